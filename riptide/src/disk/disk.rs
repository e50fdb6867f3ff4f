use std::collections::HashMap;
use tokio::sync::mpsc;
use crate::{Bitfield, ID};
use super::{storage::Storage, AllocationError, DiskCommand, DiskRx, DiskTx};

// The engine-wide disk task. Commands are cheap to dispatch: hashing
// and file I/O run on the blocking pool, so one slow torrent does not
// starve the rest.
pub struct Disk {

    torrents: HashMap<ID, Storage>,

    disk_rx: DiskRx,

}

impl Disk {

    pub fn new() -> (Self, DiskTx) {
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        (
            Disk {
                torrents: HashMap::new(),
                disk_rx,
            },
            disk_tx,
        )
    }

    pub async fn run(&mut self) {

        while let Some(cmd) = self.disk_rx.recv().await {
            match cmd {

                DiskCommand::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                    resume,
                    torrent_tx,
                    tx,
                } => {
                    if self.torrents.contains_key(&id) {
                        let _ = tx.send(Err(AllocationError::DuplicateTorrent));
                        continue;
                    }

                    let num_pieces = info.num_pieces as usize;
                    match Storage::new(info, piece_hashes, torrent_tx) {
                        Ok(storage) => {
                            let ctx = storage.ctx();
                            self.torrents.insert(id, storage);
                            match resume {
                                // Re-verify resume-marked pieces off the
                                // disk task so other torrents keep moving.
                                Some(candidates) => {
                                    tokio::task::spawn_blocking(move || {
                                        let verified = ctx.check_pieces(&candidates);
                                        match ctx.verified.write() {
                                            Ok(mut bits) => *bits = verified.clone(),
                                            Err(e) => tracing::error!(
                                                "verified bitfield poisoned: {}",
                                                e
                                            ),
                                        }
                                        let _ = tx.send(Ok(verified));
                                    });
                                }
                                None => {
                                    let _ = tx.send(Ok(Bitfield::repeat(false, num_pieces)));
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                        }
                    }
                }

                DiskCommand::WriteBlock { id, block, from } => {
                    if let Some(storage) = self.torrents.get_mut(&id) {
                        storage.write_block(block, from);
                    } else {
                        tracing::warn!("torrent {} not allocated on disk", hex::encode(id));
                    }
                }

                DiskCommand::ReadBlock { id, block, tx } => {
                    if let Some(storage) = self.torrents.get(&id) {
                        storage.read_block(block, tx);
                    } else {
                        tracing::warn!("torrent {} not allocated on disk", hex::encode(id));
                    }
                }

                DiskCommand::RemoveTorrent { id, delete_files } => {
                    match self.torrents.remove(&id) {
                        Some(storage) if delete_files => storage.delete_files(),
                        Some(_) => {}
                        None => {
                            tracing::warn!(
                                "attempted to remove unallocated torrent: {}",
                                hex::encode(id)
                            );
                        }
                    }
                }

                DiskCommand::Shutdown => break,

            }
        }
    }
}
