use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    num::NonZeroUsize,
    ops::Range,
    sync::{Arc, Mutex, RwLock},
};
use sha1::{Digest, Sha1};
use tokio::task::JoinHandle;
use crate::{
    block::{num_blocks, Block, BlockBytes, BlockInfo},
    p2p::{PeerCommand, PeerTx},
    store::StoreInfo,
    torrent::{CommandToTorrent, TorrentTx},
    Bitfield, ID,
};
use super::{
    piece::{read_piece, PieceBuf},
    AllocationError, Result,
};

// Peers tend to read several blocks from the same piece, so reads pull
// whole pieces and cache them.
const READ_CACHE_PIECES: usize = 256;

#[derive(Debug)]
pub struct StorageFile {

    pub len: usize,

    // Offset from the start of the torrent.
    pub offset: usize,

    pub file: RwLock<std::fs::File>,

}

impl StorageFile {
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.len)
    }
}

// State shared with blocking I/O closures.
#[derive(Debug)]
pub struct StorageCtx {

    pub info: StoreInfo,

    pub piece_hashes: Vec<ID>,

    pub files: Vec<StorageFile>,

    pub torrent_tx: TorrentTx,

    pub read_cache: Mutex<lru::LruCache<usize, Vec<Arc<Vec<u8>>>>>,

    // Pieces whose on-disk bytes hash-verified. Files are pre-allocated
    // to full length, so reads must never serve from outside this set.
    pub verified: RwLock<Bitfield>,

}

// One torrent's presence on disk.
#[derive(Debug)]
pub struct Storage {

    // In-flight pieces, keyed by piece index.
    write_buf: HashMap<usize, PieceBuf>,

    ctx: Arc<StorageCtx>,

}

impl Storage {

    pub fn new(
        info: StoreInfo,
        piece_hashes: Vec<ID>,
        torrent_tx: TorrentTx,
    ) -> std::result::Result<Self, AllocationError> {

        if !info.output_dir.is_dir() {
            std::fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created output directory: {:?}", info.output_dir);
        }

        debug_assert!(!info.files.is_empty());
        let mut files = Vec::with_capacity(info.files.len());
        for file_info in info.files.iter() {
            let path = info.output_dir.join(&file_info.path);
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            // Pre-allocate to the declared length; sparse where the
            // filesystem supports it.
            if file.metadata()?.len() < file_info.length as u64 {
                file.set_len(file_info.length as u64)?;
            }
            tracing::debug!("opened file: {:?}", path);

            files.push(StorageFile {
                len: file_info.length,
                offset: file_info.offset,
                file: RwLock::new(file),
            });
        }

        let read_cache = Mutex::new(lru::LruCache::new(
            NonZeroUsize::new(READ_CACHE_PIECES).expect("cache size is non-zero"),
        ));
        let verified = RwLock::new(Bitfield::repeat(false, info.num_pieces as usize));
        Ok(Self {
            write_buf: HashMap::new(),
            ctx: Arc::new(StorageCtx {
                info,
                piece_hashes,
                files,
                torrent_tx,
                read_cache,
                verified,
            }),
        })
    }

    pub fn ctx(&self) -> Arc<StorageCtx> {
        Arc::clone(&self.ctx)
    }

    // Stage a block; once its piece is complete, verify and write on
    // the blocking pool and report the outcome to the torrent.
    pub fn write_block(&mut self, block: Block, from: SocketAddr) {
        // Geometry was validated in the peer session.

        let piece_idx = block.piece_idx;
        let ctx = &self.ctx;
        let piece = self.write_buf.entry(piece_idx).or_insert_with(|| {
            let len = ctx.info.piece_length(piece_idx);
            tracing::trace!("staging piece {}", piece_idx);
            PieceBuf {
                hash: ctx.piece_hashes[piece_idx],
                len,
                data: vec![0; len],
                blocks_received: vec![false; num_blocks(len)],
                num_blocks_received: 0,
                contributors: HashSet::new(),
            }
        });

        piece.add_block(&block, from);
        tracing::trace!(
            "piece {}: {}/{} blocks",
            piece_idx,
            piece.num_blocks_received,
            piece.blocks_received.len()
        );

        if !piece.is_complete() {
            return;
        }

        let piece = self
            .write_buf
            .remove(&piece_idx)
            .expect("complete piece is staged");
        let offset = self.ctx.info.piece_byte_offset(piece_idx);
        let file_range = self.ctx.info.piece_file_intersections(piece_idx);
        let ctx = Arc::clone(&self.ctx);

        let _: JoinHandle<()> = tokio::task::spawn_blocking(move || {
            let contributors: Vec<SocketAddr> = piece.contributors.iter().copied().collect();

            if !piece.verify_hash() {
                tracing::warn!("piece {} failed hash verification", piece_idx);
                ctx.torrent_tx
                    .send(CommandToTorrent::PieceWritten {
                        idx: piece_idx,
                        valid: false,
                        contributors,
                    })
                    .ok();
                return;
            }

            match piece.write(offset, &ctx.files[file_range]) {
                Ok(()) => {
                    // Mark served-from-disk eligibility before anyone
                    // can learn of the piece via a have message.
                    match ctx.verified.write() {
                        Ok(mut verified) => verified.set(piece_idx, true),
                        Err(e) => tracing::error!("verified bitfield poisoned: {}", e),
                    }
                    ctx.torrent_tx
                        .send(CommandToTorrent::PieceWritten {
                            idx: piece_idx,
                            valid: true,
                            contributors,
                        })
                        .ok();
                }
                Err(e) => {
                    tracing::error!("failed to write piece {}: {}", piece_idx, e);
                    ctx.torrent_tx
                        .send(CommandToTorrent::StorageFailure(e.to_string()))
                        .ok();
                }
            }
        });
    }

    // Serve a block read, from cache when possible. The reply goes
    // directly to the requesting peer's task.
    pub fn read_block(&self, block: BlockInfo, peer_tx: PeerTx) {

        // The session refuses such requests already; a pre-allocated
        // file range must never leak as fabricated piece data.
        let piece_verified = match self.ctx.verified.read() {
            Ok(verified) => verified.get(block.piece_idx).map(|b| *b).unwrap_or(false),
            Err(e) => {
                tracing::error!("verified bitfield poisoned: {}", e);
                false
            }
        };
        if !piece_verified {
            tracing::warn!("refusing read of unverified piece {}", block.piece_idx);
            return;
        }

        let block_idx = block.idx_in_piece();

        let cached = {
            let mut cache = match self.ctx.read_cache.lock() {
                Ok(cache) => cache,
                Err(e) => {
                    tracing::error!("read cache poisoned: {}", e);
                    return;
                }
            };
            cache.get(&block.piece_idx).cloned()
        };

        if let Some(blocks) = cached {
            tracing::trace!("read cache hit for piece {}", block.piece_idx);
            if let Some(data) = blocks.get(block_idx) {
                peer_tx
                    .send(PeerCommand::BlockRead(Block {
                        piece_idx: block.piece_idx,
                        offset: block.offset,
                        bytes: BlockBytes::Shared(Arc::clone(data)),
                    }))
                    .ok();
            }
            return;
        }

        let offset = self.ctx.info.piece_byte_offset(block.piece_idx);
        let len = self.ctx.info.piece_length(block.piece_idx);
        let file_range = self.ctx.info.piece_file_intersections(block.piece_idx);
        let ctx = Arc::clone(&self.ctx);

        let _: JoinHandle<()> = tokio::task::spawn_blocking(move || {
            let piece = match read_piece(offset, len, &ctx.files[file_range]) {
                Ok(piece) => piece,
                Err(e) => {
                    tracing::error!("failed to read piece {}: {}", block.piece_idx, e);
                    return;
                }
            };
            let data = match piece.get(block_idx) {
                Some(data) => Arc::clone(data),
                None => return,
            };
            if let Ok(mut cache) = ctx.read_cache.lock() {
                cache.put(block.piece_idx, piece);
            }
            peer_tx
                .send(PeerCommand::BlockRead(Block {
                    piece_idx: block.piece_idx,
                    offset: block.offset,
                    bytes: BlockBytes::Shared(data),
                }))
                .ok();
        });
    }

    pub fn delete_files(&self) {
        for file_info in self.ctx.info.files.iter() {
            let path = self.ctx.info.output_dir.join(&file_info.path);
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("failed to delete {:?}: {}", path, e);
            }
        }
        // Only removes the directory if nothing else is left in it.
        let _ = std::fs::remove_dir(&self.ctx.info.output_dir);
    }
}

impl StorageCtx {

    // Re-verify candidate pieces against their hashes; mismatches and
    // read failures simply drop out of the returned bitfield.
    pub fn check_pieces(&self, candidates: &Bitfield) -> Bitfield {

        let mut verified = Bitfield::repeat(false, self.info.num_pieces as usize);

        for piece_idx in 0..self.info.num_pieces as usize {
            if !candidates[piece_idx] {
                continue;
            }
            let offset = self.info.piece_byte_offset(piece_idx);
            let len = self.info.piece_length(piece_idx);
            let file_range = self.info.piece_file_intersections(piece_idx);

            match read_piece(offset, len, &self.files[file_range]) {
                Ok(blocks) => {
                    let mut hasher = Sha1::new();
                    for block in blocks.iter() {
                        hasher.update(block.as_slice());
                    }
                    if hasher.finalize().as_slice() == self.piece_hashes[piece_idx] {
                        verified.set(piece_idx, true);
                    } else {
                        tracing::info!("resume piece {} failed verification", piece_idx);
                    }
                }
                Err(e) => {
                    tracing::info!("resume piece {} unreadable: {}", piece_idx, e);
                }
            }
        }

        verified
    }
}
