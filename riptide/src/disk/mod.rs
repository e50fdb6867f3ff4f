use std::net::SocketAddr;
use tokio::{
    sync::{mpsc, oneshot},
    task,
};
use crate::{
    block::{Block, BlockInfo},
    p2p::PeerTx,
    store::StoreInfo,
    torrent::TorrentTx,
    Bitfield, ID,
};

mod disk;
mod piece;
mod storage;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("io error: expected {expected} bytes, got {actual}")]
    IoSize { expected: usize, actual: usize },

    // Poisoned file locks.
    #[error("sync error: {0}")]
    Sync(String),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::Sync(e.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for DiskError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        DiskError::Channel(e.to_string())
    }
}

// Errors surfaced while admitting a torrent to disk.
#[derive(thiserror::Error, Debug)]
pub enum AllocationError {

    #[error("torrent already allocated")]
    DuplicateTorrent,

    #[error(transparent)]
    Io(#[from] std::io::Error),

}

pub type Result<T> = std::result::Result<T, DiskError>;
pub type DiskTx = mpsc::UnboundedSender<DiskCommand>;
pub type DiskRx = mpsc::UnboundedReceiver<DiskCommand>;

pub enum DiskCommand {

    // Open and pre-allocate a torrent's files, optionally re-verifying
    // resume-marked pieces; replies with the verified bitfield.
    NewTorrent {
        id: ID,
        info: StoreInfo,
        piece_hashes: Vec<ID>,
        resume: Option<Bitfield>,
        torrent_tx: TorrentTx,
        tx: oneshot::Sender<std::result::Result<Bitfield, AllocationError>>,
    },

    // A block from a peer; staged until its piece completes.
    WriteBlock {
        id: ID,
        block: Block,
        from: SocketAddr,
    },

    // A peer wants a block; the reply goes straight to its task.
    ReadBlock {
        id: ID,
        block: BlockInfo,
        tx: PeerTx,
    },

    RemoveTorrent {
        id: ID,
        delete_files: bool,
    },

    Shutdown,

}

pub fn spawn_disk() -> (task::JoinHandle<()>, DiskTx) {
    tracing::info!("starting disk task");
    let (mut disk, disk_tx) = disk::Disk::new();
    let handle = task::spawn(async move { disk.run().await });
    (handle, disk_tx)
}
