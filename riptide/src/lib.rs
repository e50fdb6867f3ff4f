mod block;
mod budget;
mod choker;
mod config;
mod de;
mod disk;
mod engine;
mod events;
mod metainfo;
mod p2p;
mod picker;
mod rate;
mod resume;
mod stats;
mod store;
mod torrent;
mod tracker;

// The quantum of peer wire requests.
pub const BLOCK_SIZE: usize = 0x4000;

pub(crate) type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20-byte identifier: info-hashes, peer ids, piece hashes.
pub type ID = [u8; 20];

pub use config::Settings;
pub use engine::{AddReport, Engine, EngineCommand, EngineHandle};
pub use events::{Event, EventErrorKind, TorrentSnapshot};
pub use metainfo::{MetaInfo, MetaInfoError};
pub use rate::mbps_to_bytes;
pub use resume::TorrentPrefs;
pub use torrent::TorrentState;
