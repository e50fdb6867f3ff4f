use tokio::sync::mpsc;
use crate::{torrent::TorrentState, ID};

// The host drains these; the core never blocks on it.
pub const EVENT_QUEUE_DEPTH: usize = 1024;

// Error classes surfaced to the host, mirroring the internal error
// enums without carrying their payloads across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventErrorKind {
    Metainfo,
    Bencode,
    Storage,
    Network,
    Protocol,
    Tracker,
    Integrity,
}

impl std::fmt::Display for EventErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventErrorKind::Metainfo => "metainfo",
            EventErrorKind::Bencode => "bencode",
            EventErrorKind::Storage => "storage",
            EventErrorKind::Network => "network",
            EventErrorKind::Protocol => "protocol",
            EventErrorKind::Tracker => "tracker",
            EventErrorKind::Integrity => "integrity",
        };
        f.write_str(s)
    }
}

// One row of the host's torrent list.
#[derive(Debug, Clone)]
pub struct TorrentSnapshot {

    pub id: ID,

    pub name: String,

    pub total_size: u64,

    pub verified_size: u64,

    // Bytes per second, averaged over the stats window.
    pub download_rate: u64,

    pub upload_rate: u64,

    // Peers we are actively exchanging data with.
    pub peers_active: usize,

    pub peers_total: usize,

    pub state: TorrentState,

    pub priority: u8,

}

#[derive(Debug, Clone)]
pub enum Event {

    TorrentAdded {
        id: ID,
        name: String,
    },

    ProgressTick {
        torrents: Vec<TorrentSnapshot>,
    },

    PieceVerified {
        id: ID,
        piece: usize,
    },

    StateChanged {
        id: ID,
        state: TorrentState,
    },

    Error {
        id: Option<ID>,
        kind: EventErrorKind,
        message: String,
    },

}

pub type EventRx = mpsc::Receiver<Event>;

#[derive(Debug, Clone)]
pub struct EventTx {
    tx: mpsc::Sender<Event>,
}

impl EventTx {
    // Newest events are dropped when the host stops draining; progress
    // ticks recur every second so the loss is transient.
    pub fn send(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!("event queue full, dropping event: {}", e);
        }
    }
}

pub fn channel() -> (EventTx, EventRx) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    (EventTx { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = channel();
        for i in 0..(EVENT_QUEUE_DEPTH + 10) {
            tx.send(Event::PieceVerified {
                id: [0; 20],
                piece: i,
            });
        }
        // The queue holds exactly its depth; the rest were dropped.
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, EVENT_QUEUE_DEPTH);
    }
}
