use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};
use url::Url;
use crate::ID;

mod http;
mod tcp;
mod udp;

pub use http::HttpTracker;
pub use tcp::TcpTracker;
pub use udp::UdpTracker;

pub type Result<T> = std::result::Result<T, TrackerError>;

// Total wall-clock budget for one announce, any flavour.
pub const ANNOUNCE_BUDGET: Duration = Duration::from_secs(30);

// Fallback cadence when the tracker does not supply an interval.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

// Floor between announces when the tracker gives no minimum.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

// How many peers we ask for unless the caller knows better.
pub const DEFAULT_NUM_WANT: usize = 200;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error decoding response: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("announce timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid tracker url")]
    InvalidUrl,

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("no response after {0} attempts")]
    NoResponse(usize),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("malformed response: {0}")]
    Malformed(&'static str),

}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Started,
    Completed,
    Stopped,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Completed => write!(f, "completed"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct AnnounceParams {

    pub info_hash: ID,

    pub client_id: ID,

    // Port we accept peer connections on.
    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still needed for completion.
    pub left: u64,

    pub event: Option<Event>,

    pub num_want: Option<usize>,

    // Random per torrent run; lets trackers track us across address
    // changes.
    pub key: u32,

}

// A parsed announce response, flavour-independent.
#[derive(Debug, Default)]
pub struct Announce {

    pub peers: Vec<SocketAddr>,

    pub interval: Option<Duration>,

    pub min_interval: Option<Duration>,

    pub tracker_id: Option<String>,

    pub seeders: Option<u64>,

    pub leechers: Option<u64>,

}

// Per-host HTTP extras from the settings document.
#[derive(Debug, Clone, Default)]
pub struct HttpOverrides {

    pub headers: Vec<(String, String)>,

    pub cookies: Vec<(String, String)>,

}

enum Transport {
    Http(HttpTracker),
    Udp(UdpTracker),
    Tcp(TcpTracker),
}

// One tracker endpoint with its announce bookkeeping. Tier ordering
// and fail-over live with the torrent coordinator.
pub struct Tracker {

    pub url: Url,

    transport: Transport,

    pub tracker_id: Option<String>,

    pub last_announce: Option<Instant>,

    interval: Option<Duration>,

    min_interval: Option<Duration>,

}

impl Tracker {

    pub fn new(url: Url, overrides: HttpOverrides) -> Result<Self> {
        let transport = match url.scheme() {
            "http" | "https" => Transport::Http(HttpTracker::new(url.clone(), overrides)),
            "udp" => Transport::Udp(UdpTracker::new(url.clone())),
            "tcp" => Transport::Tcp(TcpTracker::new(url.clone())),
            scheme => return Err(TrackerError::UnsupportedScheme(scheme.to_string())),
        };
        Ok(Tracker {
            url,
            transport,
            tracker_id: None,
            last_announce: None,
            interval: None,
            min_interval: None,
        })
    }

    pub async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>> {

        let announce = tokio::time::timeout(ANNOUNCE_BUDGET, async {
            match &mut self.transport {
                Transport::Http(t) => t.announce(params, self.tracker_id.as_deref()).await,
                Transport::Udp(t) => t.announce(params).await,
                Transport::Tcp(t) => t.announce(params).await,
            }
        })
        .await??;

        if let Some(interval) = announce.interval {
            self.interval = Some(interval);
        }
        if let Some(min_interval) = announce.min_interval {
            self.min_interval = Some(min_interval);
        }
        if let Some(tracker_id) = &announce.tracker_id {
            self.tracker_id = Some(tracker_id.clone());
        }
        self.last_announce = Some(Instant::now());

        tracing::info!(
            "tracker returned {} peers (seeders: {:?}, leechers: {:?})",
            announce.peers.len(),
            announce.seeders,
            announce.leechers,
        );
        Ok(announce.peers)
    }

    // Whether an off-schedule announce (we want peers) is permitted.
    pub fn can_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => {
                time.duration_since(last)
                    >= self.min_interval.unwrap_or(DEFAULT_MIN_ANNOUNCE_INTERVAL)
            }
            None => true,
        }
    }

    // Whether the regular cadence calls for an announce.
    pub fn should_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => {
                time.duration_since(last) >= self.interval.unwrap_or(DEFAULT_ANNOUNCE_INTERVAL)
            }
            None => true,
        }
    }
}

// Announce DNS prefers IPv4; v6-only hosts still resolve.
pub(crate) async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or(TrackerError::InvalidUrl)
}

// Compact peer list: 4-byte IPv4 + 2-byte big-endian port per entry.
pub(crate) fn parse_compact_peers(raw: &[u8]) -> Result<Vec<SocketAddr>> {
    if raw.len() % 6 != 0 {
        return Err(TrackerError::Malformed("compact peer list not a multiple of 6"));
    }
    Ok(raw
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(ip.into(), port)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_peers() {
        let raw = [10, 0, 0, 1, 0x1a, 0xe1, 192, 168, 1, 2, 0x00, 0x50];
        let peers = parse_compact_peers(&raw).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "10.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1], "192.168.1.2:80".parse().unwrap());

        assert!(parse_compact_peers(&raw[..5]).is_err());
        assert!(parse_compact_peers(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_unsupported_scheme() {
        let url = Url::parse("wss://tracker.example/announce").unwrap();
        assert!(matches!(
            Tracker::new(url, HttpOverrides::default()),
            Err(TrackerError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_announce_cadence() {
        let url = Url::parse("http://tracker.example/announce").unwrap();
        let mut tracker = Tracker::new(url, HttpOverrides::default()).unwrap();
        let now = Instant::now();
        assert!(tracker.can_announce(now));
        assert!(tracker.should_announce(now));

        tracker.last_announce = Some(now);
        tracker.interval = Some(Duration::from_secs(1800));
        tracker.min_interval = Some(Duration::from_secs(60));
        assert!(!tracker.can_announce(now + Duration::from_secs(30)));
        assert!(tracker.can_announce(now + Duration::from_secs(90)));
        assert!(!tracker.should_announce(now + Duration::from_secs(90)));
        assert!(tracker.should_announce(now + Duration::from_secs(1900)));
    }
}
