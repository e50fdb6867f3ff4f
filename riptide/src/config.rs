use std::{
    collections::BTreeMap,
    ops::RangeInclusive,
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use crate::{resume::write_atomic, ID};

const MAX_CONNECTIONS_RANGE: RangeInclusive<u32> = 1..=5000;
const MAX_HALF_OPEN_RANGE: RangeInclusive<u32> = 1..=2000;
const MAX_PIECES_RANGE: RangeInclusive<u32> = 1..=500;
const MAX_REQUESTS_RANGE: RangeInclusive<u32> = 1..=500;

// Azureus-style client id prefix.
const CLIENT_ID_PREFIX: &[u8; 8] = b"-RP0100-";

// The persistent settings document. Serialized as a single bencoded
// dictionary; key names are part of the on-disk format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {

    #[serde(rename = "MaxConnections")]
    pub max_connections: u32,

    #[serde(rename = "MaxHalfOpenConnections")]
    pub max_half_open: u32,

    #[serde(rename = "MaxPiecesToRequest")]
    pub max_pieces_to_request: u32,

    #[serde(rename = "MaxRequestsPerPeer")]
    pub max_requests_per_peer: u32,

    // Bytes per second; absent means unlimited.
    #[serde(rename = "GlobalMaxDownloadSpeed")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_download: Option<u64>,

    #[serde(rename = "GlobalMaxUploadSpeed")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_upload: Option<u64>,

    #[serde(rename = "EnableLogging")]
    pub enable_logging: bool,

    #[serde(rename = "DefaultDownloadPath")]
    pub default_download_path: String,

    #[serde(rename = "AutoStartOnLaunch")]
    pub auto_start_on_launch: bool,

    #[serde(rename = "AutoStartOnAdd")]
    pub auto_start_on_add: bool,

    #[serde(rename = "CopyTorrentFileToDownloadFolder")]
    pub copy_torrent_file: bool,

    #[serde(rename = "MinimizeToTrayOnClose")]
    pub minimize_to_tray: bool,

    #[serde(rename = "LanguageCode")]
    pub language_code: String,

    // Extra HTTP tracker headers, keyed by host or "*".
    #[serde(rename = "HttpTrackerHeaders")]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub http_headers: BTreeMap<String, BTreeMap<String, String>>,

    // HTTP tracker cookies, keyed by host or "*".
    #[serde(rename = "HttpTrackerCookies")]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub http_cookies: BTreeMap<String, BTreeMap<String, String>>,

}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_connections: 200,
            max_half_open: 50,
            max_pieces_to_request: 60,
            max_requests_per_peer: 50,
            max_download: None,
            max_upload: None,
            enable_logging: true,
            default_download_path: "downloads".into(),
            auto_start_on_launch: true,
            auto_start_on_add: true,
            copy_torrent_file: false,
            minimize_to_tray: false,
            language_code: "en".into(),
            http_headers: BTreeMap::new(),
            http_cookies: BTreeMap::new(),
        }
    }
}

impl Settings {

    // A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: &Path) -> std::io::Result<Settings> {
        let buf = match std::fs::read(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Settings::default());
            }
            Err(e) => return Err(e),
        };
        let mut settings: Settings = bencode::decode_bytes(&buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        settings.clamp();
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = bencode::encode_to_raw(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_atomic(path, &raw)
    }

    // Out-of-range values are pulled back into range rather than
    // rejecting the whole document.
    pub fn clamp(&mut self) {
        clamp_field("MaxConnections", &mut self.max_connections, MAX_CONNECTIONS_RANGE);
        clamp_field("MaxHalfOpenConnections", &mut self.max_half_open, MAX_HALF_OPEN_RANGE);
        clamp_field("MaxPiecesToRequest", &mut self.max_pieces_to_request, MAX_PIECES_RANGE);
        clamp_field("MaxRequestsPerPeer", &mut self.max_requests_per_peer, MAX_REQUESTS_RANGE);
    }

    // Headers for one tracker host, wildcard entries first so host
    // entries override them.
    pub fn headers_for(&self, host: &str) -> Vec<(String, String)> {
        merge_host_map(&self.http_headers, host)
    }

    pub fn cookies_for(&self, host: &str) -> Vec<(String, String)> {
        merge_host_map(&self.http_cookies, host)
    }
}

fn merge_host_map(
    map: &BTreeMap<String, BTreeMap<String, String>>,
    host: &str,
) -> Vec<(String, String)> {
    let mut merged = BTreeMap::new();
    if let Some(wildcard) = map.get("*") {
        merged.extend(wildcard.clone());
    }
    if let Some(per_host) = map.get(host) {
        merged.extend(per_host.clone());
    }
    merged.into_iter().collect()
}

fn clamp_field(name: &str, value: &mut u32, range: RangeInclusive<u32>) {
    if !range.contains(value) {
        let clamped = (*value).clamp(*range.start(), *range.end());
        tracing::warn!("{} = {} out of range, clamping to {}", name, value, clamped);
        *value = clamped;
    }
}

// Connection and request caps shared across tasks; settings changes
// land here and are observed on the next scheduling tick.
#[derive(Debug)]
pub struct Limits {

    pub max_connections: AtomicU32,

    pub max_half_open: AtomicU32,

    pub max_pieces_to_request: AtomicU32,

    pub max_requests_per_peer: AtomicU32,

}

impl Limits {

    pub fn new(settings: &Settings) -> Self {
        Limits {
            max_connections: AtomicU32::new(settings.max_connections),
            max_half_open: AtomicU32::new(settings.max_half_open),
            max_pieces_to_request: AtomicU32::new(settings.max_pieces_to_request),
            max_requests_per_peer: AtomicU32::new(settings.max_requests_per_peer),
        }
    }

    pub fn apply(&self, settings: &Settings) {
        self.max_connections
            .store(settings.max_connections, Ordering::Release);
        self.max_half_open
            .store(settings.max_half_open, Ordering::Release);
        self.max_pieces_to_request
            .store(settings.max_pieces_to_request, Ordering::Release);
        self.max_requests_per_peer
            .store(settings.max_requests_per_peer, Ordering::Release);
    }

    pub fn max_requests_per_peer(&self) -> usize {
        self.max_requests_per_peer.load(Ordering::Acquire) as usize
    }

    pub fn max_pieces_to_request(&self) -> u32 {
        self.max_pieces_to_request.load(Ordering::Acquire)
    }
}

pub fn generate_client_id() -> ID {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = rng.sample(rand::distributions::Alphanumeric);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp() {
        let mut settings = Settings {
            max_connections: 0,
            max_half_open: 9000,
            ..Default::default()
        };
        settings.clamp();
        assert_eq!(settings.max_connections, 1);
        assert_eq!(settings.max_half_open, 2000);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.bencode");
        let mut settings = Settings::default();
        settings.max_download = Some(125_000);
        settings
            .http_headers
            .entry("*".into())
            .or_default()
            .insert("User-Agent".into(), "riptide".into());
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Settings::load(&dir.path().join("nope.bencode")).unwrap();
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn test_host_overrides_wildcard() {
        let mut settings = Settings::default();
        settings
            .http_headers
            .entry("*".into())
            .or_default()
            .insert("X-Key".into(), "global".into());
        settings
            .http_headers
            .entry("tracker.example".into())
            .or_default()
            .insert("X-Key".into(), "host".into());
        let headers = settings.headers_for("tracker.example");
        assert_eq!(headers, vec![("X-Key".into(), "host".into())]);
    }

    #[test]
    fn test_client_id_shape() {
        let id = generate_client_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }
}
