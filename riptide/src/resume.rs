use std::path::{Path, PathBuf};
use serde_derive::{Deserialize, Serialize};
use crate::ID;

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed resume record: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("resume record belongs to a different torrent")]
    WrongTorrent,

}

type Result<T> = std::result::Result<T, ResumeError>;

// Per-torrent user preferences, persisted with the resume record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentPrefs {

    #[serde(rename = "download-dir")]
    pub download_dir: String,

    #[serde(rename = "paused")]
    pub paused: bool,

    #[serde(rename = "priority")]
    pub priority: u8,

}

impl Default for TorrentPrefs {
    fn default() -> Self {
        TorrentPrefs {
            download_dir: String::new(),
            paused: false,
            priority: 0,
        }
    }
}

// One bencoded dictionary per torrent. Uploaded/downloaded only ever
// grow; the coordinator rewrites the whole record on flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {

    #[serde(rename = "info-hash", with = "serde_bytes")]
    pub info_hash: Vec<u8>,

    // Verified pieces, most significant bit first.
    #[serde(rename = "bitfield", with = "serde_bytes")]
    pub bitfield: Vec<u8>,

    #[serde(rename = "uploaded")]
    pub uploaded: u64,

    #[serde(rename = "downloaded")]
    pub downloaded: u64,

    // Last successful tracker per tier, head first.
    #[serde(rename = "trackers")]
    pub trackers: Vec<String>,

    #[serde(rename = "prefs")]
    pub prefs: TorrentPrefs,

}

// Resume records live in one directory, named by hex info-hash.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {

    pub fn new(dir: PathBuf) -> Self {
        ResumeStore { dir }
    }

    fn record_path(&self, id: &ID) -> PathBuf {
        self.dir.join(format!("{}.resume", hex::encode(id)))
    }

    pub fn load(&self, id: &ID) -> Result<Option<ResumeRecord>> {
        let path = self.record_path(id);
        let buf = match std::fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: ResumeRecord = bencode::decode_bytes(&buf)?;
        if record.info_hash.as_slice() != id.as_slice() {
            return Err(ResumeError::WrongTorrent);
        }
        Ok(Some(record))
    }

    pub fn save(&self, record: &ResumeRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let raw = bencode::encode_to_raw(record)?;
        let id: ID = record
            .info_hash
            .as_slice()
            .try_into()
            .map_err(|_| ResumeError::WrongTorrent)?;
        write_atomic(&self.record_path(&id), &raw)?;
        Ok(())
    }

    pub fn remove(&self, id: &ID) -> Result<()> {
        match std::fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// Replace the target in one step: write a sibling temp file, then
// rename it over the destination.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
