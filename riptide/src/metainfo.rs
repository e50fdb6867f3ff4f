use rand::seq::SliceRandom;
use serde_derive::Deserialize;
use url::Url;
use crate::{store::FileInfo, ID};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("metainfo has no info dictionary")]
    MissingInfo,

    #[error("piece length must be greater than zero")]
    InvalidPieceLength,

    #[error("pieces must be a non-empty multiple of 20 bytes")]
    InvalidPiecesLength,

    #[error("metainfo must have exactly one of length and files")]
    AmbiguousFileMode,

    #[error("file with empty path")]
    FileEmptyPath,

    #[error("file has absolute path")]
    FileAbsolutePath,

    #[error("file lengths do not match the piece count")]
    LengthMismatch,

    #[error("metainfo lists no trackers")]
    NoTrackers,

}

type Result<T> = std::result::Result<T, MetaInfoError>;

#[derive(Debug, Clone, Deserialize)]
pub struct File {

    pub path: Vec<String>,

    pub length: u64,

}

#[derive(Clone, Deserialize)]
pub struct Info {

    pub name: String,

    // Concatenation of all 20-byte SHA-1 piece hashes.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Set in single-file mode.
    #[serde(default)]
    pub length: Option<u64>,

    // Set in multi-file mode.
    #[serde(default)]
    pub files: Option<Vec<File>>,

    // "1" forbids peer sources other than the listed trackers.
    #[serde(default)]
    pub private: Option<u8>,

}

#[derive(Clone, Deserialize)]
pub struct MetaInfo {

    #[serde(default)]
    #[serde(deserialize_with = "crate::de::optional_url")]
    pub announce: Option<Url>,

    pub info: Info,

    // SHA-1 of the raw encoded info dictionary, filled in after decode.
    #[serde(skip)]
    pub info_hash: ID,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list")]
    pub announce_list: Option<Vec<Vec<Url>>>,

    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

}

impl MetaInfo {

    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        MetaInfo::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<MetaInfo> {

        let mut metainfo: MetaInfo = bencode::decode_bytes(buf)?;

        // The info-hash is SHA-1 over the info value exactly as it
        // appears in the source file, never over a re-encoding.
        let span = bencode::dict_value_span(buf, b"info")?.ok_or(MetaInfoError::MissingInfo)?;
        metainfo.info_hash = {
            use sha1::Digest;
            let mut hasher = sha1::Sha1::new();
            hasher.update(&buf[span]);
            hasher.finalize().into()
        };

        metainfo.validate()?;
        tracing::debug!("metainfo loaded: {:#?}", metainfo);
        Ok(metainfo)
    }

    fn validate(&self) -> Result<()> {

        let info = &self.info;
        if info.piece_length == 0 {
            return Err(MetaInfoError::InvalidPieceLength);
        }
        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if info.length.is_some() == info.files.is_some() {
            return Err(MetaInfoError::AmbiguousFileMode);
        }

        if let Some(files) = &info.files {
            if files.is_empty() {
                return Err(MetaInfoError::AmbiguousFileMode);
            }
            for file in files {
                if file.path.is_empty() || file.path.iter().any(|seg| seg.is_empty()) {
                    return Err(MetaInfoError::FileEmptyPath);
                }
                if file.path[0].starts_with('/') {
                    return Err(MetaInfoError::FileAbsolutePath);
                }
            }
        }

        // The piece table must cover the content exactly: the last
        // piece is the only one allowed to be short.
        let num_pieces = (info.pieces.len() / 20) as u64;
        let piece_len = info.piece_length as u64;
        let total = self.total_len();
        if total <= (num_pieces - 1) * piece_len || total > num_pieces * piece_len {
            return Err(MetaInfoError::LengthMismatch);
        }

        if self.announce.is_none() && self.announce_list.is_none() {
            return Err(MetaInfoError::NoTrackers);
        }

        Ok(())
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info
            .pieces
            .chunks_exact(20)
            // Length is a multiple of 20, checked in validate.
            .map(|c| c.try_into().expect("20-byte chunk"))
            .collect()
    }

    pub fn piece_len(&self) -> usize {
        self.info.piece_length as usize
    }

    pub fn num_pieces(&self) -> u32 {
        self.info.pieces.len() as u32 / 20
    }

    pub fn is_multi_file(&self) -> bool {
        self.info.files.is_some()
    }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> ID {
        self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    // Tracker URLs grouped into tiers. Within a tier the order is
    // shuffled once per load, per BEP-12.
    pub fn tracker_tiers(&self) -> Vec<Vec<Url>> {
        if let Some(announce_list) = self.announce_list.clone() {
            let mut tiers = Vec::with_capacity(announce_list.len());
            for mut tier in announce_list {
                tier.shuffle(&mut rand::thread_rng());
                tiers.push(tier);
            }
            tiers
        } else {
            // validate() guarantees announce is set when the list is absent.
            self.announce.iter().map(|url| vec![url.clone()]).collect()
        }
    }

    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files
                .iter()
                .map(|f| {
                    let info = FileInfo {
                        path: f.path.iter().collect(),
                        length: f.length as usize,
                        offset,
                    };
                    offset += f.length as usize;
                    info
                })
                .collect()
        } else {
            vec![FileInfo {
                path: self.info.name.clone().into(),
                length: self.total_len() as usize,
                offset: 0,
            }]
        }
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.and_then(|secs| {
            chrono::DateTime::from_timestamp(secs, 0)
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        })
    }
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_ref().map(|u| u.as_str()))
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field(
                "announce_list",
                &self.announce_list.as_ref().map(|tiers| {
                    tiers
                        .iter()
                        .map(|tier| tier.iter().map(|u| u.as_str()).collect())
                        .collect::<Vec<Vec<&str>>>()
                }),
            )
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Skips the pieces blob, which would swamp the output.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num_pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use bencode::Value;

    // Builds a single-file metainfo document: 2 pieces of 16 KiB, the
    // second one short.
    fn sample(total_len: i64) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Int(total_len));
        info.insert(b"name".to_vec(), "sample.bin".into());
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0xaa; 40]));

        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), "http://tracker.example/announce".into());
        root.insert(b"info".to_vec(), Value::Dict(info));
        bencode::encode(&Value::Dict(root))
    }

    #[test]
    fn test_load_single_file() {
        let metainfo = MetaInfo::from_bytes(&sample(20_000)).unwrap();
        assert_eq!(metainfo.num_pieces(), 2);
        assert_eq!(metainfo.piece_len(), 16_384);
        assert_eq!(metainfo.total_len(), 20_000);
        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.files().len(), 1);
        assert_eq!(metainfo.tracker_tiers().len(), 1);
    }

    #[test]
    fn test_info_hash_is_over_raw_bytes() {
        use sha1::Digest;
        let buf = sample(20_000);
        let metainfo = MetaInfo::from_bytes(&buf).unwrap();

        let span = bencode::dict_value_span(&buf, b"info").unwrap().unwrap();
        let mut hasher = sha1::Sha1::new();
        hasher.update(&buf[span]);
        let expected: ID = hasher.finalize().into();
        assert_eq!(metainfo.info_hash(), expected);
    }

    #[test]
    fn test_length_must_match_piece_count() {
        // Two pieces of 16 KiB cover (16384, 32768].
        assert!(matches!(
            MetaInfo::from_bytes(&sample(16_384)),
            Err(MetaInfoError::LengthMismatch)
        ));
        assert!(matches!(
            MetaInfo::from_bytes(&sample(40_000)),
            Err(MetaInfoError::LengthMismatch)
        ));
        assert!(MetaInfo::from_bytes(&sample(32_768)).is_ok());
    }

    #[test]
    fn test_reject_bad_pieces_blob() {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Int(100));
        info.insert(b"name".to_vec(), "x".into());
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0xaa; 19]));
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), "http://t/a".into());
        root.insert(b"info".to_vec(), Value::Dict(info));
        let buf = bencode::encode(&Value::Dict(root));
        assert!(matches!(
            MetaInfo::from_bytes(&buf),
            Err(MetaInfoError::InvalidPiecesLength)
        ));
    }

    #[test]
    fn test_multi_file_layout() {
        let mut info = BTreeMap::new();
        let file = |segs: &[&str], len: i64| {
            let mut d = BTreeMap::new();
            d.insert(
                b"length".to_vec(),
                Value::Int(len),
            );
            d.insert(
                b"path".to_vec(),
                Value::List(segs.iter().map(|s| Value::from(*s)).collect()),
            );
            Value::Dict(d)
        };
        info.insert(
            b"files".to_vec(),
            Value::List(vec![file(&["a.bin"], 16_384), file(&["sub", "b.bin"], 10_000)]),
        );
        info.insert(b"name".to_vec(), "multi".into());
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0xbb; 40]));
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), "http://t/a".into());
        root.insert(b"info".to_vec(), Value::Dict(info));

        let metainfo = MetaInfo::from_bytes(&bencode::encode(&Value::Dict(root))).unwrap();
        assert!(metainfo.is_multi_file());
        let files = metainfo.files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].offset, 16_384);
        assert_eq!(files[1].path, std::path::PathBuf::from("sub/b.bin"));
    }
}
