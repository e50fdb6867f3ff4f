// Bencoding as used by the BitTorrent metainfo, tracker and resume
// formats. Values decode into a tagged Value; serde bridges sit on top
// for typed access.
mod de;
mod decode;
mod encode;
mod error;
mod ser;
mod value;

pub use de::{decode_bytes, from_value};
pub use decode::{decode, decode_prefix, dict_value_span};
pub use encode::{encode, encode_into};
pub use error::{Error, ErrorKind, Result};
pub use ser::{encode_to_raw, to_value};
pub use value::Value;
