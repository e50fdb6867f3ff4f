use std::fmt::Display;

pub type Result<T> = std::result::Result<T, Error>;

// Every decoder failure carries the byte offset it was detected at.
// Serde-originated errors (type mismatches etc.) have no position and
// report offset 0.
#[derive(Debug, thiserror::Error)]
#[error("bencode error at offset {offset}: {kind}")]
pub struct Error {
    pub offset: usize,
    pub kind: ErrorKind,
}

impl Error {
    pub(crate) fn new(offset: usize, kind: ErrorKind) -> Self {
        Error { offset, kind }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {

    #[error("unexpected end of input")]
    Eof,

    #[error("unexpected byte {0:#04x}")]
    Unexpected(u8),

    #[error("leading zero in number")]
    LeadingZero,

    #[error("negative zero")]
    NegativeZero,

    #[error("integer out of range")]
    IntOutOfRange,

    #[error("byte string length exceeds 2^31")]
    LengthOverflow,

    #[error("dictionary key is not a byte string")]
    NonStringKey,

    #[error("dictionary keys not in ascending order")]
    UnsortedKeys,

    #[error("trailing bytes after value")]
    TrailingData,

    #[error("nesting depth exceeded")]
    TooDeep,

    #[error("{0}")]
    Custom(String),

}

impl serde::ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: Display,
    {
        Error::new(0, ErrorKind::Custom(msg.to_string()))
    }
}

impl serde::de::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: Display,
    {
        Error::new(0, ErrorKind::Custom(msg.to_string()))
    }
}
