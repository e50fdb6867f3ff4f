use std::collections::BTreeMap;
use std::ops::Range;
use crate::error::{Error, ErrorKind, Result};
use crate::value::Value;

// Deep enough for any sane metainfo; a hard stop for hostile input.
const MAX_DEPTH: usize = 128;

// Length prefixes above this are rejected outright.
const MAX_STR_LEN: u64 = 1 << 31;

// Decode a complete value; trailing bytes are an error.
pub fn decode(buf: &[u8]) -> Result<Value> {
    let (value, used) = decode_prefix(buf)?;
    if used != buf.len() {
        return Err(Error::new(used, ErrorKind::TrailingData));
    }
    Ok(value)
}

// Decode one value off the front of the buffer, returning it together
// with the number of bytes consumed. Used when reading from a stream
// that may hold more than one message.
pub fn decode_prefix(buf: &[u8]) -> Result<(Value, usize)> {
    let mut parser = Parser { buf, pos: 0 };
    let value = parser.value(0)?;
    Ok((value, parser.pos))
}

// Byte range of the encoded value stored under `key` in a top-level
// dictionary. The info-hash is SHA-1 over exactly these source bytes,
// so this must never re-encode.
pub fn dict_value_span(buf: &[u8], key: &[u8]) -> Result<Option<Range<usize>>> {
    let mut parser = Parser { buf, pos: 0 };
    match parser.bump()? {
        b'd' => {}
        b => return Err(Error::new(0, ErrorKind::Unexpected(b))),
    }
    while parser.peek()? != b'e' {
        if !parser.peek()?.is_ascii_digit() {
            return Err(parser.err(ErrorKind::NonStringKey));
        }
        let k = parser.byte_string()?;
        let start = parser.pos;
        parser.skip(0)?;
        if k == key {
            return Ok(Some(start..parser.pos));
        }
    }
    Ok(None)
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {

    fn peek(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::new(self.pos, ErrorKind::Eof))
    }

    fn bump(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn err(&self, kind: ErrorKind) -> Error {
        Error::new(self.pos, kind)
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(self.err(ErrorKind::TooDeep));
        }
        match self.peek()? {

            b'i' => {
                self.pos += 1;
                Ok(Value::Int(self.integer()?))
            }

            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),

            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }

            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                let mut last_key: Option<Vec<u8>> = None;
                while self.peek()? != b'e' {
                    let key_offset = self.pos;
                    if !self.peek()?.is_ascii_digit() {
                        return Err(Error::new(key_offset, ErrorKind::NonStringKey));
                    }
                    let key = self.byte_string()?;
                    // Canonical input has strictly ascending keys.
                    if let Some(prev) = &last_key {
                        if key <= *prev {
                            return Err(Error::new(key_offset, ErrorKind::UnsortedKeys));
                        }
                    }
                    let value = self.value(depth + 1)?;
                    last_key = Some(key.clone());
                    dict.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(dict))
            }

            b => Err(self.err(ErrorKind::Unexpected(b))),
        }
    }

    // Walk over one value without building it, for span lookups.
    fn skip(&mut self, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(self.err(ErrorKind::TooDeep));
        }
        match self.peek()? {

            b'i' => {
                self.pos += 1;
                self.integer().map(|_| ())
            }

            b'0'..=b'9' => self.skip_bytes(),

            b'l' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.skip(depth + 1)?;
                }
                self.pos += 1;
                Ok(())
            }

            b'd' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    if !self.peek()?.is_ascii_digit() {
                        return Err(self.err(ErrorKind::NonStringKey));
                    }
                    self.skip_bytes()?;
                    self.skip(depth + 1)?;
                }
                self.pos += 1;
                Ok(())
            }

            b => Err(self.err(ErrorKind::Unexpected(b))),
        }
    }

    // The digits and closing 'e' of an integer; the leading 'i' has
    // been consumed. i0e is the only integer allowed to start with 0,
    // and -0 is rejected.
    fn integer(&mut self) -> Result<i64> {
        let negative = self.peek()? == b'-';
        if negative {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &self.buf[digits_start..self.pos];
        if digits.is_empty() {
            let b = self.peek()?;
            return Err(Error::new(self.pos, ErrorKind::Unexpected(b)));
        }
        match self.bump()? {
            b'e' => {}
            b => return Err(Error::new(self.pos - 1, ErrorKind::Unexpected(b))),
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(Error::new(digits_start, ErrorKind::LeadingZero));
        }
        if negative && digits == b"0" {
            return Err(Error::new(digits_start, ErrorKind::NegativeZero));
        }

        let mut magnitude: u64 = 0;
        for &d in digits {
            magnitude = magnitude
                .checked_mul(10)
                .and_then(|m| m.checked_add((d - b'0') as u64))
                .ok_or_else(|| Error::new(digits_start, ErrorKind::IntOutOfRange))?;
        }
        if negative {
            if magnitude > i64::MAX as u64 + 1 {
                return Err(Error::new(digits_start, ErrorKind::IntOutOfRange));
            }
            Ok((-(magnitude as i128)) as i64)
        } else {
            if magnitude > i64::MAX as u64 {
                return Err(Error::new(digits_start, ErrorKind::IntOutOfRange));
            }
            Ok(magnitude as i64)
        }
    }

    // <len>:<bytes>, positioned at the first length digit.
    fn byte_string(&mut self) -> Result<Vec<u8>> {
        let len = self.length_prefix()?;
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::new(self.buf.len(), ErrorKind::Eof))?;
        self.pos = end;
        Ok(self.buf[start..end].to_vec())
    }

    fn skip_bytes(&mut self) -> Result<()> {
        let len = self.length_prefix()?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::new(self.buf.len(), ErrorKind::Eof))?;
        self.pos = end;
        Ok(())
    }

    fn length_prefix(&mut self) -> Result<usize> {
        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &self.buf[digits_start..self.pos];
        match self.bump()? {
            b':' => {}
            b => return Err(Error::new(self.pos - 1, ErrorKind::Unexpected(b))),
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(Error::new(digits_start, ErrorKind::LeadingZero));
        }
        let mut len: u64 = 0;
        for &d in digits {
            len = len * 10 + (d - b'0') as u64;
            if len > MAX_STR_LEN {
                return Err(Error::new(digits_start, ErrorKind::LengthOverflow));
            }
        }
        Ok(len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict<const N: usize>(entries: [(&[u8], Value); N]) -> Value {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.to_vec(), v)).collect())
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
        assert_eq!(decode(b"i-17e").unwrap(), Value::Int(-17));
        assert_eq!(decode(b"4:spam").unwrap(), Value::Bytes(b"spam".to_vec()));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(vec![]));
    }

    #[test]
    fn test_decode_nested() {
        let v = decode(b"d4:infod6:lengthi7e4:name3:fooe5:tiersll3:abceee").unwrap();
        assert_eq!(
            v,
            dict([
                (
                    b"info",
                    dict([(b"length", Value::Int(7)), (b"name", "foo".into())])
                ),
                (
                    b"tiers",
                    Value::List(vec![Value::List(vec!["abc".into()])])
                ),
            ])
        );
    }

    #[test]
    fn test_reject_malformed_integers() {
        assert_eq!(decode(b"i03e").unwrap_err().kind, ErrorKind::LeadingZero);
        assert_eq!(decode(b"i-0e").unwrap_err().kind, ErrorKind::NegativeZero);
        assert_eq!(decode(b"ie").unwrap_err().kind, ErrorKind::Unexpected(b'e'));
        assert_eq!(decode(b"i-e").unwrap_err().kind, ErrorKind::Unexpected(b'e'));
        assert_eq!(
            decode(b"i9223372036854775808e").unwrap_err().kind,
            ErrorKind::IntOutOfRange
        );
        // i64::MIN itself is fine.
        assert_eq!(
            decode(b"i-9223372036854775808e").unwrap(),
            Value::Int(i64::MIN)
        );
    }

    #[test]
    fn test_reject_malformed_strings() {
        assert_eq!(decode(b"5:spam").unwrap_err().kind, ErrorKind::Eof);
        assert_eq!(decode(b"01:a").unwrap_err().kind, ErrorKind::LeadingZero);
        assert_eq!(
            decode(b"9999999999:").unwrap_err().kind,
            ErrorKind::LengthOverflow
        );
    }

    #[test]
    fn test_reject_bad_dicts() {
        assert_eq!(
            decode(b"di1e1:ae").unwrap_err().kind,
            ErrorKind::NonStringKey
        );
        assert_eq!(
            decode(b"d1:bi1e1:ai2ee").unwrap_err().kind,
            ErrorKind::UnsortedKeys
        );
        assert_eq!(
            decode(b"d1:ai1e1:ai2ee").unwrap_err().kind,
            ErrorKind::UnsortedKeys
        );
    }

    #[test]
    fn test_reject_trailing_data() {
        let err = decode(b"i1ei2e").unwrap_err();
        assert_eq!(err.kind, ErrorKind::TrailingData);
        assert_eq!(err.offset, 3);
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let (v, used) = decode_prefix(b"4:spamXYZ").unwrap();
        assert_eq!(v, Value::Bytes(b"spam".to_vec()));
        assert_eq!(used, 6);
    }

    #[test]
    fn test_error_offsets() {
        assert_eq!(decode(b"").unwrap_err().offset, 0);
        assert_eq!(decode(b"l4:spam").unwrap_err().offset, 7);
        assert_eq!(decode(b"x").unwrap_err().offset, 0);
    }

    #[test]
    fn test_dict_value_span() {
        let buf: &[u8] = b"d8:announce3:url4:infod6:lengthi7e4:name3:fooee";
        let span = dict_value_span(buf, b"info").unwrap().unwrap();
        assert_eq!(&buf[span.clone()], b"d6:lengthi7e4:name3:fooe");
        // The span decodes on its own.
        decode(&buf[span]).unwrap();
        assert!(dict_value_span(buf, b"missing").unwrap().is_none());
    }

    #[test]
    fn test_depth_limit() {
        let mut buf = vec![b'l'; 200];
        buf.extend(std::iter::repeat(b'e').take(200));
        assert_eq!(decode(&buf).unwrap_err().kind, ErrorKind::TooDeep);
    }
}
