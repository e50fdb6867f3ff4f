use serde::de::{self, Deserialize, DeserializeOwned, Unexpected};
use serde::forward_to_deserialize_any;
use crate::decode::decode;
use crate::error::{Error, Result};
use crate::value::Value;

pub fn from_value<'de, T>(value: &'de Value) -> Result<T>
where
    T: Deserialize<'de>,
{
    T::deserialize(ValueDeserializer { value })
}

pub fn decode_bytes<T>(buf: &[u8]) -> Result<T>
where
    T: DeserializeOwned,
{
    let value = decode(buf)?;
    from_value(&value)
}

#[derive(Clone, Copy)]
struct ValueDeserializer<'de> {
    value: &'de Value,
}

fn unexpected(value: &Value) -> Unexpected<'_> {
    match value {
        Value::Int(i) => Unexpected::Signed(*i),
        Value::Bytes(b) => Unexpected::Bytes(b),
        Value::List(_) => Unexpected::Seq,
        Value::Dict(_) => Unexpected::Map,
    }
}

impl<'de> de::Deserializer<'de> for ValueDeserializer<'de> {

    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        match self.value {
            Value::Int(i) => visitor.visit_i64(*i),
            Value::Bytes(b) => visitor.visit_borrowed_bytes(b),
            Value::List(items) => visitor.visit_seq(ListAccess { iter: items.iter() }),
            Value::Dict(dict) => visitor.visit_map(DictAccess {
                iter: dict.iter(),
                pending: None,
            }),
        }
    }

    // Bencode has no booleans; 0/1 integers stand in.
    fn deserialize_bool<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        match self.value {
            Value::Int(i) => visitor.visit_bool(*i != 0),
            v => Err(de::Error::invalid_type(unexpected(v), &visitor)),
        }
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        match self.value {
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => visitor.visit_borrowed_str(s),
                Err(_) => Err(de::Error::invalid_value(Unexpected::Bytes(b), &visitor)),
            },
            v => Err(de::Error::invalid_type(unexpected(v), &visitor)),
        }
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    // Present keys deserialize as Some; absence is handled by the map
    // access never producing the key.
    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V>(self, _: &'static str, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_unit<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V>(self, _: &'static str, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char bytes
        byte_buf seq tuple tuple_struct map struct enum identifier
        ignored_any
    }
}

struct ListAccess<'de> {
    iter: std::slice::Iter<'de, Value>,
}

impl<'de> de::SeqAccess<'de> for ListAccess<'de> {

    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: de::DeserializeSeed<'de>,
    {
        self.iter
            .next()
            .map(|value| seed.deserialize(ValueDeserializer { value }))
            .transpose()
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct DictAccess<'de> {
    iter: std::collections::btree_map::Iter<'de, Vec<u8>, Value>,
    pending: Option<&'de Value>,
}

impl<'de> de::MapAccess<'de> for DictAccess<'de> {

    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: de::DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some((key, value)) => {
                self.pending = Some(value);
                seed.deserialize(KeyDeserializer { key }).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: de::DeserializeSeed<'de>,
    {
        let value = self
            .pending
            .take()
            .ok_or_else(|| de::Error::custom("map value requested before key"))?;
        seed.deserialize(ValueDeserializer { value })
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct KeyDeserializer<'de> {
    key: &'de [u8],
}

impl<'de> de::Deserializer<'de> for KeyDeserializer<'de> {

    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_borrowed_bytes(self.key)
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        match std::str::from_utf8(self.key) {
            Ok(s) => visitor.visit_borrowed_str(s),
            Err(_) => Err(de::Error::invalid_value(Unexpected::Bytes(self.key), &visitor)),
        }
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_borrowed_bytes(self.key)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char bytes
        byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum ignored_any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Inner {
        length: u64,
        name: String,
        #[serde(default)]
        md5sum: Option<String>,
    }

    #[derive(Deserialize, Debug, PartialEq)]
    struct Outer {
        announce: String,
        info: Inner,
        #[serde(default)]
        #[serde(rename = "creation date")]
        creation_date: Option<i64>,
    }

    #[test]
    fn test_typed_decode() {
        let raw: &[u8] =
            b"d8:announce7:http://13:creation datei100e4:infod6:lengthi7e4:name3:fooee";
        let outer: Outer = decode_bytes(raw).unwrap();
        assert_eq!(
            outer,
            Outer {
                announce: "http://".into(),
                info: Inner {
                    length: 7,
                    name: "foo".into(),
                    md5sum: None,
                },
                creation_date: Some(100),
            }
        );
    }

    #[test]
    fn test_byte_fields() {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(with = "serde_bytes")]
            pieces: Vec<u8>,
        }
        let raw: Raw = decode_bytes(b"d6:pieces4:\x01\x02\x03\x04e").unwrap();
        assert_eq!(raw.pieces, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_bool_from_int() {
        let flags: std::collections::BTreeMap<String, bool> =
            decode_bytes(b"d2:noi0e3:yesi1ee").unwrap();
        assert_eq!(flags["yes"], true);
        assert_eq!(flags["no"], false);
    }

    #[test]
    fn test_type_mismatch() {
        let res: Result<Outer> = decode_bytes(b"d8:announcei1ee");
        assert!(res.is_err());
    }
}
