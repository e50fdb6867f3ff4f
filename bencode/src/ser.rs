use std::collections::BTreeMap;
use serde::ser::{self, Serialize};
use crate::encode::encode;
use crate::error::{Error, ErrorKind, Result};
use crate::value::Value;

// Serialize into the value model. Dictionaries pick up encoding order
// from the BTreeMap, so the output is canonical by construction.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    value.serialize(Serializer)
}

pub fn encode_to_raw<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(encode(&to_value(value)?))
}

pub struct Serializer;

impl ser::Serializer for Serializer {

    type Ok = Value;
    type Error = Error;

    type SerializeSeq = SerializeList;
    type SerializeTuple = SerializeList;
    type SerializeTupleStruct = SerializeList;
    type SerializeTupleVariant = ser::Impossible<Value, Error>;
    type SerializeMap = SerializeDict;
    type SerializeStruct = SerializeDict;
    type SerializeStructVariant = ser::Impossible<Value, Error>;

    fn serialize_bool(self, v: bool) -> Result<Value> {
        Ok(Value::Int(v as i64))
    }

    fn serialize_i8(self, v: i8) -> Result<Value> {
        Ok(Value::Int(v as i64))
    }

    fn serialize_i16(self, v: i16) -> Result<Value> {
        Ok(Value::Int(v as i64))
    }

    fn serialize_i32(self, v: i32) -> Result<Value> {
        Ok(Value::Int(v as i64))
    }

    fn serialize_i64(self, v: i64) -> Result<Value> {
        Ok(Value::Int(v))
    }

    fn serialize_u8(self, v: u8) -> Result<Value> {
        Ok(Value::Int(v as i64))
    }

    fn serialize_u16(self, v: u16) -> Result<Value> {
        Ok(Value::Int(v as i64))
    }

    fn serialize_u32(self, v: u32) -> Result<Value> {
        Ok(Value::Int(v as i64))
    }

    fn serialize_u64(self, v: u64) -> Result<Value> {
        if v > i64::MAX as u64 {
            return Err(Error::new(0, ErrorKind::IntOutOfRange));
        }
        Ok(Value::Int(v as i64))
    }

    fn serialize_f32(self, _: f32) -> Result<Value> {
        Err(ser::Error::custom("bencode cannot represent floats"))
    }

    fn serialize_f64(self, _: f64) -> Result<Value> {
        Err(ser::Error::custom("bencode cannot represent floats"))
    }

    fn serialize_char(self, v: char) -> Result<Value> {
        let mut buf = [0; 4];
        Ok(Value::Bytes(v.encode_utf8(&mut buf).as_bytes().to_vec()))
    }

    fn serialize_str(self, v: &str) -> Result<Value> {
        Ok(Value::Bytes(v.as_bytes().to_vec()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Value> {
        Ok(Value::Bytes(v.to_vec()))
    }

    // Optional fields are skipped at the struct level; a bare None has
    // no bencode representation.
    fn serialize_none(self) -> Result<Value> {
        Err(ser::Error::custom("bencode cannot represent a missing value"))
    }

    fn serialize_some<T>(self, value: &T) -> Result<Value>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(Serializer)
    }

    fn serialize_unit(self) -> Result<Value> {
        Err(ser::Error::custom("bencode cannot represent unit"))
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<Value> {
        Err(ser::Error::custom("bencode cannot represent unit"))
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
    ) -> Result<Value> {
        Ok(Value::Bytes(variant.as_bytes().to_vec()))
    }

    fn serialize_newtype_struct<T>(self, _: &'static str, value: &T) -> Result<Value>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(Serializer)
    }

    fn serialize_newtype_variant<T>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value>
    where
        T: ?Sized + Serialize,
    {
        let mut dict = BTreeMap::new();
        dict.insert(variant.as_bytes().to_vec(), value.serialize(Serializer)?);
        Ok(Value::Dict(dict))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        Ok(SerializeList {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(ser::Error::custom("tuple variants are not bencodable"))
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        Ok(SerializeDict {
            dict: BTreeMap::new(),
            next_key: None,
        })
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct> {
        Ok(SerializeDict {
            dict: BTreeMap::new(),
            next_key: None,
        })
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(ser::Error::custom("struct variants are not bencodable"))
    }
}

pub struct SerializeList {
    items: Vec<Value>,
}

impl ser::SerializeSeq for SerializeList {

    type Ok = Value;
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        self.items.push(value.serialize(Serializer)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(Value::List(self.items))
    }
}

impl ser::SerializeTuple for SerializeList {

    type Ok = Value;
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SerializeList {

    type Ok = Value;
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value> {
        ser::SerializeSeq::end(self)
    }
}

pub struct SerializeDict {
    dict: BTreeMap<Vec<u8>, Value>,
    next_key: Option<Vec<u8>>,
}

impl ser::SerializeMap for SerializeDict {

    type Ok = Value;
    type Error = Error;

    fn serialize_key<T>(&mut self, key: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        match key.serialize(Serializer)? {
            Value::Bytes(b) => {
                self.next_key = Some(b);
                Ok(())
            }
            _ => Err(Error::new(0, ErrorKind::NonStringKey)),
        }
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        let key = self
            .next_key
            .take()
            .ok_or_else(|| ser::Error::custom("map value serialized before key"))?;
        self.dict.insert(key, value.serialize(Serializer)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(Value::Dict(self.dict))
    }
}

impl ser::SerializeStruct for SerializeDict {

    type Ok = Value;
    type Error = Error;

    fn serialize_field<T>(&mut self, name: &'static str, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        self.dict
            .insert(name.as_bytes().to_vec(), value.serialize(Serializer)?);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(Value::Dict(self.dict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::Serialize;

    #[derive(Serialize)]
    struct Record {
        name: String,
        #[serde(with = "serde_bytes")]
        id: Vec<u8>,
        size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    }

    #[test]
    fn test_struct_to_dict() {
        let raw = encode_to_raw(&Record {
            name: "demo".into(),
            id: vec![0xab, 0xcd],
            size: 9,
            comment: None,
        })
        .unwrap();
        assert_eq!(raw, b"d2:id2:\xab\xcd4:name4:demo4:sizei9ee");
    }

    #[test]
    fn test_map_requires_string_keys() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(3u32, "x");
        assert!(to_value(&map).is_err());
    }

    #[test]
    fn test_bool_encodes_as_int() {
        assert_eq!(to_value(&true).unwrap(), Value::Int(1));
        assert_eq!(to_value(&false).unwrap(), Value::Int(0));
    }
}
