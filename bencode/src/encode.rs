use crate::value::Value;

// Encoding is deterministic: dictionary keys come out of the BTreeMap
// in ascending order, so encode(decode(b)) == b for canonical input.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {

        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }

        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }

        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }

        Value::Dict(dict) => {
            out.push(b'd');
            for (key, item) in dict {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode(&Value::Int(42)), b"i42e");
        assert_eq!(encode(&Value::Int(-7)), b"i-7e");
        assert_eq!(encode(&Value::Bytes(b"spam".to_vec())), b"4:spam");
    }

    #[test]
    fn test_encode_dict_sorted() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"zz".to_vec(), Value::Int(1));
        dict.insert(b"aa".to_vec(), Value::Int(2));
        assert_eq!(encode(&Value::Dict(dict)), b"d2:aai2e2:zzi1ee");
    }

    #[test]
    fn test_round_trip() {
        let canonical: &[u8] = b"d4:infod6:lengthi7e4:name3:fooe5:tiersll3:abceee";
        let value = decode(canonical).unwrap();
        assert_eq!(encode(&value), canonical);
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }
}
