use std::collections::BTreeMap;

use bytes::Bytes;

/// A bencode value: integer, byte string, list, or dictionary.
///
/// Dictionary keys are byte strings and sort lexicographically, which is
/// what the wire encoding requires.
///
/// # Examples
///
/// ```
/// use kadnode::bencode::{decode, Value};
///
/// let msg = decode(b"d1:q4:ping1:y1:qe").unwrap();
/// assert_eq!(msg.get(b"y").and_then(|v| v.as_str()), Some("q"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Byte string value from a slice.
    pub fn bytes(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }

    /// Byte string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Value::bytes(s.as_bytes())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The value as a UTF-8 string, if it is a valid UTF-8 byte string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    /// Looks up `key` and returns it as a byte string.
    pub fn get_bytes(&self, key: &[u8]) -> Option<&Bytes> {
        self.get(key)?.as_bytes()
    }

    /// Looks up `key` and returns it as an integer.
    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key)?.as_integer()
    }
}
