use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 32;

/// Decodes a single bencode value from `data`.
///
/// The input must hold exactly one complete value; trailing bytes are an
/// error, as is nesting deeper than 32 levels.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut d = Decoder { data, pos: 0 };
    let value = d.value(0)?;
    if d.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth >= MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            other => Err(BencodeError::UnexpectedByte(other)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let digits = self.take_until(b'e')?;
        let n = parse_int(digits)?;
        self.pos += 1;
        Ok(Value::Integer(n))
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let digits = self.take_until(b':')?;
        let len = parse_int(digits)?;
        if len < 0 {
            return Err(BencodeError::InvalidLength);
        }
        self.pos += 1;
        let len = len as usize;
        if self.data.len() - self.pos < len {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::UnexpectedByte(self.peek()?));
            }
            let key = self.byte_string()?;
            let value = self.value(depth + 1)?;
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(map))
    }

    fn take_until(&mut self, end: u8) -> Result<&[u8], BencodeError> {
        let start = self.pos;
        let mut pos = self.pos;
        while *self.data.get(pos).ok_or(BencodeError::UnexpectedEof)? != end {
            pos += 1;
        }
        self.pos = pos;
        Ok(&self.data[start..pos])
    }
}

fn parse_int(digits: &[u8]) -> Result<i64, BencodeError> {
    if digits.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }
    // no leading zeros, no "-0"
    if digits == b"-0"
        || (digits[0] == b'0' && digits.len() > 1)
        || (digits.len() > 2 && digits[0] == b'-' && digits[1] == b'0')
    {
        return Err(BencodeError::InvalidInteger);
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::InvalidInteger)
}
