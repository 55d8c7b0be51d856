//! Parameter values as they travel into `Bind`.
use bytes::{BufMut, Bytes};

use crate::ext::UsizeExt;

/// A parameter value, kept in its typed form until the wire format for the
/// parameter is decided.
#[derive(Clone)]
pub enum Value<'a> {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(&'a str),
    TextOwned(String),
    Slice(&'a [u8]),
    Bytes(Bytes),
}

impl Value<'_> {
    /// Returns `true` for the NULL value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Wire length of the value in binary format.
    ///
    /// NULL is `-1` with no value bytes following.
    pub fn binary_len(&self) -> i32 {
        match self {
            Value::Null => -1,
            Value::Bool(_) => 1,
            Value::Int2(_) => 2,
            Value::Int4(_) | Value::Float4(_) => 4,
            Value::Int8(_) | Value::Float8(_) => 8,
            Value::Text(s) => s.len().to_i32(),
            Value::TextOwned(s) => s.len().to_i32(),
            Value::Slice(b) => b.len().to_i32(),
            Value::Bytes(b) => b.len().to_i32(),
        }
    }

    /// Wire length of the value in text format.
    pub fn text_len(&self) -> i32 {
        match self {
            Value::Null => -1,
            Value::Bool(_) => 1,
            Value::Int2(i) => itoa::Buffer::new().format(*i).len().to_i32(),
            Value::Int4(i) => itoa::Buffer::new().format(*i).len().to_i32(),
            Value::Int8(i) => itoa::Buffer::new().format(*i).len().to_i32(),
            Value::Float4(f) => f.to_string().len().to_i32(),
            Value::Float8(f) => f.to_string().len().to_i32(),
            Value::Text(s) => s.len().to_i32(),
            Value::TextOwned(s) => s.len().to_i32(),
            // bytea hex form: `\x` then two digits per byte
            Value::Slice(b) => (2 + b.len() * 2).to_i32(),
            Value::Bytes(b) => (2 + b.len() * 2).to_i32(),
        }
    }

    /// Write the value bytes in binary format. NULL writes nothing.
    pub fn put_binary(&self, buf: &mut impl BufMut) {
        match self {
            Value::Null => {}
            Value::Bool(b) => buf.put_u8(*b as u8),
            Value::Int2(i) => buf.put_i16(*i),
            Value::Int4(i) => buf.put_i32(*i),
            Value::Int8(i) => buf.put_i64(*i),
            Value::Float4(f) => buf.put_f32(*f),
            Value::Float8(f) => buf.put_f64(*f),
            Value::Text(s) => buf.put_slice(s.as_bytes()),
            Value::TextOwned(s) => buf.put_slice(s.as_bytes()),
            Value::Slice(b) => buf.put_slice(b),
            Value::Bytes(b) => buf.put_slice(b),
        }
    }

    /// Write the value bytes in text format. NULL writes nothing.
    pub fn put_text(&self, buf: &mut impl BufMut) {
        match self {
            Value::Null => {}
            Value::Bool(b) => buf.put_u8(if *b { b't' } else { b'f' }),
            Value::Int2(i) => buf.put_slice(itoa::Buffer::new().format(*i).as_bytes()),
            Value::Int4(i) => buf.put_slice(itoa::Buffer::new().format(*i).as_bytes()),
            Value::Int8(i) => buf.put_slice(itoa::Buffer::new().format(*i).as_bytes()),
            Value::Float4(f) => buf.put_slice(f.to_string().as_bytes()),
            Value::Float8(f) => buf.put_slice(f.to_string().as_bytes()),
            Value::Text(s) => buf.put_slice(s.as_bytes()),
            Value::TextOwned(s) => buf.put_slice(s.as_bytes()),
            Value::Slice(b) => put_hex(b, buf),
            Value::Bytes(b) => put_hex(b, buf),
        }
    }
}

fn put_hex(bytes: &[u8], buf: &mut impl BufMut) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    buf.put_slice(b"\\x");
    for b in bytes {
        buf.put_u8(HEX[(b >> 4) as usize]);
        buf.put_u8(HEX[(b & 0xf) as usize]);
    }
}

impl std::fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use crate::ext::FmtExt;
        use std::fmt::Debug;
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => Debug::fmt(v, f),
            Value::Int2(v) => Debug::fmt(v, f),
            Value::Int4(v) => Debug::fmt(v, f),
            Value::Int8(v) => Debug::fmt(v, f),
            Value::Float4(v) => Debug::fmt(v, f),
            Value::Float8(v) => Debug::fmt(v, f),
            Value::Text(v) => Debug::fmt(v, f),
            Value::TextOwned(v) => Debug::fmt(v, f),
            Value::Slice(v) => Debug::fmt(&v.lossy(), f),
            Value::Bytes(v) => Debug::fmt(&v.lossy(), f),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn null_is_negative_one() {
        assert_eq!(Value::Null.binary_len(), -1);
        assert_eq!(Value::Null.text_len(), -1);
    }

    #[test]
    fn int_text_form() {
        let mut buf = BytesMut::new();
        Value::Int4(-42).put_text(&mut buf);
        assert_eq!(&buf[..], b"-42");
        assert_eq!(Value::Int4(-42).text_len(), 3);
    }

    #[test]
    fn bytea_text_is_hex() {
        let mut buf = BytesMut::new();
        Value::Slice(&[0xde, 0xad]).put_text(&mut buf);
        assert_eq!(&buf[..], b"\\xdead");
    }
}
