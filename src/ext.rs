//! Buffer extension traits for the wire protocol.
use bytes::{Buf, BufMut, Bytes};

/// Integer signess in postgres docs is awful.
pub trait UsizeExt {
    /// length is usize in rust, while sometime postgres want i32,
    /// this will panic when overflow instead of wrapping
    fn to_i32(self) -> i32;
    /// length is usize in rust, while sometime postgres want u16,
    /// this will panic when overflow instead of wrapping
    fn to_u16(self) -> u16;
}

impl UsizeExt for usize {
    fn to_i32(self) -> i32 {
        self.try_into().expect("message size too large for protocol")
    }

    fn to_u16(self) -> u16 {
        self.try_into().expect("message size too large for protocol")
    }
}

pub trait StrExt {
    /// postgres String must be nul terminated
    fn nul_string_len(&self) -> i32;
}

impl StrExt for str {
    fn nul_string_len(&self) -> i32 {
        self.len().to_i32() + 1/* nul */
    }
}

pub trait BufMutExt {
    /// postgres String must be nul terminated
    fn put_nul_string(&mut self, string: &str);
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_string(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

pub trait BytesExt {
    fn get_nul_bytes(&mut self) -> Self;

    fn get_nul_string(&mut self) -> String;
}

impl BytesExt for Bytes {
    fn get_nul_bytes(&mut self) -> Self {
        let end = self
            .iter()
            .position(|e| matches!(e, b'\0'))
            .expect("postgres string did not nul terminated");
        let me = self.split_to(end);
        Buf::advance(self, 1); // nul
        me
    }

    fn get_nul_string(&mut self) -> String {
        String::from_utf8_lossy(&self.get_nul_bytes()).into_owned()
    }
}

/// Lossy display adapter for possibly non utf8 protocol bytes.
pub struct Lossy<'a>(pub &'a [u8]);

impl std::fmt::Debug for Lossy<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&String::from_utf8_lossy(self.0), f)
    }
}

pub trait FmtExt {
    fn lossy(&self) -> Lossy<'_>;
}

impl FmtExt for [u8] {
    fn lossy(&self) -> Lossy<'_> {
        Lossy(self)
    }
}

impl FmtExt for Bytes {
    fn lossy(&self) -> Lossy<'_> {
        Lossy(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn nul_string_round_trip() {
        let mut buf = BytesMut::new();
        buf.put_nul_string("client_encoding");
        buf.put_nul_string("UTF8");
        let mut bytes = buf.freeze();
        assert_eq!(bytes.get_nul_string(), "client_encoding");
        assert_eq!(bytes.get_nul_string(), "UTF8");
        assert!(bytes.is_empty());
    }

    #[test]
    fn nul_string_len_counts_terminator() {
        assert_eq!("user".nul_string_len(), 5);
        assert_eq!("".nul_string_len(), 1);
    }
}
