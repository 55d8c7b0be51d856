//! Password based authentication responses.
use std::fmt::Write;

/// `md5` + hex(md5(hex(md5(password + user)) + salt))
///
/// The double hash makes the wire response salted per connection while the
/// server only stores the inner hash.
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = md5::compute([password.as_bytes(), user.as_bytes()].concat());
    let inner_hex = hex(&inner.0);

    let mut outer_input = Vec::with_capacity(inner_hex.len() + 4);
    outer_input.extend_from_slice(inner_hex.as_bytes());
    outer_input.extend_from_slice(&salt);
    let outer = md5::compute(outer_input);

    let mut out = String::with_capacity(3 + 32);
    out.push_str("md5");
    out.push_str(&hex(&outer.0));
    out
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_response_shape() {
        let hash = md5_password("test", "secret", [1, 2, 3, 4]);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 35);
        assert!(hash[3..].bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn md5_response_depends_on_salt_and_user() {
        let a = md5_password("test", "secret", [1, 2, 3, 4]);
        assert_eq!(a, md5_password("test", "secret", [1, 2, 3, 4]));
        assert_ne!(a, md5_password("test", "secret", [4, 3, 2, 1]));
        assert_ne!(a, md5_password("other", "secret", [1, 2, 3, 4]));
    }
}
