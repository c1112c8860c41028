//! Bencoded byte strings, the only bencode shape BEP44 values need here.

use crate::error::{DhtError, Result};

/// `<len>:<bytes>`
pub fn bencode_bytes(value: &[u8]) -> Vec<u8> {
    let mut out = value.len().to_string().into_bytes();
    out.push(b':');
    out.extend_from_slice(value);
    out
}

/// Inverse of [`bencode_bytes`]. The whole input must be one byte string.
pub fn unbencode_bytes(encoded: &[u8]) -> Result<&[u8]> {
    let colon = encoded
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| DhtError::Malformed("bencoded string has no length prefix".to_string()))?;

    let digits = &encoded[..colon];
    if digits.is_empty()
        || !digits.iter().all(u8::is_ascii_digit)
        || (digits.len() > 1 && digits[0] == b'0')
    {
        return Err(DhtError::Malformed("invalid bencoded length".to_string()));
    }

    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DhtError::Malformed("bencoded length out of range".to_string()))?;

    let body = &encoded[colon + 1..];
    if body.len() != len {
        return Err(DhtError::Malformed(format!(
            "bencoded length {} does not match {} remaining bytes",
            len,
            body.len()
        )));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_length_prefix() {
        assert_eq!(bencode_bytes(b"spam"), b"4:spam".to_vec());
        assert_eq!(bencode_bytes(b""), b"0:".to_vec());
    }

    #[test]
    fn decodes_nested_value_once() {
        let inner = bencode_bytes(br#"{"name":"relay"}"#);
        let outer = bencode_bytes(&inner);
        assert_eq!(unbencode_bytes(&outer).unwrap(), inner.as_slice());
        assert_eq!(
            unbencode_bytes(&inner).unwrap(),
            br#"{"name":"relay"}"#.as_slice()
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in [&b"spam"[..], b"5:spam", b"3:spam", b"x:abc", b"03:abc", b":abc"] {
            assert!(unbencode_bytes(bad).is_err(), "{:?}", String::from_utf8_lossy(bad));
        }
    }
}
