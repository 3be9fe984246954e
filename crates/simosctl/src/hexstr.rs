//! Hex string helpers for shell arguments and solver pipes

/// Decode a hex string (optionally `0x`-prefixed, even length) into bytes.
pub fn decode(s: &str) -> Option<Vec<u8>> {
    let s = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Parse a hex string as a 32-bit big-endian value, e.g. an address.
pub fn parse_u32(s: &str) -> Option<u32> {
    let s = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16).ok()
}

/// Render bytes as lowercase hex.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_roundtrip() {
        let bytes = decode("a0040000").unwrap();
        assert_eq!(bytes, vec![0xA0, 0x04, 0x00, 0x00]);
        assert_eq!(encode(&bytes), "a0040000");
    }

    #[test]
    fn test_decode_rejects_odd_and_junk() {
        assert!(decode("a00").is_none());
        assert!(decode("zz").is_none());
        assert!(decode("").is_none());
    }

    #[test]
    fn test_parse_u32_accepts_prefix() {
        assert_eq!(parse_u32("0xA0040000"), Some(0xA004_0000));
        assert_eq!(parse_u32("8001420C"), Some(0x8001_420C));
        assert_eq!(parse_u32("not hex"), None);
    }
}
