//! Formats raw keys and values for logging and debug output.

use itertools::Itertools as _;

/// Formats raw bytes as an escaped ASCII string.
pub fn bytes(bytes: &[u8]) -> String {
    let escaped = bytes
        .iter()
        .copied()
        .flat_map(std::ascii::escape_default)
        .collect_vec();
    format!("\"{}\"", String::from_utf8_lossy(&escaped))
}

/// Formats a key/value pair, where the value may not exist.
pub fn key_maybe_value(key: &[u8], value: Option<&[u8]>) -> String {
    let fmtkey = bytes(key);
    let fmtvalue = value.map_or("None".to_string(), bytes);
    format!("{fmtkey} -> {fmtvalue}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_non_printable_bytes() {
        assert_eq!(bytes(b"plain"), "\"plain\"");
        assert_eq!(bytes(&[0, 255]), "\"\\x00\\xff\"");
    }

    #[test]
    fn test_key_maybe_value() {
        assert_eq!(key_maybe_value(b"k", Some(b"v")), "\"k\" -> \"v\"");
        assert_eq!(key_maybe_value(b"k", None), "\"k\" -> None");
    }
}
