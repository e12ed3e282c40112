//! Object path segment escaping.
//!
//! D-Bus object path segments may only contain `[A-Za-z0-9_]`. Services that
//! embed arbitrary names in paths (systemd units, for instance) escape every
//! other byte as `_xy`, where `xy` is the byte in hex:
//!
//! ```text
//! ssh.service   <->   ssh_2eservice
//! ```
//!
//! Decoding is lenient: a `_` that is not followed by two hex digits is kept
//! as-is, so decoding never fails.

/// Prefix of systemd unit object paths.
pub const SYSTEMD_UNIT_PREFIX: &str = "/org/freedesktop/systemd1/unit/";

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Escapes arbitrary bytes into a path-safe segment.
///
/// ASCII alphanumerics pass through; every other byte (including `_`) becomes
/// `_xy`. The empty input encodes to the empty string.
#[must_use]
pub fn encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for &byte in input {
        if byte.is_ascii_alphanumeric() {
            out.push(char::from(byte));
        } else {
            out.push('_');
            out.push(char::from(HEX[usize::from(byte >> 4)]));
            out.push(char::from(HEX[usize::from(byte & 0x0f)]));
        }
    }
    out
}

/// Decodes an escaped segment into raw bytes.
#[must_use]
pub fn decode_bytes(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Decodes an escaped segment into a string.
///
/// Decoded bytes that are not valid UTF-8 are replaced with U+FFFD.
#[must_use]
pub fn decode(input: &str) -> String {
    String::from_utf8_lossy(&decode_bytes(input)).into_owned()
}

/// Decodes a systemd unit object path into the unit name.
///
/// Paths without the unit prefix, or with nothing after it, decode to `""`.
#[must_use]
pub fn decode_unit_path(path: &str) -> String {
    match path.strip_prefix(SYSTEMD_UNIT_PREFIX) {
        Some(encoded) if !encoded.is_empty() => decode(encoded),
        _ => String::new(),
    }
}

const fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn decode_inverts_encode(input in prop::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(decode_bytes(&encode(&input)), input);
        }

        #[test]
        fn encoded_segments_are_path_safe(input in prop::collection::vec(any::<u8>(), 0..64)) {
            prop_assert!(encode(&input).bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'));
        }
    }
}
