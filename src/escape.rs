//! The dump format's string escape alphabet, and hex digest conversion.
//!
//! Decoding is deliberately permissive (any unescaped byte passes through
//! unchanged) since the dump format is ASCII-oriented but not required to
//! be. Encoding is the strict direction: it only ever emits bytes in
//! `[\x21-\x7e]`, excluding space and `=`, so that encoded fields can
//! always be split on a single space and `key=value` xattrs can always be
//! split on the first unescaped `=`.

use crate::error::{CfsError, Result};

/// The single-byte run that means "this optional field is absent".
const ABSENT: &[u8] = b"-";

/// Decode one dump-format field into raw bytes.
pub fn decode(escaped: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter().copied();

    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next().ok_or(CfsError::MalformedEscape)? {
            b'\\' => out.push(b'\\'),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'x' => {
                let hi = hex_digit(bytes.next().ok_or(CfsError::MalformedEscape)?)
                    .ok_or(CfsError::MalformedEscape)?;
                let lo = hex_digit(bytes.next().ok_or(CfsError::MalformedEscape)?)
                    .ok_or(CfsError::MalformedEscape)?;
                out.push(hi << 4 | lo);
            }
            _ => return Err(CfsError::MalformedEscape),
        }
    }
    Ok(out)
}

/// Decode a field that may be the `-` sentinel for "absent".
pub fn decode_optional(escaped: &[u8]) -> Result<Option<Vec<u8>>> {
    if escaped == ABSENT {
        return Ok(None);
    }
    Ok(Some(decode(escaped)?))
}

/// Encode raw bytes into the dump format's escape alphabet.
///
/// The result never contains a space, `=`, or any byte outside
/// `[\x21-\x7e]` unescaped, so it's always safe to embed as a
/// space-separated field.
pub fn encode(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b' ' | b'=' => out.push_str(&format!("\\x{b:02x}")),
            0x21..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

/// Encode a field that may be absent, as the `-` sentinel.
pub fn encode_optional(raw: Option<&[u8]>) -> String {
    match raw {
        None => "-".to_string(),
        // An empty-but-present value would otherwise round-trip as "-" too,
        // so encode it as an explicit empty escape run... but an empty run
        // *is* the empty string, which is unambiguous as long as it's never
        // literally "-". Guard that one pathological case.
        Some(b) if b == ABSENT => "\\x2d".to_string(),
        Some(b) => encode(b),
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Parse a hex digest (an even number of hex characters) into raw bytes,
/// failing if the string is the wrong length or isn't hex.
pub fn hex_decode_digest(s: &[u8]) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(CfsError::InvalidHexDigest);
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    for pair in s.chunks_exact(2) {
        let hi = hex_digit(pair[0]).ok_or(CfsError::InvalidHexDigest)?;
        let lo = hex_digit(pair[1]).ok_or(CfsError::InvalidHexDigest)?;
        out.push(hi << 4 | lo);
    }
    Ok(out)
}

/// Encode raw bytes as a lowercase hex digest.
pub fn hex_encode_digest(raw: &[u8]) -> String {
    data_encoding::HEXLOWER.encode(raw)
}
