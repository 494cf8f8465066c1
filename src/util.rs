//! Small helpers shared across the server: clocks, pattern matching,
//! password hashing and byte/number conversions.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::types::{ErrorKind, ServerError, ServerResult};

/// Wall-clock milliseconds since the epoch.
pub fn mstime() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        // Clock before the epoch; the reactor treats backward jumps as skew.
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Wall-clock microseconds since the epoch.
pub fn ustime() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(e) => -(e.duration().as_micros() as i64),
    }
}

/// Glob-style match over binary-safe strings. Patterns and subjects are
/// matched bytewise through a lossy utf-8 view, which is exact for the
/// ascii patterns ACL rules and MATCH arguments use in practice.
pub fn stringmatch(pattern: &[u8], subject: &[u8]) -> bool {
    glob_match::glob_match(
        &String::from_utf8_lossy(pattern),
        &String::from_utf8_lossy(subject),
    )
}

/// Compare two byte strings without leaking the position of the first
/// mismatch through timing. Always scans `a.len()` bytes; unequal lengths
/// compare unequal but still burn the full loop.
pub fn time_independent_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = (a.len() ^ b.len()) as u8;
    for (i, &ab) in a.iter().enumerate() {
        let bb = if i < b.len() { b[i] } else { 0 };
        diff |= ab ^ bb;
    }
    diff == 0
}

/// Lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(HEX[(byte >> 4) as usize]);
        out.push_str(HEX[(byte & 0xf) as usize]);
    }
    out
}

const HEX: [&str; 16] = [
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "a", "b", "c", "d", "e", "f",
];

/// True if `s` is exactly 64 lowercase-insensitive hex characters, the only
/// shape a stored SHA-256 password hash may take.
pub fn valid_sha256_hex(s: &[u8]) -> bool {
    s.len() == 64 && s.iter().all(|b| b.is_ascii_hexdigit())
}

pub fn parse_i64(bytes: &[u8]) -> ServerResult<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            ServerError::new(ErrorKind::Generic, "value is not an integer or out of range")
        })
}

pub fn parse_f64(bytes: &[u8]) -> ServerResult<f64> {
    let s = std::str::from_utf8(bytes)
        .map_err(|_| ServerError::new(ErrorKind::Generic, "value is not a valid float"))?;
    let v = match s {
        "+inf" | "inf" | "Inf" | "+Inf" => f64::INFINITY,
        "-inf" | "-Inf" => f64::NEG_INFINITY,
        _ => s
            .parse::<f64>()
            .map_err(|_| ServerError::new(ErrorKind::Generic, "value is not a valid float"))?,
    };
    if v.is_nan() {
        return Err(ServerError::new(ErrorKind::Generic, "value is not a valid float"));
    }
    Ok(v)
}

/// Equality check for command and subcommand names (ascii, case-blind).
pub fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_compare_matches_plain_eq() {
        assert!(time_independent_eq(b"secret", b"secret"));
        assert!(!time_independent_eq(b"secret", b"secreT"));
        assert!(!time_independent_eq(b"short", b"longer-value"));
        assert!(time_independent_eq(b"", b""));
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn glob_matching() {
        assert!(stringmatch(b"cache:*", b"cache:42"));
        assert!(!stringmatch(b"cache:*", b"user:42"));
        assert!(stringmatch(b"h?llo", b"hello"));
        assert!(stringmatch(b"*", b"anything"));
    }

    #[test]
    fn hex_validation() {
        assert!(valid_sha256_hex(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".as_bytes()
        ));
        assert!(!valid_sha256_hex(b"abc"));
        assert!(!valid_sha256_hex(
            "zz7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".as_bytes()
        ));
    }
}
