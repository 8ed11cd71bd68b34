//! Line-protocol canonicalization and routing-key extraction.
//!
//! Every write line is canonicalized before any routing decision: the
//! trailing timestamp is rewritten to nanosecond precision and the line is
//! newline-terminated. Placement must be stable across clients regardless of
//! the precision they submit, so this is the single point where the raw byte
//! line is touched.

use crate::{Error, Result};

/// Timestamp precision of a submitted write line.
///
/// The discriminant doubles as the one-byte tag in spool records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Precision {
    Ns = 0,
    Us = 1,
    Ms = 2,
    S = 3,
    M = 4,
    H = 5,
}

impl Precision {
    /// Parse the precision tag from a write request query string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "n" | "ns" => Some(Precision::Ns),
            "u" | "us" => Some(Precision::Us),
            "ms" => Some(Precision::Ms),
            "s" => Some(Precision::S),
            "m" => Some(Precision::M),
            "h" => Some(Precision::H),
            _ => None,
        }
    }

    /// Multiplier from this precision to nanoseconds.
    pub fn factor(self) -> i64 {
        match self {
            Precision::Ns => 1,
            Precision::Us => 1_000,
            Precision::Ms => 1_000_000,
            Precision::S => 1_000_000_000,
            Precision::M => 60 * 1_000_000_000,
            Precision::H => 3_600 * 1_000_000_000,
        }
    }

    /// One-byte tag used in spool records.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Precision::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Precision::Ns),
            1 => Some(Precision::Us),
            2 => Some(Precision::Ms),
            3 => Some(Precision::S),
            4 => Some(Precision::M),
            5 => Some(Precision::H),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Ns => "ns",
            Precision::Us => "us",
            Precision::Ms => "ms",
            Precision::S => "s",
            Precision::M => "m",
            Precision::H => "h",
        }
    }
}

/// Canonicalize a write line: rewrite a trailing integer timestamp to
/// nanoseconds and ensure the result is newline-terminated.
///
/// Lines without a trailing integer timestamp are left unchanged apart from
/// the newline. An unknown precision (`None`) skips the rewrite.
pub fn to_nanos(line: &[u8], precision: Option<Precision>) -> Vec<u8> {
    let trimmed = trim_line_end(line);
    let mut out = match precision.map(Precision::factor) {
        Some(factor) if factor > 1 => rewrite_timestamp(trimmed, factor),
        _ => trimmed.to_vec(),
    };
    out.push(b'\n');
    out
}

/// Extract the measurement token: text up to the first unescaped comma or
/// whitespace, with backslash escapes removed.
pub fn scan_measurement(line: &[u8]) -> Result<String> {
    let mut token = Vec::new();
    let mut escaped = false;
    for &b in line {
        if escaped {
            token.push(b);
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            b',' | b' ' | b'\t' | b'\n' | b'\r' => break,
            _ => token.push(b),
        }
    }
    if token.is_empty() {
        return Err(Error::Malformed);
    }
    String::from_utf8(token).map_err(|_| Error::Malformed)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Multiply a trailing integer timestamp by `factor`. Lines whose last
/// whitespace-separated field is not an integer are returned unchanged.
fn rewrite_timestamp(line: &[u8], factor: i64) -> Vec<u8> {
    let Some(sep) = line.iter().rposition(|&b| b == b' ') else {
        return line.to_vec();
    };
    let field = &line[sep + 1..];
    let Some(ts) = parse_i64(field) else {
        return line.to_vec();
    };
    let Some(nanos) = ts.checked_mul(factor) else {
        return line.to_vec();
    };
    let mut out = Vec::with_capacity(line.len() + 9);
    out.extend_from_slice(&line[..=sep]);
    out.extend_from_slice(nanos.to_string().as_bytes());
    out
}

fn parse_i64(field: &[u8]) -> Option<i64> {
    if field.is_empty() {
        return None;
    }
    std::str::from_utf8(field).ok()?.parse().ok()
}
