//! Parsing of single-range `Range: bytes=<start>-[<end>]` request headers.
//!
//! Only one range is honoured. A multi-range header such as
//! `bytes=0-10,20-30` is read naively: everything up to the first `,` or
//! second `-` after the first dash is taken as the end, so the example above
//! serves `0-10`. Suffix ranges (`bytes=-500`) are rejected as malformed.

use std::num::IntErrorKind;

use thiserror::Error;

/// Inclusive `[start, end]` span of a file of `total` bytes.
///
/// Always satisfies `start <= end < total`; instances only come out of
/// [`parse_range`], which enforces this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ByteRange {
    /// Number of bytes covered, both ends included.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false: a range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for the `Content-Range` response header.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("malformed range header: {0}")]
    Malformed(String),
    #[error("Requested range not satisfiable\n{start} >= {total}")]
    NotSatisfiable { start: u64, total: u64 },
}

/// Resolves a raw `Range` header value against a file of `total` bytes.
///
/// The end is clamped to the last byte of the file, so `bytes=950-5000` on a
/// 1000 byte file yields `950-999`. A start at or past the end of the file is
/// unsatisfiable whatever the end says.
pub fn parse_range(header: &str, total: u64) -> Result<ByteRange, RangeError> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| RangeError::Malformed(format!("unsupported range unit in {header:?}")))?;

    let (start_raw, rest) = spec
        .split_once('-')
        .ok_or_else(|| RangeError::Malformed(format!("missing '-' in {header:?}")))?;

    let start_raw = start_raw.trim();
    if start_raw.is_empty() {
        return Err(RangeError::Malformed(format!(
            "missing range start in {header:?}"
        )));
    }
    let start = parse_position(start_raw)
        .ok_or_else(|| RangeError::Malformed(format!("invalid range start {start_raw:?}")))?;

    let end_raw = rest.split([',', '-']).next().unwrap_or("").trim();
    let requested_end = if end_raw.is_empty() {
        None
    } else {
        Some(
            parse_position(end_raw)
                .ok_or_else(|| RangeError::Malformed(format!("invalid range end {end_raw:?}")))?,
        )
    };

    if start >= total {
        return Err(RangeError::NotSatisfiable { start, total });
    }

    let last = total - 1;
    let end = requested_end.map_or(last, |end| end.min(last));
    if end < start {
        return Err(RangeError::Malformed(format!(
            "range end {end} precedes start {start}"
        )));
    }

    Ok(ByteRange { start, end, total })
}

/// Decimal byte position. Digit strings too large for `u64` saturate, so a
/// huge start is unsatisfiable and a huge end clamps like any other.
fn parse_position(raw: &str) -> Option<u64> {
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(err) if *err.kind() == IntErrorKind::PosOverflow
            && raw.bytes().all(|b| b.is_ascii_digit()) =>
        {
            Some(u64::MAX)
        }
        Err(_) => None,
    }
}
