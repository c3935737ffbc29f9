//! Conditional and partial responses for downloads.
//!
//! Only a single `bytes` range is honoured. Multiple ranges, other units and
//! malformed headers fall back to the full representation.

use axum::http::{HeaderMap, HeaderValue, header};
use std::time::{SystemTime, UNIX_EPOCH};

/// An inclusive byte range (`start..=end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(self) -> bool {
        self.start > self.end
    }

    pub fn content_range(self, size: u64) -> String {
        format!("bytes {}-{}/{size}", self.start, self.end)
    }
}

/// What part of the file the response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Decide the response shape from the request's `Range` header.
pub fn select_range(value: Option<&HeaderValue>, size: u64) -> RangeOutcome {
    let Some(value) = value.and_then(|v| v.to_str().ok()) else {
        return RangeOutcome::Full;
    };
    let Some((unit, spec)) = value.trim().split_once('=') else {
        return RangeOutcome::Full;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") || spec.contains(',') {
        return RangeOutcome::Full;
    }

    let Some((first, last)) = spec.trim().split_once('-') else {
        return RangeOutcome::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix form: the final `n` bytes.
        let Ok(suffix) = last.parse::<u64>() else {
            return RangeOutcome::Full;
        };
        if suffix == 0 || size == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        return RangeOutcome::Partial(ByteRange {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }

    let Ok(start) = first.parse::<u64>() else {
        return RangeOutcome::Full;
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return RangeOutcome::Full,
        }
    };

    if start >= size {
        return RangeOutcome::Unsatisfiable;
    }
    let end = end.map_or(size - 1, |end| end.min(size - 1));
    RangeOutcome::Partial(ByteRange { start, end })
}

/// Whether the client's cached copy, validated by `If-Modified-Since`, is
/// still current. HTTP dates have one-second resolution.
pub fn not_modified(headers: &HeaderMap, modified: SystemTime) -> bool {
    header_date(headers, header::IF_MODIFIED_SINCE)
        .is_some_and(|since| whole_seconds(modified) <= whole_seconds(since))
}

/// Whether a `Range` header may be honoured under `If-Range`.
///
/// Only the HTTP-date form is understood; entity tags never match since
/// downloads carry none.
pub fn range_applies(headers: &HeaderMap, modified: SystemTime) -> bool {
    let Some(value) = headers.get(header::IF_RANGE) else {
        return true;
    };
    value
        .to_str()
        .ok()
        .and_then(|v| httpdate::parse_http_date(v).ok())
        .is_some_and(|date| whole_seconds(modified) <= whole_seconds(date))
}

pub fn last_modified(modified: SystemTime) -> String {
    httpdate::fmt_http_date(modified)
}

fn header_date(headers: &HeaderMap, name: header::HeaderName) -> Option<SystemTime> {
    let value = headers.get(name)?.to_str().ok()?;
    httpdate::parse_http_date(value).ok()
}

fn whole_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
