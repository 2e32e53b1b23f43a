//! Range and conditional-request evaluation for object reads and copies.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};

/// A parsed `Range` header. Only single `bytes=` ranges are supported;
/// multi-range and other units are ignored (the caller serves a 200).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-b`
    FromTo(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n` (last n bytes)
    Suffix(u64),
}

/// Parse a Range header value. Returns None for anything unsupported,
/// which downgrades the response to a full-body 200.
pub fn parse_range(header: &str) -> Option<RangeSpec> {
    let spec = header.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None; // multi-range unsupported
    }
    let (start, end) = spec.split_once('-')?;
    match (start.is_empty(), end.is_empty()) {
        (true, false) => end.parse().ok().map(RangeSpec::Suffix),
        (false, true) => start.parse().ok().map(RangeSpec::From),
        (false, false) => {
            let (a, b) = (start.parse().ok()?, end.parse().ok()?);
            if a > b {
                return None;
            }
            Some(RangeSpec::FromTo(a, b))
        }
        (true, true) => None,
    }
}

/// Resolve a range against the object size into inclusive `(start, end)`
/// byte offsets. `Err` means the range is unsatisfiable (416).
pub fn resolve_range(spec: RangeSpec, size: u64) -> Result<(u64, u64), ()> {
    if size == 0 {
        return Err(());
    }
    match spec {
        RangeSpec::FromTo(a, b) => {
            if a >= size {
                return Err(());
            }
            Ok((a, b.min(size - 1)))
        }
        RangeSpec::From(a) => {
            if a >= size {
                return Err(());
            }
            Ok((a, size - 1))
        }
        RangeSpec::Suffix(n) => {
            if n == 0 {
                return Err(());
            }
            Ok((size.saturating_sub(n), size - 1))
        }
    }
}

/// Outcome of conditional-header evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOutcome {
    Proceed,
    /// 304 on GET/HEAD, 412 elsewhere
    NotModified,
    /// 412
    Failed,
}

/// The four conditional headers, from either the plain or the
/// `x-amz-copy-source-` prefixed family.
#[derive(Debug, Default, Clone)]
pub struct Preconditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
    pub if_modified_since: Option<DateTime<Utc>>,
}

impl Preconditions {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::extract(headers, "")
    }

    /// Copy operations carry the same conditions prefixed with
    /// `x-amz-copy-source-`.
    pub fn from_copy_headers(headers: &HeaderMap) -> Self {
        Self::extract(headers, "x-amz-copy-source-")
    }

    fn extract(headers: &HeaderMap, prefix: &str) -> Self {
        let get = |name: &str| {
            headers
                .get(format!("{}{}", prefix, name))
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        Self {
            if_match: get("if-match"),
            if_none_match: get("if-none-match"),
            if_unmodified_since: get("if-unmodified-since").and_then(|v| parse_http_date(&v)),
            if_modified_since: get("if-modified-since").and_then(|v| parse_http_date(&v)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_match.is_none()
            && self.if_none_match.is_none()
            && self.if_unmodified_since.is_none()
            && self.if_modified_since.is_none()
    }

    /// Evaluate against an object's ETag and last-modified time.
    /// First failure wins, in the S3-documented order.
    pub fn evaluate(&self, etag: &str, last_modified: DateTime<Utc>) -> CondOutcome {
        if let Some(expected) = &self.if_match {
            if !etag_matches(expected, etag) {
                return CondOutcome::Failed;
            }
        }
        if let Some(threshold) = self.if_unmodified_since {
            if last_modified.timestamp() > threshold.timestamp() {
                return CondOutcome::Failed;
            }
        }
        if let Some(expected) = &self.if_none_match {
            if etag_matches(expected, etag) {
                return CondOutcome::NotModified;
            }
        }
        if let Some(threshold) = self.if_modified_since {
            if last_modified.timestamp() <= threshold.timestamp() {
                return CondOutcome::NotModified;
            }
        }
        CondOutcome::Proceed
    }
}

/// Compare a conditional header value against an unquoted ETag. Values
/// arrive with or without surrounding quotes; `*` matches any.
fn etag_matches(header_value: &str, etag: &str) -> bool {
    let v = header_value.trim();
    if v == "*" {
        return true;
    }
    v.trim_matches('"') == etag
}

/// Parse an HTTP-date (`Sun, 06 Nov 1994 08:49:37 GMT`).
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
