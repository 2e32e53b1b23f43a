//! AWS chunked transfer encoding decoder
//!
//! When a client signs with STREAMING-AWS4-HMAC-SHA256-PAYLOAD (or sends
//! `Content-Encoding: aws-chunked`), the body arrives framed:
//!
//! ```text
//! <hex-chunk-size>;chunk-signature=<signature>\r\n
//! <chunk-data>\r\n
//! ...
//! 0;chunk-signature=<signature>\r\n
//! ```
//!
//! This module strips the framing and yields the raw payload. Per-chunk
//! signatures are not validated; trust is rooted in the outer SigV4
//! signature over the streaming sentinel.

use axum::body::Bytes;
use axum::http::HeaderMap;
use tracing::{debug, warn};

/// Sentinel payload hash marking a streamed, chunk-signed body.
pub const STREAMING_PAYLOAD: &str = "STREAMING-AWS4-HMAC-SHA256-PAYLOAD";

/// Check if the request body uses AWS chunked framing
pub fn is_aws_chunked(headers: &HeaderMap) -> bool {
    let streaming = headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == STREAMING_PAYLOAD)
        .unwrap_or(false);
    let encoded = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|e| e.trim() == "aws-chunked"))
        .unwrap_or(false);
    streaming || encoded
}

/// Get the decoded content length from headers
pub fn get_decoded_content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get("x-amz-decoded-content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Decode AWS chunked transfer encoding.
///
/// Returns the decoded payload, or None on malformed framing (the caller
/// maps that to `InvalidRequest`).
pub fn decode_aws_chunked(body: &Bytes, expected_length: Option<usize>) -> Option<Bytes> {
    let mut result = Vec::with_capacity(expected_length.unwrap_or(body.len()));
    let mut pos = 0;

    while pos < body.len() {
        // Find the chunk header line (ends with \r\n)
        let header_end = find_crlf(&body[pos..])?;
        let header_line = &body[pos..pos + header_end];
        pos += header_end + 2; // Skip past \r\n

        // Parse chunk size from header: "<hex-size>;chunk-signature=..."
        let header_str = std::str::from_utf8(header_line).ok()?;
        let chunk_size_hex = header_str.split(';').next()?;
        let chunk_size = usize::from_str_radix(chunk_size_hex.trim(), 16).ok()?;

        debug!(
            "AWS chunked: parsed chunk header '{}', size={}",
            header_str, chunk_size
        );

        // End of chunks
        if chunk_size == 0 {
            break;
        }

        // Read chunk data
        if pos + chunk_size > body.len() {
            warn!(
                "AWS chunked: not enough data for chunk (need {}, have {})",
                chunk_size,
                body.len() - pos
            );
            return None;
        }
        result.extend_from_slice(&body[pos..pos + chunk_size]);
        pos += chunk_size;

        // Skip trailing \r\n after chunk data
        if pos + 2 <= body.len() && &body[pos..pos + 2] == b"\r\n" {
            pos += 2;
        }
    }

    if let Some(expected) = expected_length {
        if result.len() != expected {
            warn!(
                "AWS chunked: decoded length {} doesn't match expected {}",
                result.len(),
                expected
            );
            // Return anyway, some clients round-trip slightly different values
        }
    }

    debug!(
        "AWS chunked: decoded {} bytes from {} byte payload",
        result.len(),
        body.len()
    );

    Some(Bytes::from(result))
}

/// Find the position of \r\n in a byte slice
fn find_crlf(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(1)).find(|&i| data[i] == b'\r' && data[i + 1] == b'\n')
}
