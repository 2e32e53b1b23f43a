//! Core types for the capstan object engine: object metadata sidecars,
//! bucket versioning state, and the bucket/key validation rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Sentinel version id written by PUTs against a version-suspended bucket.
pub const NULL_VERSION_ID: &str = "null";

/// S3 response header prefix for user-defined metadata.
pub const AMZ_META_PREFIX: &str = "x-amz-meta-";

/// Per-bucket versioning state.
///
/// `Disabled` buckets store at most one current object per key and no
/// history. Once a bucket has been `Enabled` it can only move to
/// `Suspended`, never back to `Disabled`, matching the S3 state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersioningState {
    Disabled,
    Enabled,
    Suspended,
}

impl VersioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersioningState::Disabled => "Disabled",
            VersioningState::Enabled => "Enabled",
            VersioningState::Suspended => "Suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Disabled" => Some(VersioningState::Disabled),
            "Enabled" => Some(VersioningState::Enabled),
            "Suspended" => Some(VersioningState::Suspended),
            _ => None,
        }
    }
}

impl fmt::Display for VersioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata sidecar stored next to every object (and every version).
///
/// Serialized as pretty JSON in `<key>.meta.json` or
/// `<key>.versions/<versionId>.meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Bucket name
    pub bucket: String,

    /// Full object key as the client supplied it
    pub key: String,

    /// Object size in bytes (0 for delete markers)
    pub size: u64,

    /// Content-Type header if provided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Unquoted ETag: MD5 hex for plain objects, `md5hex-N` for multipart
    pub etag: String,

    /// Creation timestamp of this version (UTC ISO8601).
    /// Version listings order by this field, newest first.
    pub updated_at: DateTime<Utc>,

    /// User-provided custom metadata (x-amz-meta-* headers, stored without
    /// the prefix, names lowercased)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user_metadata: HashMap<String, String>,

    /// Version id: 32-char lowercase hex, the sentinel "null", or absent
    /// for objects written while versioning was disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,

    /// Whether this version masks the key as logically deleted
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_delete_marker: bool,

    /// Whether this version is the current one for its key. Not persisted:
    /// the `.latest` marker file is the single source of truth, and the
    /// engine fills this in when loading sidecars.
    #[serde(skip)]
    pub is_latest: bool,
}

impl ObjectMeta {
    /// ETag as it appears on the wire (quoted).
    pub fn quoted_etag(&self) -> String {
        format!("\"{}\"", self.etag)
    }

    /// Version id for response headers and listings; absent ids collapse
    /// to the "null" sentinel the way S3 reports unversioned objects.
    pub fn version_id_or_null(&self) -> &str {
        self.version_id.as_deref().unwrap_or(NULL_VERSION_ID)
    }
}

/// Row describing an in-progress multipart upload, persisted as
/// `meta.json` inside the upload's scratch directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartUploadMeta {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user_metadata: HashMap<String, String>,
    pub initiated_at: DateTime<Utc>,
}

/// Sidecar for a single uploaded part (`part-<n>.meta`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartMeta {
    pub part_number: u32,
    /// MD5 hex of the part bytes (unquoted)
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Mint a fresh 32-char lowercase hex version id.
pub fn new_version_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Errors produced when validating user-provided bucket/key inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameValidationError(pub String);

impl fmt::Display for NameValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for NameValidationError {}

/// Validate a bucket name against the S3 DNS-name rules:
/// 3-63 chars, lowercase letters/digits/dots/hyphens, must start and end
/// alphanumeric, no adjacent dots, not formatted like an IPv4 address.
pub fn validate_bucket_name(name: &str) -> Result<(), NameValidationError> {
    if name.len() < 3 || name.len() > 63 {
        return Err(NameValidationError(
            "Bucket name must be between 3 and 63 characters".to_string(),
        ));
    }
    let bytes = name.as_bytes();
    if !bytes[0].is_ascii_lowercase() && !bytes[0].is_ascii_digit() {
        return Err(NameValidationError(
            "Bucket name must start with a lowercase letter or digit".to_string(),
        ));
    }
    let last = bytes[bytes.len() - 1];
    if !last.is_ascii_lowercase() && !last.is_ascii_digit() {
        return Err(NameValidationError(
            "Bucket name must end with a lowercase letter or digit".to_string(),
        ));
    }
    for b in bytes {
        match b {
            b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' => {}
            _ => {
                return Err(NameValidationError(
                    "Bucket name may only contain lowercase letters, digits, '.' and '-'"
                        .to_string(),
                ))
            }
        }
    }
    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return Err(NameValidationError(
            "Bucket name must not contain adjacent dots or dot-dash sequences".to_string(),
        ));
    }
    if looks_like_ipv4(name) {
        return Err(NameValidationError(
            "Bucket name must not be formatted like an IP address".to_string(),
        ));
    }
    Ok(())
}

fn looks_like_ipv4(name: &str) -> bool {
    let octets: Vec<&str> = name.split('.').collect();
    octets.len() == 4
        && octets
            .iter()
            .all(|o| !o.is_empty() && o.len() <= 3 && o.bytes().all(|b| b.is_ascii_digit()))
}

/// Validate an object key for storage operations.
///
/// Rejects anything that could escape the bucket root after path assembly:
/// `..` segments, a leading `/`, embedded NUL bytes, and backslashes
/// (Windows separators would bypass the segment checks).
pub fn validate_object_key(key: &str) -> Result<(), NameValidationError> {
    if key.is_empty() {
        return Err(NameValidationError(
            "Object key must not be empty".to_string(),
        ));
    }
    if key.starts_with('/') {
        return Err(NameValidationError(
            "Object key must not start with '/'".to_string(),
        ));
    }
    if key.contains('\0') {
        return Err(NameValidationError(
            "Object key must not contain NUL bytes".to_string(),
        ));
    }
    if key.contains('\\') {
        return Err(NameValidationError(
            "Object key must not contain backslashes".to_string(),
        ));
    }
    for segment in key.split('/') {
        if segment == ".." || segment == "." {
            return Err(NameValidationError(
                "Object key must not contain '.' or '..' path segments".to_string(),
            ));
        }
    }
    Ok(())
}
