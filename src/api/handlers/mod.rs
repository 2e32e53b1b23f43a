//! S3 API request handlers
//!
//! Split into submodules by domain:
//! - `object` - GET, HEAD, PUT (with copy detection), DELETE for objects
//! - `bucket` - Bucket CRUD, listings, versioning configuration
//! - `multipart` - Multipart upload lifecycle
//!
//! Every handler runs behind the SigV4 middleware and re-checks bucket
//! authorization against the credential cache before touching storage.

mod bucket;
mod multipart;
mod object;

use super::auth::AuthContext;
use super::errors::S3Error;
use crate::catalog::Catalog;
use crate::credentials::{AuthzError, CredentialCache};
use crate::multipart::MultipartStore;
use crate::storage::ObjectStore;
use crate::types::{ObjectMeta, VersioningState, AMZ_META_PREFIX};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

// Re-export all public handlers so the router wires against one module.
pub use bucket::{
    bucket_get_handler, bucket_put_handler, delete_bucket, delete_objects, head_bucket,
    list_buckets, BucketGetQuery,
};
pub use multipart::post_object;
pub use object::{delete_object, get_object, head_object, put_object_or_copy};

/// Application state shared across handlers
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub credentials: Arc<CredentialCache>,
    pub objects: Arc<ObjectStore>,
    pub multipart: Arc<MultipartStore>,
    /// Region echoed in locations and bucket-region headers
    pub region: String,
    /// Body buffering limit enforced by the auth middleware
    pub max_body_size: u64,
}

impl AppState {
    /// Authorize the verified access key against a bucket, returning the
    /// owning user id.
    pub fn authorize(&self, ctx: &AuthContext, bucket: &str) -> Result<String, S3Error> {
        self.credentials
            .authorize(&ctx.access_key_id, bucket)
            .map_err(|e| match e {
                AuthzError::NoSuchBucket => S3Error::NoSuchBucket(bucket.to_string()),
                AuthzError::Unauthorized => S3Error::AccessDenied,
            })
    }

    /// Versioning state for an existing bucket; absent buckets read as
    /// Disabled (authorization has already established existence).
    pub fn versioning_of(&self, bucket: &str) -> VersioningState {
        self.credentials
            .versioning_of(bucket)
            .unwrap_or(VersioningState::Disabled)
    }
}

/// Query parameters for object-level operations
#[derive(Debug, serde::Deserialize, Default)]
pub struct ObjectQuery {
    /// CreateMultipartUpload (POST with ?uploads)
    pub uploads: Option<String>,
    /// UploadPart / CompleteMultipartUpload / ListParts / Abort (?uploadId)
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    /// UploadPart (PUT with ?partNumber)
    #[serde(rename = "partNumber")]
    pub part_number: Option<u32>,
    /// Version-addressed GET/HEAD/DELETE
    #[serde(rename = "versionId")]
    pub version_id: Option<String>,
    /// ListParts pagination
    #[serde(rename = "max-parts")]
    pub max_parts: Option<u32>,
    #[serde(rename = "part-number-marker")]
    pub part_number_marker: Option<u32>,
}

/// Unauthenticated HEAD / connection probe (Cyberduck, SDK healthchecks).
pub async fn head_root() -> Response {
    StatusCode::OK.into_response()
}

/// Middleware: stamp every response with an opaque request id. Error
/// envelopes mint their own and keep it.
pub async fn request_id_middleware(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let mut response = next.run(request).await;
    if !response.headers().contains_key("x-amz-request-id") {
        let id = uuid::Uuid::new_v4().to_string();
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert("x-amz-request-id", value);
        }
    }
    response
}

// ---------------------------------------------------------------------------
// Shared utility functions used across handler submodules
// ---------------------------------------------------------------------------

/// Build response headers for an object read/head.
fn build_object_headers(meta: &ObjectMeta) -> HeaderMap {
    // PERF: itoa formats integers without a heap allocation; this runs on
    // every object response.
    let mut itoa_buf = itoa::Buffer::new();

    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let mut headers = HeaderMap::new();
    headers.insert("ETag", hval(&meta.quoted_etag()));
    headers.insert("Content-Length", hval(itoa_buf.format(meta.size)));
    headers.insert("Content-Type", hval(&content_type));
    headers.insert("Accept-Ranges", HeaderValue::from_static("bytes"));
    headers.insert(
        "Last-Modified",
        hval(
            &meta
                .updated_at
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string(),
        ),
    );
    if let Some(ref vid) = meta.version_id {
        headers.insert("x-amz-version-id", hval(vid));
    }
    if meta.is_delete_marker {
        headers.insert("x-amz-delete-marker", HeaderValue::from_static("true"));
    }

    // User-provided custom metadata (x-amz-meta-*)
    for (key, value) in &meta.user_metadata {
        let header_name = format!("{}{}", AMZ_META_PREFIX, key);
        if let Ok(name) = axum::http::header::HeaderName::from_bytes(header_name.as_bytes()) {
            headers.insert(name, hval(value));
        }
    }

    headers
}

fn hval(s: &str) -> HeaderValue {
    HeaderValue::from_bytes(s.as_bytes()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Build an XML response with correct Content-Type header.
fn xml_response(xml: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        [("Content-Type", "application/xml")],
        xml.into(),
    )
        .into_response()
}

/// Extract Content-Type header as an owned String.
fn extract_content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Parse request body as UTF-8, mapping errors to MalformedXML.
/// Returns a borrowed `&str` into the existing `Bytes` buffer (zero-copy).
fn body_to_utf8(body: &axum::body::Bytes) -> Result<&str, S3Error> {
    std::str::from_utf8(body).map_err(|_| S3Error::MalformedXML)
}

/// Extract user-provided x-amz-meta-* headers, names lowercased, prefix
/// stripped.
fn extract_user_metadata(headers: &HeaderMap) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let suffix = name.as_str().strip_prefix(AMZ_META_PREFIX)?;
            let v = value.to_str().ok()?;
            Some((suffix.to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// Decode base64 string to bytes (for Content-MD5 validation)
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(input.trim())
        .ok()
}

/// Parse a Content-MD5 header into the raw 16-byte digest.
fn content_md5_from_headers(headers: &HeaderMap) -> Result<Option<[u8; 16]>, S3Error> {
    let Some(value) = headers.get("content-md5").and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    let bytes = base64_decode(value)
        .ok_or_else(|| S3Error::InvalidArgument("Invalid Content-MD5 encoding".to_string()))?;
    let digest: [u8; 16] = bytes
        .try_into()
        .map_err(|_| S3Error::InvalidArgument("Invalid Content-MD5 length".to_string()))?;
    Ok(Some(digest))
}
