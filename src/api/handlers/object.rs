//! Object-level S3 handlers: GET, HEAD, PUT (with copy detection), DELETE.

use super::{
    build_object_headers, content_md5_from_headers, extract_content_type, extract_user_metadata,
    xml_response, AppState, ObjectQuery, S3Error,
};
use crate::api::conditional::{parse_range, resolve_range, CondOutcome, Preconditions};
use crate::api::extractors::{Authenticated, ValidatedPath};
use crate::api::xml::{CopyObjectResult, ListPartsResult};
use crate::storage::{DeleteOutcome, WriteOptions};
use crate::types::{ObjectMeta, NULL_VERSION_ID};
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// GET object handler
/// GET /{bucket}/{key}              - object bytes (range/conditional aware)
/// GET /{bucket}/{key}?versionId=X  - specific version
/// GET /{bucket}/{key}?uploadId=X   - ListParts
#[instrument(skip(state, auth, headers))]
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    Authenticated(auth): Authenticated,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    state.authorize(&auth, &bucket)?;

    // ListParts
    if let Some(upload_id) = &query.upload_id {
        info!("ListParts {}/{} uploadId={}", bucket, key, upload_id);
        let max_parts = query.max_parts.unwrap_or(1000);
        let listing = state
            .multipart
            .list_parts(&bucket, &key, upload_id, query.part_number_marker, max_parts)
            .await?;
        let result = ListPartsResult {
            bucket: bucket.clone(),
            key: key.clone(),
            upload_id: upload_id.clone(),
            parts: listing.parts,
            part_number_marker: query.part_number_marker,
            next_part_number_marker: listing.next_part_number_marker,
            max_parts,
            is_truncated: listing.is_truncated,
        };
        return Ok(xml_response(result.to_xml()));
    }

    info!("GET {}/{}", bucket, key);
    // The engine hides a key behind a latest delete marker (NoSuchKey) only
    // for unversioned reads; addressing the marker's own version id serves
    // it as a zero-byte object with x-amz-delete-marker set.
    let version_id = query.version_id.as_deref();
    let meta = state.objects.head(&bucket, &key, version_id).await?;

    if let Some(response) = check_preconditions(&headers, &meta) {
        return Ok(response);
    }

    // Range slicing: a parseable range gets a 206, an unsatisfiable one a
    // 416, anything else falls through to the full 200.
    if let Some(spec) = headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range)
    {
        let (start, end) = resolve_range(spec, meta.size)
            .map_err(|_| S3Error::InvalidRange { size: meta.size })?;
        let (data, meta) = state
            .objects
            .get_range(&bucket, &key, version_id, start, end - start + 1)
            .await?;
        let mut response_headers = build_object_headers(&meta);
        response_headers.insert(
            "Content-Range",
            super::hval(&format!("bytes {}-{}/{}", start, end, meta.size)),
        );
        response_headers.insert(
            "Content-Length",
            super::hval(itoa::Buffer::new().format(end - start + 1)),
        );
        debug!("GET {}/{} range {}-{}", bucket, key, start, end);
        return Ok((StatusCode::PARTIAL_CONTENT, response_headers, data).into_response());
    }

    let (stream, meta) = state.objects.get_stream(&bucket, &key, version_id).await?;
    let response_headers = build_object_headers(&meta);
    Ok((
        StatusCode::OK,
        response_headers,
        Body::from_stream(stream),
    )
        .into_response())
}

/// HEAD object handler
/// HEAD /{bucket}/{key}
#[instrument(skip(state, auth, headers))]
pub async fn head_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    Authenticated(auth): Authenticated,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    state.authorize(&auth, &bucket)?;
    info!("HEAD {}/{}", bucket, key);

    let meta = state
        .objects
        .head(&bucket, &key, query.version_id.as_deref())
        .await?;
    if let Some(response) = check_preconditions(&headers, &meta) {
        return Ok(response);
    }

    let response_headers = build_object_headers(&meta);
    Ok((StatusCode::OK, response_headers).into_response())
}

/// Evaluate conditional headers against the resolved object for GET/HEAD.
/// Returns the short-circuit response (304 or 412); None means proceed.
fn check_preconditions(headers: &HeaderMap, meta: &ObjectMeta) -> Option<Response> {
    let conditions = Preconditions::from_headers(headers);
    if conditions.is_empty() {
        return None;
    }
    match conditions.evaluate(&meta.etag, meta.updated_at) {
        CondOutcome::Proceed => None,
        CondOutcome::NotModified => {
            let mut response_headers = HeaderMap::new();
            response_headers.insert("ETag", super::hval(&meta.quoted_etag()));
            Some((StatusCode::NOT_MODIFIED, response_headers).into_response())
        }
        CondOutcome::Failed => Some(S3Error::PreconditionFailed.into_response()),
    }
}

/// PUT object handler with copy detection and multipart upload support
/// PUT /{bucket}/{key}                          - store object
/// PUT /{bucket}/{key}?partNumber=N&uploadId=X  - upload part
/// PUT /{bucket}/{key} + x-amz-copy-source      - copy object
#[instrument(skip(state, auth, headers, body))]
pub async fn put_object_or_copy(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    Authenticated(auth): Authenticated,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    state.authorize(&auth, &bucket)?;

    // UploadPart
    if query.part_number.is_some() || query.upload_id.is_some() {
        let (Some(part_number), Some(upload_id)) = (query.part_number, &query.upload_id) else {
            return Err(S3Error::InvalidRequest(
                "UploadPart requires both partNumber and uploadId".to_string(),
            ));
        };
        if !(1..=10000).contains(&part_number) {
            return Err(S3Error::InvalidArgument(
                "Part number must be between 1 and 10000".to_string(),
            ));
        }
        info!(
            "UploadPart {}/{} part={} uploadId={}",
            bucket, key, part_number, upload_id
        );

        if let Some(expected) = content_md5_from_headers(&headers)? {
            use md5::Digest;
            let computed: [u8; 16] = md5::Md5::digest(&body).into();
            if computed != expected {
                return Err(S3Error::BadDigest);
            }
        }

        let etag = state
            .multipart
            .upload_part(&bucket, &key, upload_id, part_number, body)
            .await?;
        return Ok((
            StatusCode::OK,
            [("ETag", format!("\"{}\"", etag))],
            "",
        )
            .into_response());
    }

    if headers.contains_key("x-amz-copy-source") {
        copy_object(&state, &auth, &bucket, &key, &headers).await
    } else {
        put_object(&state, &bucket, &key, &headers, &body).await
    }
}

async fn put_object(
    state: &AppState,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, S3Error> {
    info!("PUT {}/{} ({} bytes)", bucket, key, body.len());

    let opts = WriteOptions {
        content_type: extract_content_type(headers),
        user_metadata: extract_user_metadata(headers),
        content_md5: content_md5_from_headers(headers)?,
        etag_override: None,
    };
    let versioning = state.versioning_of(bucket);
    let meta = map_put_error(state.objects.put(bucket, key, body, opts, versioning).await)?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert("ETag", super::hval(&meta.quoted_etag()));
    if let Some(ref vid) = meta.version_id {
        response_headers.insert("x-amz-version-id", super::hval(vid));
    }
    Ok((StatusCode::OK, response_headers, "").into_response())
}

/// COPY object handler, dispatched from PUT by the x-amz-copy-source header.
async fn copy_object(
    state: &AppState,
    auth: &crate::api::auth::AuthContext,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let copy_source = headers
        .get("x-amz-copy-source")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| S3Error::InvalidRequest("Missing x-amz-copy-source header".to_string()))?;

    // Source: /bucket/key or bucket/key (URL-encoded), optional ?versionId=
    let copy_source = urlencoding::decode(copy_source)
        .map_err(|_| S3Error::InvalidArgument("Invalid copy source encoding".to_string()))?;
    let (source_path, source_version) = match copy_source.split_once('?') {
        Some((path, qs)) => {
            let vid = qs
                .split('&')
                .find_map(|pair| pair.strip_prefix("versionId="))
                .map(|v| v.to_string());
            (path, vid)
        }
        None => (copy_source.as_ref(), None),
    };
    let source_path = source_path.trim_start_matches('/');
    let (source_bucket, source_key) = source_path
        .split_once('/')
        .ok_or_else(|| S3Error::InvalidArgument("Copy source must be bucket/key".to_string()))?;

    info!(
        "COPY {}/{} -> {}/{}",
        source_bucket, source_key, bucket, key
    );

    // The key must be entitled to both ends of the copy.
    state.authorize(auth, source_bucket)?;

    let (data, source_meta) = state
        .objects
        .get(source_bucket, source_key, source_version.as_deref())
        .await
        .map_err(|e| match e {
            crate::storage::StorageError::NotFound(_) => {
                S3Error::NoSuchKey(format!("/{}/{}", source_bucket, source_key))
            }
            other => other.into(),
        })?;
    if source_meta.is_delete_marker {
        return Err(S3Error::NoSuchKey(format!(
            "/{}/{}",
            source_bucket, source_key
        )));
    }

    // Copy preconditions evaluate against the source object.
    let conditions = Preconditions::from_copy_headers(headers);
    if !conditions.is_empty()
        && conditions.evaluate(&source_meta.etag, source_meta.updated_at) != CondOutcome::Proceed
    {
        return Err(S3Error::PreconditionFailed);
    }

    // x-amz-metadata-directive: COPY (default) carries source metadata,
    // REPLACE takes it from this request.
    let directive = headers
        .get("x-amz-metadata-directive")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("COPY");
    let (content_type, user_metadata) = match directive {
        "REPLACE" => (extract_content_type(headers), extract_user_metadata(headers)),
        "COPY" => (
            source_meta.content_type.clone(),
            source_meta.user_metadata.clone(),
        ),
        other => {
            return Err(S3Error::InvalidArgument(format!(
                "Invalid x-amz-metadata-directive: {}",
                other
            )))
        }
    };

    let opts = WriteOptions {
        content_type,
        user_metadata,
        content_md5: None,
        etag_override: None,
    };
    let versioning = state.versioning_of(bucket);
    let meta = map_put_error(state.objects.put(bucket, key, &data, opts, versioning).await)?;

    debug!(
        "Copied {}/{} -> {}/{} ({} bytes)",
        source_bucket,
        source_key,
        bucket,
        key,
        data.len()
    );

    let xml = CopyObjectResult {
        etag: meta.quoted_etag(),
        last_modified: meta.updated_at,
    }
    .to_xml();

    let mut response_headers = HeaderMap::new();
    response_headers.insert("Content-Type", super::hval("application/xml"));
    if let Some(ref vid) = meta.version_id {
        response_headers.insert("x-amz-version-id", super::hval(vid));
    }
    if let Some(ref vid) = source_meta.version_id {
        response_headers.insert("x-amz-copy-source-version-id", super::hval(vid));
    }
    Ok((StatusCode::OK, response_headers, xml).into_response())
}

/// Writes surface digest failures as BadDigest, traversal as InvalidArgument.
fn map_put_error(
    result: Result<ObjectMeta, crate::storage::StorageError>,
) -> Result<ObjectMeta, S3Error> {
    result.map_err(|e| match e {
        crate::storage::StorageError::DigestMismatch => S3Error::BadDigest,
        other => other.into(),
    })
}

/// DELETE object handler
/// DELETE /{bucket}/{key}              - delete (marker in Enabled mode)
/// DELETE /{bucket}/{key}?versionId=X  - permanent version delete
/// DELETE /{bucket}/{key}?uploadId=X   - AbortMultipartUpload
#[instrument(skip(state, auth))]
pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    Authenticated(auth): Authenticated,
) -> Result<Response, S3Error> {
    state.authorize(&auth, &bucket)?;

    // AbortMultipartUpload (uploadId without versionId)
    if let (Some(upload_id), None) = (&query.upload_id, &query.version_id) {
        info!(
            "AbortMultipartUpload {}/{} uploadId={}",
            bucket, key, upload_id
        );
        state.multipart.abort(&bucket, &key, upload_id).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    info!("DELETE {}/{} versionId={:?}", bucket, key, query.version_id);

    let versioning = state.versioning_of(&bucket);
    let outcome = state
        .objects
        .delete(&bucket, &key, query.version_id.as_deref(), versioning)
        .await?;

    let mut response_headers = HeaderMap::new();
    match outcome {
        DeleteOutcome::MarkerCreated { version_id } => {
            response_headers.insert("x-amz-delete-marker", super::hval("true"));
            response_headers.insert("x-amz-version-id", super::hval(&version_id));
        }
        DeleteOutcome::VersionRemoved => {
            if let Some(vid) = query.version_id.as_deref() {
                if vid != NULL_VERSION_ID {
                    response_headers.insert("x-amz-version-id", super::hval(vid));
                }
            }
        }
        DeleteOutcome::Removed => {}
    }

    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}
