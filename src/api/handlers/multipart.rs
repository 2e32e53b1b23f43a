//! Multipart upload S3 handlers: CreateMultipartUpload, CompleteMultipartUpload.
//! (UploadPart, ListParts and Abort dispatch from the object handlers.)

use super::{
    body_to_utf8, extract_content_type, extract_user_metadata, xml_response, AppState,
    ObjectQuery, S3Error,
};
use crate::api::extractors::{Authenticated, ValidatedPath};
use crate::api::xml::{
    CompleteMultipartUploadRequest, CompleteMultipartUploadResult, InitiateMultipartUploadResult,
};
use crate::storage::WriteOptions;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// POST object handler; dispatches multipart upload operations by query param.
#[instrument(skip(state, auth, headers, body))]
pub async fn post_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    Authenticated(auth): Authenticated,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    state.authorize(&auth, &bucket)?;

    if query.uploads.is_some() {
        initiate_multipart_upload(&state, &bucket, &key, &headers).await
    } else if let Some(upload_id) = &query.upload_id {
        complete_multipart_upload(&state, &bucket, &key, upload_id, body).await
    } else {
        Err(S3Error::InvalidRequest(
            "POST on object requires ?uploads or ?uploadId parameter".to_string(),
        ))
    }
}

/// POST /{bucket}/{key}?uploads - CreateMultipartUpload
async fn initiate_multipart_upload(
    state: &AppState,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    info!("CreateMultipartUpload {}/{}", bucket, key);

    let content_type = extract_content_type(headers);
    let user_metadata = extract_user_metadata(headers);
    let upload_id = state
        .multipart
        .create(bucket, key, content_type, user_metadata)
        .await?;

    let xml = InitiateMultipartUploadResult {
        bucket: bucket.to_string(),
        key: key.to_string(),
        upload_id,
    }
    .to_xml();
    Ok(xml_response(xml))
}

/// POST /{bucket}/{key}?uploadId=X - CompleteMultipartUpload
async fn complete_multipart_upload(
    state: &AppState,
    bucket: &str,
    key: &str,
    upload_id: &str,
    body: Bytes,
) -> Result<Response, S3Error> {
    info!(
        "CompleteMultipartUpload {}/{} uploadId={}",
        bucket, key, upload_id
    );

    let complete_req = CompleteMultipartUploadRequest::from_xml(body_to_utf8(&body)?)
        .map_err(|e| {
            warn!("Failed to parse CompleteMultipartUpload XML: {}", e);
            S3Error::MalformedXML
        })?;

    let requested_parts: Vec<(u32, String)> = complete_req
        .parts
        .iter()
        .map(|p| (p.part_number, p.etag.clone()))
        .collect();

    let completed = state
        .multipart
        .complete(bucket, key, upload_id, &requested_parts)
        .await?;

    // Store through the object engine so the bucket's versioning state is
    // honoured; only then drop the scratch directory. A failed store keeps
    // the upload retryable.
    let opts = WriteOptions {
        content_type: completed.content_type,
        user_metadata: completed.user_metadata,
        content_md5: None,
        etag_override: Some(completed.etag.clone()),
    };
    let versioning = state.versioning_of(bucket);
    let meta = state
        .objects
        .put(bucket, key, &completed.data, opts, versioning)
        .await?;

    state.multipart.remove(bucket, upload_id).await;

    debug!(
        "CompleteMultipartUpload {}/{} -> {} bytes, etag {}",
        bucket,
        key,
        meta.size,
        meta.etag
    );

    let xml = CompleteMultipartUploadResult {
        location: format!("/{}/{}", bucket, key),
        bucket: bucket.to_string(),
        key: key.to_string(),
        etag: meta.quoted_etag(),
    }
    .to_xml();

    let mut response_headers = HeaderMap::new();
    response_headers.insert("Content-Type", super::hval("application/xml"));
    if let Some(ref vid) = meta.version_id {
        response_headers.insert("x-amz-version-id", super::hval(vid));
    }
    Ok((StatusCode::OK, response_headers, xml).into_response())
}
