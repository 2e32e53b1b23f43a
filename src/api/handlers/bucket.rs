//! Bucket-level S3 handlers: CRUD, versioning configuration, listings
//! (objects v1/v2, object versions, multipart uploads) and sub-resources.

use super::{body_to_utf8, xml_response, AppState, S3Error};
use crate::api::extractors::{Authenticated, ValidatedBucket};
use crate::api::xml::{
    location_constraint_xml, BucketInfo, DeleteError, DeleteRequest, DeleteResult, DeletedObject,
    ListBucketResult, ListBucketsResult, ListMultipartUploadsResult, ListVersionsResult, S3Object,
    VersionEntry, VersioningConfiguration,
};
use crate::storage::DeleteOutcome;
use crate::types::VersioningState;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Query parameters for bucket-level GET operations
#[derive(Debug, serde::Deserialize, Default)]
pub struct BucketGetQuery {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "list-type")]
    pub list_type: Option<u8>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<u32>,
    /// v2 pagination
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    #[serde(rename = "start-after")]
    pub start_after: Option<String>,
    /// v1 pagination
    pub marker: Option<String>,
    /// Encoding type for keys/prefixes in the response (e.g. "url")
    #[serde(rename = "encoding-type")]
    pub encoding_type: Option<String>,
    /// Sub-resource discriminators
    pub location: Option<String>,
    pub policy: Option<String>,
    pub versioning: Option<String>,
    pub versions: Option<String>,
    pub uploads: Option<String>,
    /// ListObjectVersions pagination
    #[serde(rename = "key-marker")]
    pub key_marker: Option<String>,
    #[serde(rename = "version-id-marker")]
    pub version_id_marker: Option<String>,
    /// ListMultipartUploads pagination
    #[serde(rename = "upload-id-marker")]
    pub upload_id_marker: Option<String>,
    #[serde(rename = "max-uploads")]
    pub max_uploads: Option<u32>,
}

/// Bucket-level GET handler - dispatches on the sub-resource query param:
/// GET /{bucket}?location    -> GetBucketLocation
/// GET /{bucket}?policy      -> GetBucketPolicy (always NoSuchBucketPolicy)
/// GET /{bucket}?versioning  -> GetBucketVersioning
/// GET /{bucket}?versions    -> ListObjectVersions
/// GET /{bucket}?uploads     -> ListMultipartUploads
/// GET /{bucket}[?list-type=2] -> ListObjects v1/v2
#[instrument(skip(state, auth, query))]
pub async fn bucket_get_handler(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
    Authenticated(auth): Authenticated,
    Query(query): Query<BucketGetQuery>,
) -> Result<Response, S3Error> {
    state.authorize(&auth, &bucket)?;

    if query.location.is_some() {
        info!("GET bucket location: {}", bucket);
        return Ok(xml_response(location_constraint_xml(&state.region)));
    }

    if query.policy.is_some() {
        // No policy subsystem; every bucket reads as policy-less.
        return Err(S3Error::NoSuchBucketPolicy(format!("/{}", bucket)));
    }

    // ?versioning wins over ?versions when both appear
    if query.versioning.is_some() {
        info!("GET bucket versioning: {}", bucket);
        let xml = VersioningConfiguration::to_xml(state.versioning_of(&bucket));
        return Ok(xml_response(xml));
    }

    if query.versions.is_some() {
        return list_object_versions(&state, &bucket, &query).await;
    }

    if query.uploads.is_some() {
        return list_multipart_uploads(&state, &bucket, &query).await;
    }

    list_objects(&state, bucket, query).await
}

/// ListObjects v1/v2
async fn list_objects(
    state: &AppState,
    bucket: String,
    query: BucketGetQuery,
) -> Result<Response, S3Error> {
    let is_v2 = query.list_type == Some(2);
    let prefix = query.prefix.unwrap_or_default();
    let delimiter = query.delimiter.clone();
    let max_keys = query.max_keys.unwrap_or(1000);

    // v1 uses `marker`; v2 uses `continuation-token`, falling back to
    // `start-after` on the first page. All three mean "start after this key".
    let pagination_token = if is_v2 {
        query
            .continuation_token
            .as_deref()
            .or(query.start_after.as_deref())
    } else {
        query.marker.as_deref()
    };

    info!(
        "LIST {}/{}* (v{})",
        bucket,
        prefix,
        if is_v2 { "2" } else { "1" }
    );

    let page = state
        .objects
        .list_objects(
            &bucket,
            &prefix,
            delimiter.as_deref(),
            pagination_token,
            max_keys,
        )
        .await?;

    let s3_objects: Vec<S3Object> = page
        .objects
        .into_iter()
        .map(|meta| {
            S3Object::new(
                meta.key.clone(),
                meta.size,
                meta.updated_at,
                meta.quoted_etag(),
            )
        })
        .collect();

    let xml = if is_v2 {
        ListBucketResult::new_v2(
            bucket,
            prefix,
            delimiter,
            max_keys,
            s3_objects,
            page.common_prefixes,
            query.continuation_token,
            page.next_marker,
            page.is_truncated,
        )
        .to_xml()
    } else {
        ListBucketResult::new_v1(
            bucket,
            prefix,
            delimiter,
            max_keys,
            s3_objects,
            page.common_prefixes,
            query.marker,
            page.next_marker,
            page.is_truncated,
            query.encoding_type,
        )
        .to_xml()
    };

    Ok(xml_response(xml))
}

/// ListObjectVersions
async fn list_object_versions(
    state: &AppState,
    bucket: &str,
    query: &BucketGetQuery,
) -> Result<Response, S3Error> {
    let prefix = query.prefix.clone().unwrap_or_default();
    let max_keys = query.max_keys.unwrap_or(1000);
    info!("LIST versions {}/{}*", bucket, prefix);

    let page = state
        .objects
        .list_versions(
            bucket,
            &prefix,
            query.delimiter.as_deref(),
            query.key_marker.as_deref(),
            query.version_id_marker.as_deref(),
            max_keys,
        )
        .await?;

    // Re-merge into listing order: key ascending, newest version first.
    let mut entries: Vec<VersionEntry> = page
        .versions
        .iter()
        .chain(page.delete_markers.iter())
        .map(|meta| VersionEntry {
            key: meta.key.clone(),
            version_id: meta.version_id_or_null().to_string(),
            is_latest: meta.is_latest,
            last_modified: meta.updated_at,
            etag: meta.quoted_etag(),
            size: meta.size,
            is_delete_marker: meta.is_delete_marker,
        })
        .collect();
    entries.sort_by(|a, b| {
        a.key
            .cmp(&b.key)
            .then_with(|| b.last_modified.cmp(&a.last_modified))
    });

    let result = ListVersionsResult {
        name: bucket.to_string(),
        prefix,
        delimiter: query.delimiter.clone(),
        key_marker: query.key_marker.clone(),
        version_id_marker: query.version_id_marker.clone(),
        next_key_marker: page.next_key_marker,
        next_version_id_marker: page.next_version_id_marker,
        max_keys,
        is_truncated: page.is_truncated,
        entries,
        common_prefixes: page.common_prefixes,
    };
    Ok(xml_response(result.to_xml()))
}

/// ListMultipartUploads
async fn list_multipart_uploads(
    state: &AppState,
    bucket: &str,
    query: &BucketGetQuery,
) -> Result<Response, S3Error> {
    info!("LIST multipart uploads: {}", bucket);
    let max_uploads = query.max_uploads.unwrap_or(1000);
    let listing = state
        .multipart
        .list_uploads(
            bucket,
            query.prefix.as_deref(),
            query.key_marker.as_deref(),
            query.upload_id_marker.as_deref(),
            max_uploads,
        )
        .await?;

    let result = ListMultipartUploadsResult {
        bucket: bucket.to_string(),
        uploads: listing.uploads,
        prefix: query.prefix.clone().unwrap_or_default(),
        key_marker: query.key_marker.clone(),
        upload_id_marker: query.upload_id_marker.clone(),
        next_key_marker: listing.next_key_marker,
        next_upload_id_marker: listing.next_upload_id_marker,
        max_uploads,
        is_truncated: listing.is_truncated,
    };
    Ok(xml_response(result.to_xml()))
}

/// Query parameters for bucket-level PUT operations
#[derive(Debug, serde::Deserialize, Default)]
pub struct BucketPutQuery {
    pub versioning: Option<String>,
}

/// PUT /{bucket}              - CreateBucket
/// PUT /{bucket}?versioning   - PutBucketVersioning
#[instrument(skip(state, auth, body))]
pub async fn bucket_put_handler(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
    Authenticated(auth): Authenticated,
    Query(query): Query<BucketPutQuery>,
    body: Bytes,
) -> Result<Response, S3Error> {
    if query.versioning.is_some() {
        return put_bucket_versioning(&state, &auth, &bucket, &body).await;
    }

    info!("CREATE bucket {}", bucket);

    let owner = state
        .credentials
        .owner_of(&auth.access_key_id)
        .ok_or(S3Error::AccessDenied)?;

    // Catalog insert is the authority on name uniqueness; the directory and
    // cache follow.
    state.catalog.create_bucket(&bucket, &owner)?;
    state.objects.create_bucket_dir(&bucket).await?;
    state.credentials.add_bucket_for_owner(&owner, &bucket);

    Ok((
        StatusCode::OK,
        [("Location", format!("/{}", bucket))],
        "",
    )
        .into_response())
}

/// PutBucketVersioning: Enabled and Suspended are the only wire states.
async fn put_bucket_versioning(
    state: &AppState,
    auth: &crate::api::auth::AuthContext,
    bucket: &str,
    body: &Bytes,
) -> Result<Response, S3Error> {
    state.authorize(auth, bucket)?;
    info!("PUT bucket versioning: {}", bucket);

    let config = VersioningConfiguration::from_xml(body_to_utf8(body)?).map_err(|e| {
        warn!("Failed to parse VersioningConfiguration XML: {}", e);
        S3Error::MalformedXML
    })?;
    let status = match config.status.as_deref() {
        Some("Enabled") => VersioningState::Enabled,
        Some("Suspended") => VersioningState::Suspended,
        other => {
            return Err(S3Error::InvalidArgument(format!(
                "Invalid versioning status: {:?}",
                other
            )))
        }
    };

    state.catalog.set_versioning(bucket, status)?;
    state.credentials.set_versioning(bucket, status);

    Ok(StatusCode::OK.into_response())
}

/// DELETE bucket handler
/// DELETE /{bucket}
#[instrument(skip(state, auth))]
pub async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
    Authenticated(auth): Authenticated,
) -> Result<Response, S3Error> {
    state.authorize(&auth, &bucket)?;
    info!("DELETE bucket {}", bucket);

    // S3 requires buckets to be empty of current keys before deletion
    if state.objects.has_any_objects(&bucket).await? {
        return Err(S3Error::BucketNotEmpty(bucket.to_string()));
    }

    state.catalog.delete_bucket(&bucket)?;
    state.objects.remove_bucket_dir(&bucket).await?;
    state.credentials.remove_bucket(&bucket);

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// HEAD bucket handler
/// HEAD /{bucket}
#[instrument(skip(state, auth))]
pub async fn head_bucket(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
    Authenticated(auth): Authenticated,
) -> Result<Response, S3Error> {
    state.authorize(&auth, &bucket)?;
    info!("HEAD bucket {}", bucket);

    Ok((
        StatusCode::OK,
        [("x-amz-bucket-region", state.region.clone())],
    )
        .into_response())
}

/// LIST buckets handler: the buckets owned by the requesting key's user.
/// GET /
#[instrument(skip(state, auth))]
pub async fn list_buckets(
    State(state): State<Arc<AppState>>,
    Authenticated(auth): Authenticated,
) -> Result<Response, S3Error> {
    info!("LIST buckets");

    let owner = state
        .credentials
        .owner_of(&auth.access_key_id)
        .ok_or(S3Error::AccessDenied)?;
    let buckets = state.catalog.buckets_for_owner(&owner)?;

    let result = ListBucketsResult {
        owner_display_name: owner.clone(),
        owner_id: owner,
        buckets: buckets
            .into_iter()
            .map(|row| BucketInfo {
                name: row.name,
                creation_date: row.created_at,
            })
            .collect(),
    };

    Ok(xml_response(result.to_xml()))
}

/// Query parameters for bucket-level POST operations
#[derive(Debug, serde::Deserialize, Default)]
pub struct BucketPostQuery {
    pub delete: Option<String>,
}

/// DELETE multiple objects handler
/// POST /{bucket}?delete
#[instrument(skip(state, auth, body))]
pub async fn delete_objects(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
    Authenticated(auth): Authenticated,
    Query(query): Query<BucketPostQuery>,
    body: Bytes,
) -> Result<Response, S3Error> {
    state.authorize(&auth, &bucket)?;

    if query.delete.is_none() {
        return Err(S3Error::InvalidRequest(
            "POST requires ?delete query parameter".to_string(),
        ));
    }

    let delete_req = DeleteRequest::from_xml(body_to_utf8(&body)?).map_err(|e| {
        warn!("Failed to parse DeleteObjects XML: {}", e);
        S3Error::MalformedXML
    })?;

    info!(
        "DELETE multiple objects in {} ({} objects)",
        bucket,
        delete_req.objects.len()
    );

    let quiet = delete_req.quiet.unwrap_or(false);
    let versioning = state.versioning_of(&bucket);
    let mut result = DeleteResult::default();

    for obj in delete_req.objects {
        match state
            .objects
            .delete(&bucket, &obj.key, obj.version_id.as_deref(), versioning)
            .await
        {
            Ok(outcome) => {
                let delete_marker_version_id = match outcome {
                    DeleteOutcome::MarkerCreated { version_id } => Some(version_id),
                    _ => None,
                };
                result.deleted.push(DeletedObject {
                    key: obj.key,
                    version_id: obj.version_id,
                    delete_marker_version_id,
                });
            }
            Err(e) => {
                let s3_err = S3Error::from(e);
                warn!("Failed to delete {}/{}: {}", bucket, obj.key, s3_err);
                result.errors.push(DeleteError {
                    key: obj.key,
                    version_id: obj.version_id,
                    code: s3_err.code().to_string(),
                    message: s3_err.to_string(),
                });
            }
        }
    }

    Ok(xml_response(result.to_xml(quiet)))
}
