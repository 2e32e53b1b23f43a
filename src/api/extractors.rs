//! Custom Axum extractors for S3 API validation
//!
//! These extractors validate bucket names and object keys before a
//! handler runs, so traversal and malformed-name checks live in exactly
//! one place.

use super::auth::AuthContext;
use super::errors::S3Error;
use crate::types::{validate_bucket_name, validate_object_key};
use axum::{
    async_trait,
    extract::{FromRequestParts, Path},
    http::request::Parts,
};

/// Bucket name from the path, checked against the S3 DNS-name rules.
#[derive(Debug, Clone)]
pub struct ValidatedBucket(pub String);

impl std::ops::Deref for ValidatedBucket {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ValidatedBucket
where
    S: Send + Sync,
{
    type Rejection = S3Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(bucket): Path<String> = Path::from_request_parts(parts, state)
            .await
            .map_err(|_| S3Error::InvalidArgument("Invalid bucket path".to_string()))?;

        validate_bucket_name(&bucket).map_err(|e| S3Error::InvalidArgument(e.to_string()))?;
        Ok(ValidatedBucket(bucket))
    }
}

/// Bucket and key from the path. The bucket gets the DNS-name check, the
/// key the traversal check (`..`, leading `/`, NUL).
#[derive(Debug, Clone)]
pub struct ValidatedPath {
    pub bucket: String,
    pub key: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for ValidatedPath
where
    S: Send + Sync,
{
    type Rejection = S3Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path((bucket, key)): Path<(String, String)> = Path::from_request_parts(parts, state)
            .await
            .map_err(|_| S3Error::InvalidArgument("Invalid bucket/key path".to_string()))?;

        validate_bucket_name(&bucket).map_err(|e| S3Error::InvalidArgument(e.to_string()))?;
        validate_object_key(&key).map_err(|e| S3Error::InvalidArgument(e.to_string()))?;

        Ok(ValidatedPath { bucket, key })
    }
}

/// The identity the SigV4 middleware attached after verification.
/// Missing extension means a route escaped the auth layer; reject.
#[derive(Debug, Clone)]
pub struct Authenticated(pub AuthContext);

#[async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = S3Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .map(Authenticated)
            .ok_or(S3Error::AccessDenied)
    }
}
