//! S3 error types and XML error envelopes

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// S3 API errors.
///
/// Every failure on the wire serialises as the standard S3 `<Error>`
/// envelope with a code from the fixed taxonomy, the resource path when
/// one is known, and a request id minted for the response.
#[derive(Debug, Clone, Error)]
pub enum S3Error {
    #[error("The specified key does not exist.")]
    NoSuchKey(String),

    #[error("The specified bucket does not exist.")]
    NoSuchBucket(String),

    #[error("The specified multipart upload does not exist.")]
    NoSuchUpload(String),

    #[error("The bucket policy does not exist.")]
    NoSuchBucketPolicy(String),

    #[error("The bucket you tried to delete is not empty.")]
    BucketNotEmpty(String),

    #[error("The requested bucket name is not available.")]
    BucketAlreadyExists(String),

    #[error("Access Denied.")]
    AccessDenied,

    #[error("The request signature we calculated does not match the signature you provided.")]
    SignatureDoesNotMatch,

    #[error("At least one of the pre-conditions you specified did not hold.")]
    PreconditionFailed,

    #[error("The requested range is not satisfiable.")]
    InvalidRange { size: u64 },

    #[error("The Content-MD5 you specified did not match what we received.")]
    BadDigest,

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidPart(String),

    #[error("The list of parts was not in ascending order or contained duplicates.")]
    InvalidPartOrder,

    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedXML,

    #[error("We encountered an internal error. Please try again.")]
    InternalError(String),
}

impl S3Error {
    /// Get the S3 error code
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchKey(_) => "NoSuchKey",
            S3Error::NoSuchBucket(_) => "NoSuchBucket",
            S3Error::NoSuchUpload(_) => "NoSuchUpload",
            S3Error::NoSuchBucketPolicy(_) => "NoSuchBucketPolicy",
            S3Error::BucketNotEmpty(_) => "BucketNotEmpty",
            S3Error::BucketAlreadyExists(_) => "BucketAlreadyExists",
            S3Error::AccessDenied => "AccessDenied",
            S3Error::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            S3Error::PreconditionFailed => "PreconditionFailed",
            S3Error::InvalidRange { .. } => "InvalidRange",
            S3Error::BadDigest => "BadDigest",
            S3Error::InvalidArgument(_) => "InvalidArgument",
            S3Error::InvalidRequest(_) => "InvalidRequest",
            S3Error::InvalidPart(_) => "InvalidPart",
            S3Error::InvalidPartOrder => "InvalidPartOrder",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchKey(_)
            | S3Error::NoSuchBucket(_)
            | S3Error::NoSuchUpload(_)
            | S3Error::NoSuchBucketPolicy(_) => StatusCode::NOT_FOUND,
            S3Error::BucketNotEmpty(_) | S3Error::BucketAlreadyExists(_) => StatusCode::CONFLICT,
            S3Error::AccessDenied | S3Error::SignatureDoesNotMatch => StatusCode::FORBIDDEN,
            S3Error::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            S3Error::InvalidRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            S3Error::BadDigest
            | S3Error::InvalidArgument(_)
            | S3Error::InvalidRequest(_)
            | S3Error::InvalidPart(_)
            | S3Error::InvalidPartOrder
            | S3Error::MalformedXML => StatusCode::BAD_REQUEST,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn resource(&self) -> &str {
        match self {
            S3Error::NoSuchKey(r)
            | S3Error::NoSuchBucket(r)
            | S3Error::NoSuchUpload(r)
            | S3Error::NoSuchBucketPolicy(r)
            | S3Error::BucketNotEmpty(r)
            | S3Error::BucketAlreadyExists(r) => r,
            _ => "",
        }
    }

    /// Generate the XML error envelope
    pub fn to_xml(&self, request_id: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>{}</Code><Message>{}</Message><Resource>{}</Resource><RequestId>{}</RequestId></Error>"#,
            self.code(),
            super::xml::escape_xml(&self.to_string()),
            super::xml::escape_xml(self.resource()),
            request_id,
        )
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        // One id per request: the error terminates the handler, so this is
        // the only envelope the client sees.
        let request_id = uuid::Uuid::new_v4().to_string();
        let status = self.status_code();
        let body = self.to_xml(&request_id);

        let mut response = (
            status,
            [
                ("Content-Type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
            ],
            body,
        )
            .into_response();

        if let S3Error::InvalidRange { size } = self {
            if let Ok(value) = format!("bytes */{}", size).parse() {
                response.headers_mut().insert("Content-Range", value);
            }
        }

        response
    }
}

impl From<crate::storage::StorageError> for S3Error {
    fn from(err: crate::storage::StorageError) -> Self {
        use crate::storage::StorageError;
        match err {
            StorageError::NotFound(key) => S3Error::NoSuchKey(key),
            StorageError::BucketNotFound(bucket) => S3Error::NoSuchBucket(bucket),
            StorageError::BucketNotEmpty(bucket) => S3Error::BucketNotEmpty(bucket),
            StorageError::InvalidKey(msg) => S3Error::InvalidArgument(msg),
            other => S3Error::InternalError(other.to_string()),
        }
    }
}

impl From<crate::catalog::CatalogError> for S3Error {
    fn from(err: crate::catalog::CatalogError) -> Self {
        use crate::catalog::CatalogError;
        match err {
            CatalogError::BucketExists(name) => S3Error::BucketAlreadyExists(name),
            CatalogError::BucketNotFound(name) => S3Error::NoSuchBucket(name),
            other => S3Error::InternalError(other.to_string()),
        }
    }
}
