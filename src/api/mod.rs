//! S3 API implementation

pub mod auth;
mod aws_chunked;
mod conditional;
mod errors;
mod extractors;
pub mod handlers;
pub mod xml;

pub use errors::S3Error;
pub use extractors::{Authenticated, ValidatedBucket, ValidatedPath};
