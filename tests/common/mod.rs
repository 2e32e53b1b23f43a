//! Shared test infrastructure: an in-process server instance plus a
//! minimal SigV4 client-side signer, so integration tests exercise the
//! full middleware + dispatcher + engine pipeline without sockets.

#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use capstan::api::handlers::AppState;
use capstan::catalog::Catalog;
use capstan::credentials::CredentialCache;
use capstan::multipart::MultipartStore;
use capstan::router::build_router;
use capstan::storage::ObjectStore;
use chrono::Utc;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub const ACCESS_KEY: &str = "AKIATESTROOTKEY00000";
pub const SECRET_KEY: &str = "testing-secret-access-key-for-the-harness";
pub const REGION: &str = "us-east-1";
pub const HOST: &str = "localhost:9000";

/// In-process capstan instance backed by temp directories.
pub struct TestApp {
    pub router: Router,
    _data_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        let data_dir = TempDir::new().expect("temp dir");
        let catalog =
            Arc::new(Catalog::open(&data_dir.path().join("catalog.db")).expect("catalog"));
        catalog
            .bootstrap_root(ACCESS_KEY, SECRET_KEY)
            .expect("bootstrap");

        let credentials = Arc::new(CredentialCache::from_catalog(&catalog).expect("cache"));
        let objects = Arc::new(
            ObjectStore::new(data_dir.path().join("buckets"))
                .await
                .expect("object store"),
        );
        let multipart = Arc::new(
            MultipartStore::new(data_dir.path().join("multipart"))
                .await
                .expect("multipart store"),
        );

        let state = Arc::new(AppState {
            catalog,
            credentials,
            objects,
            multipart,
            region: REGION.to_string(),
            max_body_size: 64 * 1024 * 1024,
        });

        Self {
            router: build_router(state),
            _data_dir: data_dir,
        }
    }

    /// Send a request through the router and collect the response.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible");
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.expect("body").to_bytes();
        (parts.status, parts.headers, bytes)
    }
}

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac key");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// SigV4 unreserved-set percent encoding.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

/// Builder for signed S3 requests against the test app.
pub struct SignedRequest {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl SignedRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sign with the harness root credentials and produce the request.
    pub fn build(self) -> Request<Body> {
        self.build_tampered(|sig| sig)
    }

    /// Sign, then let the caller corrupt the signature before assembly.
    pub fn build_tampered(self, tamper: impl FnOnce(String) -> String) -> Request<Body> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope_date = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", scope_date, REGION);

        let payload_hash = hex::encode(Sha256::digest(&self.body));

        // Canonical query string: sorted, SigV4-encoded
        let mut pairs: Vec<(String, String)> = self
            .query
            .iter()
            .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
            .collect();
        pairs.sort();
        let canonical_query = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            HOST, payload_hash, amz_date
        );
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method, self.path, canonical_query, canonical_headers, signed_headers,
            payload_hash
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = hmac_sha256(format!("AWS4{}", SECRET_KEY).as_bytes(), scope_date.as_bytes());
        let k_region = hmac_sha256(&k_date, REGION.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));
        let signature = tamper(signature);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            ACCESS_KEY, scope, signed_headers, signature
        );

        let uri = if canonical_query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, canonical_query)
        };

        let mut builder = Request::builder()
            .method(self.method.as_str())
            .uri(uri)
            .header("host", HOST)
            .header("x-amz-date", &amz_date)
            .header("x-amz-content-sha256", &payload_hash)
            .header("authorization", authorization);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder.body(Body::from(self.body)).expect("request")
    }
}

/// Extract the text of the first `<{tag}>...</{tag}>` element.
pub fn xml_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    xml.split(&open).nth(1)?.split(&close).next()
}

pub fn body_str(bytes: &Bytes) -> &str {
    std::str::from_utf8(bytes).expect("utf8 body")
}
