//! End-to-end S3 API tests driving the real router in-process: SigV4
//! middleware, dispatcher, object engine, multipart engine.

mod common;

use axum::http::StatusCode;
use common::{body_str, xml_text, SignedRequest, TestApp};

async fn create_bucket(app: &TestApp, name: &str) {
    let (status, _, _) = app
        .send(SignedRequest::new("PUT", &format!("/{}", name)).build())
        .await;
    assert_eq!(status, StatusCode::OK, "create bucket {}", name);
}

async fn put_versioning(app: &TestApp, bucket: &str, status_value: &str) {
    let body = format!(
        r#"<VersioningConfiguration xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Status>{}</Status></VersioningConfiguration>"#,
        status_value
    );
    let (status, _, _) = app
        .send(
            SignedRequest::new("PUT", &format!("/{}", bucket))
                .query("versioning", "")
                .body(body.into_bytes())
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "put versioning {}", status_value);
}

// ============================================================================
// Simple object round-trip
// ============================================================================

#[tokio::test]
async fn test_put_get_roundtrip() {
    let app = TestApp::new().await;
    create_bucket(&app, "bkt").await;

    let (status, headers, _) = app
        .send(
            SignedRequest::new("PUT", "/bkt/k")
                .body(&b"Hello, World!"[..])
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get("ETag").unwrap(),
        "\"65a8e27d8879283831b664bd8b7f0ad4\""
    );

    let (status, headers, body) = app.send(SignedRequest::new("GET", "/bkt/k").build()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"Hello, World!");
    assert_eq!(headers.get("Content-Length").unwrap(), "13");
    assert_eq!(headers.get("Accept-Ranges").unwrap(), "bytes");
    assert!(headers.contains_key("x-amz-request-id"));
}

#[tokio::test]
async fn test_head_object_and_user_metadata() {
    let app = TestApp::new().await;
    create_bucket(&app, "bkt").await;

    let (status, _, _) = app
        .send(
            SignedRequest::new("PUT", "/bkt/doc")
                .header("content-type", "text/plain")
                .header("x-amz-meta-team", "infra")
                .body(&b"hello"[..])
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, body) = app.send(SignedRequest::new("HEAD", "/bkt/doc").build()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(headers.get("Content-Type").unwrap(), "text/plain");
    assert_eq!(headers.get("x-amz-meta-team").unwrap(), "infra");
    assert!(headers.contains_key("Last-Modified"));
}

// ============================================================================
// Range requests
// ============================================================================

#[tokio::test]
async fn test_range_requests() {
    let app = TestApp::new().await;
    create_bucket(&app, "bkt").await;
    app.send(
        SignedRequest::new("PUT", "/bkt/f")
            .body(&b"0123456789ABCDEF"[..])
            .build(),
    )
    .await;

    let (status, headers, body) = app
        .send(
            SignedRequest::new("GET", "/bkt/f")
                .header("range", "bytes=10-")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(&body[..], b"ABCDEF");
    assert_eq!(headers.get("Content-Range").unwrap(), "bytes 10-15/16");
    assert_eq!(headers.get("Content-Length").unwrap(), "6");

    let (status, headers, body) = app
        .send(
            SignedRequest::new("GET", "/bkt/f")
                .header("range", "bytes=-5")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(&body[..], b"BCDEF");
    assert_eq!(headers.get("Content-Range").unwrap(), "bytes 11-15/16");

    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/bkt/f")
                .header("range", "bytes=0-9")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(&body[..], b"0123456789");

    // Unsatisfiable start offset
    let (status, headers, _) = app
        .send(
            SignedRequest::new("GET", "/bkt/f")
                .header("range", "bytes=99-")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(headers.get("Content-Range").unwrap(), "bytes */16");

    // Unsupported unit falls back to the full body
    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/bkt/f")
                .header("range", "chapters=1-2")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.len(), 16);
}

// ============================================================================
// Versioning lifecycle
// ============================================================================

#[tokio::test]
async fn test_versioning_lifecycle() {
    let app = TestApp::new().await;
    create_bucket(&app, "vbk").await;
    put_versioning(&app, "vbk", "Enabled").await;

    let (_, headers, _) = app
        .send(SignedRequest::new("PUT", "/vbk/k").body(&b"v1"[..]).build())
        .await;
    let v1 = headers
        .get("x-amz-version-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let (_, headers, _) = app
        .send(SignedRequest::new("PUT", "/vbk/k").body(&b"v2"[..]).build())
        .await;
    let v2 = headers
        .get("x-amz-version-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(v1, v2);
    assert_eq!(v1.len(), 32);

    // Latest read returns v2; explicit version returns v1
    let (status, _, body) = app.send(SignedRequest::new("GET", "/vbk/k").build()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"v2");

    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/vbk/k")
                .query("versionId", &v1)
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"v1");

    // Unversioned DELETE appends a delete marker
    let (status, headers, _) = app
        .send(SignedRequest::new("DELETE", "/vbk/k").build())
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers.get("x-amz-delete-marker").unwrap(), "true");
    let marker = headers
        .get("x-amz-version-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(marker.len(), 32);

    // Masked for plain GET, still reachable by version id
    let (status, _, body) = app.send(SignedRequest::new("GET", "/vbk/k").build()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body_str(&body).contains("NoSuchKey"));

    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/vbk/k")
                .query("versionId", &v2)
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"v2");

    // The marker's own version id reads back as a zero-byte object
    let (status, headers, body) = app
        .send(
            SignedRequest::new("GET", "/vbk/k")
                .query("versionId", &marker)
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(headers.get("x-amz-delete-marker").unwrap(), "true");
    assert_eq!(headers.get("x-amz-version-id").unwrap(), marker.as_str());
    assert_eq!(headers.get("Content-Length").unwrap(), "0");

    let (status, headers, _) = app
        .send(
            SignedRequest::new("HEAD", "/vbk/k")
                .query("versionId", &marker)
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-amz-delete-marker").unwrap(), "true");

    // Version listing shows two versions and one delete marker
    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/vbk")
                .query("versions", "")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let xml = body_str(&body);
    assert_eq!(xml.matches("<Version>").count(), 2);
    assert_eq!(xml.matches("<DeleteMarker>").count(), 1);
    assert!(xml.contains(&marker));

    // Permanently deleting the marker resurrects v2
    let (status, _, _) = app
        .send(
            SignedRequest::new("DELETE", "/vbk/k")
                .query("versionId", &marker)
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, body) = app.send(SignedRequest::new("GET", "/vbk/k").build()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"v2");
}

#[tokio::test]
async fn test_suspended_versioning_preserves_history() {
    let app = TestApp::new().await;
    create_bucket(&app, "sus").await;
    put_versioning(&app, "sus", "Enabled").await;

    let (_, headers, _) = app
        .send(SignedRequest::new("PUT", "/sus/k").body(&b"old"[..]).build())
        .await;
    let v1 = headers
        .get("x-amz-version-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    put_versioning(&app, "sus", "Suspended").await;

    let (_, headers, _) = app
        .send(SignedRequest::new("PUT", "/sus/k").body(&b"new"[..]).build())
        .await;
    assert_eq!(headers.get("x-amz-version-id").unwrap(), "null");

    let (_, _, body) = app.send(SignedRequest::new("GET", "/sus/k").build()).await;
    assert_eq!(&body[..], b"new");
    let (_, _, body) = app
        .send(
            SignedRequest::new("GET", "/sus/k")
                .query("versionId", &v1)
                .build(),
        )
        .await;
    assert_eq!(&body[..], b"old");

    // GET ?versioning reflects the suspended state
    let (_, _, body) = app
        .send(
            SignedRequest::new("GET", "/sus")
                .query("versioning", "")
                .build(),
        )
        .await;
    assert!(body_str(&body).contains("<Status>Suspended</Status>"));
}

// ============================================================================
// Multipart upload
// ============================================================================

#[tokio::test]
async fn test_multipart_lifecycle() {
    let app = TestApp::new().await;
    create_bucket(&app, "mpb").await;

    let (status, _, body) = app
        .send(
            SignedRequest::new("POST", "/mpb/big")
                .query("uploads", "")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let upload_id = xml_text(body_str(&body), "UploadId").unwrap().to_string();
    assert_eq!(upload_id.len(), 32);

    let (status, headers, _) = app
        .send(
            SignedRequest::new("PUT", "/mpb/big")
                .query("partNumber", "1")
                .query("uploadId", &upload_id)
                .body(&b"Hello, "[..])
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let e1 = headers.get("ETag").unwrap().to_str().unwrap().to_string();

    let (status, headers, _) = app
        .send(
            SignedRequest::new("PUT", "/mpb/big")
                .query("partNumber", "2")
                .query("uploadId", &upload_id)
                .body(&b"World!"[..])
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let e2 = headers.get("ETag").unwrap().to_str().unwrap().to_string();

    // ListParts shows both
    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/mpb/big")
                .query("uploadId", &upload_id)
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body_str(&body).matches("<Part>").count(), 2);

    let complete = format!(
        "<CompleteMultipartUpload><Part><PartNumber>1</PartNumber><ETag>{}</ETag></Part><Part><PartNumber>2</PartNumber><ETag>{}</ETag></Part></CompleteMultipartUpload>",
        e1, e2
    );
    let (status, _, body) = app
        .send(
            SignedRequest::new("POST", "/mpb/big")
                .query("uploadId", &upload_id)
                .body(complete.into_bytes())
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let etag = xml_text(body_str(&body), "ETag").unwrap();
    assert!(etag.trim_matches('"').ends_with("-2"), "{etag}");

    let (status, _, body) = app.send(SignedRequest::new("GET", "/mpb/big").build()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"Hello, World!");

    // Scratch is gone: a second Complete is NoSuchUpload
    let (status, _, body) = app
        .send(
            SignedRequest::new("POST", "/mpb/big")
                .query("uploadId", &upload_id)
                .body("<CompleteMultipartUpload><Part><PartNumber>1</PartNumber><ETag>x</ETag></Part></CompleteMultipartUpload>".as_bytes().to_vec())
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body_str(&body).contains("NoSuchUpload"));
}

#[tokio::test]
async fn test_multipart_abort_and_duplicate_rejection() {
    let app = TestApp::new().await;
    create_bucket(&app, "mpa").await;

    let (_, _, body) = app
        .send(
            SignedRequest::new("POST", "/mpa/obj")
                .query("uploads", "")
                .build(),
        )
        .await;
    let upload_id = xml_text(body_str(&body), "UploadId").unwrap().to_string();

    let (_, headers, _) = app
        .send(
            SignedRequest::new("PUT", "/mpa/obj")
                .query("partNumber", "1")
                .query("uploadId", &upload_id)
                .body(&b"data"[..])
                .build(),
        )
        .await;
    let e1 = headers.get("ETag").unwrap().to_str().unwrap().to_string();

    // Duplicate part numbers in Complete
    let dup = format!(
        "<CompleteMultipartUpload><Part><PartNumber>1</PartNumber><ETag>{e}</ETag></Part><Part><PartNumber>1</PartNumber><ETag>{e}</ETag></Part></CompleteMultipartUpload>",
        e = e1
    );
    let (status, _, body) = app
        .send(
            SignedRequest::new("POST", "/mpa/obj")
                .query("uploadId", &upload_id)
                .body(dup.into_bytes())
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body_str(&body).contains("InvalidPartOrder"));

    // Out-of-range part numbers
    let (status, _, body) = app
        .send(
            SignedRequest::new("PUT", "/mpa/obj")
                .query("partNumber", "10001")
                .query("uploadId", &upload_id)
                .body(&b"x"[..])
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body_str(&body).contains("InvalidArgument"));

    // Abort removes the upload
    let (status, _, _) = app
        .send(
            SignedRequest::new("DELETE", "/mpa/obj")
                .query("uploadId", &upload_id)
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = app
        .send(
            SignedRequest::new("PUT", "/mpa/obj")
                .query("partNumber", "1")
                .query("uploadId", &upload_id)
                .body(&b"x"[..])
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Conditional requests
// ============================================================================

#[tokio::test]
async fn test_conditional_requests() {
    let app = TestApp::new().await;
    create_bucket(&app, "cond").await;

    let (_, headers, _) = app
        .send(
            SignedRequest::new("PUT", "/cond/k")
                .body(&b"payload"[..])
                .build(),
        )
        .await;
    let etag = headers.get("ETag").unwrap().to_str().unwrap().to_string();

    let (status, _, _) = app
        .send(
            SignedRequest::new("GET", "/cond/k")
                .header("if-none-match", &etag)
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/cond/k")
                .header("if-match", "\"wrong\"")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert!(body_str(&body).contains("PreconditionFailed"));

    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/cond/k")
                .header("if-match", &etag)
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"payload");
}

// ============================================================================
// Signature rejection
// ============================================================================

#[tokio::test]
async fn test_signature_rejection() {
    let app = TestApp::new().await;
    create_bucket(&app, "sig").await;
    app.send(SignedRequest::new("PUT", "/sig/k").body(&b"x"[..]).build())
        .await;

    // Correctly signed GET succeeds
    let (status, _, _) = app.send(SignedRequest::new("GET", "/sig/k").build()).await;
    assert_eq!(status, StatusCode::OK);

    // Flipping one hex digit of the signature produces 403
    let request = SignedRequest::new("GET", "/sig/k").build_tampered(|sig| {
        let mut bytes = sig.into_bytes();
        bytes[0] = if bytes[0] == b'0' { b'1' } else { b'0' };
        String::from_utf8(bytes).unwrap()
    });
    let (status, _, body) = app.send(request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body_str(&body).contains("SignatureDoesNotMatch"));

    // No credentials at all
    let bare = axum::http::Request::builder()
        .method("GET")
        .uri("/sig/k")
        .header("host", common::HOST)
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, _, body) = app.send(bare).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body_str(&body).contains("AccessDenied"));
}

#[tokio::test]
async fn test_head_root_probe_is_open() {
    let app = TestApp::new().await;
    let probe = axum::http::Request::builder()
        .method("HEAD")
        .uri("/")
        .header("host", common::HOST)
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, _, _) = app.send(probe).await;
    assert_eq!(status, StatusCode::OK);
}

// ============================================================================
// Buckets, listings, errors
// ============================================================================

#[tokio::test]
async fn test_bucket_lifecycle_and_conflicts() {
    let app = TestApp::new().await;
    create_bucket(&app, "life").await;

    // Duplicate name
    let (status, _, body) = app
        .send(SignedRequest::new("PUT", "/life").build())
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body_str(&body).contains("BucketAlreadyExists"));

    // Invalid DNS name
    let (status, _, body) = app
        .send(SignedRequest::new("PUT", "/Bad_Name").build())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body_str(&body).contains("InvalidArgument"));

    // Unknown bucket
    let (status, _, body) = app
        .send(SignedRequest::new("HEAD", "/ghost-bucket").build())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let _ = body;

    // Non-empty bucket refuses deletion
    app.send(
        SignedRequest::new("PUT", "/life/obj")
            .body(&b"data"[..])
            .build(),
    )
    .await;
    let (status, _, body) = app
        .send(SignedRequest::new("DELETE", "/life").build())
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body_str(&body).contains("BucketNotEmpty"));

    // Empty it, then delete succeeds
    app.send(SignedRequest::new("DELETE", "/life/obj").build())
        .await;
    let (status, _, _) = app
        .send(SignedRequest::new("DELETE", "/life").build())
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = app.send(SignedRequest::new("HEAD", "/life").build()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_buckets_and_objects() {
    let app = TestApp::new().await;
    create_bucket(&app, "alpha").await;
    create_bucket(&app, "beta").await;

    let (status, _, body) = app.send(SignedRequest::new("GET", "/").build()).await;
    assert_eq!(status, StatusCode::OK);
    let xml = body_str(&body);
    assert!(xml.contains("<Name>alpha</Name>"));
    assert!(xml.contains("<Name>beta</Name>"));

    for key in ["docs/a.txt", "docs/b.txt", "top.txt"] {
        app.send(
            SignedRequest::new("PUT", &format!("/alpha/{}", key))
                .body(&b"content"[..])
                .build(),
        )
        .await;
    }

    // Delimiter listing groups the docs/ prefix
    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/alpha")
                .query("delimiter", "/")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let xml = body_str(&body);
    assert!(xml.contains("<Prefix>docs/</Prefix>"));
    assert!(xml.contains("<Key>top.txt</Key>"));
    assert!(!xml.contains("<Key>docs/a.txt</Key>"));

    // V2 listing with prefix
    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/alpha")
                .query("list-type", "2")
                .query("prefix", "docs/")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let xml = body_str(&body);
    assert!(xml.contains("<KeyCount>2</KeyCount>"));
    assert!(xml.contains("<Key>docs/a.txt</Key>"));
}

#[tokio::test]
async fn test_get_bucket_location_and_policy() {
    let app = TestApp::new().await;
    create_bucket(&app, "loc").await;

    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/loc")
                .query("location", "")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body_str(&body).contains("LocationConstraint"));

    let (status, _, body) = app
        .send(SignedRequest::new("GET", "/loc").query("policy", "").build())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body_str(&body).contains("NoSuchBucketPolicy"));
}

#[tokio::test]
async fn test_copy_object() {
    let app = TestApp::new().await;
    create_bucket(&app, "src").await;
    create_bucket(&app, "dst").await;

    app.send(
        SignedRequest::new("PUT", "/src/orig")
            .header("content-type", "text/plain")
            .header("x-amz-meta-origin", "here")
            .body(&b"copy me"[..])
            .build(),
    )
    .await;

    let (status, _, body) = app
        .send(
            SignedRequest::new("PUT", "/dst/copied")
                .header("x-amz-copy-source", "/src/orig")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body_str(&body).contains("<CopyObjectResult"));
    assert!(xml_text(body_str(&body), "ETag").is_some());

    let (status, headers, body) = app
        .send(SignedRequest::new("GET", "/dst/copied").build())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"copy me");
    // COPY directive carries source metadata along
    assert_eq!(headers.get("x-amz-meta-origin").unwrap(), "here");
    assert_eq!(headers.get("Content-Type").unwrap(), "text/plain");

    // Copy conditional failure
    let (status, _, _) = app
        .send(
            SignedRequest::new("PUT", "/dst/copied2")
                .header("x-amz-copy-source", "/src/orig")
                .header("x-amz-copy-source-if-match", "\"bogus\"")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);

    // Copy idempotence: same source, same bytes, same ETag
    let (_, h1, _) = app
        .send(SignedRequest::new("HEAD", "/dst/copied").build())
        .await;
    let (_, h2, _) = app
        .send(SignedRequest::new("HEAD", "/src/orig").build())
        .await;
    assert_eq!(h1.get("ETag").unwrap(), h2.get("ETag").unwrap());
}

#[tokio::test]
async fn test_content_md5_validation() {
    let app = TestApp::new().await;
    create_bucket(&app, "md5").await;

    // Correct digest accepted
    use base64::Engine;
    use md5::Digest;
    let good = base64::engine::general_purpose::STANDARD.encode(md5::Md5::digest(b"body"));
    let (status, _, _) = app
        .send(
            SignedRequest::new("PUT", "/md5/k")
                .header("content-md5", &good)
                .body(&b"body"[..])
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // Wrong digest rejected
    let bad = base64::engine::general_purpose::STANDARD.encode(md5::Md5::digest(b"other"));
    let (status, _, body) = app
        .send(
            SignedRequest::new("PUT", "/md5/k")
                .header("content-md5", &bad)
                .body(&b"body"[..])
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body_str(&body).contains("BadDigest"));
}

#[tokio::test]
async fn test_key_traversal_rejected() {
    let app = TestApp::new().await;
    create_bucket(&app, "safe").await;

    let (status, _, body) = app
        .send(SignedRequest::new("GET", "/safe/a/../../etc/passwd").build())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body_str(&body).contains("InvalidArgument"));

    let (status, _, _) = app
        .send(
            SignedRequest::new("PUT", "/safe/a/../b")
                .body(&b"x"[..])
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_batch_delete() {
    let app = TestApp::new().await;
    create_bucket(&app, "batch").await;
    for key in ["a", "b", "c"] {
        app.send(
            SignedRequest::new("PUT", &format!("/batch/{}", key))
                .body(&b"x"[..])
                .build(),
        )
        .await;
    }

    let body = r#"<Delete><Object><Key>a</Key></Object><Object><Key>b</Key></Object></Delete>"#;
    let (status, _, response) = app
        .send(
            SignedRequest::new("POST", "/batch")
                .query("delete", "")
                .body(body.as_bytes().to_vec())
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let xml = body_str(&response);
    assert_eq!(xml.matches("<Deleted>").count(), 2);

    let (status, _, body) = app
        .send(SignedRequest::new("GET", "/batch").build())
        .await;
    assert_eq!(status, StatusCode::OK);
    let xml = body_str(&body);
    assert!(!xml.contains("<Key>a</Key>"));
    assert!(xml.contains("<Key>c</Key>"));
}

#[tokio::test]
async fn test_batch_delete_quiet_and_missing_keys() {
    let app = TestApp::new().await;
    create_bucket(&app, "quiet").await;
    app.send(
        SignedRequest::new("PUT", "/quiet/real")
            .body(&b"x"[..])
            .build(),
    )
    .await;

    // Quiet mode suppresses <Deleted> entries; a never-existing key still
    // deletes successfully (idempotent), so no <Error> appears either.
    let body = r#"<Delete><Quiet>true</Quiet><Object><Key>real</Key></Object><Object><Key>ghost</Key></Object></Delete>"#;
    let (status, _, response) = app
        .send(
            SignedRequest::new("POST", "/quiet")
                .query("delete", "")
                .body(body.as_bytes().to_vec())
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let xml = body_str(&response);
    assert!(!xml.contains("<Deleted>"));
    assert!(!xml.contains("<Error>"));

    let (status, _, _) = app
        .send(SignedRequest::new("GET", "/quiet/real").build())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_batch_delete_versioned_mints_markers() {
    let app = TestApp::new().await;
    create_bucket(&app, "vdel").await;
    put_versioning(&app, "vdel", "Enabled").await;

    let (_, headers, _) = app
        .send(SignedRequest::new("PUT", "/vdel/k").body(&b"v1"[..]).build())
        .await;
    let v1 = headers
        .get("x-amz-version-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Unversioned batch entry against an Enabled bucket appends a marker
    let body = r#"<Delete><Object><Key>k</Key></Object></Delete>"#;
    let (status, _, response) = app
        .send(
            SignedRequest::new("POST", "/vdel")
                .query("delete", "")
                .body(body.as_bytes().to_vec())
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let xml = body_str(&response).to_string();
    assert!(xml.contains("<DeleteMarker>true</DeleteMarker>"));
    let marker = xml_text(&xml, "DeleteMarkerVersionId").unwrap().to_string();
    assert_eq!(marker.len(), 32);

    let (status, _, _) = app.send(SignedRequest::new("GET", "/vdel/k").build()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // VersionId entries remove permanently: dropping the marker
    // resurrects v1, dropping v1 empties the key
    let body = format!(
        "<Delete><Object><Key>k</Key><VersionId>{}</VersionId></Object></Delete>",
        marker
    );
    let (status, _, response) = app
        .send(
            SignedRequest::new("POST", "/vdel")
                .query("delete", "")
                .body(body.into_bytes())
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body_str(&response).contains(&format!("<VersionId>{}</VersionId>", marker)));

    let (status, _, body) = app.send(SignedRequest::new("GET", "/vdel/k").build()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"v1");

    let body = format!(
        "<Delete><Object><Key>k</Key><VersionId>{}</VersionId></Object></Delete>",
        v1
    );
    let (status, _, _) = app
        .send(
            SignedRequest::new("POST", "/vdel")
                .query("delete", "")
                .body(body.into_bytes())
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = app
        .send(
            SignedRequest::new("GET", "/vdel")
                .query("versions", "")
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let xml = body_str(&body);
    assert!(!xml.contains("<Version>"));
    assert!(!xml.contains("<DeleteMarker>"));
}

#[tokio::test]
async fn test_batch_delete_reports_per_key_errors() {
    let app = TestApp::new().await;
    create_bucket(&app, "berr").await;
    app.send(
        SignedRequest::new("PUT", "/berr/good")
            .body(&b"x"[..])
            .build(),
    )
    .await;

    // A traversal key fails its entry while the valid one still deletes
    let body = r#"<Delete><Object><Key>good</Key></Object><Object><Key>../escape</Key></Object></Delete>"#;
    let (status, _, response) = app
        .send(
            SignedRequest::new("POST", "/berr")
                .query("delete", "")
                .body(body.as_bytes().to_vec())
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let xml = body_str(&response);
    assert!(xml.contains("<Deleted>"));
    assert!(xml.contains("<Key>good</Key>"));
    assert!(xml.contains("<Error>"));
    assert!(xml.contains("<Code>InvalidArgument</Code>"));

    let (status, _, _) = app
        .send(SignedRequest::new("GET", "/berr/good").build())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_aws_chunked_upload() {
    let app = TestApp::new().await;
    create_bucket(&app, "chunky").await;

    // Frame "Hello, World!" as a single aws-chunked chunk. The signature
    // covers the framed bytes: the signer hashes the body it is given, so
    // frame first, then sign.
    let framed = b"d;chunk-signature=deadbeef\r\nHello, World!\r\n0;chunk-signature=deadbeef\r\n";
    let (status, _, _) = app
        .send(
            SignedRequest::new("PUT", "/chunky/k")
                .header("content-encoding", "aws-chunked")
                .header("x-amz-decoded-content-length", "13")
                .body(&framed[..])
                .build(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = app
        .send(SignedRequest::new("GET", "/chunky/k").build())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"Hello, World!");
}
