//! S3 router assembly, shared by the binary and the integration tests.

use crate::api::auth::sigv4_auth_middleware;
use crate::api::handlers::{
    bucket_get_handler, bucket_put_handler, delete_bucket, delete_object, delete_objects,
    get_object, head_bucket, head_object, head_root, list_buckets, post_object,
    put_object_or_copy, request_id_middleware, AppState,
};
use axum::{extract::DefaultBodyLimit, middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the path-style S3 router:
///   GET    /                    - list buckets (HEAD / = probe)
///   PUT    /{bucket}            - create bucket / put versioning
///   DELETE /{bucket}            - delete bucket
///   HEAD   /{bucket}            - head bucket
///   GET    /{bucket}            - listings and sub-resources
///   POST   /{bucket}            - batch delete
///   *      /{bucket}/{key...}   - object and multipart operations
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Root: list buckets + HEAD probe for S3 client compatibility
        .route("/", get(list_buckets).head(head_root))
        // Object operations (wildcard routes first - more specific)
        .route(
            "/:bucket/*key",
            get(get_object)
                .put(put_object_or_copy)
                .delete(delete_object)
                .head(head_object)
                .post(post_object),
        )
        // Bucket operations (without trailing slash)
        .route(
            "/:bucket",
            get(bucket_get_handler)
                .put(bucket_put_handler)
                .delete(delete_bucket)
                .head(head_bucket)
                .post(delete_objects),
        )
        // Bucket operations (with trailing slash)
        .route(
            "/:bucket/",
            get(bucket_get_handler)
                .put(bucket_put_handler)
                .delete(delete_bucket)
                .head(head_bucket)
                .post(delete_objects),
        )
        .layer(TraceLayer::new_for_http())
        // SigV4 verification; buffers and normalizes the body
        .layer(middleware::from_fn_with_state(
            state.clone(),
            sigv4_auth_middleware,
        ))
        // Outermost: stamps x-amz-request-id on every response, auth
        // rejections included
        .layer(middleware::from_fn(request_id_middleware))
        .layer(DefaultBodyLimit::max(state.max_body_size as usize))
        .with_state(state)
}
