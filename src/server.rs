//! Axum router construction and S3 operation dispatch.
//!
//! S3 distinguishes operations by method, path shape and query
//! parameters rather than by path alone: `GET /bucket` is ListObjects,
//! `GET /bucket?location` is GetBucketLocation, `GET /bucket?uploads` is
//! ListMultipartUploads and so on.  Every request is routed through a
//! single [`dispatch`] handler that resolves the operation from the
//! [`ROUTES`] table and hands a decoded [`S3Request`] to the REST adapter.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderValue, Method, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use percent_encoding::percent_decode_str;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auth::{self, Identity};
use crate::errors::{generate_request_id, S3Error, SERVER_NAME};
use crate::handlers::{bucket, multipart, object, Query, S3Request};
use crate::AppState;

/// Build the S3 router with all middleware installed.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(dispatch))
        .route("/*path", any(dispatch))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            timeout_middleware,
        ))
        .layer(middleware::from_fn(head_error_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-amz-request-id`, `Date` and `Server` to every response.
pub async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses already carry their own request id.
    if !headers.contains_key("x-amz-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-amz-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static(SERVER_NAME));

    response
}

/// Drops error bodies from `HEAD` responses, whichever layer produced them.
pub async fn head_error_middleware(req: Request<Body>, next: Next) -> Response {
    let is_head = req.method() == Method::HEAD;
    let response = next.run(req).await;
    let status = response.status();
    if !is_head || !(status.is_client_error() || status.is_server_error()) {
        return response;
    }
    let (mut parts, _) = response.into_parts();
    parts.headers.remove("content-type");
    parts.headers.remove("content-length");
    Response::from_parts(parts, Body::empty())
}

/// Bounds signature validation plus body streaming for one request.
async fn timeout_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let limit = Duration::from_secs(state.config.server.request_timeout);
    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(response) => response,
        Err(_) => S3Error::RequestTimeout.into_response(),
    }
}

// -- Dispatch table ----------------------------------------------------------

/// What the request path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathShape {
    /// `/`
    Service,
    /// `/{bucket}`
    Bucket,
    /// `/{bucket}/{key}`
    Object,
}

/// A decoded request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub shape: PathShape,
    pub bucket: String,
    pub key: String,
}

impl Target {
    /// Split and percent-decode a raw request path.
    pub fn parse(path: &str) -> Result<Self, S3Error> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        if trimmed.is_empty() {
            return Ok(Self {
                shape: PathShape::Service,
                bucket: String::new(),
                key: String::new(),
            });
        }
        let (bucket, key) = match trimmed.split_once('/') {
            Some((bucket, key)) => (bucket, key),
            None => (trimmed, ""),
        };
        let bucket = decode_segment(bucket)?;
        let key = decode_segment(key)?;
        let shape = if key.is_empty() {
            PathShape::Bucket
        } else {
            PathShape::Object
        };
        Ok(Self { shape, bucket, key })
    }
}

fn decode_segment(raw: &str) -> Result<String, S3Error> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| S3Error::InvalidArgument {
            message: "The request path is not valid UTF-8".to_string(),
        })
}

/// Every operation the REST adapter serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ListBuckets,
    CreateBucket,
    HeadBucket,
    DeleteBucket,
    ListObjects,
    GetBucketLocation,
    GetBucketVersioning,
    PutBucketVersioning,
    GetBucketPolicy,
    PutBucketPolicy,
    DeleteBucketPolicy,
    GetBucketCors,
    PutBucketCors,
    DeleteBucketCors,
    ListMultipartUploads,
    DeleteObjects,
    PutObject,
    CopyObject,
    GetObject,
    HeadObject,
    DeleteObject,
    CreateMultipartUpload,
    UploadPart,
    UploadPartCopy,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    ListParts,
}

/// One row of the dispatch table.
///
/// A route matches when the method and path shape are equal, every
/// listed query parameter is present and the header (if any) is present.
/// Among matching routes the most specific one wins.
pub struct Route {
    pub method: &'static str,
    pub shape: PathShape,
    pub query: &'static [&'static str],
    pub header: Option<&'static str>,
    pub op: Operation,
}

impl Route {
    const fn new(method: &'static str, shape: PathShape, op: Operation) -> Self {
        Self {
            method,
            shape,
            query: &[],
            header: None,
            op,
        }
    }

    const fn with_query(mut self, query: &'static [&'static str]) -> Self {
        self.query = query;
        self
    }

    const fn with_header(mut self, header: &'static str) -> Self {
        self.header = Some(header);
        self
    }

    fn matches(&self, method: &str, shape: PathShape, query: &Query, headers: &HeaderMap) -> bool {
        self.method == method
            && self.shape == shape
            && self.query.iter().all(|name| query.contains_key(*name))
            && self.header.map_or(true, |name| headers.contains_key(name))
    }

    fn specificity(&self) -> usize {
        self.query.len() + usize::from(self.header.is_some())
    }
}

use Operation as Op;
use PathShape::{Bucket as B, Object as O, Service as S};

pub static ROUTES: &[Route] = &[
    Route::new("GET", S, Op::ListBuckets),
    // Bucket
    Route::new("PUT", B, Op::CreateBucket),
    Route::new("HEAD", B, Op::HeadBucket),
    Route::new("DELETE", B, Op::DeleteBucket),
    Route::new("GET", B, Op::ListObjects),
    Route::new("GET", B, Op::GetBucketLocation).with_query(&["location"]),
    Route::new("GET", B, Op::GetBucketVersioning).with_query(&["versioning"]),
    Route::new("PUT", B, Op::PutBucketVersioning).with_query(&["versioning"]),
    Route::new("GET", B, Op::GetBucketPolicy).with_query(&["policy"]),
    Route::new("PUT", B, Op::PutBucketPolicy).with_query(&["policy"]),
    Route::new("DELETE", B, Op::DeleteBucketPolicy).with_query(&["policy"]),
    Route::new("GET", B, Op::GetBucketCors).with_query(&["cors"]),
    Route::new("PUT", B, Op::PutBucketCors).with_query(&["cors"]),
    Route::new("DELETE", B, Op::DeleteBucketCors).with_query(&["cors"]),
    Route::new("GET", B, Op::ListMultipartUploads).with_query(&["uploads"]),
    Route::new("POST", B, Op::DeleteObjects).with_query(&["delete"]),
    // Object
    Route::new("PUT", O, Op::PutObject),
    Route::new("PUT", O, Op::CopyObject).with_header("x-amz-copy-source"),
    Route::new("GET", O, Op::GetObject),
    Route::new("HEAD", O, Op::HeadObject),
    Route::new("DELETE", O, Op::DeleteObject),
    // Multipart
    Route::new("POST", O, Op::CreateMultipartUpload).with_query(&["uploads"]),
    Route::new("PUT", O, Op::UploadPart).with_query(&["partNumber", "uploadId"]),
    Route::new("PUT", O, Op::UploadPartCopy)
        .with_query(&["partNumber", "uploadId"])
        .with_header("x-amz-copy-source"),
    Route::new("POST", O, Op::CompleteMultipartUpload).with_query(&["uploadId"]),
    Route::new("DELETE", O, Op::AbortMultipartUpload).with_query(&["uploadId"]),
    Route::new("GET", O, Op::ListParts).with_query(&["uploadId"]),
];

/// Subresources recognised but not served.
const UNSUPPORTED_SUBRESOURCES: &[&str] = &[
    "accelerate",
    "acl",
    "analytics",
    "attributes",
    "encryption",
    "intelligent-tiering",
    "inventory",
    "legal-hold",
    "lifecycle",
    "logging",
    "metrics",
    "notification",
    "object-lock",
    "ownershipControls",
    "publicAccessBlock",
    "replication",
    "requestPayment",
    "restore",
    "retention",
    "select",
    "tagging",
    "torrent",
    "versions",
    "website",
];

/// Resolve the operation for a request.
pub fn resolve(
    method: &Method,
    shape: PathShape,
    query: &Query,
    headers: &HeaderMap,
) -> Result<Operation, S3Error> {
    if shape != PathShape::Service
        && UNSUPPORTED_SUBRESOURCES
            .iter()
            .any(|name| query.contains_key(*name))
    {
        return Err(S3Error::NotImplemented);
    }
    ROUTES
        .iter()
        .filter(|route| route.matches(method.as_str(), shape, query, headers))
        .max_by_key(|route| route.specificity())
        .map(|route| route.op)
        .ok_or(S3Error::MethodNotAllowed)
}

/// Parse a raw query string into decoded name/value pairs.  Names with no
/// `=` map to an empty value.
pub fn parse_query(raw: Option<&str>) -> Query {
    let mut map = Query::new();
    for part in raw.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (name, value) = part.split_once('=').unwrap_or((part, ""));
        map.insert(
            percent_decode_str(name).decode_utf8_lossy().into_owned(),
            percent_decode_str(value).decode_utf8_lossy().into_owned(),
        );
    }
    map
}

// -- Dispatch ----------------------------------------------------------------

async fn dispatch(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    let method = req.method().as_str().to_string();
    let (parts, body) = req.into_parts();
    let origin = parts
        .headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let target = match Target::parse(parts.uri.path()) {
        Ok(target) => target,
        Err(err) => return err.into_response(),
    };

    if parts.method == Method::OPTIONS {
        return match bucket::cors_preflight(Arc::clone(&state), &target.bucket, &parts.headers)
            .await
        {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };
    }

    let result = route_request(Arc::clone(&state), parts, body, &target).await;
    let mut response = match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };

    if let Some(origin) = origin.filter(|_| !target.bucket.is_empty()) {
        if let Some(matched) = state
            .gateway
            .cors_for_request(&target.bucket, &origin, &method)
            .await
        {
            matched.apply(response.headers_mut(), false);
        }
    }
    response
}

async fn route_request(
    state: Arc<AppState>,
    parts: axum::http::request::Parts,
    body: Body,
    target: &Target,
) -> Result<Response, S3Error> {
    let identity = parts
        .extensions
        .get::<Identity>()
        .cloned()
        .ok_or_else(|| S3Error::AccessDenied {
            resource: parts.uri.path().to_string(),
        })?;
    let query = parse_query(parts.uri.query());
    let op = resolve(&parts.method, target.shape, &query, &parts.headers)?;
    debug!(
        operation = ?op,
        bucket = %target.bucket,
        key = %target.key,
        owner = %identity.owner_id,
        "dispatching"
    );

    let req = S3Request {
        identity,
        bucket: target.bucket.clone(),
        key: target.key.clone(),
        query,
        headers: parts.headers,
        body,
    };
    execute(op, state, req).await
}

async fn execute(op: Operation, state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    match op {
        Op::ListBuckets => bucket::list_buckets(state, req).await,
        Op::CreateBucket => bucket::create_bucket(state, req).await,
        Op::HeadBucket => bucket::head_bucket(state, req).await,
        Op::DeleteBucket => bucket::delete_bucket(state, req).await,
        Op::ListObjects => bucket::list_objects(state, req).await,
        Op::GetBucketLocation => bucket::get_bucket_location(state, req).await,
        Op::GetBucketVersioning => bucket::get_bucket_versioning(state, req).await,
        Op::PutBucketVersioning => bucket::put_bucket_versioning(state, req).await,
        Op::GetBucketPolicy => bucket::get_bucket_policy(state, req).await,
        Op::PutBucketPolicy => bucket::put_bucket_policy(state, req).await,
        Op::DeleteBucketPolicy => bucket::delete_bucket_policy(state, req).await,
        Op::GetBucketCors => bucket::get_bucket_cors(state, req).await,
        Op::PutBucketCors => bucket::put_bucket_cors(state, req).await,
        Op::DeleteBucketCors => bucket::delete_bucket_cors(state, req).await,
        Op::ListMultipartUploads => multipart::list_multipart_uploads(state, req).await,
        Op::DeleteObjects => bucket::delete_objects(state, req).await,
        Op::PutObject => object::put_object(state, req).await,
        Op::CopyObject => object::copy_object(state, req).await,
        Op::GetObject => object::get_object(state, req).await,
        Op::HeadObject => object::head_object(state, req).await,
        Op::DeleteObject => object::delete_object(state, req).await,
        Op::CreateMultipartUpload => multipart::create_multipart_upload(state, req).await,
        Op::UploadPart => multipart::upload_part(state, req).await,
        Op::UploadPartCopy => multipart::upload_part_copy(state, req).await,
        Op::CompleteMultipartUpload => multipart::complete_multipart_upload(state, req).await,
        Op::AbortMultipartUpload => multipart::abort_multipart_upload(state, req).await,
        Op::ListParts => multipart::list_parts(state, req).await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::metadata::store::MetadataStore;
    use crate::service::{Gateway, GatewaySettings};
    use crate::storage::backend::StorageBackend;
    use crate::storage::local::LocalBackend;
    use axum::http::StatusCode;
    use chrono::Utc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    pub(crate) fn test_state() -> (Arc<AppState>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let store = SqliteMetadataStore::new(":memory:").unwrap();
        store
            .seed_credential(
                &config.auth.access_key,
                &config.auth.secret_key,
                &config.auth.owner_id,
                &config.auth.display_name,
            )
            .unwrap();
        let metadata: Arc<dyn MetadataStore> = Arc::new(store);
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalBackend::new(dir.path().join("objects")).unwrap());
        let gateway = Gateway::new(
            Arc::clone(&metadata),
            storage,
            GatewaySettings::from_config(&config),
        );
        let state = Arc::new(AppState {
            config,
            metadata,
            gateway,
        });
        (state, dir)
    }

    /// Build a request signed with the bootstrap credential.
    pub(crate) fn signed(state: &AppState, method: &str, uri: &str, body: &'static [u8]) -> Request<Body> {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-length", body.len().to_string())
            .body(Body::from(body))
            .unwrap();
        auth::sign_request(
            &mut req,
            &state.config.auth.access_key,
            &state.config.auth.secret_key,
            &state.config.server.region,
            Utc::now(),
            "UNSIGNED-PAYLOAD",
        );
        req
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn resolve_str(method: &str, path: &str, query: &str, headers: &[&str]) -> Result<Operation, S3Error> {
        let target = Target::parse(path).unwrap();
        let mut map = HeaderMap::new();
        for name in headers {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_static("x"),
            );
        }
        let method = Method::from_bytes(method.as_bytes()).unwrap();
        resolve(&method, target.shape, &parse_query(Some(query)), &map)
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(Target::parse("/").unwrap().shape, PathShape::Service);
        let t = Target::parse("/photos/").unwrap();
        assert_eq!(t.shape, PathShape::Bucket);
        assert_eq!(t.bucket, "photos");
        let t = Target::parse("/photos/2024/cat%20one.jpg").unwrap();
        assert_eq!(t.shape, PathShape::Object);
        assert_eq!(t.key, "2024/cat one.jpg");
        assert!(Target::parse("/photos/%FF").is_err());
    }

    #[test]
    fn test_parse_query_decodes() {
        let q = parse_query(Some("uploads&prefix=a%2Fb&max-keys=5"));
        assert_eq!(q.get("uploads").map(String::as_str), Some(""));
        assert_eq!(q.get("prefix").map(String::as_str), Some("a/b"));
        assert_eq!(q.get("max-keys").map(String::as_str), Some("5"));
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_dispatch_table_resolution() {
        assert_eq!(resolve_str("GET", "/", "", &[]).unwrap(), Op::ListBuckets);
        assert_eq!(resolve_str("GET", "/b", "", &[]).unwrap(), Op::ListObjects);
        assert_eq!(resolve_str("GET", "/b", "location", &[]).unwrap(), Op::GetBucketLocation);
        assert_eq!(resolve_str("GET", "/b", "uploads", &[]).unwrap(), Op::ListMultipartUploads);
        assert_eq!(resolve_str("POST", "/b", "delete", &[]).unwrap(), Op::DeleteObjects);
        assert_eq!(resolve_str("PUT", "/b/k", "", &[]).unwrap(), Op::PutObject);
        assert_eq!(
            resolve_str("PUT", "/b/k", "", &["x-amz-copy-source"]).unwrap(),
            Op::CopyObject
        );
        assert_eq!(
            resolve_str("PUT", "/b/k", "partNumber=1&uploadId=u", &[]).unwrap(),
            Op::UploadPart
        );
        assert_eq!(
            resolve_str("PUT", "/b/k", "partNumber=1&uploadId=u", &["x-amz-copy-source"]).unwrap(),
            Op::UploadPartCopy
        );
        assert_eq!(resolve_str("POST", "/b/k", "uploads", &[]).unwrap(), Op::CreateMultipartUpload);
        assert_eq!(
            resolve_str("POST", "/b/k", "uploadId=u", &[]).unwrap(),
            Op::CompleteMultipartUpload
        );
        assert_eq!(
            resolve_str("DELETE", "/b/k", "uploadId=u", &[]).unwrap(),
            Op::AbortMultipartUpload
        );
        assert_eq!(resolve_str("GET", "/b/k", "uploadId=u", &[]).unwrap(), Op::ListParts);
    }

    #[test]
    fn test_unsupported_and_unknown_routes() {
        assert!(matches!(
            resolve_str("GET", "/b", "acl", &[]),
            Err(S3Error::NotImplemented)
        ));
        assert!(matches!(
            resolve_str("PUT", "/b/k", "tagging", &[]),
            Err(S3Error::NotImplemented)
        ));
        assert!(matches!(
            resolve_str("POST", "/b", "", &[]),
            Err(S3Error::MethodNotAllowed)
        ));
        assert!(matches!(
            resolve_str("DELETE", "/", "", &[]),
            Err(S3Error::MethodNotAllowed)
        ));
    }

    #[tokio::test]
    async fn test_create_bucket_and_conflict() {
        let (state, _dir) = test_state();
        let response = app(state.clone())
            .oneshot(signed(&state, "PUT", "/photos", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["location"], "/photos");
        assert!(response.headers().contains_key("x-amz-request-id"));
        assert_eq!(response.headers()["server"], SERVER_NAME);

        let response = app(state.clone())
            .oneshot(signed(&state, "PUT", "/photos", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_text(response).await.contains("BucketAlreadyOwnedByYou"));
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let (state, _dir) = test_state();
        let mut req = signed(&state, "PUT", "/photos", b"");
        let auth = req.headers()["authorization"].to_str().unwrap().to_string();
        let tampered = format!("{}0000", &auth[..auth.len() - 4]);
        req.headers_mut()
            .insert("authorization", HeaderValue::from_str(&tampered).unwrap());

        let response = app(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_text(response).await.contains("SignatureDoesNotMatch"));
    }

    #[tokio::test]
    async fn test_anonymous_request_denied() {
        let (state, _dir) = test_state();
        let req = Request::builder()
            .uri("/")
            .header("host", "localhost")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (state, _dir) = test_state();
        app(state.clone())
            .oneshot(signed(&state, "PUT", "/docs", b""))
            .await
            .unwrap();

        let mut req = signed(&state, "PUT", "/docs/notes/a%20b.txt", b"hello world");
        req.headers_mut()
            .insert("x-amz-meta-color", HeaderValue::from_static("blue"));
        let response = app(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["etag"],
            "\"5eb63bbbe01eeed093cb22bb8f5acdc3\""
        );

        let response = app(state.clone())
            .oneshot(signed(&state, "GET", "/docs/notes/a%20b.txt", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-amz-meta-color"], "blue");
        assert_eq!(body_text(response).await, "hello world");

        let response = app(state.clone())
            .oneshot(signed(&state, "GET", "/docs?list-type=2", b""))
            .await
            .unwrap();
        let listing = body_text(response).await;
        assert!(listing.contains("<Key>notes/a b.txt</Key>"));
        assert!(listing.contains("<KeyCount>1</KeyCount>"));
    }

    #[tokio::test]
    async fn test_not_implemented_subresource() {
        let (state, _dir) = test_state();
        app(state.clone())
            .oneshot(signed(&state, "PUT", "/docs", b""))
            .await
            .unwrap();
        let response = app(state.clone())
            .oneshot(signed(&state, "GET", "/docs?acl", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_head_error_has_no_body() {
        let (state, _dir) = test_state();
        let response = app(state.clone())
            .oneshot(signed(&state, "HEAD", "/missing", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_text(response).await.is_empty());
    }

    fn presigned(state: &AppState, method: &str, path: &str, at: chrono::DateTime<Utc>) -> Request<Body> {
        let uri = auth::presign_uri(
            method,
            path,
            &state.config.auth.access_key,
            &state.config.auth.secret_key,
            &state.config.server.region,
            at,
            3600,
        );
        Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "localhost")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_presigned_url_expiry() {
        let (state, _dir) = test_state();
        app(state.clone())
            .oneshot(signed(&state, "PUT", "/docs", b""))
            .await
            .unwrap();
        app(state.clone())
            .oneshot(signed(&state, "PUT", "/docs/shared.txt", b"shared"))
            .await
            .unwrap();

        let fresh = presigned(&state, "GET", "/docs/shared.txt", Utc::now());
        let response = app(state.clone()).oneshot(fresh).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "shared");

        let signed_at = Utc::now() - chrono::Duration::seconds(7200);
        let expired = presigned(&state, "GET", "/docs/shared.txt", signed_at);
        let response = app(state.clone()).oneshot(expired).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_text(response).await.contains("AccessDenied"));
    }

    #[tokio::test]
    async fn test_unknown_key_reported_before_clock_skew() {
        let (state, _dir) = test_state();
        let mut req = Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        auth::sign_request(
            &mut req,
            "AKUNKNOWN",
            "not-a-secret",
            &state.config.server.region,
            Utc::now() - chrono::Duration::days(1),
            "UNSIGNED-PAYLOAD",
        );
        let response = app(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_text(response).await.contains("InvalidAccessKeyId"));
    }

    #[tokio::test]
    async fn test_head_rejected_by_auth_has_no_body() {
        let (state, _dir) = test_state();
        let req = Request::builder()
            .method("HEAD")
            .uri("/docs/a.txt")
            .header("host", "localhost")
            .body(Body::empty())
            .unwrap();
        let response = app(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!response.headers().contains_key("content-type"));
        assert!(response.headers().contains_key("x-amz-request-id"));
        assert!(body_text(response).await.is_empty());

        let signed_at = Utc::now() - chrono::Duration::seconds(7200);
        let expired = presigned(&state, "HEAD", "/docs/a.txt", signed_at);
        let response = app(state).oneshot(expired).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_text(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_preflight_without_rules_forbidden() {
        let (state, _dir) = test_state();
        app(state.clone())
            .oneshot(signed(&state, "PUT", "/docs", b""))
            .await
            .unwrap();
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/docs/a.txt")
            .header("origin", "https://example.com")
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_text(response).await.contains("AccessForbidden"));
    }
}
