//! RPC/JSON adapter.
//!
//! A second listener exposing a small JSON API over the same
//! [`Gateway`](crate::service::Gateway) operations the S3 surface uses.
//! Requests are authenticated by the same SigV4 middleware; errors are
//! the same [`S3Error`] values rendered as JSON instead of XML.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::{self, Identity};
use crate::errors::{generate_request_id, S3Error};
use crate::metadata::store::{
    BucketRecord, CustomMetadata, ListObjectsQuery, ListUploadsQuery, MultipartUploadRecord,
    ObjectRecord, VersioningStatus,
};
use crate::server::common_headers_middleware;
use crate::service::Preconditions;
use crate::AppState;

const MAX_LIST: u32 = 1000;

/// Build the RPC router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/v1/usage", get(usage))
        .route("/v1/buckets", get(list_buckets).post(create_bucket))
        .route("/v1/buckets/:bucket", get(get_bucket).delete(delete_bucket))
        .route("/v1/buckets/:bucket/versioning", put(set_versioning))
        .route("/v1/buckets/:bucket/objects", get(list_objects))
        .route(
            "/v1/buckets/:bucket/objects/*key",
            get(get_object).delete(delete_object),
        )
        .route("/v1/buckets/:bucket/uploads", get(list_uploads))
        .route(
            "/v1/buckets/:bucket/uploads/:upload_id",
            delete(abort_upload),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// -- Errors ------------------------------------------------------------------

/// An [`S3Error`] rendered as `{code, message, request_id}`.
#[derive(Debug)]
pub struct RpcError(pub S3Error);

impl From<S3Error> for RpcError {
    fn from(err: S3Error) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    request_id: &'a str,
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        if let S3Error::InternalError(ref err) = self.0 {
            error!(request_id = %request_id, "internal error: {err:#}");
        }
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
            request_id: &request_id,
        };
        let mut response = (self.0.status_code(), Json(body)).into_response();
        if let Ok(value) = request_id.parse() {
            response.headers_mut().insert("x-amz-request-id", value);
        }
        response
    }
}

type RpcResult<T> = Result<T, RpcError>;

// -- Views -------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct BucketView {
    pub name: String,
    pub owner_id: String,
    pub region: String,
    pub storage_class: String,
    pub acl: String,
    pub versioning: String,
    pub object_count: i64,
    pub total_size: i64,
    pub created_at: String,
}

impl From<BucketRecord> for BucketView {
    fn from(b: BucketRecord) -> Self {
        Self {
            versioning: b.versioning.as_str().to_string(),
            name: b.name,
            owner_id: b.owner_id,
            region: b.region,
            storage_class: b.storage_class,
            acl: b.acl,
            object_count: b.object_count,
            total_size: b.total_size,
            created_at: b.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectView {
    pub key: String,
    pub version_id: Option<String>,
    pub size: u64,
    pub etag: String,
    pub content_type: String,
    pub storage_class: String,
    pub last_modified: String,
    pub metadata: CustomMetadata,
}

impl From<ObjectRecord> for ObjectView {
    fn from(o: ObjectRecord) -> Self {
        Self {
            key: o.key,
            version_id: o.version_id,
            size: o.size,
            etag: o.etag,
            content_type: o.content_type,
            storage_class: o.storage_class,
            last_modified: o.last_modified,
            metadata: o.metadata,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadView {
    pub upload_id: String,
    pub key: String,
    pub initiated_at: String,
    pub storage_class: String,
}

impl From<MultipartUploadRecord> for UploadView {
    fn from(u: MultipartUploadRecord) -> Self {
        Self {
            upload_id: u.upload_id,
            key: u.key,
            initiated_at: u.initiated_at,
            storage_class: u.storage_class,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectList {
    pub bucket: String,
    pub objects: Vec<ObjectView>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageView {
    pub owner_id: String,
    pub display_name: String,
    pub used_storage: i64,
    pub storage_quota: Option<i64>,
}

// -- Requests ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateBucketRequest {
    pub name: String,
    pub region: Option<String>,
    #[serde(default)]
    pub versioning: bool,
}

#[derive(Debug, Deserialize)]
pub struct VersioningRequest {
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteBucketParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListObjectsParams {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub delimiter: String,
    #[serde(default)]
    pub marker: String,
    pub max_keys: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListUploadsParams {
    #[serde(default)]
    pub prefix: String,
    pub max_uploads: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VersionParams {
    pub version_id: Option<String>,
}

// -- Handlers ----------------------------------------------------------------

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn usage(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> RpcResult<Json<UsageView>> {
    let user = state.gateway.usage(&identity).await?;
    Ok(Json(UsageView {
        owner_id: user.owner_id,
        display_name: user.display_name,
        used_storage: user.used_storage,
        storage_quota: user.storage_quota,
    }))
}

async fn list_buckets(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> RpcResult<Json<serde_json::Value>> {
    let buckets: Vec<BucketView> = state
        .gateway
        .list_buckets(&identity)
        .await?
        .into_iter()
        .map(BucketView::from)
        .collect();
    Ok(Json(serde_json::json!({ "buckets": buckets })))
}

async fn create_bucket(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreateBucketRequest>,
) -> RpcResult<(StatusCode, Json<BucketView>)> {
    let gateway = &state.gateway;
    let mut bucket = gateway
        .create_bucket(&identity, &body.name, body.region.as_deref(), None)
        .await?;
    if body.versioning {
        gateway
            .set_bucket_versioning(&identity, &body.name, VersioningStatus::Enabled)
            .await?;
        bucket.versioning = VersioningStatus::Enabled;
    }
    info!(bucket = %body.name, "bucket created over rpc");
    Ok((StatusCode::CREATED, Json(BucketView::from(bucket))))
}

async fn get_bucket(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(bucket): Path<String>,
) -> RpcResult<Json<BucketView>> {
    let record = state.gateway.bucket_info(&identity, &bucket).await?;
    Ok(Json(record.into()))
}

async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(bucket): Path<String>,
    Query(params): Query<DeleteBucketParams>,
) -> RpcResult<StatusCode> {
    state
        .gateway
        .delete_bucket(&identity, &bucket, params.force)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_versioning(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(bucket): Path<String>,
    Json(body): Json<VersioningRequest>,
) -> RpcResult<Json<serde_json::Value>> {
    let status = if body.enabled {
        VersioningStatus::Enabled
    } else {
        VersioningStatus::Suspended
    };
    state
        .gateway
        .set_bucket_versioning(&identity, &bucket, status)
        .await?;
    Ok(Json(serde_json::json!({ "versioning": status.as_str() })))
}

async fn list_objects(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(bucket): Path<String>,
    Query(params): Query<ListObjectsParams>,
) -> RpcResult<Json<ObjectList>> {
    let query = ListObjectsQuery {
        prefix: params.prefix,
        delimiter: params.delimiter,
        marker: params.marker,
        max_keys: params.max_keys.unwrap_or(MAX_LIST).min(MAX_LIST),
    };
    let (_, result) = state
        .gateway
        .list_objects(&identity, &bucket, &query)
        .await?;
    Ok(Json(ObjectList {
        bucket,
        objects: result.objects.into_iter().map(ObjectView::from).collect(),
        common_prefixes: result.common_prefixes,
        is_truncated: result.is_truncated,
        next_marker: result.next_marker,
    }))
}

async fn get_object(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<VersionParams>,
) -> RpcResult<Json<ObjectView>> {
    let record = state
        .gateway
        .head_object(
            &identity,
            &bucket,
            &key,
            params.version_id.as_deref(),
            &Preconditions::default(),
        )
        .await?;
    Ok(Json(record.into()))
}

async fn delete_object(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<VersionParams>,
) -> RpcResult<Json<serde_json::Value>> {
    let outcome = state
        .gateway
        .delete_object(&identity, &bucket, &key, params.version_id.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "version_id": outcome.version_id,
        "delete_marker": outcome.delete_marker,
    })))
}

async fn list_uploads(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(bucket): Path<String>,
    Query(params): Query<ListUploadsParams>,
) -> RpcResult<Json<serde_json::Value>> {
    let query = ListUploadsQuery {
        prefix: params.prefix,
        max_uploads: params.max_uploads.unwrap_or(MAX_LIST).min(MAX_LIST),
        ..ListUploadsQuery::default()
    };
    let result = state
        .gateway
        .list_multipart_uploads(&identity, &bucket, &query)
        .await?;
    let uploads: Vec<UploadView> = result.uploads.into_iter().map(UploadView::from).collect();
    Ok(Json(serde_json::json!({
        "bucket": bucket,
        "uploads": uploads,
        "is_truncated": result.is_truncated,
    })))
}

async fn abort_upload(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path((bucket, upload_id)): Path<(String, String)>,
) -> RpcResult<StatusCode> {
    state
        .gateway
        .abort_multipart_upload(&identity, &bucket, None, &upload_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::{signed, test_state};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn signed_json(state: &AppState, method: &str, uri: &str, body: &'static str) -> Request<Body> {
        let mut req = signed(state, method, uri, body.as_bytes());
        req.headers_mut()
            .insert("content-type", "application/json".parse().unwrap());
        req
    }

    #[tokio::test]
    async fn test_healthz_skips_auth() {
        let (state, _dir) = test_state();
        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_bucket_lifecycle_over_rpc() {
        let (state, _dir) = test_state();
        let response = app(state.clone())
            .oneshot(signed_json(
                &state,
                "POST",
                "/v1/buckets",
                r#"{"name":"reports","versioning":true}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json(response).await["versioning"], "Enabled");

        let response = app(state.clone())
            .oneshot(signed(&state, "GET", "/v1/buckets", b""))
            .await
            .unwrap();
        let listing = json(response).await;
        assert_eq!(listing["buckets"][0]["name"], "reports");

        let response = app(state.clone())
            .oneshot(signed(&state, "GET", "/v1/buckets/reports", b""))
            .await
            .unwrap();
        assert_eq!(json(response).await["object_count"], 0);

        let response = app(state.clone())
            .oneshot(signed(&state, "DELETE", "/v1/buckets/reports?force=true", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_errors_render_as_json() {
        let (state, _dir) = test_state();
        let response = app(state.clone())
            .oneshot(signed(&state, "GET", "/v1/buckets/missing/objects", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key("x-amz-request-id"));
        let body = json(response).await;
        assert_eq!(body["code"], "NoSuchBucket");
        assert!(body["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_usage_reports_quota() {
        let (state, _dir) = test_state();
        let response = app(state.clone())
            .oneshot(signed(&state, "GET", "/v1/usage", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["owner_id"], state.config.auth.owner_id.as_str());
        assert_eq!(body["used_storage"], 0);
        assert!(body["storage_quota"].is_null());
    }
}
