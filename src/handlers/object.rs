//! Object-level S3 API handlers.

use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use super::{
    header_str, object_attributes, object_headers, preconditions, set_header, upload_body,
    xml_response, S3Request,
};
use crate::errors::S3Error;
use crate::service::{CopySource, MetadataDirective, RangeRequest};
use crate::xml;
use crate::AppState;

/// `PUT /{bucket}/{key}` -- PutObject.
pub async fn put_object(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let attributes = object_attributes(&req.headers);
    let body = upload_body(&req.headers, req.body)?;
    let out = state
        .gateway
        .put_object(&req.identity, &req.bucket, &req.key, body, attributes)
        .await?;

    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    set_header(headers, "etag", &out.etag);
    if let Some(version_id) = &out.version_id {
        set_header(headers, "x-amz-version-id", version_id);
    }
    Ok(response)
}

/// `PUT /{bucket}/{key}` with `x-amz-copy-source` -- CopyObject.
pub async fn copy_object(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let source = CopySource::parse(req.header("x-amz-copy-source").unwrap_or_default())?;
    let directive = MetadataDirective::parse(req.header("x-amz-metadata-directive"))?;
    let attributes = object_attributes(&req.headers);

    let out = state
        .gateway
        .copy_object(
            &req.identity,
            &source,
            &req.bucket,
            &req.key,
            directive,
            attributes,
        )
        .await?;

    let mut response = xml_response(
        StatusCode::OK,
        xml::render_copy_object_result(&out.etag, &out.last_modified),
    );
    let headers = response.headers_mut();
    if let Some(version_id) = &out.version_id {
        set_header(headers, "x-amz-version-id", version_id);
    }
    if let Some(source_version) = &out.source_version_id {
        set_header(headers, "x-amz-copy-source-version-id", source_version);
    }
    Ok(response)
}

/// `GET /{bucket}/{key}` -- GetObject, streaming the body.
pub async fn get_object(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let range = header_str(&req.headers, "range").and_then(RangeRequest::parse);
    let conditions = preconditions(&req.headers);
    let out = state
        .gateway
        .get_object(
            &req.identity,
            &req.bucket,
            &req.key,
            req.query("versionId"),
            range,
            &conditions,
        )
        .await?;

    let (status, length) = match out.range {
        Some(r) => (StatusCode::PARTIAL_CONTENT, r.len()),
        None => (StatusCode::OK, out.record.size),
    };
    let mut response = Response::new(Body::from_stream(out.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    object_headers(headers, &out.record);
    set_header(headers, "content-length", &length.to_string());
    if let Some(r) = out.range {
        set_header(
            headers,
            "content-range",
            &format!("bytes {}-{}/{}", r.first, r.last, out.record.size),
        );
    }
    Ok(response)
}

/// `HEAD /{bucket}/{key}` -- HeadObject.
pub async fn head_object(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let conditions = preconditions(&req.headers);
    let record = state
        .gateway
        .head_object(
            &req.identity,
            &req.bucket,
            &req.key,
            req.query("versionId"),
            &conditions,
        )
        .await?;

    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    object_headers(headers, &record);
    set_header(headers, "content-length", &record.size.to_string());
    Ok(response)
}

/// `DELETE /{bucket}/{key}` -- DeleteObject.
pub async fn delete_object(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let outcome = state
        .gateway
        .delete_object(&req.identity, &req.bucket, &req.key, req.query("versionId"))
        .await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    if outcome.delete_marker {
        set_header(headers, "x-amz-delete-marker", "true");
    }
    if let Some(version_id) = &outcome.version_id {
        set_header(headers, "x-amz-version-id", version_id);
    }
    Ok(response)
}
