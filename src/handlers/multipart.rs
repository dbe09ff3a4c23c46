//! Multipart upload S3 API handlers.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use super::{
    collect_body, object_attributes, query_u32, set_header, upload_body, xml_response, S3Request,
    MAX_DOCUMENT_SIZE,
};
use crate::errors::S3Error;
use crate::metadata::store::ListUploadsQuery;
use crate::multipart::{DEFAULT_MAX_PARTS, MAX_PART_NUMBER};
use crate::service::{CopySource, RangeRequest};
use crate::xml;
use crate::AppState;

const MAX_UPLOADS: u32 = 1000;

fn upload_id(req: &S3Request) -> Result<&str, S3Error> {
    req.query("uploadId")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| S3Error::NoSuchUpload {
            upload_id: String::new(),
        })
}

fn part_number(req: &S3Request) -> Result<u32, S3Error> {
    req.query("partNumber")
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|n| (1..=MAX_PART_NUMBER).contains(n))
        .ok_or_else(|| S3Error::InvalidArgument {
            message: format!(
                "Part number must be an integer between 1 and {MAX_PART_NUMBER}, inclusive"
            ),
        })
}

/// `POST /{bucket}/{key}?uploads` -- CreateMultipartUpload.
pub async fn create_multipart_upload(
    state: Arc<AppState>,
    req: S3Request,
) -> Result<Response, S3Error> {
    let attributes = object_attributes(&req.headers);
    let upload = state
        .gateway
        .create_multipart_upload(&req.identity, &req.bucket, &req.key, attributes)
        .await?;
    Ok(xml_response(
        StatusCode::OK,
        xml::render_initiate_multipart_upload_result(&req.bucket, &req.key, &upload.upload_id),
    ))
}

/// `PUT /{bucket}/{key}?partNumber=N&uploadId=ID` -- UploadPart.
pub async fn upload_part(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let part_number = part_number(&req)?;
    let upload_id = upload_id(&req)?.to_string();
    let body = upload_body(&req.headers, req.body)?;
    let part = state
        .gateway
        .upload_part(
            &req.identity,
            &req.bucket,
            &req.key,
            &upload_id,
            part_number,
            body,
        )
        .await?;

    let mut response = StatusCode::OK.into_response();
    set_header(response.headers_mut(), "etag", &part.etag);
    Ok(response)
}

/// `PUT /{bucket}/{key}?partNumber=N&uploadId=ID` with `x-amz-copy-source`
/// -- UploadPartCopy.
pub async fn upload_part_copy(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let part_number = part_number(&req)?;
    let upload_id = upload_id(&req)?;
    let source = CopySource::parse(req.header("x-amz-copy-source").unwrap_or_default())?;
    let range = match req.header("x-amz-copy-source-range") {
        None => None,
        Some(value) => match RangeRequest::parse(value) {
            Some(r @ RangeRequest::Bounded { .. }) => Some(r),
            _ => {
                return Err(S3Error::InvalidArgument {
                    message: "The x-amz-copy-source-range value must be of the form bytes=first-last"
                        .to_string(),
                })
            }
        },
    };

    let part = state
        .gateway
        .upload_part_copy(
            &req.identity,
            &req.bucket,
            &req.key,
            upload_id,
            part_number,
            &source,
            range,
        )
        .await?;
    Ok(xml_response(
        StatusCode::OK,
        xml::render_copy_part_result(&part.etag, &part.last_modified),
    ))
}

/// `POST /{bucket}/{key}?uploadId=ID` -- CompleteMultipartUpload.
pub async fn complete_multipart_upload(
    state: Arc<AppState>,
    req: S3Request,
) -> Result<Response, S3Error> {
    let upload_id = upload_id(&req)?.to_string();
    let body = collect_body(req.body, MAX_DOCUMENT_SIZE).await?;
    let parts = xml::parse_complete_multipart_upload(&body)?;

    let done = state
        .gateway
        .complete_multipart_upload(&req.identity, &req.bucket, &req.key, &upload_id, &parts)
        .await?;

    let location = format!("/{}/{}", done.bucket, done.key);
    let mut response = xml_response(
        StatusCode::OK,
        xml::render_complete_multipart_upload_result(&location, &done.bucket, &done.key, &done.etag),
    );
    if let Some(version_id) = &done.version_id {
        set_header(response.headers_mut(), "x-amz-version-id", version_id);
    }
    Ok(response)
}

/// `DELETE /{bucket}/{key}?uploadId=ID` -- AbortMultipartUpload.
pub async fn abort_multipart_upload(
    state: Arc<AppState>,
    req: S3Request,
) -> Result<Response, S3Error> {
    let upload_id = upload_id(&req)?;
    state
        .gateway
        .abort_multipart_upload(&req.identity, &req.bucket, Some(&req.key), upload_id)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /{bucket}?uploads` -- ListMultipartUploads.
pub async fn list_multipart_uploads(
    state: Arc<AppState>,
    req: S3Request,
) -> Result<Response, S3Error> {
    let query = ListUploadsQuery {
        prefix: req.query("prefix").unwrap_or_default().to_string(),
        key_marker: req.query("key-marker").unwrap_or_default().to_string(),
        upload_id_marker: req.query("upload-id-marker").unwrap_or_default().to_string(),
        max_uploads: query_u32(&req.query, "max-uploads", MAX_UPLOADS, MAX_UPLOADS)?,
    };
    let result = state
        .gateway
        .list_multipart_uploads(&req.identity, &req.bucket, &query)
        .await?;

    let entries: Vec<xml::UploadEntry<'_>> = result
        .uploads
        .iter()
        .map(|u| xml::UploadEntry {
            key: &u.key,
            upload_id: &u.upload_id,
            initiated: &u.initiated_at,
            storage_class: &u.storage_class,
            owner_id: &u.owner_id,
            owner_display: &u.owner_display,
        })
        .collect();
    let page = xml::UploadsPage {
        bucket: &req.bucket,
        prefix: &query.prefix,
        key_marker: &query.key_marker,
        upload_id_marker: &query.upload_id_marker,
        next_key_marker: result.next_key_marker.as_deref(),
        next_upload_id_marker: result.next_upload_id_marker.as_deref(),
        max_uploads: query.max_uploads,
        is_truncated: result.is_truncated,
    };
    Ok(xml_response(
        StatusCode::OK,
        xml::render_list_multipart_uploads_result(&page, &entries),
    ))
}

/// `GET /{bucket}/{key}?uploadId=ID` -- ListParts.
pub async fn list_parts(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let upload_id = upload_id(&req)?;
    let max_parts = query_u32(&req.query, "max-parts", DEFAULT_MAX_PARTS, DEFAULT_MAX_PARTS)?;
    let marker = query_u32(&req.query, "part-number-marker", 0, MAX_PART_NUMBER)?;

    let (upload, result) = state
        .gateway
        .list_parts(&req.identity, &req.bucket, &req.key, upload_id, max_parts, marker)
        .await?;

    let parts: Vec<xml::PartEntry<'_>> = result
        .parts
        .iter()
        .map(|p| xml::PartEntry {
            part_number: p.part_number,
            last_modified: &p.last_modified,
            etag: &p.etag,
            size: p.size,
        })
        .collect();
    let page = xml::PartsPage {
        bucket: &req.bucket,
        key: &req.key,
        upload_id,
        storage_class: &upload.storage_class,
        owner_id: &upload.owner_id,
        owner_display: &upload.owner_display,
        part_number_marker: marker,
        next_part_number_marker: result.next_part_number_marker,
        max_parts,
        is_truncated: result.is_truncated,
    };
    Ok(xml_response(
        StatusCode::OK,
        xml::render_list_parts_result(&page, &parts),
    ))
}
