//! Bucket-level S3 API handlers.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use super::{
    collect_body, decode_continuation_token, encode_continuation_token, encode_if,
    encoding_type, force_delete_requested, header_str, query_u32, set_header, verify_content_md5,
    xml_response, S3Request, MAX_DOCUMENT_SIZE,
};
use crate::cors::{parse_request_headers, CorsMatch};
use crate::errors::S3Error;
use crate::metadata::store::{ListObjectsQuery, VersioningStatus};
use crate::xml;
use crate::AppState;

/// Largest page S3 returns for ListObjects.
const MAX_KEYS: u32 = 1000;

/// `GET /` -- ListBuckets.
pub async fn list_buckets(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let buckets = state.gateway.list_buckets(&req.identity).await?;
    let entries: Vec<(&str, &str)> = buckets
        .iter()
        .map(|b| (b.name.as_str(), b.created_at.as_str()))
        .collect();
    let body = xml::render_list_buckets_result(
        &req.identity.owner_id,
        &req.identity.display_name,
        &entries,
    );
    Ok(xml_response(StatusCode::OK, body))
}

/// `PUT /{bucket}` -- CreateBucket, with an optional
/// `CreateBucketConfiguration` body.
pub async fn create_bucket(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let body = collect_body(req.body, MAX_DOCUMENT_SIZE).await?;
    let location = if body.is_empty() {
        None
    } else {
        xml::parse_location_constraint(&body)?
    };
    let acl = header_str(&req.headers, "x-amz-acl");
    state
        .gateway
        .create_bucket(&req.identity, &req.bucket, location.as_deref(), acl)
        .await?;

    let mut response = StatusCode::OK.into_response();
    set_header(response.headers_mut(), "location", &format!("/{}", req.bucket));
    Ok(response)
}

/// `DELETE /{bucket}` -- DeleteBucket.
pub async fn delete_bucket(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let force = force_delete_requested(&req.headers);
    state
        .gateway
        .delete_bucket(&req.identity, &req.bucket, force)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `HEAD /{bucket}` -- HeadBucket.
pub async fn head_bucket(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let bucket = state.gateway.head_bucket(&req.identity, &req.bucket).await?;
    let mut response = StatusCode::OK.into_response();
    set_header(response.headers_mut(), "x-amz-bucket-region", &bucket.region);
    Ok(response)
}

/// `GET /{bucket}?location`
pub async fn get_bucket_location(
    state: Arc<AppState>,
    req: S3Request,
) -> Result<Response, S3Error> {
    let region = state
        .gateway
        .bucket_location(&req.identity, &req.bucket)
        .await?;
    Ok(xml_response(
        StatusCode::OK,
        xml::render_location_constraint(&region),
    ))
}

/// `GET /{bucket}?versioning`
pub async fn get_bucket_versioning(
    state: Arc<AppState>,
    req: S3Request,
) -> Result<Response, S3Error> {
    let status = state
        .gateway
        .bucket_versioning(&req.identity, &req.bucket)
        .await?;
    let status = match status {
        VersioningStatus::Unversioned => None,
        other => Some(other.as_str()),
    };
    Ok(xml_response(
        StatusCode::OK,
        xml::render_versioning_configuration(status),
    ))
}

/// `PUT /{bucket}?versioning`
pub async fn put_bucket_versioning(
    state: Arc<AppState>,
    req: S3Request,
) -> Result<Response, S3Error> {
    let body = collect_body(req.body, MAX_DOCUMENT_SIZE).await?;
    let status = xml::parse_versioning_configuration(&body)?;
    let status = VersioningStatus::parse(&status)
        .filter(|s| *s != VersioningStatus::Unversioned)
        .ok_or(S3Error::MalformedXML)?;
    state
        .gateway
        .set_bucket_versioning(&req.identity, &req.bucket, status)
        .await?;
    Ok(StatusCode::OK.into_response())
}

/// `GET /{bucket}?policy` -- the stored policy document as JSON.
pub async fn get_bucket_policy(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let policy = state
        .gateway
        .bucket_policy(&req.identity, &req.bucket)
        .await?;
    Ok((
        StatusCode::OK,
        [("content-type", "application/json")],
        policy,
    )
        .into_response())
}

/// `PUT /{bucket}?policy`
pub async fn put_bucket_policy(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let body = collect_body(req.body, MAX_DOCUMENT_SIZE).await?;
    let document = std::str::from_utf8(&body).map_err(|_| S3Error::MalformedPolicy {
        message: "Policies must be valid UTF-8 JSON".to_string(),
    })?;
    state
        .gateway
        .set_bucket_policy(&req.identity, &req.bucket, document)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `DELETE /{bucket}?policy`
pub async fn delete_bucket_policy(
    state: Arc<AppState>,
    req: S3Request,
) -> Result<Response, S3Error> {
    state
        .gateway
        .delete_bucket_policy(&req.identity, &req.bucket)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /{bucket}?cors`
pub async fn get_bucket_cors(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let rules = state.gateway.bucket_cors(&req.identity, &req.bucket).await?;
    Ok(xml_response(
        StatusCode::OK,
        xml::render_cors_configuration(&rules),
    ))
}

/// `PUT /{bucket}?cors`
pub async fn put_bucket_cors(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let body = collect_body(req.body, MAX_DOCUMENT_SIZE).await?;
    verify_content_md5(&req.headers, &body)?;
    let rules = xml::parse_cors_configuration(&body)?;
    state
        .gateway
        .set_bucket_cors(&req.identity, &req.bucket, &rules)
        .await?;
    Ok(StatusCode::OK.into_response())
}

/// `DELETE /{bucket}?cors`
pub async fn delete_bucket_cors(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    state
        .gateway
        .delete_bucket_cors(&req.identity, &req.bucket)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `OPTIONS /{bucket}[/{key}]` -- CORS preflight, answered without
/// authentication from the bucket's stored rules.
pub async fn cors_preflight(
    state: Arc<AppState>,
    bucket: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let origin = header_str(headers, "origin");
    let method = header_str(headers, "access-control-request-method");
    let (Some(origin), Some(method)) = (origin, method) else {
        return Err(S3Error::InvalidArgument {
            message: "Insufficient information. Origin request header needed.".to_string(),
        });
    };
    if bucket.is_empty() {
        return Err(S3Error::CorsForbidden);
    }
    let requested = header_str(headers, "access-control-request-headers")
        .map(parse_request_headers)
        .unwrap_or_default();
    let matched: CorsMatch = state
        .gateway
        .cors_preflight(bucket, origin, method, &requested)
        .await?;

    let mut response = StatusCode::OK.into_response();
    matched.apply(response.headers_mut(), true);
    Ok(response)
}

/// `GET /{bucket}` -- ListObjects V1, or V2 with `list-type=2`.
pub async fn list_objects(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let v2 = match req.query("list-type") {
        None | Some("1") => false,
        Some("2") => true,
        Some(other) => {
            return Err(S3Error::InvalidArgument {
                message: format!("Invalid list-type: {other}"),
            })
        }
    };
    let encoding = encoding_type(&req.query)?;
    let prefix = req.query("prefix").unwrap_or_default();
    let delimiter = req.query("delimiter").unwrap_or_default();
    let max_keys = query_u32(&req.query, "max-keys", MAX_KEYS, MAX_KEYS)?;

    let continuation_token = req.query("continuation-token").filter(|_| v2);
    let start_after = req.query("start-after").filter(|_| v2);
    let marker = if v2 {
        match continuation_token {
            Some(token) => decode_continuation_token(token)?,
            None => start_after.unwrap_or_default().to_string(),
        }
    } else {
        req.query("marker").unwrap_or_default().to_string()
    };

    let query = ListObjectsQuery {
        prefix: prefix.to_string(),
        delimiter: delimiter.to_string(),
        marker,
        max_keys,
    };
    let (bucket, result) = state
        .gateway
        .list_objects(&req.identity, &req.bucket, &query)
        .await?;

    // V1 always names the owner; V2 only with fetch-owner=true.
    let with_owner = !v2 || req.query("fetch-owner") == Some("true");
    let owner = with_owner.then_some((bucket.owner_id.as_str(), bucket.owner_display.as_str()));

    let keys: Vec<String> = result
        .objects
        .iter()
        .map(|o| encode_if(encoding, &o.key))
        .collect();
    let entries: Vec<xml::ObjectEntry<'_>> = result
        .objects
        .iter()
        .zip(&keys)
        .map(|(o, key)| xml::ObjectEntry {
            key,
            last_modified: &o.last_modified,
            etag: &o.etag,
            size: o.size,
            storage_class: &o.storage_class,
            owner,
        })
        .collect();
    let common_prefixes: Vec<String> = result
        .common_prefixes
        .iter()
        .map(|p| encode_if(encoding, p))
        .collect();

    let prefix = encode_if(encoding, prefix);
    let delimiter = encode_if(encoding, delimiter);
    let page = xml::ListObjectsPage {
        bucket: &req.bucket,
        prefix: &prefix,
        delimiter: &delimiter,
        max_keys,
        is_truncated: result.is_truncated,
        encoding_type: encoding,
        objects: &entries,
        common_prefixes: &common_prefixes,
    };

    let body = if v2 {
        let next_token = result
            .next_marker
            .as_deref()
            .filter(|_| result.is_truncated)
            .map(encode_continuation_token);
        let start_after = start_after.map(|s| encode_if(encoding, s));
        xml::render_list_objects_result(
            &page,
            &xml::ListCursor::V2 {
                continuation_token,
                next_continuation_token: next_token.as_deref(),
                start_after: start_after.as_deref(),
            },
        )
    } else {
        let marker = encode_if(encoding, &query.marker);
        // NextMarker is only sent for delimited listings.
        let next_marker = result
            .next_marker
            .as_deref()
            .filter(|_| result.is_truncated && !query.delimiter.is_empty())
            .map(|m| encode_if(encoding, m));
        xml::render_list_objects_result(
            &page,
            &xml::ListCursor::V1 {
                marker: &marker,
                next_marker: next_marker.as_deref(),
            },
        )
    };
    Ok(xml_response(StatusCode::OK, body))
}

/// `POST /{bucket}?delete` -- DeleteObjects.
pub async fn delete_objects(state: Arc<AppState>, req: S3Request) -> Result<Response, S3Error> {
    let body = collect_body(req.body, MAX_DOCUMENT_SIZE).await?;
    verify_content_md5(&req.headers, &body)?;
    let request = xml::parse_delete(&body)?;
    let targets = request
        .objects
        .into_iter()
        .map(|t| (t.key, t.version_id))
        .collect();

    let entries = state
        .gateway
        .delete_objects(&req.identity, &req.bucket, targets)
        .await?;

    let mut deleted = Vec::new();
    let mut failures = Vec::new();
    for entry in &entries {
        match &entry.result {
            Ok(outcome) => deleted.push((entry, outcome)),
            Err(e) => failures.push((entry, e.code(), e.to_string())),
        }
    }
    let deleted: Vec<xml::DeletedEntry<'_>> = deleted
        .iter()
        .map(|(entry, outcome)| xml::DeletedEntry {
            key: &entry.key,
            version_id: if outcome.delete_marker {
                outcome.version_id.as_deref()
            } else {
                entry.version_id.as_deref()
            },
            delete_marker: outcome.delete_marker,
        })
        .collect();
    let errors: Vec<xml::DeleteErrorEntry<'_>> = failures
        .iter()
        .map(|(entry, code, message)| xml::DeleteErrorEntry {
            key: &entry.key,
            code,
            message,
        })
        .collect();

    Ok(xml_response(
        StatusCode::OK,
        xml::render_delete_result(&deleted, &errors, request.quiet),
    ))
}
