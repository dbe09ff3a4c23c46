//! REST/XML adapter.
//!
//! Each handler turns one S3 operation's headers, query and body into a
//! [`Gateway`](crate::service::Gateway) call and renders the result.
//! Request-boundary extraction (custom metadata, content digests,
//! conditional headers) lives here so it happens exactly once.

pub mod bucket;
pub mod multipart;
pub mod object;

use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::io;

use crate::auth::Identity;
use crate::errors::S3Error;
use crate::metadata::store::{CustomMetadata, ObjectRecord};
use crate::service::{ObjectAttributes, Preconditions, UploadBody};
use crate::storage::backend::{ByteStream, PayloadHashMismatch};

/// Prefix of user metadata headers.
pub const META_PREFIX: &str = "x-amz-meta-";

/// Header that turns `DELETE /{bucket}` into a recursive delete.
pub const FORCE_DELETE_HEADER: &str = "x-gateway-force-delete";

/// Upper bound for XML and JSON request documents.
pub const MAX_DOCUMENT_SIZE: usize = 2 * 1024 * 1024;

/// Decoded query parameters.
pub type Query = BTreeMap<String, String>;

/// One routed S3 request.
pub struct S3Request {
    pub identity: Identity,
    pub bucket: String,
    pub key: String,
    pub query: Query,
    pub headers: HeaderMap,
    pub body: Body,
}

impl S3Request {
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }
}

// ── Bodies ──────────────────────────────────────────────────────────

/// Recover the `io::Error` a body stream was built from.
fn body_error(err: axum::Error) -> io::Error {
    match err.into_inner().downcast::<io::Error>() {
        Ok(io_err) => *io_err,
        Err(other) => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Adapt a request body for the blob store.
pub fn body_stream(body: Body) -> ByteStream {
    Box::pin(body.into_data_stream().map_err(body_error))
}

/// Buffer a small request document.
pub async fn collect_body(body: Body, limit: usize) -> Result<Bytes, S3Error> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        let err = body_error(e);
        if PayloadHashMismatch::is_cause_of(&err) {
            S3Error::ContentSha256Mismatch
        } else {
            S3Error::IncompleteBody
        }
    })
}

/// Check a buffered document against `Content-MD5`, when one was sent.
pub fn verify_content_md5(headers: &HeaderMap, body: &[u8]) -> Result<(), S3Error> {
    if let Some(expected) = content_md5(headers)? {
        if Md5::digest(body)[..] != expected[..] {
            return Err(S3Error::BadDigest);
        }
    }
    Ok(())
}

// ── Headers ─────────────────────────────────────────────────────────

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CONTENT_LENGTH.as_str()).and_then(|v| v.trim().parse().ok())
}

/// Decode `Content-MD5` (base64 of the 16-byte digest).
pub fn content_md5(headers: &HeaderMap) -> Result<Option<[u8; 16]>, S3Error> {
    let Some(value) = header_str(headers, "content-md5") else {
        return Ok(None);
    };
    let decoded = BASE64
        .decode(value.trim())
        .map_err(|_| S3Error::InvalidDigest)?;
    let digest: [u8; 16] = decoded.try_into().map_err(|_| S3Error::InvalidDigest)?;
    Ok(Some(digest))
}

/// Collect `x-amz-meta-*` headers with the prefix stripped.
pub fn custom_metadata(headers: &HeaderMap) -> CustomMetadata {
    let mut metadata = CustomMetadata::new();
    for (name, value) in headers {
        if let Some(suffix) = name.as_str().strip_prefix(META_PREFIX) {
            if let Ok(value) = value.to_str() {
                metadata.insert(suffix, value);
            }
        }
    }
    metadata
}

/// Content headers and custom metadata for a new object.
pub fn object_attributes(headers: &HeaderMap) -> ObjectAttributes {
    let owned = |name: &str| header_str(headers, name).map(str::to_string);
    ObjectAttributes {
        content_type: owned("content-type"),
        content_encoding: owned("content-encoding"),
        content_disposition: owned("content-disposition"),
        cache_control: owned("cache-control"),
        storage_class: owned("x-amz-storage-class"),
        metadata: custom_metadata(headers),
    }
}

/// Wrap a request body together with its declared length and digest.
pub fn upload_body(headers: &HeaderMap, body: Body) -> Result<UploadBody, S3Error> {
    Ok(UploadBody {
        content_md5: content_md5(headers)?,
        content_length: content_length(headers),
        stream: body_stream(body),
    })
}

fn http_date_header(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    header_str(headers, name)
        .and_then(|v| httpdate::parse_http_date(v).ok())
        .map(DateTime::<Utc>::from)
}

/// Conditional request headers.  Unparseable dates are ignored.
pub fn preconditions(headers: &HeaderMap) -> Preconditions {
    Preconditions {
        if_match: header_str(headers, "if-match").map(str::to_string),
        if_none_match: header_str(headers, "if-none-match").map(str::to_string),
        if_modified_since: http_date_header(headers, "if-modified-since"),
        if_unmodified_since: http_date_header(headers, "if-unmodified-since"),
    }
}

pub fn force_delete_requested(headers: &HeaderMap) -> bool {
    header_str(headers, FORCE_DELETE_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// ISO-8601 to RFC 7231 (`Last-Modified`).
pub fn http_date(iso: &str) -> String {
    DateTime::parse_from_rfc3339(iso)
        .map(|t| {
            t.with_timezone(&Utc)
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string()
        })
        .unwrap_or_else(|_| iso.to_string())
}

/// Insert a header, skipping values that are not valid header text.
pub fn set_header(headers: &mut HeaderMap, name: impl AsRef<str>, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_ref().as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

/// Headers describing a stored object on GET and HEAD.
pub fn object_headers(headers: &mut HeaderMap, record: &ObjectRecord) {
    set_header(headers, "content-type", &record.content_type);
    set_header(headers, "etag", &record.etag);
    set_header(headers, "last-modified", &http_date(&record.last_modified));
    set_header(headers, "accept-ranges", "bytes");
    set_header(headers, "x-amz-storage-class", &record.storage_class);
    for (name, value) in [
        ("content-encoding", &record.content_encoding),
        ("content-disposition", &record.content_disposition),
        ("cache-control", &record.cache_control),
        ("x-amz-version-id", &record.version_id),
    ] {
        if let Some(value) = value {
            set_header(headers, name, value);
        }
    }
    for (name, value) in record.metadata.iter() {
        set_header(headers, format!("{META_PREFIX}{name}"), value);
    }
}

pub fn xml_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

// ── Query helpers ───────────────────────────────────────────────────

/// Parse an optional integer query parameter, clamped to `max`.
pub fn query_u32(query: &Query, name: &str, default: u32, max: u32) -> Result<u32, S3Error> {
    match query.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .map(|n| n.min(i64::from(max)) as u32)
            .ok_or_else(|| S3Error::InvalidArgument {
                message: format!("Provided {name} not an integer or within integer range"),
            }),
    }
}

/// `encoding-type` must be absent or `url`.
pub fn encoding_type(query: &Query) -> Result<Option<&str>, S3Error> {
    match query.get("encoding-type").map(String::as_str) {
        None => Ok(None),
        Some("url") => Ok(Some("url")),
        Some(other) => Err(S3Error::InvalidArgument {
            message: format!("Invalid Encoding Method specified in Request: {other}"),
        }),
    }
}

/// URL-encode a key for `encoding-type=url` responses.
pub fn encode_if(encoding: Option<&str>, value: &str) -> String {
    match encoding {
        Some(_) => crate::auth::s3_uri_encode(value, false),
        None => value.to_string(),
    }
}

/// Opaque ListObjectsV2 continuation token.
pub fn encode_continuation_token(key: &str) -> String {
    BASE64.encode(key.as_bytes())
}

pub fn decode_continuation_token(token: &str) -> Result<String, S3Error> {
    BASE64
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| S3Error::InvalidArgument {
            message: "The continuation token provided is incorrect".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_custom_metadata_strips_prefix() {
        let h = headers(&[
            ("x-amz-meta-color", "blue"),
            ("x-amz-meta-Owner", "ann"),
            ("x-amz-date", "20260101T000000Z"),
        ]);
        let meta = custom_metadata(&h);
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.get("color"), Some("blue"));
        assert_eq!(meta.get("owner"), Some("ann"));
    }

    #[test]
    fn test_content_md5_decoding() {
        // md5("hello") = 5d41402abc4b2a76b9719d911017c592
        let h = headers(&[("content-md5", "XUFAKrxLKna5cZ2REBfFkg==")]);
        let digest = content_md5(&h).unwrap().unwrap();
        assert_eq!(hex::encode(digest), "5d41402abc4b2a76b9719d911017c592");
        assert!(verify_content_md5(&h, b"hello").is_ok());
        assert!(matches!(verify_content_md5(&h, b"world"), Err(S3Error::BadDigest)));

        let bad = headers(&[("content-md5", "not-base64!")]);
        assert!(matches!(content_md5(&bad), Err(S3Error::InvalidDigest)));
        let short = headers(&[("content-md5", "AAAA")]);
        assert!(matches!(content_md5(&short), Err(S3Error::InvalidDigest)));
    }

    #[test]
    fn test_http_date_conversion() {
        assert_eq!(
            http_date("2026-03-05T07:08:09.000Z"),
            "Thu, 05 Mar 2026 07:08:09 GMT"
        );
        let h = headers(&[("if-modified-since", "Thu, 05 Mar 2026 07:08:09 GMT")]);
        let pre = preconditions(&h);
        assert_eq!(pre.if_modified_since.unwrap().timestamp(), 1_772_694_489);
    }

    #[test]
    fn test_query_u32_bounds() {
        let mut q = Query::new();
        assert_eq!(query_u32(&q, "max-keys", 1000, 1000).unwrap(), 1000);
        q.insert("max-keys".into(), "5000".into());
        assert_eq!(query_u32(&q, "max-keys", 1000, 1000).unwrap(), 1000);
        q.insert("max-keys".into(), "-1".into());
        assert!(query_u32(&q, "max-keys", 1000, 1000).is_err());
    }

    #[test]
    fn test_continuation_token_roundtrip() {
        let token = encode_continuation_token("photos/2026/a b.jpg");
        assert_eq!(decode_continuation_token(&token).unwrap(), "photos/2026/a b.jpg");
        assert!(decode_continuation_token("%%%").is_err());
    }

    #[test]
    fn test_force_delete_header() {
        assert!(force_delete_requested(&headers(&[(FORCE_DELETE_HEADER, "TRUE")])));
        assert!(!force_delete_requested(&headers(&[(FORCE_DELETE_HEADER, "no")])));
        assert!(!force_delete_requested(&HeaderMap::new()));
    }
}
