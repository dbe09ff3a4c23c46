//! S3-compatible error types.
//!
//! Every variant maps to a well-known S3 error code.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(S3Error::NoSuchBucket { .. })`.  Repository and blob-store
//! failures are folded in through the `From` impls at the bottom.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::metadata::store::MetadataError;
use crate::storage::backend::BlobError;
use crate::xml::render_error;

/// Server header value attached to every response.
pub const SERVER_NAME: &str = "S3Gateway";

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// S3 error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum S3Error {
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    #[error("The specified key does not exist.")]
    NoSuchKey { key: String },

    #[error("The specified version does not exist.")]
    NoSuchVersion { key: String, version_id: String },

    #[error("The specified upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed.")]
    NoSuchUpload { upload_id: String },

    #[error("The bucket policy does not exist")]
    NoSuchBucketPolicy { bucket: String },

    #[error("The CORS configuration does not exist")]
    NoSuchCORSConfiguration { bucket: String },

    #[error("The requested bucket name is not available. The bucket namespace is shared by all users of the system. Please select a different name and try again.")]
    BucketAlreadyExists { bucket: String },

    #[error("Your previous request to create the named bucket succeeded and you already own it.")]
    BucketAlreadyOwnedByYou { bucket: String },

    #[error("The bucket you tried to delete is not empty")]
    BucketNotEmpty { bucket: String },

    #[error("Access Denied")]
    AccessDenied { resource: String },

    #[error("{message}")]
    InvalidArgument { message: String },

    #[error("The AWS Access Key Id you provided does not exist in our records.")]
    InvalidAccessKeyId,

    #[error("The request signature we calculated does not match the signature you provided. Check your key and signing method.")]
    SignatureDoesNotMatch,

    #[error("The difference between the request time and the current time is too large.")]
    RequestTimeTooSkewed,

    #[error("The provided 'x-amz-content-sha256' header does not match what was computed.")]
    ContentSha256Mismatch,

    #[error("The specified bucket is not valid.")]
    InvalidBucketName { name: String },

    #[error("At least one of the pre-conditions you specified did not hold")]
    PreconditionFailed,

    #[error("Your proposed upload exceeds the maximum allowed object size.")]
    EntityTooLarge,

    #[error("Your proposed upload is smaller than the minimum allowed object size.")]
    EntityTooSmall,

    #[error("Your key is too long")]
    KeyTooLongError,

    #[error("Your metadata headers exceed the maximum allowed metadata size.")]
    MetadataTooLarge,

    #[error("The storage quota for this account has been exceeded.")]
    QuotaExceeded,

    #[error("The Content-MD5 you specified did not match what we received.")]
    BadDigest,

    #[error("The Content-MD5 you specified is not valid.")]
    InvalidDigest,

    #[error("You did not provide the number of bytes specified by the Content-Length HTTP header.")]
    IncompleteBody,

    #[error("{message}")]
    InvalidPart { message: String },

    #[error("The list of parts was not in ascending order. Parts must be ordered by part number.")]
    InvalidPartOrder,

    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedXML,

    #[error("{message}")]
    MalformedPolicy { message: String },

    #[error("CORSResponse: This CORS request is not allowed.")]
    CorsForbidden,

    #[error("A header you provided implies functionality that is not implemented")]
    NotImplemented,

    #[error("The specified method is not allowed against this resource.")]
    MethodNotAllowed,

    #[error("You must provide the Content-Length HTTP header.")]
    MissingContentLength,

    #[error("Your socket connection to the server was not read from or written to within the timeout period.")]
    RequestTimeout,

    #[error("The requested range is not satisfiable")]
    InvalidRange,

    #[error("Not Modified")]
    NotModified,

    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket { .. } => "NoSuchBucket",
            S3Error::NoSuchKey { .. } => "NoSuchKey",
            S3Error::NoSuchVersion { .. } => "NoSuchVersion",
            S3Error::NoSuchUpload { .. } => "NoSuchUpload",
            S3Error::NoSuchBucketPolicy { .. } => "NoSuchBucketPolicy",
            S3Error::NoSuchCORSConfiguration { .. } => "NoSuchCORSConfiguration",
            S3Error::BucketAlreadyExists { .. } => "BucketAlreadyExists",
            S3Error::BucketAlreadyOwnedByYou { .. } => "BucketAlreadyOwnedByYou",
            S3Error::BucketNotEmpty { .. } => "BucketNotEmpty",
            S3Error::AccessDenied { .. } => "AccessDenied",
            S3Error::InvalidArgument { .. } => "InvalidArgument",
            S3Error::InvalidAccessKeyId => "InvalidAccessKeyId",
            S3Error::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            S3Error::RequestTimeTooSkewed => "RequestTimeTooSkewed",
            S3Error::ContentSha256Mismatch => "XAmzContentSHA256Mismatch",
            S3Error::InvalidBucketName { .. } => "InvalidBucketName",
            S3Error::PreconditionFailed => "PreconditionFailed",
            S3Error::EntityTooLarge => "EntityTooLarge",
            S3Error::EntityTooSmall => "EntityTooSmall",
            S3Error::KeyTooLongError => "KeyTooLongError",
            S3Error::MetadataTooLarge => "MetadataTooLarge",
            S3Error::QuotaExceeded => "QuotaExceeded",
            S3Error::BadDigest => "BadDigest",
            S3Error::InvalidDigest => "InvalidDigest",
            S3Error::IncompleteBody => "IncompleteBody",
            S3Error::InvalidPart { .. } => "InvalidPart",
            S3Error::InvalidPartOrder => "InvalidPartOrder",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::MalformedPolicy { .. } => "MalformedPolicy",
            S3Error::CorsForbidden => "AccessForbidden",
            S3Error::NotImplemented => "NotImplemented",
            S3Error::MethodNotAllowed => "MethodNotAllowed",
            S3Error::MissingContentLength => "MissingContentLength",
            S3Error::RequestTimeout => "RequestTimeout",
            S3Error::InvalidRange => "InvalidRange",
            S3Error::NotModified => "NotModified",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchBucket { .. }
            | S3Error::NoSuchKey { .. }
            | S3Error::NoSuchVersion { .. }
            | S3Error::NoSuchUpload { .. }
            | S3Error::NoSuchBucketPolicy { .. }
            | S3Error::NoSuchCORSConfiguration { .. } => StatusCode::NOT_FOUND,
            S3Error::BucketAlreadyExists { .. }
            | S3Error::BucketAlreadyOwnedByYou { .. }
            | S3Error::BucketNotEmpty { .. } => StatusCode::CONFLICT,
            S3Error::AccessDenied { .. }
            | S3Error::InvalidAccessKeyId
            | S3Error::SignatureDoesNotMatch
            | S3Error::RequestTimeTooSkewed
            | S3Error::CorsForbidden => StatusCode::FORBIDDEN,
            S3Error::InvalidArgument { .. }
            | S3Error::ContentSha256Mismatch
            | S3Error::InvalidBucketName { .. }
            | S3Error::EntityTooLarge
            | S3Error::EntityTooSmall
            | S3Error::KeyTooLongError
            | S3Error::MetadataTooLarge
            | S3Error::QuotaExceeded
            | S3Error::BadDigest
            | S3Error::InvalidDigest
            | S3Error::IncompleteBody
            | S3Error::InvalidPart { .. }
            | S3Error::InvalidPartOrder
            | S3Error::MalformedXML
            | S3Error::MalformedPolicy { .. }
            | S3Error::RequestTimeout => StatusCode::BAD_REQUEST,
            S3Error::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            S3Error::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            S3Error::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            S3Error::MissingContentLength => StatusCode::LENGTH_REQUIRED,
            S3Error::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            S3Error::NotModified => StatusCode::NOT_MODIFIED,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The `<Resource>` value for the error document, when one is known.
    pub fn resource(&self) -> String {
        match self {
            S3Error::NoSuchBucket { bucket }
            | S3Error::NoSuchBucketPolicy { bucket }
            | S3Error::NoSuchCORSConfiguration { bucket }
            | S3Error::BucketAlreadyExists { bucket }
            | S3Error::BucketAlreadyOwnedByYou { bucket }
            | S3Error::BucketNotEmpty { bucket } => format!("/{bucket}"),
            S3Error::InvalidBucketName { name } => format!("/{name}"),
            S3Error::NoSuchKey { key } | S3Error::NoSuchVersion { key, .. } => key.clone(),
            S3Error::NoSuchUpload { upload_id } => upload_id.clone(),
            S3Error::AccessDenied { resource } => resource.clone(),
            _ => String::new(),
        }
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        if let S3Error::InternalError(ref err) = self {
            error!(request_id = %request_id, "internal error: {err:#}");
        }

        // 304 Not Modified responses must not have a body.
        if matches!(self, S3Error::NotModified) {
            return (
                status,
                [
                    ("x-amz-request-id", request_id),
                    ("date", date),
                    ("server", SERVER_NAME.to_string()),
                ],
            )
                .into_response();
        }

        let body = render_error(self.code(), &self.to_string(), &self.resource(), &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
                ("date", date),
                ("server", SERVER_NAME.to_string()),
            ],
            body,
        )
            .into_response()
    }
}

impl From<MetadataError> for S3Error {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::BucketNotFound(bucket) => S3Error::NoSuchBucket { bucket },
            MetadataError::BucketExists { bucket, .. } => S3Error::BucketAlreadyExists { bucket },
            MetadataError::BucketNotEmpty(bucket) => S3Error::BucketNotEmpty { bucket },
            MetadataError::ObjectNotFound(key) => S3Error::NoSuchKey { key },
            MetadataError::VersionNotFound { key, version_id } => {
                S3Error::NoSuchVersion { key, version_id }
            }
            MetadataError::UploadNotFound(upload_id) | MetadataError::UploadClosed(upload_id) => {
                S3Error::NoSuchUpload { upload_id }
            }
            MetadataError::PartMismatch { part_number } => S3Error::InvalidPart {
                message: format!(
                    "One or more of the specified parts could not be found. Part {part_number} is missing or its ETag does not match."
                ),
            },
            MetadataError::QuotaExceeded { .. } => S3Error::QuotaExceeded,
            MetadataError::Sqlite(e) => S3Error::InternalError(e.into()),
            MetadataError::Other(e) => S3Error::InternalError(e),
        }
    }
}

impl From<BlobError> for S3Error {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::DigestMismatch => S3Error::BadDigest,
            BlobError::PayloadHashMismatch => S3Error::ContentSha256Mismatch,
            BlobError::SizeMismatch { .. } => S3Error::IncompleteBody,
            BlobError::TooLarge { .. } => S3Error::EntityTooLarge,
            BlobError::InvalidPath(path) => {
                error!(path = %path, "blob path rejected by the store");
                S3Error::InvalidArgument {
                    message: "Object key cannot be stored".to_string(),
                }
            }
            BlobError::NotFound(path) => {
                S3Error::InternalError(anyhow::anyhow!("blob missing for current object: {path}"))
            }
            BlobError::Io(e) => S3Error::InternalError(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_codes_share_status() {
        let exists = S3Error::BucketAlreadyExists { bucket: "b".into() };
        let owned = S3Error::BucketAlreadyOwnedByYou { bucket: "b".into() };
        assert_eq!(exists.status_code(), StatusCode::CONFLICT);
        assert_eq!(owned.status_code(), StatusCode::CONFLICT);
        assert_eq!(exists.code(), "BucketAlreadyExists");
        assert_eq!(owned.code(), "BucketAlreadyOwnedByYou");
    }

    #[test]
    fn test_auth_errors_are_forbidden() {
        assert_eq!(S3Error::SignatureDoesNotMatch.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(S3Error::RequestTimeTooSkewed.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(S3Error::InvalidAccessKeyId.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_missing_content_length_is_411() {
        assert_eq!(
            S3Error::MissingContentLength.status_code(),
            StatusCode::LENGTH_REQUIRED
        );
    }

    #[test]
    fn test_metadata_error_mapping() {
        let err: S3Error = MetadataError::QuotaExceeded {
            owner_id: "u".into(),
            requested: 10,
        }
        .into();
        assert_eq!(err.code(), "QuotaExceeded");

        let err: S3Error = MetadataError::PartMismatch { part_number: 3 }.into();
        assert_eq!(err.code(), "InvalidPart");
        assert!(err.to_string().contains("Part 3"));

        let err: S3Error = MetadataError::UploadClosed("abc".into()).into();
        assert_eq!(err.code(), "NoSuchUpload");
        assert_eq!(err.resource(), "abc");
    }

    #[test]
    fn test_blob_error_mapping() {
        assert_eq!(S3Error::from(BlobError::DigestMismatch).code(), "BadDigest");
        assert_eq!(
            S3Error::from(BlobError::PayloadHashMismatch).code(),
            "XAmzContentSHA256Mismatch"
        );
        assert_eq!(
            S3Error::from(BlobError::SizeMismatch {
                expected: 10,
                actual: 4
            })
            .code(),
            "IncompleteBody"
        );
    }

    #[tokio::test]
    async fn test_error_response_is_xml() {
        let response = S3Error::NoSuchBucket {
            bucket: "missing".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/xml"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("<Code>NoSuchBucket</Code>"));
        assert!(text.contains("<Resource>/missing</Resource>"));
    }
}
