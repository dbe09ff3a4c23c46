//! Business operations shared by the REST/XML and RPC/JSON adapters.
//!
//! [`Gateway`] owns the metadata repository and blob store handles.  Every
//! public operation takes the caller's [`Identity`], resolves the bucket,
//! runs the authorization check for the S3 action it performs and only
//! then touches storage.  Adapters translate wire formats and nothing else.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::Identity;
use crate::config::Config;
use crate::cors::{self, CorsMatch, CorsRule};
use crate::errors::S3Error;
use crate::metadata::store::{
    BucketRecord, CustomMetadata, DeleteOutcome, ListObjectsQuery, ListObjectsResult,
    ListPartsResult, ListUploadsQuery, ListUploadsResult, MetadataError, MetadataStore,
    MultipartUploadRecord, ObjectRecord, PartRecord, PutObjectOutcome, UserRecord,
    VersioningStatus,
};
use crate::metadata::{new_version_id, timestamp_now};
use crate::multipart::{CompletedUpload, MultipartAssembler};
use crate::policy::{is_permitted, resource_arn, BucketPolicy};
use crate::storage::backend::{
    BlobError, ByteRange, ByteStream, StorageBackend, StoredBlob, WriteLimits,
};
use crate::storage::{new_write_id, object_blob_path, version_blob_path};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Maximum combined size of `x-amz-meta-*` names and values.
pub const MAX_METADATA_SIZE: usize = 2048;

/// Maximum number of keys in one batch delete.
pub const MAX_DELETE_KEYS: usize = 1000;

const STORAGE_CLASSES: &[&str] = &[
    "STANDARD",
    "REDUCED_REDUNDANCY",
    "STANDARD_IA",
    "ONEZONE_IA",
    "INTELLIGENT_TIERING",
    "GLACIER",
    "GLACIER_IR",
    "DEEP_ARCHIVE",
];

const CANNED_ACLS: &[&str] = &[
    "private",
    "public-read",
    "public-read-write",
    "authenticated-read",
    "aws-exec-read",
    "bucket-owner-read",
    "bucket-owner-full-control",
    "log-delivery-write",
];

// ── Actions ─────────────────────────────────────────────────────────

/// S3 actions checked against bucket ownership and policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ListBucket,
    DeleteBucket,
    GetBucketLocation,
    GetBucketVersioning,
    PutBucketVersioning,
    GetBucketPolicy,
    PutBucketPolicy,
    DeleteBucketPolicy,
    GetBucketCors,
    PutBucketCors,
    ListBucketMultipartUploads,
    GetObject,
    PutObject,
    DeleteObject,
    AbortMultipartUpload,
    ListMultipartUploadParts,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ListBucket => "s3:ListBucket",
            Action::DeleteBucket => "s3:DeleteBucket",
            Action::GetBucketLocation => "s3:GetBucketLocation",
            Action::GetBucketVersioning => "s3:GetBucketVersioning",
            Action::PutBucketVersioning => "s3:PutBucketVersioning",
            Action::GetBucketPolicy => "s3:GetBucketPolicy",
            Action::PutBucketPolicy => "s3:PutBucketPolicy",
            Action::DeleteBucketPolicy => "s3:DeleteBucketPolicy",
            Action::GetBucketCors => "s3:GetBucketCORS",
            Action::PutBucketCors => "s3:PutBucketCORS",
            Action::ListBucketMultipartUploads => "s3:ListBucketMultipartUploads",
            Action::GetObject => "s3:GetObject",
            Action::PutObject => "s3:PutObject",
            Action::DeleteObject => "s3:DeleteObject",
            Action::AbortMultipartUpload => "s3:AbortMultipartUpload",
            Action::ListMultipartUploadParts => "s3:ListMultipartUploadParts",
        }
    }
}

// ── Inputs and outputs ──────────────────────────────────────────────

/// Content headers and user metadata attached to a new object.
#[derive(Debug, Clone, Default)]
pub struct ObjectAttributes {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    pub storage_class: Option<String>,
    pub metadata: CustomMetadata,
}

impl ObjectAttributes {
    /// Check storage class and metadata size.
    pub fn validate(&self) -> Result<(), S3Error> {
        if self.metadata.encoded_size() > MAX_METADATA_SIZE {
            return Err(S3Error::MetadataTooLarge);
        }
        self.resolved_storage_class().map(|_| ())
    }

    pub fn resolved_storage_class(&self) -> Result<String, S3Error> {
        match self.storage_class.as_deref() {
            None | Some("") => Ok("STANDARD".to_string()),
            Some(class) if STORAGE_CLASSES.contains(&class) => Ok(class.to_string()),
            Some(class) => Err(S3Error::InvalidArgument {
                message: format!("Invalid storage class: {class}"),
            }),
        }
    }

    pub fn resolved_content_type(&self) -> String {
        self.content_type
            .clone()
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }

    /// Attributes carried over from an existing object by a `COPY` directive.
    pub fn from_record(record: &ObjectRecord) -> Self {
        Self {
            content_type: Some(record.content_type.clone()),
            content_encoding: record.content_encoding.clone(),
            content_disposition: record.content_disposition.clone(),
            cache_control: record.cache_control.clone(),
            storage_class: Some(record.storage_class.clone()),
            metadata: record.metadata.clone(),
        }
    }

    pub fn from_upload(upload: &MultipartUploadRecord) -> Self {
        Self {
            content_type: Some(upload.content_type.clone()),
            content_encoding: upload.content_encoding.clone(),
            content_disposition: upload.content_disposition.clone(),
            cache_control: upload.cache_control.clone(),
            storage_class: Some(upload.storage_class.clone()),
            metadata: upload.metadata.clone(),
        }
    }

    /// Build the repository record for a blob that has been written.
    pub(crate) fn into_record(
        self,
        placement: Placement,
        bucket: &BucketRecord,
        key: &str,
        blob: &StoredBlob,
        etag: String,
    ) -> Result<ObjectRecord, S3Error> {
        let storage_class = self.resolved_storage_class()?;
        let content_type = self.resolved_content_type();
        Ok(ObjectRecord {
            bucket_id: bucket.id.clone(),
            key: key.to_string(),
            version_id: placement.version_id,
            size: blob.size,
            etag,
            md5: blob.md5_hex(),
            content_type,
            content_encoding: self.content_encoding,
            content_disposition: self.content_disposition,
            cache_control: self.cache_control,
            storage_class,
            metadata: self.metadata,
            last_modified: timestamp_now(),
            is_latest: true,
            is_deleted: false,
            blob_path: placement.blob_path,
        })
    }
}

/// A body to be stored, with the integrity checks the client asked for.
pub struct UploadBody {
    pub stream: ByteStream,
    pub content_length: Option<u64>,
    /// Decoded `Content-MD5`.
    pub content_md5: Option<[u8; 16]>,
}

/// Result of writing an object.
#[derive(Debug, Clone)]
pub struct PutObjectOutput {
    pub etag: String,
    pub version_id: Option<String>,
    pub last_modified: String,
}

/// A `Range` request before the object size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// `bytes=first-last`
    Bounded { first: u64, last: u64 },
    /// `bytes=first-`
    From(u64),
    /// `bytes=-n`
    Suffix(u64),
}

impl RangeRequest {
    /// Parse a single-range `bytes=` header.  Multi-range and malformed
    /// values yield `None` and are served as a full response.
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }
        let (first, last) = spec.split_once('-')?;
        match (first.trim(), last.trim()) {
            ("", n) => n.parse().ok().map(RangeRequest::Suffix),
            (f, "") => f.parse().ok().map(RangeRequest::From),
            (f, l) => {
                let first: u64 = f.parse().ok()?;
                let last: u64 = l.parse().ok()?;
                (first <= last).then_some(RangeRequest::Bounded { first, last })
            }
        }
    }

    /// Clamp to an object of `size` bytes.
    pub fn resolve(&self, size: u64) -> Result<ByteRange, S3Error> {
        if size == 0 {
            return Err(S3Error::InvalidRange);
        }
        match *self {
            RangeRequest::Bounded { first, last } if first < size => Ok(ByteRange {
                first,
                last: last.min(size - 1),
            }),
            RangeRequest::From(first) if first < size => Ok(ByteRange {
                first,
                last: size - 1,
            }),
            RangeRequest::Suffix(n) if n > 0 => Ok(ByteRange {
                first: size.saturating_sub(n),
                last: size - 1,
            }),
            _ => Err(S3Error::InvalidRange),
        }
    }
}

/// Conditional request headers for GET and HEAD.
#[derive(Debug, Clone, Default)]
pub struct Preconditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

impl Preconditions {
    /// Evaluate in RFC 7232 order: `If-Match`, `If-Unmodified-Since`,
    /// `If-None-Match`, `If-Modified-Since`.
    pub fn evaluate(&self, record: &ObjectRecord) -> Result<(), S3Error> {
        let last_modified = DateTime::parse_from_rfc3339(&record.last_modified)
            .ok()
            .map(|t| t.timestamp());

        if let Some(if_match) = &self.if_match {
            if !etag_list_matches(if_match, &record.etag) {
                return Err(S3Error::PreconditionFailed);
            }
        } else if let (Some(since), Some(modified)) = (self.if_unmodified_since, last_modified) {
            if modified > since.timestamp() {
                return Err(S3Error::PreconditionFailed);
            }
        }

        if let Some(if_none_match) = &self.if_none_match {
            if etag_list_matches(if_none_match, &record.etag) {
                return Err(S3Error::NotModified);
            }
        } else if let (Some(since), Some(modified)) = (self.if_modified_since, last_modified) {
            if modified <= since.timestamp() {
                return Err(S3Error::NotModified);
            }
        }
        Ok(())
    }
}

/// Match a comma-separated ETag list (or `*`) against a stored ETag.
fn etag_list_matches(list: &str, etag: &str) -> bool {
    let stored = strip_quotes(etag);
    list.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || strip_quotes(candidate.trim_start_matches("W/")) == stored
    })
}

pub(crate) fn strip_quotes(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// A readable object and the part of it being returned.
pub struct GetObjectOutput {
    pub record: ObjectRecord,
    pub body: ByteStream,
    pub range: Option<ByteRange>,
}

/// Parsed `x-amz-copy-source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
}

impl CopySource {
    /// Parse `bucket/key` or `/bucket/key`, optionally with `?versionId=`.
    /// The value is percent-decoded.
    pub fn parse(value: &str) -> Result<Self, S3Error> {
        let invalid = || S3Error::InvalidArgument {
            message: "Copy Source must mention the source bucket and key: sourcebucket/sourcekey"
                .to_string(),
        };
        let (path, query) = match value.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (value, None),
        };
        let path = percent_encoding::percent_decode_str(path)
            .decode_utf8()
            .map_err(|_| invalid())?;
        let path = path.strip_prefix('/').unwrap_or(&path);
        let (bucket, key) = path.split_once('/').ok_or_else(invalid)?;
        if bucket.is_empty() || key.is_empty() {
            return Err(invalid());
        }
        let version_id = query
            .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("versionId=")))
            .map(str::to_string);
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            version_id,
        })
    }
}

/// `x-amz-metadata-directive`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataDirective {
    #[default]
    Copy,
    Replace,
}

impl MetadataDirective {
    pub fn parse(value: Option<&str>) -> Result<Self, S3Error> {
        match value {
            None => Ok(MetadataDirective::Copy),
            Some(v) if v.eq_ignore_ascii_case("COPY") => Ok(MetadataDirective::Copy),
            Some(v) if v.eq_ignore_ascii_case("REPLACE") => Ok(MetadataDirective::Replace),
            Some(v) => Err(S3Error::InvalidArgument {
                message: format!("Unknown metadata directive: {v}"),
            }),
        }
    }
}

/// Result of a server-side copy.
#[derive(Debug, Clone)]
pub struct CopyObjectOutput {
    pub etag: String,
    pub last_modified: String,
    pub version_id: Option<String>,
    pub source_version_id: Option<String>,
}

/// One target of a batch delete and what happened to it.
pub struct BatchDeleteEntry {
    pub key: String,
    pub version_id: Option<String>,
    pub result: Result<DeleteOutcome, S3Error>,
}

/// Where a new object body goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Placement {
    pub version_id: Option<String>,
    pub blob_path: String,
}

impl Placement {
    /// Versioned writes get a fresh id and their own blob.  Null-version
    /// writes land on a fresh path under the key's directories inside the
    /// bucket volume, so the live body is only replaced once the new row
    /// is committed.
    pub fn for_write(bucket: &BucketRecord, key: &str) -> Self {
        if bucket.versioning_enabled() {
            let version_id = new_version_id();
            Self {
                blob_path: version_blob_path(&bucket.volume_path, &version_id),
                version_id: Some(version_id),
            }
        } else {
            Self {
                version_id: None,
                blob_path: object_blob_path(&bucket.volume_path, key, &new_write_id()),
            }
        }
    }
}

// ── Validation helpers ──────────────────────────────────────────────

/// S3 bucket naming rules.
pub fn validate_bucket_name(name: &str) -> Result<(), S3Error> {
    let invalid = || S3Error::InvalidBucketName {
        name: name.to_string(),
    };
    if !(3..=63).contains(&name.len()) {
        return Err(invalid());
    }
    let allowed = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-');
    let edges_ok = [name.as_bytes()[0], name.as_bytes()[name.len() - 1]]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if !allowed || !edges_ok {
        return Err(invalid());
    }
    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return Err(invalid());
    }
    if name.parse::<std::net::Ipv4Addr>().is_ok() {
        return Err(invalid());
    }
    if name.starts_with("xn--") || name.ends_with("-s3alias") {
        return Err(invalid());
    }
    Ok(())
}

pub fn validate_key(key: &str) -> Result<(), S3Error> {
    if key.is_empty() {
        return Err(S3Error::InvalidArgument {
            message: "Object key must not be empty".to_string(),
        });
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(S3Error::KeyTooLongError);
    }
    Ok(())
}

fn validate_canned_acl(acl: &str) -> Result<String, S3Error> {
    if CANNED_ACLS.contains(&acl) {
        Ok(acl.to_string())
    } else {
        Err(S3Error::InvalidArgument {
            message: format!("Invalid canned ACL: {acl}"),
        })
    }
}

/// Reject a write that would push the owner over quota.
pub(crate) async fn ensure_quota(
    metadata: &dyn MetadataStore,
    owner_id: &str,
    incoming: u64,
) -> Result<(), S3Error> {
    let incoming = i64::try_from(incoming).unwrap_or(i64::MAX);
    if let Some(user) = metadata.get_user(owner_id).await? {
        if !user.has_room_for(incoming) {
            debug!(owner = owner_id, incoming, "quota exceeded");
            return Err(S3Error::QuotaExceeded);
        }
    }
    Ok(())
}

/// Remove a blob whose metadata commit failed.  Every write lands on a
/// fresh path, so no committed row can refer to it.
pub(crate) async fn discard_blob(storage: &dyn StorageBackend, blob_path: &str) {
    if let Err(e) = storage.delete(blob_path).await {
        warn!(path = blob_path, "failed to discard orphaned blob: {e}");
    }
}

/// Remove the body a committed overwrite replaced.
pub(crate) async fn release_replaced(storage: &dyn StorageBackend, outcome: &PutObjectOutcome) {
    if let Some(old) = outcome.replaced_blob.as_deref() {
        if let Err(e) = storage.delete(old).await {
            warn!(path = old, "failed to remove replaced blob: {e}");
        }
    }
}

// ── Settings ────────────────────────────────────────────────────────

/// Limits taken from configuration.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub region: String,
    pub max_object_size: u64,
    pub min_part_size: u64,
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            region: config.server.region.clone(),
            max_object_size: config.server.max_object_size,
            min_part_size: config.multipart.min_part_size,
        }
    }
}

// ── Gateway ─────────────────────────────────────────────────────────

/// The single service layer behind both adapters.
pub struct Gateway {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageBackend>,
    multipart: MultipartAssembler,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageBackend>,
        settings: GatewaySettings,
    ) -> Self {
        let multipart = MultipartAssembler::new(
            Arc::clone(&metadata),
            Arc::clone(&storage),
            settings.min_part_size,
            settings.max_object_size,
        );
        Self {
            metadata,
            storage,
            multipart,
            settings,
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn multipart(&self) -> &MultipartAssembler {
        &self.multipart
    }

    // ── Authorization ───────────────────────────────────────────────

    async fn bucket(&self, name: &str) -> Result<BucketRecord, S3Error> {
        self.metadata
            .get_bucket(name)
            .await?
            .ok_or_else(|| S3Error::NoSuchBucket {
                bucket: name.to_string(),
            })
    }

    /// Owner check, refined by the bucket policy when one is set.
    fn authorize(
        &self,
        identity: &Identity,
        bucket: &BucketRecord,
        action: Action,
        key: Option<&str>,
    ) -> Result<(), S3Error> {
        let policy = match bucket.policy.as_deref() {
            Some(json) => Some(serde_json::from_str::<BucketPolicy>(json).map_err(|e| {
                S3Error::InternalError(anyhow::anyhow!(
                    "stored policy for `{}` unreadable: {e}",
                    bucket.name
                ))
            })?),
            None => None,
        };
        let arn = resource_arn(&bucket.name, key);
        if is_permitted(
            &bucket.owner_id,
            policy.as_ref(),
            &identity.owner_id,
            action.as_str(),
            &arn,
        ) {
            return Ok(());
        }
        debug!(
            principal = %identity.owner_id,
            action = action.as_str(),
            resource = %arn,
            "access denied"
        );
        let resource = match key {
            Some(key) => format!("/{}/{key}", bucket.name),
            None => format!("/{}", bucket.name),
        };
        Err(S3Error::AccessDenied { resource })
    }

    async fn authorized_bucket(
        &self,
        identity: &Identity,
        name: &str,
        action: Action,
        key: Option<&str>,
    ) -> Result<BucketRecord, S3Error> {
        let bucket = self.bucket(name).await?;
        self.authorize(identity, &bucket, action, key)?;
        Ok(bucket)
    }

    // ── Buckets ─────────────────────────────────────────────────────

    pub async fn list_buckets(&self, identity: &Identity) -> Result<Vec<BucketRecord>, S3Error> {
        Ok(self.metadata.list_buckets(&identity.owner_id).await?)
    }

    /// Create a bucket owned by the caller.  `location` must match the
    /// gateway's region when given.
    pub async fn create_bucket(
        &self,
        identity: &Identity,
        name: &str,
        location: Option<&str>,
        acl: Option<&str>,
    ) -> Result<BucketRecord, S3Error> {
        validate_bucket_name(name)?;
        let acl = validate_canned_acl(acl.unwrap_or("private"))?;
        let region = match location.filter(|l| !l.is_empty()) {
            Some(l) if l != self.settings.region => {
                return Err(S3Error::InvalidArgument {
                    message: format!(
                        "The {l} location constraint is incompatible with the region {}",
                        self.settings.region
                    ),
                })
            }
            _ => self.settings.region.clone(),
        };

        self.metadata
            .ensure_user(&identity.owner_id, &identity.display_name)
            .await?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let record = BucketRecord {
            id: id.clone(),
            name: name.to_string(),
            owner_id: identity.owner_id.clone(),
            owner_display: identity.display_name.clone(),
            region,
            storage_class: "STANDARD".to_string(),
            acl,
            versioning: VersioningStatus::Unversioned,
            volume_path: id,
            object_count: 0,
            total_size: 0,
            policy: None,
            cors: None,
            created_at: timestamp_now(),
        };

        match self.metadata.create_bucket(record.clone()).await {
            Ok(()) => {}
            Err(MetadataError::BucketExists { bucket, owner_id })
                if owner_id == identity.owner_id =>
            {
                return Err(S3Error::BucketAlreadyOwnedByYou { bucket })
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.storage.create_volume(&record.volume_path).await {
            if let Err(undo) = self.metadata.delete_bucket(name, true).await {
                warn!(bucket = name, "failed to roll back bucket row: {undo}");
            }
            return Err(e.into());
        }

        info!(bucket = name, owner = %identity.owner_id, "bucket created");
        Ok(record)
    }

    /// Existence and access check.
    pub async fn head_bucket(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<BucketRecord, S3Error> {
        self.authorized_bucket(identity, name, Action::ListBucket, None)
            .await
    }

    /// Delete a bucket.  With `force`, all objects, versions and uploads go
    /// with it.
    pub async fn delete_bucket(
        &self,
        identity: &Identity,
        name: &str,
        force: bool,
    ) -> Result<(), S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::DeleteBucket, None)
            .await?;

        let pending_uploads = if force {
            self.multipart.in_progress_upload_ids(&bucket).await?
        } else {
            Vec::new()
        };

        let removed = self.metadata.delete_bucket(name, force).await?;

        for upload_id in &pending_uploads {
            if let Err(e) = self.storage.delete_parts(upload_id).await {
                warn!(bucket = name, upload_id, "failed to remove part files: {e}");
            }
        }
        if let Err(e) = self.storage.delete_volume(&removed.volume_path).await {
            warn!(bucket = name, "failed to remove bucket volume: {e}");
        }

        info!(bucket = name, force, "bucket deleted");
        Ok(())
    }

    pub async fn bucket_location(&self, identity: &Identity, name: &str) -> Result<String, S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::GetBucketLocation, None)
            .await?;
        Ok(bucket.region)
    }

    /// Bucket detail for the RPC adapter.
    pub async fn bucket_info(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<BucketRecord, S3Error> {
        self.authorized_bucket(identity, name, Action::ListBucket, None)
            .await
    }

    pub async fn bucket_versioning(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<VersioningStatus, S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::GetBucketVersioning, None)
            .await?;
        Ok(bucket.versioning)
    }

    pub async fn set_bucket_versioning(
        &self,
        identity: &Identity,
        name: &str,
        status: VersioningStatus,
    ) -> Result<(), S3Error> {
        if status == VersioningStatus::Unversioned {
            return Err(S3Error::MalformedXML);
        }
        self.authorized_bucket(identity, name, Action::PutBucketVersioning, None)
            .await?;
        self.metadata.set_bucket_versioning(name, status).await?;
        info!(bucket = name, status = status.as_str(), "versioning updated");
        Ok(())
    }

    pub async fn bucket_policy(&self, identity: &Identity, name: &str) -> Result<String, S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::GetBucketPolicy, None)
            .await?;
        bucket.policy.ok_or_else(|| S3Error::NoSuchBucketPolicy {
            bucket: name.to_string(),
        })
    }

    pub async fn set_bucket_policy(
        &self,
        identity: &Identity,
        name: &str,
        document: &str,
    ) -> Result<(), S3Error> {
        self.authorized_bucket(identity, name, Action::PutBucketPolicy, None)
            .await?;
        let policy = BucketPolicy::parse(document, name)?;
        self.metadata
            .set_bucket_policy(name, Some(policy.to_json()?))
            .await?;
        info!(bucket = name, "bucket policy set");
        Ok(())
    }

    pub async fn delete_bucket_policy(&self, identity: &Identity, name: &str) -> Result<(), S3Error> {
        self.authorized_bucket(identity, name, Action::DeleteBucketPolicy, None)
            .await?;
        self.metadata.set_bucket_policy(name, None).await?;
        Ok(())
    }

    pub async fn bucket_cors(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<Vec<CorsRule>, S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::GetBucketCors, None)
            .await?;
        match bucket.cors {
            Some(json) => cors::rules_from_json(&json),
            None => Err(S3Error::NoSuchCORSConfiguration {
                bucket: name.to_string(),
            }),
        }
    }

    pub async fn set_bucket_cors(
        &self,
        identity: &Identity,
        name: &str,
        rules: &[CorsRule],
    ) -> Result<(), S3Error> {
        self.authorized_bucket(identity, name, Action::PutBucketCors, None)
            .await?;
        cors::validate_rules(rules)?;
        self.metadata
            .set_bucket_cors(name, Some(cors::rules_to_json(rules)?))
            .await?;
        Ok(())
    }

    pub async fn delete_bucket_cors(&self, identity: &Identity, name: &str) -> Result<(), S3Error> {
        self.authorized_bucket(identity, name, Action::PutBucketCors, None)
            .await?;
        self.metadata.set_bucket_cors(name, None).await?;
        Ok(())
    }

    /// Answer an unauthenticated `OPTIONS` preflight from the bucket's rules.
    pub async fn cors_preflight(
        &self,
        name: &str,
        origin: &str,
        method: &str,
        request_headers: &[String],
    ) -> Result<CorsMatch, S3Error> {
        let bucket = self
            .metadata
            .get_bucket(name)
            .await?
            .ok_or(S3Error::CorsForbidden)?;
        let rules = match bucket.cors.as_deref() {
            Some(json) => cors::rules_from_json(json)?,
            None => return Err(S3Error::CorsForbidden),
        };
        cors::match_preflight(&rules, origin, method, request_headers)
            .ok_or(S3Error::CorsForbidden)
    }

    /// CORS headers for an actual cross-origin request, if any rule matches.
    pub async fn cors_for_request(&self, name: &str, origin: &str, method: &str) -> Option<CorsMatch> {
        let bucket = self.metadata.get_bucket(name).await.ok()??;
        let rules = cors::rules_from_json(bucket.cors.as_deref()?).ok()?;
        cors::match_request(&rules, origin, method)
    }

    // ── Usage ───────────────────────────────────────────────────────

    /// The caller's stored usage and quota.
    pub async fn usage(&self, identity: &Identity) -> Result<UserRecord, S3Error> {
        self.metadata
            .ensure_user(&identity.owner_id, &identity.display_name)
            .await?;
        self.metadata
            .get_user(&identity.owner_id)
            .await?
            .ok_or_else(|| {
                S3Error::InternalError(anyhow::anyhow!(
                    "user `{}` missing after creation",
                    identity.owner_id
                ))
            })
    }

    // ── Objects ─────────────────────────────────────────────────────

    pub async fn list_objects(
        &self,
        identity: &Identity,
        name: &str,
        query: &ListObjectsQuery,
    ) -> Result<(BucketRecord, ListObjectsResult), S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::ListBucket, None)
            .await?;
        let result = self.metadata.list_objects(&bucket.id, query).await?;
        Ok((bucket, result))
    }

    /// Stream a new object into place and record it.
    pub async fn put_object(
        &self,
        identity: &Identity,
        name: &str,
        key: &str,
        body: UploadBody,
        attributes: ObjectAttributes,
    ) -> Result<PutObjectOutput, S3Error> {
        validate_key(key)?;
        attributes.validate()?;
        let bucket = self
            .authorized_bucket(identity, name, Action::PutObject, Some(key))
            .await?;

        let length = body.content_length.ok_or(S3Error::MissingContentLength)?;
        if length > self.settings.max_object_size {
            return Err(S3Error::EntityTooLarge);
        }
        ensure_quota(self.metadata.as_ref(), &bucket.owner_id, length).await?;

        let placement = Placement::for_write(&bucket, key);
        let limits = WriteLimits {
            expected_md5: body.content_md5,
            expected_size: Some(length),
            max_size: Some(self.settings.max_object_size),
        };
        let blob = self
            .storage
            .write(&placement.blob_path, body.stream, limits)
            .await?;

        let blob_path = placement.blob_path.clone();
        let record = attributes.into_record(placement, &bucket, key, &blob, blob.etag())?;
        let last_modified = record.last_modified.clone();
        let outcome = match self
            .metadata
            .put_object(record, bucket.versioning_enabled())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                discard_blob(self.storage.as_ref(), &blob_path).await;
                return Err(e.into());
            }
        };

        release_replaced(self.storage.as_ref(), &outcome).await;
        debug!(bucket = name, key, size = blob.size, "object stored");
        Ok(PutObjectOutput {
            etag: blob.etag(),
            version_id: outcome.version_id,
            last_modified,
        })
    }

    /// Latest (or a specific) version, with delete markers reported as missing.
    async fn find_object(
        &self,
        bucket: &BucketRecord,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectRecord, S3Error> {
        let record = self
            .metadata
            .get_object(&bucket.id, key, version_id)
            .await?;
        match (record, version_id) {
            (Some(r), _) if !r.is_deleted => Ok(r),
            // A delete marker cannot be read by version id.
            (Some(_), Some(_)) => Err(S3Error::MethodNotAllowed),
            (None, Some(v)) => Err(S3Error::NoSuchVersion {
                key: key.to_string(),
                version_id: v.to_string(),
            }),
            _ => Err(S3Error::NoSuchKey {
                key: key.to_string(),
            }),
        }
    }

    pub async fn get_object(
        &self,
        identity: &Identity,
        name: &str,
        key: &str,
        version_id: Option<&str>,
        range: Option<RangeRequest>,
        preconditions: &Preconditions,
    ) -> Result<GetObjectOutput, S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::GetObject, Some(key))
            .await?;
        let mut retried = false;
        loop {
            let record = self.find_object(&bucket, key, version_id).await?;
            preconditions.evaluate(&record)?;
            let resolved = range.map(|r| r.resolve(record.size)).transpose()?;
            match self.storage.read(&record.blob_path, resolved).await {
                Ok(body) => {
                    return Ok(GetObjectOutput {
                        record,
                        body,
                        range: resolved,
                    })
                }
                // Overwritten between the row lookup and the open.
                Err(BlobError::NotFound(_)) if !retried && version_id.is_none() => {
                    retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn head_object(
        &self,
        identity: &Identity,
        name: &str,
        key: &str,
        version_id: Option<&str>,
        preconditions: &Preconditions,
    ) -> Result<ObjectRecord, S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::GetObject, Some(key))
            .await?;
        let record = self.find_object(&bucket, key, version_id).await?;
        preconditions.evaluate(&record)?;
        Ok(record)
    }

    pub async fn delete_object(
        &self,
        identity: &Identity,
        name: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<DeleteOutcome, S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::DeleteObject, Some(key))
            .await?;
        self.delete_from(&bucket, key, version_id).await
    }

    /// Remove the row (or add a delete marker), then the blob on a best-effort basis.
    async fn delete_from(
        &self,
        bucket: &BucketRecord,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<DeleteOutcome, S3Error> {
        let outcome = match self
            .metadata
            .soft_delete_object(&bucket.id, key, version_id, bucket.versioning_enabled())
            .await
        {
            Ok(outcome) => outcome,
            // Deleting something already gone succeeds.
            Err(MetadataError::VersionNotFound { .. }) => DeleteOutcome::default(),
            Err(e) => return Err(e.into()),
        };
        if let Some(path) = &outcome.removed_blob {
            if let Err(e) = self.storage.delete(path).await {
                warn!(bucket = %bucket.name, key, path = %path, "failed to remove blob: {e}");
            }
        }
        debug!(bucket = %bucket.name, key, marker = outcome.delete_marker, "object deleted");
        Ok(outcome)
    }

    /// Delete up to 1000 keys; per-key failures are reported, not raised.
    pub async fn delete_objects(
        &self,
        identity: &Identity,
        name: &str,
        targets: Vec<(String, Option<String>)>,
    ) -> Result<Vec<BatchDeleteEntry>, S3Error> {
        if targets.len() > MAX_DELETE_KEYS {
            return Err(S3Error::MalformedXML);
        }
        let bucket = self.bucket(name).await?;
        let mut entries = Vec::with_capacity(targets.len());
        for (key, version_id) in targets {
            let result = match validate_key(&key)
                .and_then(|_| self.authorize(identity, &bucket, Action::DeleteObject, Some(&key)))
            {
                Ok(()) => self.delete_from(&bucket, &key, version_id.as_deref()).await,
                Err(e) => Err(e),
            };
            entries.push(BatchDeleteEntry {
                key,
                version_id,
                result,
            });
        }
        Ok(entries)
    }

    /// Server-side copy.  `attributes` only apply with [`MetadataDirective::Replace`];
    /// a storage class given with `Copy` still overrides the source's.
    pub async fn copy_object(
        &self,
        identity: &Identity,
        source: &CopySource,
        name: &str,
        key: &str,
        directive: MetadataDirective,
        attributes: ObjectAttributes,
    ) -> Result<CopyObjectOutput, S3Error> {
        validate_key(key)?;
        attributes.validate()?;

        let src_bucket = self
            .authorized_bucket(identity, &source.bucket, Action::GetObject, Some(&source.key))
            .await?;
        let src = self
            .find_object(&src_bucket, &source.key, source.version_id.as_deref())
            .await?;
        let dst_bucket = self
            .authorized_bucket(identity, name, Action::PutObject, Some(key))
            .await?;

        let in_place = src_bucket.id == dst_bucket.id && source.key == key;
        if in_place
            && directive == MetadataDirective::Copy
            && attributes.storage_class.is_none()
            && !dst_bucket.versioning_enabled()
        {
            return Err(S3Error::InvalidArgument {
                message: "This copy request is illegal because it is trying to copy an object to itself without changing the object's metadata, storage class, website redirect location or encryption attributes.".to_string(),
            });
        }
        if src.size > self.settings.max_object_size {
            return Err(S3Error::EntityTooLarge);
        }
        ensure_quota(self.metadata.as_ref(), &dst_bucket.owner_id, src.size).await?;

        let new_attributes = match directive {
            MetadataDirective::Replace => attributes,
            MetadataDirective::Copy => ObjectAttributes {
                storage_class: attributes
                    .storage_class
                    .or_else(|| Some(src.storage_class.clone())),
                ..ObjectAttributes::from_record(&src)
            },
        };

        let placement = Placement::for_write(&dst_bucket, key);
        let blob = self
            .storage
            .copy(&src.blob_path, None, &placement.blob_path)
            .await?;
        let blob_path = placement.blob_path.clone();
        let record = new_attributes.into_record(placement, &dst_bucket, key, &blob, blob.etag())?;
        let last_modified = record.last_modified.clone();
        let outcome = match self
            .metadata
            .put_object(record, dst_bucket.versioning_enabled())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                discard_blob(self.storage.as_ref(), &blob_path).await;
                return Err(e.into());
            }
        };

        release_replaced(self.storage.as_ref(), &outcome).await;
        debug!(
            src_bucket = %source.bucket,
            src_key = %source.key,
            bucket = name,
            key,
            "object copied"
        );
        Ok(CopyObjectOutput {
            etag: blob.etag(),
            last_modified,
            version_id: outcome.version_id,
            source_version_id: src.version_id,
        })
    }

    // ── Multipart ───────────────────────────────────────────────────

    pub async fn create_multipart_upload(
        &self,
        identity: &Identity,
        name: &str,
        key: &str,
        attributes: ObjectAttributes,
    ) -> Result<MultipartUploadRecord, S3Error> {
        validate_key(key)?;
        attributes.validate()?;
        let bucket = self
            .authorized_bucket(identity, name, Action::PutObject, Some(key))
            .await?;
        self.multipart
            .initiate(&bucket, key, identity, attributes)
            .await
    }

    pub async fn upload_part(
        &self,
        identity: &Identity,
        name: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: UploadBody,
    ) -> Result<PartRecord, S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::PutObject, Some(key))
            .await?;
        let length = body.content_length.ok_or(S3Error::MissingContentLength)?;
        if length > self.settings.max_object_size {
            return Err(S3Error::EntityTooLarge);
        }
        let limits = WriteLimits {
            expected_md5: body.content_md5,
            expected_size: Some(length),
            max_size: Some(self.settings.max_object_size),
        };
        self.multipart
            .upload_part(&bucket, key, upload_id, part_number, body.stream, limits)
            .await
    }

    /// `UploadPartCopy`: a part whose bytes come from an existing object.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_part_copy(
        &self,
        identity: &Identity,
        name: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source: &CopySource,
        range: Option<RangeRequest>,
    ) -> Result<PartRecord, S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::PutObject, Some(key))
            .await?;
        let src_bucket = self
            .authorized_bucket(identity, &source.bucket, Action::GetObject, Some(&source.key))
            .await?;
        let src = self
            .find_object(&src_bucket, &source.key, source.version_id.as_deref())
            .await?;
        let range = range.map(|r| r.resolve(src.size)).transpose()?;
        let stream = self.storage.read(&src.blob_path, range).await?;
        let limits = WriteLimits {
            max_size: Some(self.settings.max_object_size),
            ..WriteLimits::default()
        };
        self.multipart
            .upload_part(&bucket, key, upload_id, part_number, stream, limits)
            .await
    }

    pub async fn complete_multipart_upload(
        &self,
        identity: &Identity,
        name: &str,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<CompletedUpload, S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::PutObject, Some(key))
            .await?;
        self.multipart.complete(&bucket, key, upload_id, parts).await
    }

    /// Abort an upload.  `key` is checked against the upload when given.
    pub async fn abort_multipart_upload(
        &self,
        identity: &Identity,
        name: &str,
        key: Option<&str>,
        upload_id: &str,
    ) -> Result<(), S3Error> {
        let bucket = self.bucket(name).await?;
        let upload = self.multipart.find_abortable(&bucket, key, upload_id).await?;
        self.authorize(
            identity,
            &bucket,
            Action::AbortMultipartUpload,
            Some(&upload.key),
        )?;
        self.multipart.abort(&upload).await
    }

    pub async fn list_multipart_uploads(
        &self,
        identity: &Identity,
        name: &str,
        query: &ListUploadsQuery,
    ) -> Result<ListUploadsResult, S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::ListBucketMultipartUploads, None)
            .await?;
        Ok(self
            .metadata
            .list_multipart_uploads(&bucket.id, query)
            .await?)
    }

    pub async fn list_parts(
        &self,
        identity: &Identity,
        name: &str,
        key: &str,
        upload_id: &str,
        max_parts: u32,
        part_number_marker: u32,
    ) -> Result<(MultipartUploadRecord, ListPartsResult), S3Error> {
        let bucket = self
            .authorized_bucket(identity, name, Action::ListMultipartUploadParts, Some(key))
            .await?;
        self.multipart
            .list_parts(&bucket, key, upload_id, max_parts, part_number_marker)
            .await
    }

    /// Startup housekeeping: abort uploads older than `ttl_seconds`.
    pub async fn reap_expired_uploads(&self, ttl_seconds: u64) -> Result<usize, S3Error> {
        self.multipart.reap_expired(ttl_seconds).await
    }
}
