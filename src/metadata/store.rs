//! Abstract metadata repository.
//!
//! Any metadata backend must implement [`MetadataStore`].  The trait
//! uses manually desugared async methods (pinned boxed futures) so it can
//! be held as `Arc<dyn MetadataStore>` and injected into the service layer.
//!
//! Every mutating operation that touches object existence also updates the
//! bucket counters (`object_count`, `total_size`) and the owning user's
//! `used_storage` inside the same transaction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by every repository method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, MetadataError>> + Send + 'a>>;

// ── Errors ─────────────────────────────────────────────────────────

/// Failures a repository can report.
///
/// Domain variants carry enough context for the HTTP layer to pick the
/// matching S3 error code; storage-engine failures are wrapped.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),

    #[error("bucket `{bucket}` already exists (owner {owner_id})")]
    BucketExists { bucket: String, owner_id: String },

    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),

    #[error("object `{0}` not found")]
    ObjectNotFound(String),

    #[error("version `{version_id}` of `{key}` not found")]
    VersionNotFound { key: String, version_id: String },

    #[error("upload `{0}` not found")]
    UploadNotFound(String),

    #[error("upload `{0}` is no longer in progress")]
    UploadClosed(String),

    #[error("part {part_number} is missing or its ETag changed")]
    PartMismatch { part_number: u32 },

    #[error("quota exceeded for `{owner_id}` ({requested} bytes requested)")]
    QuotaExceeded { owner_id: String, requested: i64 },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ── Custom metadata ────────────────────────────────────────────────

/// User-defined `x-amz-meta-*` metadata with the prefix stripped and the
/// name lowercased.  Ordered so that responses echo headers deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomMetadata(BTreeMap<String, String>);

impl CustomMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Size counted against the 2 KiB limit: names plus values, in bytes.
    pub fn encoded_size(&self) -> usize {
        self.0.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Tolerates malformed stored JSON by returning an empty map.
    pub fn from_json(json: &str) -> Self {
        serde_json::from_str(json).map(Self).unwrap_or_default()
    }
}

// ── Users and credentials ──────────────────────────────────────────

/// Aggregate usage for one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub owner_id: String,
    pub display_name: String,
    /// Bytes; `None` means unlimited.
    pub storage_quota: Option<i64>,
    pub used_storage: i64,
    pub created_at: String,
}

impl UserRecord {
    /// Whether adding `incoming` bytes keeps the user within quota.
    pub fn has_room_for(&self, incoming: i64) -> bool {
        match self.storage_quota {
            Some(quota) => self.used_storage.saturating_add(incoming) <= quota,
            None => true,
        }
    }
}

/// Stored credential record for SigV4 authentication.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    /// AWS-style access key ID.
    pub access_key_id: String,
    /// Signing secret.  SigV4 derives keys from the raw secret, so this
    /// is kept as issued rather than as a one-way hash.
    pub secret_key: String,
    pub owner_id: String,
    pub display_name: String,
    pub active: bool,
    /// ISO-8601 expiry; `None` never expires.
    pub expires_at: Option<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

impl CredentialRecord {
    /// Active and not past its expiry at `now` (ISO-8601).
    pub fn is_usable_at(&self, now: &str) -> bool {
        if !self.active {
            return false;
        }
        match &self.expires_at {
            Some(expires_at) => now < expires_at.as_str(),
            None => true,
        }
    }
}

// ── Buckets ────────────────────────────────────────────────────────

/// Bucket versioning state as exposed through `?versioning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersioningStatus {
    /// Never configured.
    Unversioned,
    Enabled,
    Suspended,
}

impl VersioningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersioningStatus::Unversioned => "",
            VersioningStatus::Enabled => "Enabled",
            VersioningStatus::Suspended => "Suspended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" => Some(VersioningStatus::Unversioned),
            "Enabled" => Some(VersioningStatus::Enabled),
            "Suspended" => Some(VersioningStatus::Suspended),
            _ => None,
        }
    }
}

/// Metadata record for a bucket.
#[derive(Debug, Clone)]
pub struct BucketRecord {
    /// Stable identifier; objects and uploads reference this.
    pub id: String,
    /// Globally unique bucket name.
    pub name: String,
    pub owner_id: String,
    pub owner_display: String,
    pub region: String,
    pub storage_class: String,
    /// Canned ACL given at creation (`private`, `public-read`, ...).
    pub acl: String,
    pub versioning: VersioningStatus,
    /// Blob-store directory for this bucket; fixed at creation.
    pub volume_path: String,
    pub object_count: i64,
    pub total_size: i64,
    /// Bucket policy document (JSON), if set.
    pub policy: Option<String>,
    /// CORS rules (JSON-serialized), if set.
    pub cors: Option<String>,
    pub created_at: String,
}

impl BucketRecord {
    pub fn versioning_enabled(&self) -> bool {
        self.versioning == VersioningStatus::Enabled
    }
}

// ── Objects ────────────────────────────────────────────────────────

/// Metadata record for one object version.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub bucket_id: String,
    pub key: String,
    /// `None` for the null version written while versioning is off.
    pub version_id: Option<String>,
    pub size: u64,
    /// Quoted ETag (`"<md5hex>"` or `"<md5hex>-<parts>"`).
    pub etag: String,
    /// Hex MD5 of the full content.
    pub md5: String,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    pub storage_class: String,
    pub metadata: CustomMetadata,
    /// ISO-8601 last-modified timestamp.
    pub last_modified: String,
    pub is_latest: bool,
    /// Delete marker (versioned buckets only).
    pub is_deleted: bool,
    /// Blob-store path relative to the storage root.
    pub blob_path: String,
}

/// Result of an object upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObjectOutcome {
    pub version_id: Option<String>,
    /// Body of the null version this write overwrote; the caller removes
    /// it once the row is committed.
    pub replaced_blob: Option<String>,
}

/// Result of a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Version id of the removed version or of the new delete marker.
    pub version_id: Option<String>,
    pub delete_marker: bool,
    /// Blob the caller should remove (best effort).
    pub removed_blob: Option<String>,
}

/// Listing parameters shared by V1 and V2.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsQuery {
    pub prefix: String,
    pub delimiter: String,
    /// Exclusive start key.
    pub marker: String,
    pub max_keys: u32,
}

/// Result of a ListObjects operation.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsResult {
    pub objects: Vec<ObjectRecord>,
    /// Sorted, deduplicated common prefixes.
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Last key or common prefix returned, when truncated.
    pub next_marker: Option<String>,
}

// ── Multipart ──────────────────────────────────────────────────────

/// Lifecycle of a multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Initiated,
    Completed,
    Aborted,
}

impl UploadState {
    pub fn accepts_parts(&self) -> bool {
        matches!(self, UploadState::Initiated)
    }
}

/// Metadata record for a multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartUploadRecord {
    pub upload_id: String,
    pub bucket_id: String,
    pub key: String,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    pub storage_class: String,
    pub metadata: CustomMetadata,
    pub owner_id: String,
    pub owner_display: String,
    pub initiated_at: String,
    pub state: UploadState,
}

/// Metadata record for a single uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRecord {
    /// Part number (1..=10000).
    pub part_number: u32,
    pub size: u64,
    /// Quoted ETag string.
    pub etag: String,
    pub last_modified: String,
}

/// Listing parameters for in-progress uploads.
#[derive(Debug, Clone, Default)]
pub struct ListUploadsQuery {
    pub prefix: String,
    pub key_marker: String,
    pub upload_id_marker: String,
    pub max_uploads: u32,
}

/// Result of a ListMultipartUploads operation.
#[derive(Debug, Clone)]
pub struct ListUploadsResult {
    pub uploads: Vec<MultipartUploadRecord>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_upload_id_marker: Option<String>,
}

/// Result of a ListParts operation.
#[derive(Debug, Clone)]
pub struct ListPartsResult {
    pub parts: Vec<PartRecord>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
}

/// Upload removed by the expiry reaper.
#[derive(Debug, Clone)]
pub struct ReapedUpload {
    pub upload_id: String,
    pub bucket_id: String,
    pub key: String,
}

// ── Trait ───────────────────────────────────────────────────────────

/// Async metadata repository contract.
pub trait MetadataStore: Send + Sync + 'static {
    // ── Users ───────────────────────────────────────────────────────

    /// Create the user row if missing; existing rows are left untouched.
    fn ensure_user<'a>(&'a self, owner_id: &'a str, display_name: &'a str) -> StoreFuture<'a, ()>;

    fn get_user<'a>(&'a self, owner_id: &'a str) -> StoreFuture<'a, Option<UserRecord>>;

    fn set_user_quota<'a>(&'a self, owner_id: &'a str, quota: Option<i64>) -> StoreFuture<'a, ()>;

    // ── Credentials ─────────────────────────────────────────────────

    fn get_credential<'a>(
        &'a self,
        access_key_id: &'a str,
    ) -> StoreFuture<'a, Option<CredentialRecord>>;

    /// Insert or replace a credential record.
    fn put_credential(&self, record: CredentialRecord) -> StoreFuture<'_, ()>;

    /// Revoke a credential.  Returns whether a row was removed.
    fn delete_credential<'a>(&'a self, access_key_id: &'a str) -> StoreFuture<'a, bool>;

    /// Record a successful authentication.
    fn touch_credential<'a>(&'a self, access_key_id: &'a str, at: &'a str) -> StoreFuture<'a, ()>;

    // ── Buckets ─────────────────────────────────────────────────────

    /// Create a bucket.  Fails with [`MetadataError::BucketExists`] when the
    /// name is taken, carrying the current owner.
    fn create_bucket(&self, record: BucketRecord) -> StoreFuture<'_, ()>;

    fn get_bucket<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Option<BucketRecord>>;

    /// Buckets owned by `owner_id`, sorted by name.
    fn list_buckets<'a>(&'a self, owner_id: &'a str) -> StoreFuture<'a, Vec<BucketRecord>>;

    /// Delete a bucket.  Without `force` it must hold no objects; with
    /// `force` every object row and upload is removed and the owner's usage
    /// is reduced in the same transaction.
    fn delete_bucket<'a>(&'a self, name: &'a str, force: bool) -> StoreFuture<'a, BucketRecord>;

    fn set_bucket_versioning<'a>(
        &'a self,
        name: &'a str,
        status: VersioningStatus,
    ) -> StoreFuture<'a, ()>;

    fn set_bucket_policy<'a>(&'a self, name: &'a str, policy: Option<String>)
        -> StoreFuture<'a, ()>;

    fn set_bucket_cors<'a>(&'a self, name: &'a str, cors: Option<String>) -> StoreFuture<'a, ()>;

    // ── Objects ─────────────────────────────────────────────────────

    /// Upsert an object.  With `versioned` a new row is added and the
    /// previous latest row is demoted; otherwise the null-version row is
    /// overwritten in place.  Checks the bucket owner's quota and updates
    /// bucket and user usage atomically with the row write.
    fn put_object(&self, record: ObjectRecord, versioned: bool)
        -> StoreFuture<'_, PutObjectOutcome>;

    /// Find an object version.  Without `version_id` the latest row is
    /// returned, which may be a delete marker.
    fn get_object<'a>(
        &'a self,
        bucket_id: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StoreFuture<'a, Option<ObjectRecord>>;

    /// List latest, non-deleted objects.  Fetches `max_keys + 1` entries to
    /// determine truncation.
    fn list_objects<'a>(
        &'a self,
        bucket_id: &'a str,
        query: &'a ListObjectsQuery,
    ) -> StoreFuture<'a, ListObjectsResult>;

    /// Delete an object.  Unversioned buckets lose the row; versioned
    /// buckets get a delete marker unless a specific `version_id` is given,
    /// in which case that version is removed permanently.
    fn soft_delete_object<'a>(
        &'a self,
        bucket_id: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
        versioned: bool,
    ) -> StoreFuture<'a, DeleteOutcome>;

    // ── Multipart uploads ───────────────────────────────────────────

    fn create_multipart_upload(&self, record: MultipartUploadRecord) -> StoreFuture<'_, ()>;

    fn get_multipart_upload<'a>(
        &'a self,
        upload_id: &'a str,
    ) -> StoreFuture<'a, Option<MultipartUploadRecord>>;

    /// Record a part, replacing any earlier row for the same number.
    /// Rejected once the upload is completed or aborted.
    fn upsert_part<'a>(&'a self, upload_id: &'a str, part: PartRecord) -> StoreFuture<'a, ()>;

    fn list_parts<'a>(
        &'a self,
        upload_id: &'a str,
        max_parts: u32,
        part_number_marker: u32,
    ) -> StoreFuture<'a, ListPartsResult>;

    /// All parts in ascending part-number order.
    fn get_parts<'a>(&'a self, upload_id: &'a str) -> StoreFuture<'a, Vec<PartRecord>>;

    /// Atomically re-validate the listed parts, materialize the object,
    /// update usage and mark the upload completed.
    fn complete_multipart_upload<'a>(
        &'a self,
        upload_id: &'a str,
        parts: &'a [(u32, String)],
        final_object: ObjectRecord,
        versioned: bool,
    ) -> StoreFuture<'a, PutObjectOutcome>;

    /// Mark an upload aborted and drop its part rows.  Aborting an already
    /// aborted upload succeeds; a completed upload cannot be aborted.
    fn abort_multipart_upload<'a>(&'a self, upload_id: &'a str) -> StoreFuture<'a, ()>;

    /// In-progress uploads of a bucket, ordered by key then upload id.
    fn list_multipart_uploads<'a>(
        &'a self,
        bucket_id: &'a str,
        query: &'a ListUploadsQuery,
    ) -> StoreFuture<'a, ListUploadsResult>;

    /// Abort uploads initiated more than `ttl_seconds` ago.
    fn reap_expired_uploads(&self, ttl_seconds: u64) -> StoreFuture<'_, Vec<ReapedUpload>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_metadata_lowercases_and_sizes() {
        let mut meta = CustomMetadata::new();
        meta.insert("Color", "blue");
        meta.insert("owner", "ann");
        assert_eq!(meta.get("color"), Some("blue"));
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.encoded_size(), "color".len() + 4 + "owner".len() + 3);
    }

    #[test]
    fn test_custom_metadata_json_roundtrip_tolerates_garbage() {
        let mut meta = CustomMetadata::new();
        meta.insert("a", "1");
        assert_eq!(CustomMetadata::from_json(&meta.to_json()), meta);
        assert!(CustomMetadata::from_json("not json").is_empty());
    }

    #[test]
    fn test_user_quota_room() {
        let user = UserRecord {
            owner_id: "u".into(),
            display_name: "u".into(),
            storage_quota: Some(100),
            used_storage: 60,
            created_at: String::new(),
        };
        assert!(user.has_room_for(40));
        assert!(!user.has_room_for(41));

        let unlimited = UserRecord {
            storage_quota: None,
            ..user
        };
        assert!(unlimited.has_room_for(i64::MAX));
    }

    #[test]
    fn test_credential_expiry() {
        let cred = CredentialRecord {
            access_key_id: "AK".into(),
            secret_key: "s".into(),
            owner_id: "o".into(),
            display_name: "o".into(),
            active: true,
            expires_at: Some("2030-01-01T00:00:00.000Z".into()),
            created_at: String::new(),
            last_used_at: None,
        };
        assert!(cred.is_usable_at("2029-12-31T23:59:59.000Z"));
        assert!(!cred.is_usable_at("2030-01-01T00:00:00.000Z"));

        let inactive = CredentialRecord {
            active: false,
            expires_at: None,
            ..cred
        };
        assert!(!inactive.is_usable_at("2000-01-01T00:00:00.000Z"));
    }

    #[test]
    fn test_versioning_status_parse() {
        assert_eq!(
            VersioningStatus::parse("Enabled"),
            Some(VersioningStatus::Enabled)
        );
        assert_eq!(VersioningStatus::parse("bogus"), None);
        assert_eq!(VersioningStatus::Suspended.as_str(), "Suspended");
    }
}
