//! SQLite-backed metadata repository.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.
//!
//! Usage counters are maintained by the same transaction that writes or
//! removes object rows, so `buckets.object_count`, `buckets.total_size`
//! and `users.used_storage` never drift from the rows they summarize.

use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::store::{
    BucketRecord, CredentialRecord, CustomMetadata, DeleteOutcome, ListObjectsQuery,
    ListObjectsResult, ListPartsResult, ListUploadsQuery, ListUploadsResult, MetadataError,
    MetadataStore, MultipartUploadRecord, ObjectRecord, PartRecord, PutObjectOutcome,
    ReapedUpload, StoreFuture, UploadState, UserRecord, VersioningStatus,
};
use super::{new_version_id, timestamp_now};

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// Upper bound on rows fetched per listing round trip.
const LIST_BATCH: u32 = 1000;

/// Sorts after every character a key can continue with; appended to a
/// common prefix to skip past all keys rolled up under it.
const PREFIX_SKIP: char = '\u{10FFFF}';

const BUCKET_COLUMNS: &str = "id, name, owner_id, owner_display, region, storage_class, acl,
    versioning, volume_path, object_count, total_size, policy, cors, created_at";

const OBJECT_COLUMNS: &str = "bucket_id, key, version_id, size, etag, md5, content_type,
    content_encoding, content_disposition, cache_control, storage_class, metadata,
    last_modified, is_latest, is_deleted, blob_path";

const UPLOAD_COLUMNS: &str = "upload_id, bucket_id, key, content_type, content_encoding,
    content_disposition, cache_control, storage_class, metadata, owner_id, owner_display,
    initiated_at, is_completed, is_aborted";

/// Metadata store backed by a single SQLite database file.
pub struct SqliteMetadataStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
    /// Quota given to users created implicitly by a write.
    default_quota: Option<i64>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            default_quota: None,
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    /// Set the quota applied to users first seen by this store.
    pub fn with_default_quota(mut self, quota: Option<i64>) -> Self {
        self.default_quota = quota;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, MetadataError> {
        self.conn
            .lock()
            .map_err(|_| MetadataError::Other(anyhow::anyhow!("metadata connection mutex poisoned")))
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already exist.
    /// Idempotent, so it runs on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                owner_id       TEXT PRIMARY KEY,
                display_name   TEXT NOT NULL DEFAULT '',
                storage_quota  INTEGER,
                used_storage   INTEGER NOT NULL DEFAULT 0,
                created_at     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credentials (
                access_key_id  TEXT PRIMARY KEY,
                secret_key     TEXT NOT NULL,
                owner_id       TEXT NOT NULL,
                display_name   TEXT NOT NULL DEFAULT '',
                active         INTEGER NOT NULL DEFAULT 1,
                expires_at     TEXT,
                created_at     TEXT NOT NULL,
                last_used_at   TEXT
            );

            CREATE TABLE IF NOT EXISTS buckets (
                id             TEXT PRIMARY KEY,
                name           TEXT NOT NULL UNIQUE,
                owner_id       TEXT NOT NULL,
                owner_display  TEXT NOT NULL DEFAULT '',
                region         TEXT NOT NULL DEFAULT 'us-east-1',
                storage_class  TEXT NOT NULL DEFAULT 'STANDARD',
                acl            TEXT NOT NULL DEFAULT 'private',
                versioning     TEXT NOT NULL DEFAULT '',
                volume_path    TEXT NOT NULL,
                object_count   INTEGER NOT NULL DEFAULT 0,
                total_size     INTEGER NOT NULL DEFAULT 0,
                policy         TEXT,
                cors           TEXT,
                created_at     TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_buckets_owner ON buckets(owner_id, name);

            CREATE TABLE IF NOT EXISTS objects (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket_id           TEXT NOT NULL,
                key                 TEXT NOT NULL,
                version_id          TEXT,
                size                INTEGER NOT NULL,
                etag                TEXT NOT NULL,
                md5                 TEXT NOT NULL DEFAULT '',
                content_type        TEXT NOT NULL DEFAULT 'application/octet-stream',
                content_encoding    TEXT,
                content_disposition TEXT,
                cache_control       TEXT,
                storage_class       TEXT NOT NULL DEFAULT 'STANDARD',
                metadata            TEXT NOT NULL DEFAULT '{}',
                last_modified       TEXT NOT NULL,
                is_latest           INTEGER NOT NULL DEFAULT 1,
                is_deleted          INTEGER NOT NULL DEFAULT 0,
                blob_path           TEXT NOT NULL DEFAULT '',

                FOREIGN KEY (bucket_id) REFERENCES buckets(id) ON DELETE CASCADE
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_objects_version
                ON objects(bucket_id, key, IFNULL(version_id, ''));
            CREATE INDEX IF NOT EXISTS idx_objects_listing
                ON objects(bucket_id, is_latest, key);

            CREATE TABLE IF NOT EXISTS multipart_uploads (
                upload_id           TEXT PRIMARY KEY,
                bucket_id           TEXT NOT NULL,
                key                 TEXT NOT NULL,
                content_type        TEXT NOT NULL DEFAULT 'application/octet-stream',
                content_encoding    TEXT,
                content_disposition TEXT,
                cache_control       TEXT,
                storage_class       TEXT NOT NULL DEFAULT 'STANDARD',
                metadata            TEXT NOT NULL DEFAULT '{}',
                owner_id            TEXT NOT NULL,
                owner_display       TEXT NOT NULL DEFAULT '',
                initiated_at        TEXT NOT NULL,
                is_completed        INTEGER NOT NULL DEFAULT 0,
                is_aborted          INTEGER NOT NULL DEFAULT 0,

                FOREIGN KEY (bucket_id) REFERENCES buckets(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_uploads_bucket_key
                ON multipart_uploads(bucket_id, key, upload_id);

            CREATE TABLE IF NOT EXISTS multipart_parts (
                upload_id      TEXT NOT NULL,
                part_number    INTEGER NOT NULL,
                size           INTEGER NOT NULL,
                etag           TEXT NOT NULL,
                last_modified  TEXT NOT NULL,

                PRIMARY KEY (upload_id, part_number),
                FOREIGN KEY (upload_id) REFERENCES multipart_uploads(upload_id) ON DELETE CASCADE
            );
            ",
        )?;

        let existing: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        if existing.map_or(true, |v| v < SCHEMA_VERSION) {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, timestamp_now()],
            )?;
        }

        Ok(())
    }

    /// Seed a credential and its user on startup.  Idempotent: an existing
    /// access key keeps its stored secret and state.
    pub fn seed_credential(
        &self,
        access_key: &str,
        secret_key: &str,
        owner_id: &str,
        display_name: &str,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        let now = timestamp_now();
        conn.execute(
            "INSERT OR IGNORE INTO credentials
                (access_key_id, secret_key, owner_id, display_name, active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![access_key, secret_key, owner_id, display_name, now],
        )?;
        insert_user_if_missing(&conn, owner_id, display_name, self.default_quota)?;
        Ok(())
    }
}

// ── Row mapping ────────────────────────────────────────────────────

fn map_bucket_row(row: &Row<'_>) -> rusqlite::Result<BucketRecord> {
    let versioning: String = row.get(7)?;
    Ok(BucketRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_id: row.get(2)?,
        owner_display: row.get(3)?,
        region: row.get(4)?,
        storage_class: row.get(5)?,
        acl: row.get(6)?,
        versioning: VersioningStatus::parse(&versioning).unwrap_or(VersioningStatus::Unversioned),
        volume_path: row.get(8)?,
        object_count: row.get(9)?,
        total_size: row.get(10)?,
        policy: row.get(11)?,
        cors: row.get(12)?,
        created_at: row.get(13)?,
    })
}

fn map_object_row(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    let size: i64 = row.get(3)?;
    let metadata: String = row.get(11)?;
    let is_latest: i32 = row.get(13)?;
    let is_deleted: i32 = row.get(14)?;
    Ok(ObjectRecord {
        bucket_id: row.get(0)?,
        key: row.get(1)?,
        version_id: row.get(2)?,
        size: size.max(0) as u64,
        etag: row.get(4)?,
        md5: row.get(5)?,
        content_type: row.get(6)?,
        content_encoding: row.get(7)?,
        content_disposition: row.get(8)?,
        cache_control: row.get(9)?,
        storage_class: row.get(10)?,
        metadata: CustomMetadata::from_json(&metadata),
        last_modified: row.get(12)?,
        is_latest: is_latest != 0,
        is_deleted: is_deleted != 0,
        blob_path: row.get(15)?,
    })
}

fn map_upload_row(row: &Row<'_>) -> rusqlite::Result<MultipartUploadRecord> {
    let metadata: String = row.get(8)?;
    let is_completed: i32 = row.get(12)?;
    let is_aborted: i32 = row.get(13)?;
    let state = if is_completed != 0 {
        UploadState::Completed
    } else if is_aborted != 0 {
        UploadState::Aborted
    } else {
        UploadState::Initiated
    };
    Ok(MultipartUploadRecord {
        upload_id: row.get(0)?,
        bucket_id: row.get(1)?,
        key: row.get(2)?,
        content_type: row.get(3)?,
        content_encoding: row.get(4)?,
        content_disposition: row.get(5)?,
        cache_control: row.get(6)?,
        storage_class: row.get(7)?,
        metadata: CustomMetadata::from_json(&metadata),
        owner_id: row.get(9)?,
        owner_display: row.get(10)?,
        initiated_at: row.get(11)?,
        state,
    })
}

fn map_part_row(row: &Row<'_>) -> rusqlite::Result<PartRecord> {
    let size: i64 = row.get(1)?;
    Ok(PartRecord {
        part_number: row.get(0)?,
        size: size.max(0) as u64,
        etag: row.get(2)?,
        last_modified: row.get(3)?,
    })
}

fn map_user_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        owner_id: row.get(0)?,
        display_name: row.get(1)?,
        storage_quota: row.get(2)?,
        used_storage: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// `version_id = "null"` addresses the null version, as in S3.
fn normalize_version(version_id: Option<&str>) -> Option<Option<&str>> {
    match version_id {
        None => None,
        Some("null") => Some(None),
        Some(v) => Some(Some(v)),
    }
}

// ── Transaction helpers ────────────────────────────────────────────

fn insert_user_if_missing(
    conn: &Connection,
    owner_id: &str,
    display_name: &str,
    quota: Option<i64>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO users (owner_id, display_name, storage_quota, used_storage, created_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![owner_id, display_name, quota, timestamp_now()],
    )?;
    Ok(())
}

fn bucket_by_id(conn: &Connection, bucket_id: &str) -> Result<BucketRecord, MetadataError> {
    conn.query_row(
        &format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE id = ?1"),
        params![bucket_id],
        map_bucket_row,
    )
    .optional()?
    .ok_or_else(|| MetadataError::BucketNotFound(bucket_id.to_string()))
}

/// Reject when `incoming` more bytes would exceed the owner's quota.
fn check_quota(conn: &Connection, owner_id: &str, incoming: i64) -> Result<(), MetadataError> {
    if incoming <= 0 {
        return Ok(());
    }
    let user = conn
        .query_row(
            "SELECT owner_id, display_name, storage_quota, used_storage, created_at
             FROM users WHERE owner_id = ?1",
            params![owner_id],
            map_user_row,
        )
        .optional()?;
    match user {
        Some(user) if !user.has_room_for(incoming) => Err(MetadataError::QuotaExceeded {
            owner_id: owner_id.to_string(),
            requested: incoming,
        }),
        _ => Ok(()),
    }
}

/// Apply count/size deltas to a bucket and its owner.
fn adjust_usage(
    conn: &Connection,
    bucket: &BucketRecord,
    default_quota: Option<i64>,
    count_delta: i64,
    size_delta: i64,
) -> rusqlite::Result<()> {
    if count_delta == 0 && size_delta == 0 {
        return Ok(());
    }
    conn.execute(
        "UPDATE buckets
         SET object_count = MAX(0, object_count + ?1), total_size = MAX(0, total_size + ?2)
         WHERE id = ?3",
        params![count_delta, size_delta, bucket.id],
    )?;
    insert_user_if_missing(conn, &bucket.owner_id, &bucket.owner_display, default_quota)?;
    conn.execute(
        "UPDATE users SET used_storage = MAX(0, used_storage + ?1) WHERE owner_id = ?2",
        params![size_delta, bucket.owner_id],
    )?;
    Ok(())
}

fn insert_object_row(conn: &Connection, record: &ObjectRecord) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO objects ({OBJECT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            record.bucket_id,
            record.key,
            record.version_id,
            record.size as i64,
            record.etag,
            record.md5,
            record.content_type,
            record.content_encoding,
            record.content_disposition,
            record.cache_control,
            record.storage_class,
            record.metadata.to_json(),
            record.last_modified,
            record.is_latest as i32,
            record.is_deleted as i32,
            record.blob_path,
        ],
    )?;
    Ok(())
}

/// Make the newest remaining row of `key` the latest one.
fn promote_latest(conn: &Connection, bucket_id: &str, key: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE objects SET is_latest = 1
         WHERE id = (SELECT id FROM objects WHERE bucket_id = ?1 AND key = ?2
                     ORDER BY id DESC LIMIT 1)",
        params![bucket_id, key],
    )?;
    Ok(())
}

/// The versioned/unversioned overwrite rule plus quota and counters.
fn upsert_object_tx(
    conn: &Connection,
    default_quota: Option<i64>,
    mut record: ObjectRecord,
    versioned: bool,
) -> Result<PutObjectOutcome, MetadataError> {
    let bucket = bucket_by_id(conn, &record.bucket_id)?;
    let size = record.size as i64;
    record.is_latest = true;
    record.is_deleted = false;

    if versioned {
        check_quota(conn, &bucket.owner_id, size)?;
        let version_id = record.version_id.clone().unwrap_or_else(new_version_id);
        record.version_id = Some(version_id.clone());
        conn.execute(
            "UPDATE objects SET is_latest = 0 WHERE bucket_id = ?1 AND key = ?2",
            params![record.bucket_id, record.key],
        )?;
        insert_object_row(conn, &record)?;
        adjust_usage(conn, &bucket, default_quota, 1, size)?;
        return Ok(PutObjectOutcome {
            version_id: Some(version_id),
            replaced_blob: None,
        });
    }

    record.version_id = None;
    let existing: Option<(i64, i32, String)> = conn
        .query_row(
            "SELECT size, is_deleted, blob_path FROM objects
             WHERE bucket_id = ?1 AND key = ?2 AND version_id IS NULL",
            params![record.bucket_id, record.key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let (count_delta, size_delta) = match existing {
        Some((_, deleted, _)) if deleted != 0 => (1, size),
        Some((old_size, _, _)) => (0, size - old_size),
        None => (1, size),
    };
    let replaced_blob = existing
        .as_ref()
        .map(|(_, _, path)| path.clone())
        .filter(|path| !path.is_empty() && *path != record.blob_path);
    check_quota(conn, &bucket.owner_id, size_delta)?;

    conn.execute(
        "UPDATE objects SET is_latest = 0 WHERE bucket_id = ?1 AND key = ?2",
        params![record.bucket_id, record.key],
    )?;
    if existing.is_some() {
        conn.execute(
            "UPDATE objects SET size = ?3, etag = ?4, md5 = ?5, content_type = ?6,
                content_encoding = ?7, content_disposition = ?8, cache_control = ?9,
                storage_class = ?10, metadata = ?11, last_modified = ?12,
                is_latest = 1, is_deleted = 0, blob_path = ?13
             WHERE bucket_id = ?1 AND key = ?2 AND version_id IS NULL",
            params![
                record.bucket_id,
                record.key,
                size,
                record.etag,
                record.md5,
                record.content_type,
                record.content_encoding,
                record.content_disposition,
                record.cache_control,
                record.storage_class,
                record.metadata.to_json(),
                record.last_modified,
                record.blob_path,
            ],
        )?;
    } else {
        insert_object_row(conn, &record)?;
    }
    adjust_usage(conn, &bucket, default_quota, count_delta, size_delta)?;
    Ok(PutObjectOutcome {
        version_id: None,
        replaced_blob,
    })
}

fn upload_state(conn: &Connection, upload_id: &str) -> Result<UploadState, MetadataError> {
    conn.query_row(
        &format!("SELECT {UPLOAD_COLUMNS} FROM multipart_uploads WHERE upload_id = ?1"),
        params![upload_id],
        map_upload_row,
    )
    .optional()?
    .map(|u| u.state)
    .ok_or_else(|| MetadataError::UploadNotFound(upload_id.to_string()))
}

/// Keys after `cursor` that are latest, live and start with `prefix`.
fn fetch_listing_batch(
    conn: &Connection,
    bucket_id: &str,
    prefix: &str,
    cursor: &str,
    limit: u32,
) -> rusqlite::Result<Vec<ObjectRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OBJECT_COLUMNS} FROM objects
         WHERE bucket_id = ?1 AND is_latest = 1 AND is_deleted = 0
           AND key > ?2 AND substr(key, 1, ?3) = ?4
         ORDER BY key
         LIMIT ?5"
    ))?;
    let rows = stmt.query_map(
        params![
            bucket_id,
            cursor,
            prefix.chars().count() as i64,
            prefix,
            limit as i64
        ],
        map_object_row,
    )?;
    rows.collect()
}

/// One listing entry before truncation.
enum ListEntry {
    Object(ObjectRecord),
    Prefix(String),
}

/// The common prefix `key` rolls up into, if any.
fn common_prefix_of(key: &str, prefix: &str, delimiter: &str) -> Option<String> {
    if delimiter.is_empty() {
        return None;
    }
    let rest = key.strip_prefix(prefix)?;
    rest.find(delimiter)
        .map(|pos| format!("{prefix}{}{delimiter}", &rest[..pos]))
}

fn list_objects_tx(
    conn: &Connection,
    bucket_id: &str,
    query: &ListObjectsQuery,
) -> rusqlite::Result<ListObjectsResult> {
    if query.max_keys == 0 {
        return Ok(ListObjectsResult::default());
    }
    let wanted = query.max_keys as usize + 1;
    let mut entries: Vec<ListEntry> = Vec::new();

    // A marker that is itself a common prefix resumes after everything
    // rolled up under it.
    let mut cursor = match common_prefix_of(&query.marker, &query.prefix, &query.delimiter) {
        Some(cp) if cp == query.marker => format!("{cp}{PREFIX_SKIP}"),
        _ => query.marker.clone(),
    };

    'scan: loop {
        let batch = fetch_listing_batch(conn, bucket_id, &query.prefix, &cursor, LIST_BATCH)?;
        let exhausted = batch.len() < LIST_BATCH as usize;
        let mut last_prefix: Option<String> = None;
        let mut last_key: Option<String> = None;

        for record in batch {
            last_key = Some(record.key.clone());
            match common_prefix_of(&record.key, &query.prefix, &query.delimiter) {
                Some(cp) => {
                    if last_prefix.as_deref() == Some(cp.as_str()) {
                        continue;
                    }
                    let duplicate = matches!(entries.last(), Some(ListEntry::Prefix(p)) if *p == cp);
                    last_prefix = Some(cp.clone());
                    if !duplicate {
                        entries.push(ListEntry::Prefix(cp));
                    }
                }
                None => {
                    last_prefix = None;
                    entries.push(ListEntry::Object(record));
                }
            }
            if entries.len() >= wanted {
                break 'scan;
            }
        }

        if exhausted {
            break;
        }
        cursor = match (last_prefix, last_key) {
            (Some(cp), _) => format!("{cp}{PREFIX_SKIP}"),
            (None, Some(key)) => key,
            (None, None) => break,
        };
    }

    let is_truncated = entries.len() > query.max_keys as usize;
    entries.truncate(query.max_keys as usize);

    let next_marker = if is_truncated {
        entries.last().map(|e| match e {
            ListEntry::Object(o) => o.key.clone(),
            ListEntry::Prefix(p) => p.clone(),
        })
    } else {
        None
    };

    let mut objects = Vec::new();
    let mut common_prefixes = Vec::new();
    for entry in entries {
        match entry {
            ListEntry::Object(o) => objects.push(o),
            ListEntry::Prefix(p) => common_prefixes.push(p),
        }
    }

    Ok(ListObjectsResult {
        objects,
        common_prefixes,
        is_truncated,
        next_marker,
    })
}

// ── MetadataStore implementation ───────────────────────────────────

impl MetadataStore for SqliteMetadataStore {
    // ── Users ───────────────────────────────────────────────────────

    fn ensure_user<'a>(&'a self, owner_id: &'a str, display_name: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            insert_user_if_missing(&conn, owner_id, display_name, self.default_quota)?;
            Ok(())
        })
    }

    fn get_user<'a>(&'a self, owner_id: &'a str) -> StoreFuture<'a, Option<UserRecord>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let user = conn
                .query_row(
                    "SELECT owner_id, display_name, storage_quota, used_storage, created_at
                     FROM users WHERE owner_id = ?1",
                    params![owner_id],
                    map_user_row,
                )
                .optional()?;
            Ok(user)
        })
    }

    fn set_user_quota<'a>(&'a self, owner_id: &'a str, quota: Option<i64>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            insert_user_if_missing(&conn, owner_id, owner_id, quota)?;
            conn.execute(
                "UPDATE users SET storage_quota = ?1 WHERE owner_id = ?2",
                params![quota, owner_id],
            )?;
            Ok(())
        })
    }

    // ── Credentials ─────────────────────────────────────────────────

    fn get_credential<'a>(
        &'a self,
        access_key_id: &'a str,
    ) -> StoreFuture<'a, Option<CredentialRecord>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let result = conn
                .query_row(
                    "SELECT access_key_id, secret_key, owner_id, display_name, active,
                            expires_at, created_at, last_used_at
                     FROM credentials WHERE access_key_id = ?1",
                    params![access_key_id],
                    |row| {
                        let active: i32 = row.get(4)?;
                        Ok(CredentialRecord {
                            access_key_id: row.get(0)?,
                            secret_key: row.get(1)?,
                            owner_id: row.get(2)?,
                            display_name: row.get(3)?,
                            active: active != 0,
                            expires_at: row.get(5)?,
                            created_at: row.get(6)?,
                            last_used_at: row.get(7)?,
                        })
                    },
                )
                .optional()?;
            Ok(result)
        })
    }

    fn put_credential(&self, record: CredentialRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO credentials
                    (access_key_id, secret_key, owner_id, display_name, active,
                     expires_at, created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.access_key_id,
                    record.secret_key,
                    record.owner_id,
                    record.display_name,
                    record.active as i32,
                    record.expires_at,
                    record.created_at,
                    record.last_used_at,
                ],
            )?;
            insert_user_if_missing(
                &conn,
                &record.owner_id,
                &record.display_name,
                self.default_quota,
            )?;
            Ok(())
        })
    }

    fn delete_credential<'a>(&'a self, access_key_id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let conn = self.lock()?;
            let removed = conn.execute(
                "DELETE FROM credentials WHERE access_key_id = ?1",
                params![access_key_id],
            )?;
            Ok(removed > 0)
        })
    }

    fn touch_credential<'a>(&'a self, access_key_id: &'a str, at: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE credentials SET last_used_at = ?1 WHERE access_key_id = ?2",
                params![at, access_key_id],
            )?;
            Ok(())
        })
    }

    // ── Buckets ─────────────────────────────────────────────────────

    fn create_bucket(&self, record: BucketRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                &format!(
                    "INSERT INTO buckets ({BUCKET_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10, ?11, ?12)"
                ),
                params![
                    record.id,
                    record.name,
                    record.owner_id,
                    record.owner_display,
                    record.region,
                    record.storage_class,
                    record.acl,
                    record.versioning.as_str(),
                    record.volume_path,
                    record.policy,
                    record.cors,
                    record.created_at,
                ],
            );
            if let Err(err) = inserted {
                if is_unique_violation(&err) {
                    let owner_id: String = tx.query_row(
                        "SELECT owner_id FROM buckets WHERE name = ?1",
                        params![record.name],
                        |row| row.get(0),
                    )?;
                    return Err(MetadataError::BucketExists {
                        bucket: record.name,
                        owner_id,
                    });
                }
                return Err(err.into());
            }
            insert_user_if_missing(&tx, &record.owner_id, &record.owner_display, self.default_quota)?;
            tx.commit()?;
            info!(bucket = %record.name, owner = %record.owner_id, "bucket created");
            Ok(())
        })
    }

    fn get_bucket<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Option<BucketRecord>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let result = conn
                .query_row(
                    &format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE name = ?1"),
                    params![name],
                    map_bucket_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn list_buckets<'a>(&'a self, owner_id: &'a str) -> StoreFuture<'a, Vec<BucketRecord>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {BUCKET_COLUMNS} FROM buckets WHERE owner_id = ?1 ORDER BY name"
            ))?;
            let buckets = stmt
                .query_map(params![owner_id], map_bucket_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(buckets)
        })
    }

    fn delete_bucket<'a>(&'a self, name: &'a str, force: bool) -> StoreFuture<'a, BucketRecord> {
        Box::pin(async move {
            let conn = self.lock()?;
            let tx = conn.unchecked_transaction()?;
            let bucket = tx
                .query_row(
                    &format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE name = ?1"),
                    params![name],
                    map_bucket_row,
                )
                .optional()?
                .ok_or_else(|| MetadataError::BucketNotFound(name.to_string()))?;

            if bucket.object_count > 0 {
                if !force {
                    return Err(MetadataError::BucketNotEmpty(name.to_string()));
                }
                tx.execute(
                    "UPDATE users SET used_storage = MAX(0, used_storage - ?1) WHERE owner_id = ?2",
                    params![bucket.total_size, bucket.owner_id],
                )?;
            }

            // Cascades to objects, uploads and parts.
            tx.execute("DELETE FROM buckets WHERE id = ?1", params![bucket.id])?;
            tx.commit()?;
            info!(bucket = %name, force, "bucket deleted");
            Ok(bucket)
        })
    }

    fn set_bucket_versioning<'a>(
        &'a self,
        name: &'a str,
        status: VersioningStatus,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            let updated = conn.execute(
                "UPDATE buckets SET versioning = ?1 WHERE name = ?2",
                params![status.as_str(), name],
            )?;
            if updated == 0 {
                return Err(MetadataError::BucketNotFound(name.to_string()));
            }
            Ok(())
        })
    }

    fn set_bucket_policy<'a>(
        &'a self,
        name: &'a str,
        policy: Option<String>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            let updated = conn.execute(
                "UPDATE buckets SET policy = ?1 WHERE name = ?2",
                params![policy, name],
            )?;
            if updated == 0 {
                return Err(MetadataError::BucketNotFound(name.to_string()));
            }
            Ok(())
        })
    }

    fn set_bucket_cors<'a>(&'a self, name: &'a str, cors: Option<String>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            let updated = conn.execute(
                "UPDATE buckets SET cors = ?1 WHERE name = ?2",
                params![cors, name],
            )?;
            if updated == 0 {
                return Err(MetadataError::BucketNotFound(name.to_string()));
            }
            Ok(())
        })
    }

    // ── Objects ─────────────────────────────────────────────────────

    fn put_object(
        &self,
        record: ObjectRecord,
        versioned: bool,
    ) -> StoreFuture<'_, PutObjectOutcome> {
        Box::pin(async move {
            let conn = self.lock()?;
            let tx = conn.unchecked_transaction()?;
            let outcome = upsert_object_tx(&tx, self.default_quota, record, versioned)?;
            tx.commit()?;
            Ok(outcome)
        })
    }

    fn get_object<'a>(
        &'a self,
        bucket_id: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StoreFuture<'a, Option<ObjectRecord>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let result = match normalize_version(version_id) {
                None => conn
                    .query_row(
                        &format!(
                            "SELECT {OBJECT_COLUMNS} FROM objects
                             WHERE bucket_id = ?1 AND key = ?2 AND is_latest = 1"
                        ),
                        params![bucket_id, key],
                        map_object_row,
                    )
                    .optional()?,
                Some(None) => conn
                    .query_row(
                        &format!(
                            "SELECT {OBJECT_COLUMNS} FROM objects
                             WHERE bucket_id = ?1 AND key = ?2 AND version_id IS NULL"
                        ),
                        params![bucket_id, key],
                        map_object_row,
                    )
                    .optional()?,
                Some(Some(v)) => conn
                    .query_row(
                        &format!(
                            "SELECT {OBJECT_COLUMNS} FROM objects
                             WHERE bucket_id = ?1 AND key = ?2 AND version_id = ?3"
                        ),
                        params![bucket_id, key, v],
                        map_object_row,
                    )
                    .optional()?,
            };
            Ok(result)
        })
    }

    fn list_objects<'a>(
        &'a self,
        bucket_id: &'a str,
        query: &'a ListObjectsQuery,
    ) -> StoreFuture<'a, ListObjectsResult> {
        Box::pin(async move {
            let conn = self.lock()?;
            let result = list_objects_tx(&conn, bucket_id, query)?;
            debug!(
                bucket_id,
                prefix = %query.prefix,
                returned = result.objects.len(),
                prefixes = result.common_prefixes.len(),
                truncated = result.is_truncated,
                "listed objects"
            );
            Ok(result)
        })
    }

    fn soft_delete_object<'a>(
        &'a self,
        bucket_id: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
        versioned: bool,
    ) -> StoreFuture<'a, DeleteOutcome> {
        Box::pin(async move {
            let conn = self.lock()?;
            let tx = conn.unchecked_transaction()?;
            let bucket = bucket_by_id(&tx, bucket_id)?;

            // Unversioned delete on a versioned bucket: add a delete marker.
            if versioned && version_id.is_none() {
                let marker_id = new_version_id();
                tx.execute(
                    "UPDATE objects SET is_latest = 0 WHERE bucket_id = ?1 AND key = ?2",
                    params![bucket_id, key],
                )?;
                let marker = ObjectRecord {
                    bucket_id: bucket_id.to_string(),
                    key: key.to_string(),
                    version_id: Some(marker_id.clone()),
                    size: 0,
                    etag: String::new(),
                    md5: String::new(),
                    content_type: String::new(),
                    content_encoding: None,
                    content_disposition: None,
                    cache_control: None,
                    storage_class: bucket.storage_class.clone(),
                    metadata: CustomMetadata::new(),
                    last_modified: timestamp_now(),
                    is_latest: true,
                    is_deleted: true,
                    blob_path: String::new(),
                };
                insert_object_row(&tx, &marker)?;
                tx.commit()?;
                return Ok(DeleteOutcome {
                    version_id: Some(marker_id),
                    delete_marker: true,
                    removed_blob: None,
                });
            }

            let target = match normalize_version(version_id) {
                Some(Some(v)) => {
                    let row = tx
                        .query_row(
                            &format!(
                                "SELECT id, {OBJECT_COLUMNS} FROM objects
                                 WHERE bucket_id = ?1 AND key = ?2 AND version_id = ?3"
                            ),
                            params![bucket_id, key, v],
                            |row| Ok((row.get::<_, i64>(0)?, shifted_object_row(row)?)),
                        )
                        .optional()?;
                    match row {
                        Some(row) => Some(row),
                        None => {
                            return Err(MetadataError::VersionNotFound {
                                key: key.to_string(),
                                version_id: v.to_string(),
                            })
                        }
                    }
                }
                _ => tx
                    .query_row(
                        &format!(
                            "SELECT id, {OBJECT_COLUMNS} FROM objects
                             WHERE bucket_id = ?1 AND key = ?2 AND version_id IS NULL"
                        ),
                        params![bucket_id, key],
                        |row| Ok((row.get::<_, i64>(0)?, shifted_object_row(row)?)),
                    )
                    .optional()?,
            };

            let Some((row_id, record)) = target else {
                // Deleting a missing key is not an error.
                return Ok(DeleteOutcome::default());
            };

            tx.execute("DELETE FROM objects WHERE id = ?1", params![row_id])?;
            if record.is_latest {
                promote_latest(&tx, bucket_id, key)?;
            }
            let removed_blob = if record.is_deleted {
                None
            } else {
                adjust_usage(&tx, &bucket, self.default_quota, -1, -(record.size as i64))?;
                Some(record.blob_path.clone())
            };
            tx.commit()?;

            Ok(DeleteOutcome {
                version_id: record.version_id,
                delete_marker: record.is_deleted,
                removed_blob,
            })
        })
    }

    // ── Multipart uploads ───────────────────────────────────────────

    fn create_multipart_upload(&self, record: MultipartUploadRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                &format!(
                    "INSERT INTO multipart_uploads ({UPLOAD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, 0)"
                ),
                params![
                    record.upload_id,
                    record.bucket_id,
                    record.key,
                    record.content_type,
                    record.content_encoding,
                    record.content_disposition,
                    record.cache_control,
                    record.storage_class,
                    record.metadata.to_json(),
                    record.owner_id,
                    record.owner_display,
                    record.initiated_at,
                ],
            )?;
            Ok(())
        })
    }

    fn get_multipart_upload<'a>(
        &'a self,
        upload_id: &'a str,
    ) -> StoreFuture<'a, Option<MultipartUploadRecord>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let result = conn
                .query_row(
                    &format!("SELECT {UPLOAD_COLUMNS} FROM multipart_uploads WHERE upload_id = ?1"),
                    params![upload_id],
                    map_upload_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn upsert_part<'a>(&'a self, upload_id: &'a str, part: PartRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            let tx = conn.unchecked_transaction()?;
            if !upload_state(&tx, upload_id)?.accepts_parts() {
                return Err(MetadataError::UploadClosed(upload_id.to_string()));
            }
            tx.execute(
                "INSERT OR REPLACE INTO multipart_parts
                    (upload_id, part_number, size, etag, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    upload_id,
                    part.part_number,
                    part.size as i64,
                    part.etag,
                    part.last_modified,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn list_parts<'a>(
        &'a self,
        upload_id: &'a str,
        max_parts: u32,
        part_number_marker: u32,
    ) -> StoreFuture<'a, ListPartsResult> {
        Box::pin(async move {
            let conn = self.lock()?;
            let fetch_limit = max_parts as i64 + 1;
            let mut stmt = conn.prepare(
                "SELECT part_number, size, etag, last_modified
                 FROM multipart_parts
                 WHERE upload_id = ?1 AND part_number > ?2
                 ORDER BY part_number
                 LIMIT ?3",
            )?;
            let mut parts = stmt
                .query_map(
                    params![upload_id, part_number_marker, fetch_limit],
                    map_part_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            let is_truncated = parts.len() > max_parts as usize;
            if is_truncated {
                parts.truncate(max_parts as usize);
            }
            let next_part_number_marker = if is_truncated {
                parts.last().map(|p| p.part_number)
            } else {
                None
            };
            Ok(ListPartsResult {
                parts,
                is_truncated,
                next_part_number_marker,
            })
        })
    }

    fn get_parts<'a>(&'a self, upload_id: &'a str) -> StoreFuture<'a, Vec<PartRecord>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT part_number, size, etag, last_modified
                 FROM multipart_parts
                 WHERE upload_id = ?1
                 ORDER BY part_number",
            )?;
            let parts = stmt
                .query_map(params![upload_id], map_part_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(parts)
        })
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        upload_id: &'a str,
        parts: &'a [(u32, String)],
        final_object: ObjectRecord,
        versioned: bool,
    ) -> StoreFuture<'a, PutObjectOutcome> {
        Box::pin(async move {
            let conn = self.lock()?;
            let tx = conn.unchecked_transaction()?;

            match upload_state(&tx, upload_id)? {
                UploadState::Initiated => {}
                _ => return Err(MetadataError::UploadClosed(upload_id.to_string())),
            }

            // A part re-uploaded while the blob was being assembled would
            // leave the assembled bytes stale.
            for (part_number, etag) in parts {
                let stored: Option<String> = tx
                    .query_row(
                        "SELECT etag FROM multipart_parts WHERE upload_id = ?1 AND part_number = ?2",
                        params![upload_id, part_number],
                        |row| row.get(0),
                    )
                    .optional()?;
                if stored.as_deref() != Some(etag.as_str()) {
                    return Err(MetadataError::PartMismatch {
                        part_number: *part_number,
                    });
                }
            }

            let outcome = upsert_object_tx(&tx, self.default_quota, final_object, versioned)?;
            tx.execute(
                "UPDATE multipart_uploads SET is_completed = 1 WHERE upload_id = ?1",
                params![upload_id],
            )?;
            tx.execute(
                "DELETE FROM multipart_parts WHERE upload_id = ?1",
                params![upload_id],
            )?;
            tx.commit()?;
            Ok(outcome)
        })
    }

    fn abort_multipart_upload<'a>(&'a self, upload_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            let tx = conn.unchecked_transaction()?;
            match upload_state(&tx, upload_id)? {
                UploadState::Aborted => return Ok(()),
                UploadState::Completed => {
                    return Err(MetadataError::UploadClosed(upload_id.to_string()))
                }
                UploadState::Initiated => {}
            }
            tx.execute(
                "UPDATE multipart_uploads SET is_aborted = 1 WHERE upload_id = ?1",
                params![upload_id],
            )?;
            tx.execute(
                "DELETE FROM multipart_parts WHERE upload_id = ?1",
                params![upload_id],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn list_multipart_uploads<'a>(
        &'a self,
        bucket_id: &'a str,
        query: &'a ListUploadsQuery,
    ) -> StoreFuture<'a, ListUploadsResult> {
        Box::pin(async move {
            let conn = self.lock()?;
            let fetch_limit = query.max_uploads as i64 + 1;
            let mut stmt = conn.prepare(&format!(
                "SELECT {UPLOAD_COLUMNS} FROM multipart_uploads
                 WHERE bucket_id = ?1 AND is_completed = 0 AND is_aborted = 0
                   AND substr(key, 1, ?2) = ?3
                   AND (?4 = '' OR key > ?4 OR (key = ?4 AND ?5 <> '' AND upload_id > ?5))
                 ORDER BY key, upload_id
                 LIMIT ?6"
            ))?;
            let mut uploads = stmt
                .query_map(
                    params![
                        bucket_id,
                        query.prefix.chars().count() as i64,
                        query.prefix,
                        query.key_marker,
                        query.upload_id_marker,
                        fetch_limit
                    ],
                    map_upload_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;

            let is_truncated = uploads.len() > query.max_uploads as usize;
            if is_truncated {
                uploads.truncate(query.max_uploads as usize);
            }
            let (next_key_marker, next_upload_id_marker) = match uploads.last() {
                Some(last) if is_truncated => {
                    (Some(last.key.clone()), Some(last.upload_id.clone()))
                }
                _ => (None, None),
            };

            Ok(ListUploadsResult {
                uploads,
                is_truncated,
                next_key_marker,
                next_upload_id_marker,
            })
        })
    }

    fn reap_expired_uploads(&self, ttl_seconds: u64) -> StoreFuture<'_, Vec<ReapedUpload>> {
        Box::pin(async move {
            let cutoff = super::timestamp_before(ttl_seconds);
            let conn = self.lock()?;
            let tx = conn.unchecked_transaction()?;

            let expired: Vec<ReapedUpload> = {
                let mut stmt = tx.prepare(
                    "SELECT upload_id, bucket_id, key FROM multipart_uploads
                     WHERE is_completed = 0 AND is_aborted = 0 AND initiated_at < ?1",
                )?;
                let rows = stmt
                    .query_map(params![cutoff], |row| {
                        Ok(ReapedUpload {
                            upload_id: row.get(0)?,
                            bucket_id: row.get(1)?,
                            key: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            for upload in &expired {
                tx.execute(
                    "UPDATE multipart_uploads SET is_aborted = 1 WHERE upload_id = ?1",
                    params![upload.upload_id],
                )?;
                tx.execute(
                    "DELETE FROM multipart_parts WHERE upload_id = ?1",
                    params![upload.upload_id],
                )?;
            }

            tx.commit()?;
            Ok(expired)
        })
    }
}

/// Map an object row whose columns start at index 1 (index 0 is the rowid).
fn shifted_object_row(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    let size: i64 = row.get(4)?;
    let metadata: String = row.get(12)?;
    let is_latest: i32 = row.get(14)?;
    let is_deleted: i32 = row.get(15)?;
    Ok(ObjectRecord {
        bucket_id: row.get(1)?,
        key: row.get(2)?,
        version_id: row.get(3)?,
        size: size.max(0) as u64,
        etag: row.get(5)?,
        md5: row.get(6)?,
        content_type: row.get(7)?,
        content_encoding: row.get(8)?,
        content_disposition: row.get(9)?,
        cache_control: row.get(10)?,
        storage_class: row.get(11)?,
        metadata: CustomMetadata::from_json(&metadata),
        last_modified: row.get(13)?,
        is_latest: is_latest != 0,
        is_deleted: is_deleted != 0,
        blob_path: row.get(16)?,
    })
}

// ── Tests ───────────────────────────────────────────────────────────
