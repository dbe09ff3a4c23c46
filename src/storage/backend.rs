//! Abstract blob storage trait.
//!
//! The blob store only moves bytes: it never decides whether an object
//! exists (the metadata repository does).  Every write goes through a
//! temp file that is hashed while streaming and renamed into place.

use bytes::Bytes;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use thiserror::Error;

/// Stream of body chunks, as produced by a request body or a blob read.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// Boxed future returned by [`StorageBackend`] methods.
pub type BlobFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BlobError>> + Send + 'a>>;

/// Errors from the blob store.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("content-md5 does not match the received bytes")]
    DigestMismatch,

    #[error("x-amz-content-sha256 does not match the received bytes")]
    PayloadHashMismatch,

    #[error("expected {expected} bytes but received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("body exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("invalid blob path: {0}")]
    InvalidPath(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Marker placed inside an `io::Error` by body streams whose SHA-256 does
/// not match the signed payload hash.  Writers surface it as
/// [`BlobError::PayloadHashMismatch`].
#[derive(Debug)]
pub struct PayloadHashMismatch;

impl fmt::Display for PayloadHashMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("payload hash mismatch")
    }
}

impl std::error::Error for PayloadHashMismatch {}

impl PayloadHashMismatch {
    pub fn into_io_error(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }

    pub fn is_cause_of(err: &io::Error) -> bool {
        err.get_ref().map_or(false, |inner| inner.is::<PayloadHashMismatch>())
    }
}

/// Checks applied to a body while it is written.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteLimits {
    /// Decoded `Content-MD5`; a mismatch discards the write.
    pub expected_md5: Option<[u8; 16]>,
    /// Declared `Content-Length`; a short or long body discards the write.
    pub expected_size: Option<u64>,
    /// Hard cap; exceeding it aborts streaming immediately.
    pub max_size: Option<u64>,
}

/// Size and digest of a blob that was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBlob {
    pub size: u64,
    pub md5: [u8; 16],
}

impl StoredBlob {
    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }

    /// Quoted single-part ETag.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.md5_hex())
    }
}

/// Inclusive byte range `first..=last` of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub first: u64,
    pub last: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }
}

/// Async blob storage contract.
///
/// Paths are relative to the store root, as built by
/// [`object_blob_path`](super::object_blob_path) and
/// [`version_blob_path`](super::version_blob_path).
pub trait StorageBackend: Send + Sync + 'static {
    /// Create the directory for a bucket volume.
    fn create_volume<'a>(&'a self, volume: &'a str) -> BlobFuture<'a, ()>;

    /// Remove a bucket volume and everything under it.
    fn delete_volume<'a>(&'a self, volume: &'a str) -> BlobFuture<'a, ()>;

    /// Stream `body` into a temp file, verify it against `limits`, then
    /// atomically rename it to `path`.
    fn write<'a>(&'a self, path: &'a str, body: ByteStream, limits: WriteLimits)
        -> BlobFuture<'a, StoredBlob>;

    /// Open `path` for streaming, optionally restricted to `range`.
    fn read<'a>(&'a self, path: &'a str, range: Option<ByteRange>) -> BlobFuture<'a, ByteStream>;

    /// Delete `path`.  Missing blobs are not an error.
    fn delete<'a>(&'a self, path: &'a str) -> BlobFuture<'a, ()>;

    /// Copy `src` (or a range of it) to `dst` through the temp-file path.
    fn copy<'a>(
        &'a self,
        src: &'a str,
        range: Option<ByteRange>,
        dst: &'a str,
    ) -> BlobFuture<'a, StoredBlob>;

    /// Stream one multipart part into its per-upload slot.  Each upload of
    /// a part number is kept apart by its digest, so a re-upload never
    /// changes the bytes behind an ETag already recorded.
    fn put_part<'a>(
        &'a self,
        upload_id: &'a str,
        part_number: u32,
        body: ByteStream,
        limits: WriteLimits,
    ) -> BlobFuture<'a, StoredBlob>;

    /// Concatenate parts, given as part number and the ETag `put_part`
    /// returned, in order into `dst`.  The returned digest covers the
    /// whole assembled body.
    fn assemble_parts<'a>(
        &'a self,
        upload_id: &'a str,
        parts: &'a [(u32, String)],
        dst: &'a str,
    ) -> BlobFuture<'a, StoredBlob>;

    /// Delete all part files for an upload.  Idempotent.
    fn delete_parts<'a>(&'a self, upload_id: &'a str) -> BlobFuture<'a, ()>;

    /// Remove temp files left behind by a previous process.  Returns how
    /// many were removed.
    fn cleanup_temp(&self) -> BlobFuture<'_, usize>;
}
