//! Local filesystem blob store.
//!
//! Layout under the root directory:
//!
//! ```text
//! {volume}/s{segment}.../@{id}  null-version object bodies
//! .versions/{volume}/{id}       bodies of versioned writes
//! .multipart/{upload_id}/{n}-{md5}  uploaded parts
//! .tmp/tmp-{uuid}               in-flight writes
//! ```
//!
//! All writes follow crash-only design: stream to a temp file while
//! hashing, fsync, rename.  A temp file is removed when its write fails
//! or the writing future is dropped.

use futures::StreamExt;
use md5::{Digest, Md5};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::backend::{
    BlobError, BlobFuture, ByteRange, ByteStream, PayloadHashMismatch, StorageBackend, StoredBlob,
    WriteLimits,
};
use super::VERSIONS_DIR;

const TMP_DIR: &str = ".tmp";
const MULTIPART_DIR: &str = ".multipart";
const COPY_BUFFER: usize = 64 * 1024;

/// Temp file that deletes itself unless persisted.
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    async fn persist(mut self, dst: &Path) -> io::Result<()> {
        if let Err(err) = fs::rename(&self.path, dst).await {
            // A concurrent delete may have pruned the parent directory.
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err);
            }
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&self.path, dst).await?;
        }
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn stream_error(err: io::Error) -> BlobError {
    if PayloadHashMismatch::is_cause_of(&err) {
        BlobError::PayloadHashMismatch
    } else {
        BlobError::Io(err)
    }
}

/// Stores blobs on the local filesystem.
pub struct LocalBackend {
    /// Root directory for all stored blobs.
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`, creating the
    /// directory skeleton if needed.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        for dir in [TMP_DIR, MULTIPART_DIR, VERSIONS_DIR] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative blob path, rejecting anything that could step
    /// outside the root or collapse onto a directory.
    fn resolve(&self, rel: &str) -> Result<PathBuf, BlobError> {
        let valid = !rel.is_empty()
            && rel
                .split('/')
                .all(|seg| !seg.is_empty() && seg != "." && seg != ".." && !seg.contains('\0'));
        if !valid {
            return Err(BlobError::InvalidPath(rel.to_string()));
        }
        Ok(self.root.join(rel))
    }

    /// A blob cannot land on an existing directory or below an existing file.
    fn check_placement(&self, rel: &str, path: &Path) -> Result<(), BlobError> {
        if path.is_dir() {
            return Err(BlobError::InvalidPath(rel.to_string()));
        }
        let blocked = path
            .ancestors()
            .skip(1)
            .take_while(|a| *a != self.root)
            .any(|a| a.is_file());
        if blocked {
            return Err(BlobError::InvalidPath(rel.to_string()));
        }
        Ok(())
    }

    fn part_dir(&self, upload_id: &str) -> Result<PathBuf, BlobError> {
        if upload_id.is_empty() || upload_id.contains(['/', '\\', '.']) {
            return Err(BlobError::InvalidPath(upload_id.to_string()));
        }
        Ok(self.root.join(MULTIPART_DIR).join(upload_id))
    }

    /// File holding the upload of part `part_number` whose ETag is `etag`.
    fn part_path(&self, upload_id: &str, part_number: u32, etag: &str) -> Result<PathBuf, BlobError> {
        let md5 = etag.trim_matches('"');
        if md5.is_empty() || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BlobError::InvalidPath(format!("{upload_id}/{part_number}")));
        }
        Ok(self.part_dir(upload_id)?.join(format!("{part_number}-{md5}")))
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(TMP_DIR)
            .join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    /// Stream `body` into a fresh temp file, enforcing `limits`.
    async fn stream_to_temp(
        &self,
        mut body: ByteStream,
        limits: WriteLimits,
    ) -> Result<(TempFile, StoredBlob), BlobError> {
        let temp = TempFile::new(self.temp_path());
        let mut file = fs::File::create(&temp.path).await?;
        let mut hasher = Md5::new();
        let mut size: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(stream_error)?;
            size += chunk.len() as u64;
            if let Some(limit) = limits.max_size {
                if size > limit {
                    return Err(BlobError::TooLarge { limit });
                }
            }
            if let Some(expected) = limits.expected_size {
                if size > expected {
                    return Err(BlobError::SizeMismatch {
                        expected,
                        actual: size,
                    });
                }
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = limits.expected_size {
            if size != expected {
                return Err(BlobError::SizeMismatch {
                    expected,
                    actual: size,
                });
            }
        }

        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&hasher.finalize());
        if let Some(expected) = limits.expected_md5 {
            if expected != md5 {
                return Err(BlobError::DigestMismatch);
            }
        }

        Ok((temp, StoredBlob { size, md5 }))
    }

    /// Move a finished temp file to `rel`, creating parent directories.
    async fn commit(&self, temp: TempFile, rel: &str, path: &Path) -> Result<(), BlobError> {
        self.check_placement(rel, path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|_| BlobError::InvalidPath(rel.to_string()))?;
        }
        temp.persist(path).await?;
        Ok(())
    }

    /// Remove now-empty directories between `path` and its volume root.
    async fn prune_empty_dirs(&self, rel: &str, path: &Path) {
        let Some(first) = rel.split('/').next() else {
            return;
        };
        if first == VERSIONS_DIR {
            return;
        }
        let stop = self.root.join(first);
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == stop || !d.starts_with(&stop) {
                break;
            }
            if fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

impl StorageBackend for LocalBackend {
    fn create_volume<'a>(&'a self, volume: &'a str) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            let path = self.resolve(volume)?;
            fs::create_dir_all(&path).await?;
            Ok(())
        })
    }

    fn delete_volume<'a>(&'a self, volume: &'a str) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            let path = self.resolve(volume)?;
            let versions = self.root.join(VERSIONS_DIR).join(volume);
            for dir in [path, versions] {
                match fs::remove_dir_all(&dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
    }

    fn write<'a>(
        &'a self,
        path: &'a str,
        body: ByteStream,
        limits: WriteLimits,
    ) -> BlobFuture<'a, StoredBlob> {
        Box::pin(async move {
            let final_path = self.resolve(path)?;
            self.check_placement(path, &final_path)?;
            let (temp, blob) = self.stream_to_temp(body, limits).await?;
            self.commit(temp, path, &final_path).await?;
            debug!(path, size = blob.size, "blob written");
            Ok(blob)
        })
    }

    fn read<'a>(&'a self, path: &'a str, range: Option<ByteRange>) -> BlobFuture<'a, ByteStream> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            let mut file = match fs::File::open(&full).await {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(BlobError::NotFound(path.to_string()))
                }
                Err(e) => return Err(e.into()),
            };
            let stream: ByteStream = match range {
                Some(r) => {
                    file.seek(SeekFrom::Start(r.first)).await?;
                    Box::pin(ReaderStream::with_capacity(file.take(r.len()), COPY_BUFFER))
                }
                None => Box::pin(ReaderStream::with_capacity(file, COPY_BUFFER)),
            };
            Ok(stream)
        })
    }

    fn delete<'a>(&'a self, path: &'a str) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            match fs::remove_file(&full).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            self.prune_empty_dirs(path, &full).await;
            Ok(())
        })
    }

    fn copy<'a>(
        &'a self,
        src: &'a str,
        range: Option<ByteRange>,
        dst: &'a str,
    ) -> BlobFuture<'a, StoredBlob> {
        Box::pin(async move {
            let body = self.read(src, range).await?;
            self.write(dst, body, WriteLimits::default()).await
        })
    }

    fn put_part<'a>(
        &'a self,
        upload_id: &'a str,
        part_number: u32,
        body: ByteStream,
        limits: WriteLimits,
    ) -> BlobFuture<'a, StoredBlob> {
        Box::pin(async move {
            let dir = self.part_dir(upload_id)?;
            let (temp, blob) = self.stream_to_temp(body, limits).await?;
            fs::create_dir_all(&dir).await?;
            let path = self.part_path(upload_id, part_number, &blob.md5_hex())?;
            temp.persist(&path).await?;
            debug!(upload_id, part_number, size = blob.size, "part written");
            Ok(blob)
        })
    }

    fn assemble_parts<'a>(
        &'a self,
        upload_id: &'a str,
        parts: &'a [(u32, String)],
        dst: &'a str,
    ) -> BlobFuture<'a, StoredBlob> {
        Box::pin(async move {
            let final_path = self.resolve(dst)?;
            self.check_placement(dst, &final_path)?;

            let temp = TempFile::new(self.temp_path());
            let mut out = fs::File::create(&temp.path).await?;
            let mut hasher = Md5::new();
            let mut size: u64 = 0;
            let mut buf = vec![0u8; COPY_BUFFER];

            for (part_number, etag) in parts {
                let part_path = self.part_path(upload_id, *part_number, etag)?;
                let mut part = match fs::File::open(&part_path).await {
                    Ok(f) => f,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(BlobError::NotFound(format!("{upload_id}/{part_number}")))
                    }
                    Err(e) => return Err(e.into()),
                };
                loop {
                    let n = part.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    out.write_all(&buf[..n]).await?;
                    size += n as u64;
                }
            }

            out.flush().await?;
            out.sync_all().await?;
            drop(out);

            self.commit(temp, dst, &final_path).await?;
            let mut md5 = [0u8; 16];
            md5.copy_from_slice(&hasher.finalize());
            debug!(upload_id, parts = parts.len(), size, "parts assembled");
            Ok(StoredBlob { size, md5 })
        })
    }

    fn delete_parts<'a>(&'a self, upload_id: &'a str) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            let dir = self.part_dir(upload_id)?;
            match fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn cleanup_temp(&self) -> BlobFuture<'_, usize> {
        Box::pin(async move {
            let dir = self.root.join(TMP_DIR);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e.into()),
            };
            let mut removed = 0;
            while let Some(entry) = entries.next_entry().await? {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove temp file"),
                }
            }
            Ok(removed)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::object_blob_path;
    use bytes::Bytes;
    use futures::stream;
    use std::time::Duration;

    fn test_backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let backend = LocalBackend::new(dir.path()).expect("failed to create backend");
        (dir, backend)
    }

    fn body(chunks: &[&'static str]) -> ByteStream {
        let items: Vec<io::Result<Bytes>> = chunks.iter().map(|c| Ok(Bytes::from(*c))).collect();
        Box::pin(stream::iter(items))
    }

    async fn collect(mut s: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = s.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    fn temp_entries(backend: &LocalBackend) -> usize {
        std::fs::read_dir(backend.root().join(TMP_DIR)).unwrap().count()
    }

    fn md5_of(data: &[u8]) -> [u8; 16] {
        let mut out = [0u8; 16];
        out.copy_from_slice(&Md5::digest(data));
        out
    }

    #[tokio::test]
    async fn test_write_and_read_roundtrip() {
        let (_dir, backend) = test_backend();
        backend.create_volume("vol").await.unwrap();

        let blob = backend
            .write("vol/a/b/key.txt", body(&["hello ", "world"]), WriteLimits::default())
            .await
            .unwrap();
        assert_eq!(blob.size, 11);
        assert_eq!(blob.md5, md5_of(b"hello world"));
        assert_eq!(blob.etag(), format!("\"{}\"", hex::encode(md5_of(b"hello world"))));

        let data = collect(backend.read("vol/a/b/key.txt", None).await.unwrap()).await;
        assert_eq!(data, b"hello world");
        assert_eq!(temp_entries(&backend), 0);
    }

    #[tokio::test]
    async fn test_range_read() {
        let (_dir, backend) = test_backend();
        backend
            .write("vol/k", body(&["0123456789"]), WriteLimits::default())
            .await
            .unwrap();
        let range = ByteRange { first: 2, last: 5 };
        let data = collect(backend.read("vol/k", Some(range)).await.unwrap()).await;
        assert_eq!(data, b"2345");
    }

    #[tokio::test]
    async fn test_digest_mismatch_discards_temp() {
        let (_dir, backend) = test_backend();
        let limits = WriteLimits {
            expected_md5: Some([0u8; 16]),
            ..Default::default()
        };
        let err = backend.write("vol/k", body(&["data"]), limits).await;
        assert!(matches!(err, Err(BlobError::DigestMismatch)));
        assert_eq!(temp_entries(&backend), 0);
        assert!(matches!(
            backend.read("vol/k", None).await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_short_body_is_size_mismatch() {
        let (_dir, backend) = test_backend();
        let limits = WriteLimits {
            expected_size: Some(10),
            ..Default::default()
        };
        let err = backend.write("vol/k", body(&["abc"]), limits).await;
        assert!(matches!(
            err,
            Err(BlobError::SizeMismatch {
                expected: 10,
                actual: 3
            })
        ));
        assert_eq!(temp_entries(&backend), 0);
    }

    #[tokio::test]
    async fn test_max_size_aborts_stream() {
        let (_dir, backend) = test_backend();
        let limits = WriteLimits {
            max_size: Some(4),
            ..Default::default()
        };
        let err = backend.write("vol/k", body(&["abc", "def"]), limits).await;
        assert!(matches!(err, Err(BlobError::TooLarge { limit: 4 })));
        assert_eq!(temp_entries(&backend), 0);
    }

    #[tokio::test]
    async fn test_payload_hash_marker_is_recognized() {
        let (_dir, backend) = test_backend();
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(PayloadHashMismatch.into_io_error()),
        ];
        let err = backend
            .write("vol/k", Box::pin(stream::iter(items)), WriteLimits::default())
            .await;
        assert!(matches!(err, Err(BlobError::PayloadHashMismatch)));
        assert_eq!(temp_entries(&backend), 0);
    }

    #[tokio::test]
    async fn test_cancelled_write_removes_temp() {
        let (_dir, backend) = test_backend();
        let slow: ByteStream = Box::pin(
            stream::iter(vec![Ok(Bytes::from_static(b"partial"))]).chain(stream::pending()),
        );
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            backend.write("vol/k", slow, WriteLimits::default()),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(temp_entries(&backend), 0);
    }

    #[tokio::test]
    async fn test_rejects_traversal_and_empty_segments() {
        let (_dir, backend) = test_backend();
        for bad in ["vol/../escape", "vol//k", "vol/./k", "vol/k/"] {
            let err = backend.write(bad, body(&["x"]), WriteLimits::default()).await;
            assert!(matches!(err, Err(BlobError::InvalidPath(_))), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_file_directory_collision_is_invalid_path() {
        let (_dir, backend) = test_backend();
        backend
            .write("vol/a", body(&["x"]), WriteLimits::default())
            .await
            .unwrap();
        let err = backend.write("vol/a/b", body(&["y"]), WriteLimits::default()).await;
        assert!(matches!(err, Err(BlobError::InvalidPath(_))));

        backend
            .write("vol/d/e", body(&["x"]), WriteLimits::default())
            .await
            .unwrap();
        let err = backend.write("vol/d", body(&["y"]), WriteLimits::default()).await;
        assert!(matches!(err, Err(BlobError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_prunes_dirs() {
        let (dir, backend) = test_backend();
        backend.create_volume("vol").await.unwrap();
        backend
            .write("vol/x/y/z", body(&["x"]), WriteLimits::default())
            .await
            .unwrap();
        backend.delete("vol/x/y/z").await.unwrap();
        backend.delete("vol/x/y/z").await.unwrap();
        assert!(!dir.path().join("vol/x").exists());
        assert!(dir.path().join("vol").exists());
    }

    #[tokio::test]
    async fn test_copy_range() {
        let (_dir, backend) = test_backend();
        backend
            .write("vol/src", body(&["abcdef"]), WriteLimits::default())
            .await
            .unwrap();
        let blob = backend
            .copy("vol/src", Some(ByteRange { first: 1, last: 3 }), "vol/dst")
            .await
            .unwrap();
        assert_eq!(blob.size, 3);
        let data = collect(backend.read("vol/dst", None).await.unwrap()).await;
        assert_eq!(data, b"bcd");
    }

    #[tokio::test]
    async fn test_parts_assemble_in_order() {
        let (dir, backend) = test_backend();
        let world = backend
            .put_part("up1", 2, body(&["world"]), WriteLimits::default())
            .await
            .unwrap();
        let stale = backend
            .put_part("up1", 1, body(&["stale"]), WriteLimits::default())
            .await
            .unwrap();
        let hello = backend
            .put_part("up1", 1, body(&["hello "]), WriteLimits::default())
            .await
            .unwrap();

        let parts = [(1, hello.etag()), (2, world.etag())];
        let blob = backend
            .assemble_parts("up1", &parts, "vol/final")
            .await
            .unwrap();
        assert_eq!(blob.size, 11);
        assert_eq!(blob.md5, md5_of(b"hello world"));

        // The earlier upload of part 1 is still addressable by its ETag.
        let old = backend
            .assemble_parts("up1", &[(1, stale.etag())], "vol/old")
            .await
            .unwrap();
        assert_eq!(old.md5, md5_of(b"stale"));

        backend.delete_parts("up1").await.unwrap();
        backend.delete_parts("up1").await.unwrap();
        assert!(!dir.path().join(MULTIPART_DIR).join("up1").exists());
    }

    #[tokio::test]
    async fn test_assemble_missing_part_fails() {
        let (_dir, backend) = test_backend();
        let one = backend
            .put_part("up1", 1, body(&["x"]), WriteLimits::default())
            .await
            .unwrap();
        let parts = [(1, one.etag()), (2, one.etag())];
        let err = backend.assemble_parts("up1", &parts, "vol/final").await;
        assert!(matches!(err, Err(BlobError::NotFound(_))));
        assert_eq!(temp_entries(&backend), 0);

        let bogus = [(1, "\"../../etc\"".to_string())];
        let err = backend.assemble_parts("up1", &bogus, "vol/final").await;
        assert!(matches!(err, Err(BlobError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_folder_marker_and_nested_keys_coexist() {
        let (_dir, backend) = test_backend();
        let paths = [
            object_blob_path("vol", "photos/", "w1"),
            object_blob_path("vol", "photos/cat.jpg", "w2"),
            object_blob_path("vol", "a", "w3"),
            object_blob_path("vol", "a/b", "w4"),
            object_blob_path("vol", "a//b", "w5"),
        ];
        for (i, path) in paths.iter().enumerate() {
            let chunk: io::Result<Bytes> = Ok(Bytes::from(format!("body{i}")));
            let data: ByteStream = Box::pin(stream::iter(vec![chunk]));
            backend.write(path, data, WriteLimits::default()).await.unwrap();
        }
        for (i, path) in paths.iter().enumerate() {
            let data = collect(backend.read(path, None).await.unwrap()).await;
            assert_eq!(data, format!("body{i}").into_bytes());
        }

        // Removing the marker leaves the objects below it.
        backend.delete(&paths[0]).await.unwrap();
        let data = collect(backend.read(&paths[1], None).await.unwrap()).await;
        assert_eq!(data, b"body1");
    }

    #[tokio::test]
    async fn test_cleanup_temp_and_delete_volume() {
        let (dir, backend) = test_backend();
        std::fs::write(dir.path().join(TMP_DIR).join("tmp-orphan"), b"x").unwrap();
        assert_eq!(backend.cleanup_temp().await.unwrap(), 1);

        backend
            .write("vol/k", body(&["x"]), WriteLimits::default())
            .await
            .unwrap();
        backend
            .write(".versions/vol/v1", body(&["x"]), WriteLimits::default())
            .await
            .unwrap();
        backend.delete_volume("vol").await.unwrap();
        assert!(!dir.path().join("vol").exists());
        assert!(!dir.path().join(VERSIONS_DIR).join("vol").exists());
        backend.delete_volume("vol").await.unwrap();
    }
}
