//! Multipart upload state machine.
//!
//! An upload moves `Initiated -> Completed` or `Initiated -> Aborted`.
//! Parts are streamed into per-upload slots by the blob store and recorded
//! in the repository; completion validates the requested part list,
//! assembles the final blob and commits the object row in one repository
//! transaction that re-checks every part.

use md5::{Digest, Md5};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::Identity;
use crate::errors::S3Error;
use crate::metadata::store::{
    BucketRecord, ListPartsResult, ListUploadsQuery, MetadataError, MetadataStore,
    MultipartUploadRecord, PartRecord, UploadState,
};
use crate::metadata::timestamp_now;
use crate::service::{
    discard_blob, ensure_quota, release_replaced, strip_quotes, ObjectAttributes, Placement,
};
use crate::storage::backend::{ByteStream, StorageBackend, WriteLimits};

/// Highest part number S3 accepts.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Default page size for ListParts.
pub const DEFAULT_MAX_PARTS: u32 = 1000;

/// Object created by completing an upload.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub version_id: Option<String>,
}

/// Composite ETag: MD5 over the concatenated binary part digests,
/// suffixed with the part count.
pub fn multipart_etag<'a>(part_etags: impl IntoIterator<Item = &'a str>) -> Result<String, S3Error> {
    let mut hasher = Md5::new();
    let mut count = 0usize;
    for etag in part_etags {
        let digest = hex::decode(strip_quotes(etag)).map_err(|_| S3Error::InvalidPart {
            message: format!("part ETag {etag} is not an MD5 digest"),
        })?;
        hasher.update(&digest);
        count += 1;
    }
    Ok(format!("\"{}-{count}\"", hex::encode(hasher.finalize())))
}

fn check_part_number(part_number: u32) -> Result<(), S3Error> {
    if (1..=MAX_PART_NUMBER).contains(&part_number) {
        Ok(())
    } else {
        Err(S3Error::InvalidArgument {
            message: format!(
                "Part number must be an integer between 1 and {MAX_PART_NUMBER}, inclusive"
            ),
        })
    }
}

/// Drives uploads against the repository and blob store.
pub struct MultipartAssembler {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageBackend>,
    min_part_size: u64,
    max_object_size: u64,
}

impl MultipartAssembler {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageBackend>,
        min_part_size: u64,
        max_object_size: u64,
    ) -> Self {
        Self {
            metadata,
            storage,
            min_part_size,
            max_object_size,
        }
    }

    pub async fn initiate(
        &self,
        bucket: &BucketRecord,
        key: &str,
        initiator: &Identity,
        attributes: ObjectAttributes,
    ) -> Result<MultipartUploadRecord, S3Error> {
        let record = MultipartUploadRecord {
            upload_id: uuid::Uuid::new_v4().simple().to_string(),
            bucket_id: bucket.id.clone(),
            key: key.to_string(),
            content_type: attributes.resolved_content_type(),
            storage_class: attributes.resolved_storage_class()?,
            content_encoding: attributes.content_encoding,
            content_disposition: attributes.content_disposition,
            cache_control: attributes.cache_control,
            metadata: attributes.metadata,
            owner_id: initiator.owner_id.clone(),
            owner_display: initiator.display_name.clone(),
            initiated_at: timestamp_now(),
            state: UploadState::Initiated,
        };
        self.metadata.create_multipart_upload(record.clone()).await?;
        debug!(bucket = %bucket.name, key, upload_id = %record.upload_id, "upload initiated");
        Ok(record)
    }

    /// Look up an upload of `bucket`, checking `key` when given.  Completed
    /// and aborted uploads are reported as missing.
    pub async fn find_upload(
        &self,
        bucket: &BucketRecord,
        key: Option<&str>,
        upload_id: &str,
    ) -> Result<MultipartUploadRecord, S3Error> {
        self.lookup(bucket, key, upload_id, UploadState::accepts_parts)
            .await
    }

    /// Like [`find_upload`](Self::find_upload), but an aborted upload is
    /// still found so that aborting it again succeeds.
    pub async fn find_abortable(
        &self,
        bucket: &BucketRecord,
        key: Option<&str>,
        upload_id: &str,
    ) -> Result<MultipartUploadRecord, S3Error> {
        self.lookup(bucket, key, upload_id, |state| {
            !matches!(state, UploadState::Completed)
        })
        .await
    }

    async fn lookup(
        &self,
        bucket: &BucketRecord,
        key: Option<&str>,
        upload_id: &str,
        visible: fn(&UploadState) -> bool,
    ) -> Result<MultipartUploadRecord, S3Error> {
        let missing = || S3Error::NoSuchUpload {
            upload_id: upload_id.to_string(),
        };
        let upload = self
            .metadata
            .get_multipart_upload(upload_id)
            .await?
            .ok_or_else(missing)?;
        let key_matches = key.map_or(true, |k| k == upload.key);
        if upload.bucket_id != bucket.id || !key_matches || !visible(&upload.state) {
            return Err(missing());
        }
        Ok(upload)
    }

    /// Store one part.  A part re-uploaded under the same number replaces
    /// the earlier one.
    pub async fn upload_part(
        &self,
        bucket: &BucketRecord,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: ByteStream,
        limits: WriteLimits,
    ) -> Result<PartRecord, S3Error> {
        check_part_number(part_number)?;
        self.find_upload(bucket, Some(key), upload_id).await?;

        let blob = self
            .storage
            .put_part(upload_id, part_number, body, limits)
            .await?;
        let part = PartRecord {
            part_number,
            size: blob.size,
            etag: blob.etag(),
            last_modified: timestamp_now(),
        };

        match self.metadata.upsert_part(upload_id, part.clone()).await {
            Ok(()) => {}
            Err(MetadataError::UploadClosed(_)) => {
                // Aborted while the part was streaming.
                if let Err(e) = self.storage.delete_parts(upload_id).await {
                    warn!(upload_id, "failed to remove parts of closed upload: {e}");
                }
                return Err(S3Error::NoSuchUpload {
                    upload_id: upload_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        debug!(upload_id, part_number, size = part.size, "part stored");
        Ok(part)
    }

    /// Validate the requested part list against what was uploaded and
    /// return the stored parts in request order.
    fn select_parts(
        &self,
        requested: &[(u32, String)],
        stored: &[PartRecord],
    ) -> Result<Vec<PartRecord>, S3Error> {
        let mut previous = 0u32;
        let mut selected = Vec::with_capacity(requested.len());
        for (part_number, etag) in requested {
            if *part_number <= previous {
                return Err(S3Error::InvalidPartOrder);
            }
            check_part_number(*part_number)?;
            previous = *part_number;

            let part = stored
                .iter()
                .find(|p| p.part_number == *part_number)
                .filter(|p| strip_quotes(&p.etag) == strip_quotes(etag))
                .ok_or_else(|| S3Error::InvalidPart {
                    message: format!(
                        "One or more of the specified parts could not be found. Part {part_number} with ETag {etag}"
                    ),
                })?;
            selected.push(part.clone());
        }

        if let Some((_, head)) = selected.split_last() {
            if head.iter().any(|p| p.size < self.min_part_size) {
                return Err(S3Error::EntityTooSmall);
            }
        }
        Ok(selected)
    }

    pub async fn complete(
        &self,
        bucket: &BucketRecord,
        key: &str,
        upload_id: &str,
        requested: &[(u32, String)],
    ) -> Result<CompletedUpload, S3Error> {
        if requested.is_empty() {
            return Err(S3Error::MalformedXML);
        }
        let upload = self.find_upload(bucket, Some(key), upload_id).await?;
        let stored = self.metadata.get_parts(upload_id).await?;
        let parts = self.select_parts(requested, &stored)?;

        let total: u64 = parts.iter().map(|p| p.size).sum();
        if total > self.max_object_size {
            return Err(S3Error::EntityTooLarge);
        }
        ensure_quota(self.metadata.as_ref(), &bucket.owner_id, total).await?;

        let etag = multipart_etag(parts.iter().map(|p| p.etag.as_str()))?;
        let placement = Placement::for_write(bucket, key);
        let checked: Vec<(u32, String)> = parts
            .iter()
            .map(|p| (p.part_number, p.etag.clone()))
            .collect();
        let blob = self
            .storage
            .assemble_parts(upload_id, &checked, &placement.blob_path)
            .await?;

        let blob_path = placement.blob_path.clone();
        let record = ObjectAttributes::from_upload(&upload).into_record(
            placement,
            bucket,
            key,
            &blob,
            etag.clone(),
        )?;

        let outcome = match self
            .metadata
            .complete_multipart_upload(upload_id, &checked, record, bucket.versioning_enabled())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                discard_blob(self.storage.as_ref(), &blob_path).await;
                return Err(e.into());
            }
        };

        release_replaced(self.storage.as_ref(), &outcome).await;
        if let Err(e) = self.storage.delete_parts(upload_id).await {
            warn!(upload_id, "failed to remove assembled parts: {e}");
        }
        info!(
            bucket = %bucket.name,
            key,
            upload_id,
            parts = parts.len(),
            size = blob.size,
            "multipart upload completed"
        );
        Ok(CompletedUpload {
            bucket: bucket.name.clone(),
            key: key.to_string(),
            etag,
            version_id: outcome.version_id,
        })
    }

    /// Abort an upload and drop its part files.  An upload that is
    /// already aborted is left as is.
    pub async fn abort(&self, upload: &MultipartUploadRecord) -> Result<(), S3Error> {
        if upload.state == UploadState::Aborted {
            debug!(upload_id = %upload.upload_id, "upload already aborted");
            return Ok(());
        }
        self.metadata
            .abort_multipart_upload(&upload.upload_id)
            .await?;
        if let Err(e) = self.storage.delete_parts(&upload.upload_id).await {
            warn!(upload_id = %upload.upload_id, "failed to remove aborted parts: {e}");
        }
        debug!(upload_id = %upload.upload_id, "upload aborted");
        Ok(())
    }

    pub async fn list_parts(
        &self,
        bucket: &BucketRecord,
        key: &str,
        upload_id: &str,
        max_parts: u32,
        part_number_marker: u32,
    ) -> Result<(MultipartUploadRecord, ListPartsResult), S3Error> {
        let upload = self.find_upload(bucket, Some(key), upload_id).await?;
        let max_parts = max_parts.clamp(1, DEFAULT_MAX_PARTS);
        let parts = self
            .metadata
            .list_parts(upload_id, max_parts, part_number_marker)
            .await?;
        Ok((upload, parts))
    }

    /// Every in-progress upload id of a bucket, across all pages.
    pub async fn in_progress_upload_ids(&self, bucket: &BucketRecord) -> Result<Vec<String>, S3Error> {
        let mut ids = Vec::new();
        let mut query = ListUploadsQuery {
            max_uploads: 1000,
            ..ListUploadsQuery::default()
        };
        loop {
            let page = self
                .metadata
                .list_multipart_uploads(&bucket.id, &query)
                .await?;
            ids.extend(page.uploads.into_iter().map(|u| u.upload_id));
            match (page.is_truncated, page.next_key_marker, page.next_upload_id_marker) {
                (true, Some(key), Some(upload_id)) => {
                    query.key_marker = key;
                    query.upload_id_marker = upload_id;
                }
                _ => break,
            }
        }
        Ok(ids)
    }

    /// Abort uploads older than `ttl_seconds` and drop their part files.
    pub async fn reap_expired(&self, ttl_seconds: u64) -> Result<usize, S3Error> {
        let reaped = self.metadata.reap_expired_uploads(ttl_seconds).await?;
        for upload in &reaped {
            if let Err(e) = self.storage.delete_parts(&upload.upload_id).await {
                warn!(upload_id = %upload.upload_id, "failed to remove expired parts: {e}");
            }
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "expired multipart uploads reaped");
        }
        Ok(reaped.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::{body, owner, read_all, test_gateway, test_gateway_with};
    use crate::service::Preconditions;

    #[test]
    fn test_multipart_etag_hashes_binary_digests() {
        // md5("a") and md5("b") as part ETags.
        let parts = [
            "\"0cc175b9c0f1b6a831c399e269772661\"",
            "\"92eb5ffee6ae2fec3ad71c777531578f\"",
        ];
        let mut concat = Vec::new();
        for p in &parts {
            concat.extend(hex::decode(strip_quotes(p)).unwrap());
        }
        let expected = format!("\"{}-2\"", hex::encode(Md5::digest(&concat)));
        assert_eq!(multipart_etag(parts).unwrap(), expected);
        assert!(multipart_etag(["\"zz\""]).is_err());
    }

    #[tokio::test]
    async fn test_full_upload_lifecycle() {
        let (gw, _dir) = test_gateway();
        gw.create_bucket(&owner(), "mpu-test", None, None).await.unwrap();
        let upload = gw
            .create_multipart_upload(&owner(), "mpu-test", "big", ObjectAttributes::default())
            .await
            .unwrap();

        let p1 = gw
            .upload_part(&owner(), "mpu-test", "big", &upload.upload_id, 1, body(b"hello "))
            .await
            .unwrap();
        let p2 = gw
            .upload_part(&owner(), "mpu-test", "big", &upload.upload_id, 2, body(b"world"))
            .await
            .unwrap();

        let (_, listed) = gw
            .list_parts(&owner(), "mpu-test", "big", &upload.upload_id, 1000, 0)
            .await
            .unwrap();
        assert_eq!(listed.parts.len(), 2);

        let done = gw
            .complete_multipart_upload(
                &owner(),
                "mpu-test",
                "big",
                &upload.upload_id,
                &[(1, p1.etag.clone()), (2, p2.etag.clone())],
            )
            .await
            .unwrap();
        assert_eq!(
            done.etag,
            multipart_etag([p1.etag.as_str(), p2.etag.as_str()]).unwrap()
        );
        assert!(done.etag.ends_with("-2\""));

        let got = gw
            .get_object(&owner(), "mpu-test", "big", None, None, &Preconditions::default())
            .await
            .unwrap();
        assert_eq!(got.record.etag, done.etag);
        assert_eq!(read_all(got.body).await, b"hello world");

        // The upload is closed once completed.
        let again = gw
            .upload_part(&owner(), "mpu-test", "big", &upload.upload_id, 3, body(b"late"))
            .await;
        assert!(matches!(again, Err(S3Error::NoSuchUpload { .. })));
    }

    #[tokio::test]
    async fn test_completion_validation() {
        let (gw, _, _dir) = test_gateway_with(None, 5);
        gw.create_bucket(&owner(), "mpu-test", None, None).await.unwrap();
        let upload = gw
            .create_multipart_upload(&owner(), "mpu-test", "k", ObjectAttributes::default())
            .await
            .unwrap();
        let id = upload.upload_id.as_str();
        let small = gw
            .upload_part(&owner(), "mpu-test", "k", id, 1, body(b"abc"))
            .await
            .unwrap();
        let last = gw
            .upload_part(&owner(), "mpu-test", "k", id, 2, body(b"abcdef"))
            .await
            .unwrap();

        let out_of_order = gw
            .complete_multipart_upload(&owner(), "mpu-test", "k", id, &[(2, last.etag.clone()), (1, small.etag.clone())])
            .await;
        assert!(matches!(out_of_order, Err(S3Error::InvalidPartOrder)));

        let wrong_etag = gw
            .complete_multipart_upload(&owner(), "mpu-test", "k", id, &[(1, "\"00\"".into())])
            .await;
        assert!(matches!(wrong_etag, Err(S3Error::InvalidPart { .. })));

        let too_small = gw
            .complete_multipart_upload(&owner(), "mpu-test", "k", id, &[(1, small.etag.clone()), (2, last.etag.clone())])
            .await;
        assert!(matches!(too_small, Err(S3Error::EntityTooSmall)));

        // A small final part alone is fine.
        assert!(gw
            .complete_multipart_upload(&owner(), "mpu-test", "k", id, &[(2, last.etag)])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_part_number_bounds_and_abort() {
        let (gw, _dir) = test_gateway();
        gw.create_bucket(&owner(), "mpu-test", None, None).await.unwrap();
        let upload = gw
            .create_multipart_upload(&owner(), "mpu-test", "k", ObjectAttributes::default())
            .await
            .unwrap();
        let id = upload.upload_id.as_str();

        for bad in [0, MAX_PART_NUMBER + 1] {
            let res = gw.upload_part(&owner(), "mpu-test", "k", id, bad, body(b"x")).await;
            assert!(matches!(res, Err(S3Error::InvalidArgument { .. })));
        }

        let wrong_key = gw.upload_part(&owner(), "mpu-test", "other", id, 1, body(b"x")).await;
        assert!(matches!(wrong_key, Err(S3Error::NoSuchUpload { .. })));

        gw.abort_multipart_upload(&owner(), "mpu-test", Some("k"), id)
            .await
            .unwrap();
        let listed = gw
            .list_multipart_uploads(&owner(), "mpu-test", &ListUploadsQuery { max_uploads: 1000, ..Default::default() })
            .await
            .unwrap();
        assert!(listed.uploads.is_empty());
        let after = gw.upload_part(&owner(), "mpu-test", "k", id, 1, body(b"x")).await;
        assert!(matches!(after, Err(S3Error::NoSuchUpload { .. })));
    }

    #[tokio::test]
    async fn test_abort_twice_succeeds() {
        let (gw, _dir) = test_gateway();
        gw.create_bucket(&owner(), "mpu-test", None, None).await.unwrap();
        let upload = gw
            .create_multipart_upload(&owner(), "mpu-test", "k", ObjectAttributes::default())
            .await
            .unwrap();
        let id = upload.upload_id.as_str();
        gw.upload_part(&owner(), "mpu-test", "k", id, 1, body(b"x"))
            .await
            .unwrap();

        gw.abort_multipart_upload(&owner(), "mpu-test", Some("k"), id)
            .await
            .unwrap();
        gw.abort_multipart_upload(&owner(), "mpu-test", Some("k"), id)
            .await
            .unwrap();
        gw.abort_multipart_upload(&owner(), "mpu-test", None, id)
            .await
            .unwrap();

        let unknown = gw
            .abort_multipart_upload(&owner(), "mpu-test", Some("k"), "feedface")
            .await;
        assert!(matches!(unknown, Err(S3Error::NoSuchUpload { .. })));
        let wrong_key = gw
            .abort_multipart_upload(&owner(), "mpu-test", Some("other"), id)
            .await;
        assert!(matches!(wrong_key, Err(S3Error::NoSuchUpload { .. })));
    }

    #[tokio::test]
    async fn test_completed_upload_cannot_be_aborted() {
        let (gw, _dir) = test_gateway();
        gw.create_bucket(&owner(), "mpu-test", None, None).await.unwrap();
        let upload = gw
            .create_multipart_upload(&owner(), "mpu-test", "k", ObjectAttributes::default())
            .await
            .unwrap();
        let id = upload.upload_id.as_str();
        let part = gw
            .upload_part(&owner(), "mpu-test", "k", id, 1, body(b"done"))
            .await
            .unwrap();
        gw.complete_multipart_upload(&owner(), "mpu-test", "k", id, &[(1, part.etag)])
            .await
            .unwrap();

        let abort = gw.abort_multipart_upload(&owner(), "mpu-test", Some("k"), id).await;
        assert!(matches!(abort, Err(S3Error::NoSuchUpload { .. })));
        let got = gw
            .get_object(&owner(), "mpu-test", "k", None, None, &Preconditions::default())
            .await
            .unwrap();
        assert_eq!(read_all(got.body).await, b"done");
    }

    #[tokio::test]
    async fn test_reuploaded_part_invalidates_old_etag() {
        let (gw, _dir) = test_gateway();
        gw.create_bucket(&owner(), "mpu-test", None, None).await.unwrap();
        let upload = gw
            .create_multipart_upload(&owner(), "mpu-test", "k", ObjectAttributes::default())
            .await
            .unwrap();
        let id = upload.upload_id.as_str();
        let first = gw
            .upload_part(&owner(), "mpu-test", "k", id, 1, body(b"first"))
            .await
            .unwrap();
        let second = gw
            .upload_part(&owner(), "mpu-test", "k", id, 1, body(b"second"))
            .await
            .unwrap();

        let stale = gw
            .complete_multipart_upload(&owner(), "mpu-test", "k", id, &[(1, first.etag)])
            .await;
        assert!(matches!(stale, Err(S3Error::InvalidPart { .. })));

        // A third upload of the part races the completion that names the
        // second one.  Whatever wins, the object never pairs the second
        // ETag's digest with other bytes.
        let (owner_a, owner_b) = (owner(), owner());
        let parts = [(1, second.etag.clone())];
        let (third, done) = tokio::join!(
            gw.upload_part(&owner_a, "mpu-test", "k", id, 1, body(b"third")),
            gw.complete_multipart_upload(&owner_b, "mpu-test", "k", id, &parts),
        );
        match done {
            Ok(done) => {
                let got = gw
                    .get_object(&owner(), "mpu-test", "k", None, None, &Preconditions::default())
                    .await
                    .unwrap();
                assert_eq!(got.record.etag, done.etag);
                assert_eq!(done.etag, multipart_etag([second.etag.as_str()]).unwrap());
                assert_eq!(read_all(got.body).await, b"second");
            }
            Err(err) => {
                assert!(matches!(err, S3Error::InvalidPart { .. }), "{err:?}");
                assert!(third.is_ok());
            }
        }
    }

    #[tokio::test]
    async fn test_reap_removes_stale_uploads() {
        let (gw, _dir) = test_gateway();
        gw.create_bucket(&owner(), "mpu-test", None, None).await.unwrap();
        gw.create_multipart_upload(&owner(), "mpu-test", "k", ObjectAttributes::default())
            .await
            .unwrap();
        assert_eq!(gw.reap_expired_uploads(3600).await.unwrap(), 0);
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(gw.reap_expired_uploads(0).await.unwrap(), 1);
    }
}
