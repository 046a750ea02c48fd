//! Resumable uploads (tus 1.0.0 core protocol).
//!
//! Uploads spool into temp files; the stored offset is the single
//! serialization point, advanced with a compare-and-set so of two
//! concurrent PATCHes at most one wins. When the offset reaches the
//! declared length the upload finalizes: MIME sniffing, bucket policy
//! checks, SHA-256, a streaming put into the bucket's backend, and a File
//! row — after which the upload row and temp file are gone.

use crate::error::{Error, Result};
use crate::storage::ObjectStore;
use crate::store::Store;
use crate::types::{FileRecord, Upload};
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Protocol version advertised in every response.
pub const TUS_VERSION: &str = "1.0.0";

/// Uploads expire this long after creation.
const UPLOAD_TTL_HOURS: i64 = 24;

/// Expiry sweep cadence.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Bytes sniffed for content-based MIME detection.
const SNIFF_LEN: usize = 512;

/// Result of a PATCH: the new offset, and the finalized file when this
/// chunk completed the upload.
#[derive(Debug)]
pub struct PatchOutcome {
    pub new_offset: i64,
    pub completed: Option<FileRecord>,
}

struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct UploadService {
    store: Store,
    objects: Arc<ObjectStore>,
    spool_dir: PathBuf,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl UploadService {
    pub fn new(store: Store, objects: Arc<ObjectStore>, spool_dir: impl AsRef<Path>) -> Self {
        Self {
            store,
            objects,
            spool_dir: spool_dir.as_ref().to_path_buf(),
            sweeper: Mutex::new(None),
        }
    }

    fn temp_path(&self, upload_id: &str) -> PathBuf {
        self.spool_dir.join(upload_id)
    }

    /// Create an upload of `length` bytes into `bucket`.
    /// `metadata` is the raw `Upload-Metadata` header, if sent.
    pub async fn create(
        &self,
        bucket: &str,
        length: i64,
        metadata: Option<&str>,
    ) -> Result<Upload> {
        // Unknown buckets fail before any row or file exists
        self.objects.bucket(bucket)?;
        if length <= 0 {
            return Err(Error::Validation(
                "Upload-Length must be greater than zero".to_string(),
            ));
        }
        let metadata = match metadata {
            Some(header) => parse_upload_metadata(header)?,
            None => HashMap::new(),
        };
        let filename = metadata.get("filename").cloned();

        let now = Utc::now();
        let upload = Upload {
            id: Uuid::new_v4().to_string(),
            bucket: bucket.to_string(),
            filename,
            size: length,
            offset: 0,
            metadata,
            expires_at: now + ChronoDuration::hours(UPLOAD_TTL_HOURS),
            created_at: now,
        };

        tokio::fs::create_dir_all(&self.spool_dir).await?;
        tokio::fs::File::create(self.temp_path(&upload.id)).await?;
        self.store.insert_upload(&upload).await?;
        Ok(upload)
    }

    /// Current state for a HEAD response.
    pub async fn head(&self, upload_id: &str) -> Result<Upload> {
        self.store
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| Error::UploadNotFound(upload_id.to_string()))
    }

    /// Apply one chunk at `offset`. The offset must equal the stored
    /// offset; a stale offset leaves the upload untouched.
    pub async fn patch(&self, upload_id: &str, offset: i64, body: &[u8]) -> Result<PatchOutcome> {
        let upload = self.head(upload_id).await?;
        if offset != upload.offset {
            return Err(Error::OffsetMismatch {
                upload_id: upload_id.to_string(),
                expected: upload.offset,
                got: offset,
            });
        }
        let new_offset = offset + body.len() as i64;
        if new_offset > upload.size {
            return Err(Error::Validation(format!(
                "chunk exceeds declared upload length ({} > {})",
                new_offset, upload.size
            )));
        }

        // Claim the range [offset, new_offset) before touching the file.
        // The CAS succeeding means no concurrent PATCH holds this range.
        if !self
            .store
            .advance_upload_offset(upload_id, offset, new_offset)
            .await?
        {
            let current = self.head(upload_id).await?;
            return Err(Error::OffsetMismatch {
                upload_id: upload_id.to_string(),
                expected: current.offset,
                got: offset,
            });
        }

        if !body.is_empty() {
            let write_result = self.write_chunk(upload_id, offset, body).await;
            if let Err(e) = write_result {
                // Roll the claim back so the client can retry this chunk
                let _ = self
                    .store
                    .advance_upload_offset(upload_id, new_offset, offset)
                    .await;
                return Err(e);
            }
        }

        if new_offset == upload.size {
            let mut finished = upload;
            finished.offset = new_offset;
            let file = self.finalize(finished).await?;
            return Ok(PatchOutcome {
                new_offset,
                completed: Some(file),
            });
        }
        Ok(PatchOutcome {
            new_offset,
            completed: None,
        })
    }

    async fn write_chunk(&self, upload_id: &str, offset: i64, body: &[u8]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.temp_path(upload_id))
            .await?;
        file.seek(SeekFrom::Start(offset as u64)).await?;
        file.write_all(body).await?;
        file.flush().await?;
        Ok(())
    }

    /// Remove the upload and its temp file.
    pub async fn delete(&self, upload_id: &str) -> Result<()> {
        // 404 for uploads that never existed
        self.head(upload_id).await?;
        let _ = tokio::fs::remove_file(self.temp_path(upload_id)).await;
        self.store.delete_upload(upload_id).await
    }

    /// Turn a complete upload into a stored file.
    async fn finalize(&self, upload: Upload) -> Result<FileRecord> {
        let handle = self.objects.bucket(&upload.bucket)?;
        let temp = self.temp_path(&upload.id);

        // Bucket policy: MIME from the leading bytes, then the size cap
        let mut file = tokio::fs::File::open(&temp).await?;
        let mut head = vec![0u8; SNIFF_LEN.min(upload.size as usize)];
        file.read_exact(&mut head).await?;
        let mime_type = detect_mime(&head, upload.filename.as_deref());
        if !mime_allowed(&handle.config.allowed_mime, &mime_type) {
            return Err(Error::Validation(format!(
                "MIME type {} not allowed in bucket {}",
                mime_type, upload.bucket
            )));
        }
        if upload.size as u64 > handle.config.max_file_size {
            return Err(Error::Validation(format!(
                "file size {} exceeds bucket limit {}",
                upload.size, handle.config.max_file_size
            )));
        }

        // SHA-256 over the whole temp file, streaming
        file.seek(SeekFrom::Start(0)).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let checksum = hex::encode(hasher.finalize());
        drop(file);

        let name = upload
            .filename
            .clone()
            .unwrap_or_else(|| upload.id.clone());
        let path = name.clone();

        let reader = tokio::fs::File::open(&temp).await?;
        handle
            .backend
            .put(&upload.bucket, &path, Box::new(reader), upload.size)
            .await?;

        let compression = handle.compression();
        let now = Utc::now();
        let record = FileRecord {
            id: Uuid::new_v4().to_string(),
            bucket: upload.bucket.clone(),
            name,
            path: path.clone(),
            mime_type,
            size: upload.size,
            checksum,
            compressed: compression.is_some(),
            compression_type: compression.map(|c| c.as_str().to_string()),
            original_size: compression.map(|_| upload.size),
            metadata: upload.metadata.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let stored = async {
            self.store.insert_file(&record).await?;
            self.store.delete_upload(&upload.id).await?;
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = stored {
            // The object landed but the metadata did not: take the object
            // back out so no orphaned bytes remain.
            if let Err(cleanup) = handle.backend.delete(&upload.bucket, &path).await {
                tracing::error!(
                    "Failed to remove orphaned object {}/{}: {}",
                    upload.bucket,
                    path,
                    cleanup
                );
            }
            return Err(e);
        }

        let _ = tokio::fs::remove_file(&temp).await;
        Ok(record)
    }

    /// Delete expired uploads and their temp files.
    pub async fn sweep_expired(&self) -> Result<usize> {
        sweep_expired(&self.store, &self.spool_dir).await
    }

    /// Start the hourly expiry sweeper. Idempotent.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().expect("sweeper lock poisoned");
        if sweeper.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let store = self.store.clone();
        let spool_dir = self.spool_dir.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sweep_expired(&store, &spool_dir).await {
                            tracing::error!("Upload expiry sweep failed: {}", e);
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });
        *sweeper = Some(SweeperHandle { stop: stop_tx, task });
    }

    /// Stop the sweeper and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let handle = self.sweeper.lock().expect("sweeper lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
            let _ = handle.task.await;
        }
    }
}

/// Delete expired uploads and their temp files.
async fn sweep_expired(store: &Store, spool_dir: &Path) -> Result<usize> {
    let expired = store.expired_uploads(Utc::now()).await?;
    let count = expired.len();
    for upload in expired {
        let _ = tokio::fs::remove_file(spool_dir.join(&upload.id)).await;
        if let Err(e) = store.delete_upload(&upload.id).await {
            tracing::error!("Failed to delete expired upload {}: {}", upload.id, e);
        } else {
            tracing::debug!("Reclaimed expired upload {}", upload.id);
        }
    }
    Ok(count)
}

/// Parse `Upload-Metadata`: comma-separated `key base64(value)` pairs.
/// A key without a value is allowed and maps to the empty string.
pub fn parse_upload_metadata(header: &str) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    for pair in header.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, encoded) = match pair.split_once(' ') {
            Some((key, encoded)) => (key, encoded.trim()),
            None => (pair, ""),
        };
        if key.is_empty() {
            return Err(Error::Validation(format!(
                "invalid Upload-Metadata pair: {}",
                pair
            )));
        }
        let value = if encoded.is_empty() {
            String::new()
        } else {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| {
                    Error::Validation(format!("invalid base64 in Upload-Metadata: {}", key))
                })?;
            String::from_utf8(decoded).map_err(|_| {
                Error::Validation(format!("Upload-Metadata value for {} is not UTF-8", key))
            })?
        };
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

/// Detect a MIME type: content magic first, then the filename extension,
/// then `application/octet-stream`.
pub fn detect_mime(head: &[u8], filename: Option<&str>) -> String {
    if let Some(mime) = sniff_content(head) {
        return mime.to_string();
    }
    if let Some(filename) = filename {
        let guessed = mime_guess::from_path(filename);
        if let Some(mime) = guessed.first() {
            return mime.essence_str().to_string();
        }
    }
    "application/octet-stream".to_string()
}

/// Magic-byte sniffing over the leading bytes of a file.
fn sniff_content(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("image/png");
    }
    if head.starts_with(b"\xff\xd8\xff") {
        return Some("image/jpeg");
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if head.starts_with(b"%PDF-") {
        return Some("application/pdf");
    }
    if head.starts_with(b"PK\x03\x04") {
        return Some("application/zip");
    }
    if head.starts_with(b"\x1f\x8b") {
        return Some("application/gzip");
    }
    if head.starts_with(b"(\xb5/\xfd") {
        return Some("application/zstd");
    }
    if head.starts_with(b"\0asm") {
        return Some("application/wasm");
    }
    let text = std::str::from_utf8(head).ok()?;
    let trimmed = text.trim_start();
    if trimmed.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("<!doc"))
        || trimmed.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("<html"))
    {
        return Some("text/html");
    }
    if !text.contains('\0') {
        return Some("text/plain");
    }
    None
}

/// Check a detected type against a bucket allow-list. `type/*` wildcards
/// are supported, charset suffixes are stripped before comparison, and an
/// empty list allows everything.
pub fn mime_allowed(allowed: &[String], mime: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let mime = strip_mime_params(mime);
    allowed.iter().any(|entry| {
        let entry = strip_mime_params(entry);
        if let Some(prefix) = entry.strip_suffix("/*") {
            mime.split('/').next().is_some_and(|t| t.eq_ignore_ascii_case(prefix))
        } else {
            entry.eq_ignore_ascii_case(mime)
        }
    })
}

fn strip_mime_params(mime: &str) -> &str {
    mime.split(';').next().unwrap_or(mime).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BucketConfig;
    use crate::db::Database;
    use crate::storage::{BucketHandle, FilesystemBackend};
    use tokio::io::AsyncReadExt as _;

    async fn service(
        temp: &tempfile::TempDir,
        max_file_size: u64,
        allowed_mime: Vec<String>,
    ) -> (Arc<UploadService>, Store) {
        let storage_root = temp.path().join("storage");
        std::fs::create_dir_all(&storage_root).unwrap();
        let backend = Arc::new(FilesystemBackend::new("local", &storage_root).unwrap());
        let objects = Arc::new(ObjectStore::from_handles([BucketHandle {
            name: "media".to_string(),
            backend,
            config: BucketConfig {
                backend: "local".to_string(),
                max_file_size,
                allowed_mime,
                compression: None,
            },
        }]));
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let service = Arc::new(UploadService::new(
            store.clone(),
            objects,
            temp.path().join("spool"),
        ));
        (service, store)
    }

    #[test]
    fn test_parse_upload_metadata() {
        let parsed =
            parse_upload_metadata("filename cGhvdG8ucG5n,owner YWxpY2U=").unwrap();
        assert_eq!(parsed.get("filename").unwrap(), "photo.png");
        assert_eq!(parsed.get("owner").unwrap(), "alice");

        // Key without value
        let parsed = parse_upload_metadata("is_confidential").unwrap();
        assert_eq!(parsed.get("is_confidential").unwrap(), "");

        assert!(parse_upload_metadata("bad !!!notbase64!!!").is_err());
    }

    #[test]
    fn test_mime_allowed_wildcards_and_charset() {
        let allowed = vec!["image/*".to_string(), "application/pdf".to_string()];
        assert!(mime_allowed(&allowed, "image/png"));
        assert!(mime_allowed(&allowed, "image/webp"));
        assert!(mime_allowed(&allowed, "application/pdf"));
        assert!(mime_allowed(&allowed, "application/pdf; charset=binary"));
        assert!(!mime_allowed(&allowed, "text/plain"));
        // Empty list allows everything
        assert!(mime_allowed(&[], "anything/at-all"));
    }

    #[test]
    fn test_detect_mime_content_beats_extension() {
        let png = b"\x89PNG\r\n\x1a\nrest-of-file";
        assert_eq!(detect_mime(png, Some("misleading.txt")), "image/png");
        assert_eq!(detect_mime(b"\0\x01\x02\x03", Some("data.json")), "application/json");
        assert_eq!(detect_mime(b"\0\x01\x02\x03", None), "application/octet-stream");
        assert_eq!(detect_mime(b"plain words", None), "text/plain");
    }

    #[tokio::test]
    async fn test_create_requires_positive_length() {
        let temp = tempfile::tempdir().unwrap();
        let (service, _) = service(&temp, 1024, vec![]).await;
        assert!(service.create("media", 0, None).await.is_err());
        assert!(service.create("media", -5, None).await.is_err());
        assert!(service.create("nope", 10, None).await.is_err());
    }

    #[tokio::test]
    async fn test_full_upload_in_chunks() {
        let temp = tempfile::tempdir().unwrap();
        let (service, store) = service(&temp, 20_000_000, vec![]).await;

        let data: Vec<u8> = (0..10_000_000u32).map(|i| (i % 251) as u8).collect();
        let upload = service
            .create("media", data.len() as i64, Some("filename YmlnLmJpbg=="))
            .await
            .unwrap();
        assert_eq!(upload.offset, 0);
        assert_eq!(upload.filename.as_deref(), Some("big.bin"));

        let chunks = [
            &data[..3_000_000],
            &data[3_000_000..6_000_000],
            &data[6_000_000..],
        ];
        let mut offset = 0i64;
        let mut completed = None;
        for chunk in chunks {
            let outcome = service.patch(&upload.id, offset, chunk).await.unwrap();
            offset = outcome.new_offset;
            completed = outcome.completed;
        }

        let file = completed.expect("last chunk finalizes");
        assert_eq!(file.size, 10_000_000);
        assert_eq!(file.name, "big.bin");
        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(file.checksum, expected);

        // Upload row and temp file are gone
        assert!(store.get_upload(&upload.id).await.unwrap().is_none());
        assert!(!temp.path().join("spool").join(&upload.id).exists());

        // Bytes round-trip from the backend
        let handle = service.objects.bucket("media").unwrap();
        let mut reader = handle.backend.get("media", &file.path).await.unwrap();
        let mut stored = Vec::new();
        reader.read_to_end(&mut stored).await.unwrap();
        assert_eq!(stored, data);
    }

    #[tokio::test]
    async fn test_offset_mismatch_leaves_state_untouched() {
        let temp = tempfile::tempdir().unwrap();
        let (service, _) = service(&temp, 20_000_000, vec![]).await;
        let upload = service.create("media", 10_000_000, None).await.unwrap();

        service
            .patch(&upload.id, 0, &vec![1u8; 3_000_000])
            .await
            .unwrap();
        service
            .patch(&upload.id, 3_000_000, &vec![2u8; 3_000_000])
            .await
            .unwrap();

        let err = service
            .patch(&upload.id, 5_000_000, &vec![3u8; 1_000_000])
            .await
            .unwrap_err();
        match err {
            Error::OffsetMismatch { expected, got, .. } => {
                assert_eq!(expected, 6_000_000);
                assert_eq!(got, 5_000_000);
            }
            other => panic!("expected OffsetMismatch, got {}", other),
        }
        assert_eq!(service.head(&upload.id).await.unwrap().offset, 6_000_000);
    }

    #[tokio::test]
    async fn test_empty_patch_completes_only_at_size() {
        let temp = tempfile::tempdir().unwrap();
        let (service, _) = service(&temp, 1024, vec![]).await;
        let upload = service.create("media", 5, None).await.unwrap();

        // Empty body midway: accepted as a no-op, does not finalize
        let outcome = service.patch(&upload.id, 0, b"").await.unwrap();
        assert_eq!(outcome.new_offset, 0);
        assert!(outcome.completed.is_none());

        service.patch(&upload.id, 0, b"hello").await.unwrap();
        // Upload finalized by the full chunk, row is gone
        assert!(service.head(&upload.id).await.is_err());
    }

    #[tokio::test]
    async fn test_max_file_size_boundary() {
        let temp = tempfile::tempdir().unwrap();
        let (service, _) = service(&temp, 8, vec![]).await;

        // Exactly max_file_size succeeds
        let upload = service.create("media", 8, None).await.unwrap();
        let outcome = service.patch(&upload.id, 0, b"12345678").await.unwrap();
        assert!(outcome.completed.is_some());

        // One byte over fails at finalize with a validation error, and the
        // upload row survives for inspection
        let upload = service.create("media", 9, None).await.unwrap();
        let err = service
            .patch(&upload.id, 0, b"123456789")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {}", err);
    }

    #[tokio::test]
    async fn test_disallowed_mime_fails_finalize() {
        let temp = tempfile::tempdir().unwrap();
        let (service, _) = service(&temp, 1024, vec!["image/*".to_string()]).await;
        let upload = service
            .create("media", 11, Some("filename bm90ZXMudHh0"))
            .await
            .unwrap();
        let err = service
            .patch(&upload.id, 0, b"plain notes")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_row_and_temp() {
        let temp = tempfile::tempdir().unwrap();
        let (service, _) = service(&temp, 1024, vec![]).await;
        let upload = service.create("media", 100, None).await.unwrap();
        service.patch(&upload.id, 0, b"partial").await.unwrap();

        service.delete(&upload.id).await.unwrap();
        assert!(service.head(&upload.id).await.is_err());
        assert!(!temp.path().join("spool").join(&upload.id).exists());

        // Deleting again is a 404
        assert!(service.delete(&upload.id).await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired() {
        let temp = tempfile::tempdir().unwrap();
        let (service, store) = service(&temp, 1024, vec![]).await;
        let upload = service.create("media", 100, None).await.unwrap();

        // Nothing expired yet
        assert_eq!(service.sweep_expired().await.unwrap(), 0);

        // Force the expiry into the past
        sqlx::query("UPDATE _alyx_uploads SET expires_at = ? WHERE id = ?")
            .bind(Utc::now() - ChronoDuration::hours(1))
            .bind(&upload.id)
            .execute(store.pool())
            .await
            .unwrap();

        assert_eq!(service.sweep_expired().await.unwrap(), 1);
        assert!(service.head(&upload.id).await.is_err());
        assert!(!temp.path().join("spool").join(&upload.id).exists());
    }
}
