//! Storage backends for alyx buckets.
//!
//! A backend is a byte-level store with four operations. Buckets are mapped
//! onto named backends by configuration; a bucket with compression enabled
//! gets its backend wrapped in the transparent [`CompressedBackend`]
//! decorator, so callers never see compressed bytes.

mod compress;
mod fs;
mod s3;

pub use compress::CompressedBackend;
pub use fs::FilesystemBackend;
pub use s3::S3Backend;

use crate::config::{BackendConfig, BucketConfig, CompressionType, StorageConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Boxed byte stream handed to and returned by backends.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Size passed to `put` when the total length is unknown.
pub const SIZE_UNKNOWN: i64 = -1;

/// A pluggable byte-level store behind the bucket abstraction.
///
/// All operations are bound to the caller's future: dropping the returned
/// future cancels in-flight I/O. Implementations must not leave partial
/// objects visible after a failed `put`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name from the configuration key (used for logging only).
    fn name(&self) -> &str;

    /// Store the reader's bytes under `(bucket, key)`.
    /// `size_hint` is the total length when known, [`SIZE_UNKNOWN`] otherwise.
    async fn put(&self, bucket: &str, key: &str, reader: ByteReader, size_hint: i64)
        -> Result<()>;

    /// Open `(bucket, key)` for reading. Fails with a NotFound error when
    /// the object is absent; every other failure is an I/O error.
    async fn get(&self, bucket: &str, key: &str) -> Result<ByteReader>;

    /// Remove `(bucket, key)`. Idempotent: deleting an absent object
    /// succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Whether `(bucket, key)` currently exists.
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;
}

/// A configured bucket: its backend (already wrapped for compression) and
/// its policy.
#[derive(Clone)]
pub struct BucketHandle {
    pub name: String,
    pub backend: Arc<dyn StorageBackend>,
    pub config: BucketConfig,
}

impl BucketHandle {
    pub fn compression(&self) -> Option<CompressionType> {
        self.config.compression
    }
}

/// Routes bucket names to their configured backends.
pub struct ObjectStore {
    buckets: HashMap<String, BucketHandle>,
}

impl ObjectStore {
    /// Build backends and bucket handles from configuration.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let mut backends: HashMap<String, Arc<dyn StorageBackend>> = HashMap::new();
        for (name, backend_config) in &config.backends {
            let backend: Arc<dyn StorageBackend> = match backend_config {
                BackendConfig::Filesystem { base_path } => {
                    Arc::new(FilesystemBackend::new(name, base_path)?)
                }
                BackendConfig::S3 { .. } => {
                    Arc::new(S3Backend::from_config(name, backend_config).await?)
                }
            };
            backends.insert(name.clone(), backend);
        }

        let mut buckets = HashMap::new();
        for (bucket_name, bucket_config) in &config.buckets {
            let backend = backends
                .get(&bucket_config.backend)
                .cloned()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "bucket {} references unknown backend {}",
                        bucket_name, bucket_config.backend
                    ))
                })?;
            let backend = match bucket_config.compression {
                Some(codec) => Arc::new(CompressedBackend::new(backend, codec)) as Arc<_>,
                None => backend,
            };
            buckets.insert(
                bucket_name.clone(),
                BucketHandle {
                    name: bucket_name.clone(),
                    backend,
                    config: bucket_config.clone(),
                },
            );
        }

        Ok(Self { buckets })
    }

    /// Assemble an object store directly (used by tests and embedders).
    pub fn from_handles(handles: impl IntoIterator<Item = BucketHandle>) -> Self {
        Self {
            buckets: handles.into_iter().map(|h| (h.name.clone(), h)).collect(),
        }
    }

    pub fn bucket(&self, name: &str) -> Result<&BucketHandle> {
        self.buckets
            .get(name)
            .ok_or_else(|| Error::Validation(format!("unknown bucket: {}", name)))
    }

    pub fn bucket_names(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }
}
