//! Local filesystem storage backend.
//!
//! Objects live under `base_path/bucket/key`. Writes go to a temp file in
//! the destination directory and are renamed into place, so a failed put
//! never leaves a visible object.

use super::{ByteReader, StorageBackend};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct FilesystemBackend {
    name: String,
    base_path: PathBuf,
}

impl FilesystemBackend {
    pub fn new(name: impl Into<String>, base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        if !base_path.is_absolute() {
            return Err(Error::Storage(format!(
                "backend base_path must be absolute: {}",
                base_path.display()
            )));
        }
        Ok(Self {
            name: name.into(),
            base_path,
        })
    }

    /// Validate a key and resolve it under `base_path/bucket`.
    ///
    /// Rejects NUL bytes, absolute paths (Unix prefix or Windows drive
    /// letter), and any `..` segment; the result is always a descendant of
    /// `base_path`.
    fn resolve(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        // The bucket name is config-controlled, but hold it to the same rule.
        validate_key(bucket)?;

        let mut path = self.base_path.join(bucket);
        for segment in key.split('/').filter(|s| !s.is_empty() && *s != ".") {
            path.push(segment);
        }

        if !path.starts_with(&self.base_path) {
            return Err(Error::Storage(format!("key escapes base path: {}", key)));
        }
        Ok(path)
    }
}

/// Reject keys that could escape the storage root.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Storage("empty storage key".to_string()));
    }
    if key.contains('\0') {
        return Err(Error::Storage("storage key contains NUL".to_string()));
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(Error::Storage(format!("absolute storage key: {}", key)));
    }
    let bytes = key.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(Error::Storage(format!("absolute storage key: {}", key)));
    }
    if key
        .split(['/', '\\'])
        .any(|segment| segment == "..")
    {
        return Err(Error::Storage(format!(
            "storage key contains '..': {}",
            key
        )));
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        mut reader: ByteReader,
        _size_hint: i64,
    ) -> Result<()> {
        let dest = self.resolve(bucket, key)?;
        let parent = dest
            .parent()
            .ok_or_else(|| Error::Storage(format!("key has no parent directory: {}", key)))?;
        tokio::fs::create_dir_all(parent).await?;

        // Temp file in the destination directory so the rename is atomic
        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            tokio::io::copy(&mut reader, &mut file).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &dest).await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ByteReader> {
        let path = self.resolve(bucket, key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::FileNotFound(format!("{}/{}", bucket, key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.resolve(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let path = self.resolve(bucket, key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}
