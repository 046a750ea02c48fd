//! S3-compatible storage backend.
//!
//! Objects at or above 5 MiB are written with multipart upload in 5 MiB
//! parts; any error aborts the multipart upload so no partial object
//! becomes visible.

use super::{ByteReader, StorageBackend};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::io::AsyncReadExt;

/// Part size for multipart uploads; also the single-put cutoff.
const PART_SIZE: usize = 5 * 1024 * 1024;

pub struct S3Backend {
    name: String,
    client: Client,
    bucket_prefix: String,
}

impl S3Backend {
    /// Build a client from an `[storage.backends.*]` S3 entry.
    pub async fn from_config(name: impl Into<String>, config: &BackendConfig) -> Result<Self> {
        let BackendConfig::S3 {
            endpoint,
            region,
            access_key,
            secret_key,
            bucket_prefix,
            force_path_style,
        } = config
        else {
            return Err(Error::Config("expected an s3 backend config".to_string()));
        };

        let mut loader =
            aws_config::from_env().region(aws_config::Region::new(region.clone()));
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let credentials = Credentials::new(
            access_key.resolve()?,
            secret_key.resolve()?,
            None,
            None,
            "alyx-config",
        );
        loader = loader.credentials_provider(credentials);
        let shared = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(*force_path_style)
            .build();

        Ok(Self {
            name: name.into(),
            client: Client::from_conf(s3_config),
            bucket_prefix: bucket_prefix.clone().unwrap_or_default(),
        })
    }

    fn remote_bucket(&self, bucket: &str) -> String {
        format!("{}{}", self.bucket_prefix, bucket)
    }

    /// Read up to one part from the stream. A short buffer means EOF.
    async fn read_part(reader: &mut ByteReader) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(PART_SIZE);
        while buf.len() < PART_SIZE {
            let mut chunk = vec![0u8; PART_SIZE - buf.len()];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(buf)
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        first_part: Vec<u8>,
        reader: &mut ByteReader,
    ) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::S3(format!("Failed to start multipart upload: {}", e)))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::S3("multipart upload has no id".to_string()))?
            .to_string();

        let uploaded = async {
            let mut parts = Vec::new();
            let mut part_number = 1i32;
            let mut chunk = first_part;
            loop {
                let full = chunk.len() == PART_SIZE;
                let part = self
                    .client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk))
                    .send()
                    .await
                    .map_err(|e| {
                        Error::S3(format!("Failed to upload part {}: {}", part_number, e))
                    })?;
                parts.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .e_tag(part.e_tag().unwrap_or_default())
                        .build(),
                );
                if !full {
                    break;
                }
                chunk = Self::read_part(reader).await?;
                if chunk.is_empty() {
                    break;
                }
                part_number += 1;
            }
            Ok::<_, Error>(parts)
        }
        .await;

        match uploaded {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| Error::S3(format!("Failed to complete multipart upload: {}", e)))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        "Failed to abort multipart upload for {}/{}: {}",
                        bucket,
                        key,
                        abort_err
                    );
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
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
        let remote = self.remote_bucket(bucket);
        let first_part = Self::read_part(&mut reader).await?;

        if first_part.len() < PART_SIZE {
            self.client
                .put_object()
                .bucket(&remote)
                .key(key)
                .body(ByteStream::from(first_part))
                .send()
                .await
                .map_err(|e| Error::S3(format!("Failed to put {}/{}: {}", bucket, key, e)))?;
            return Ok(());
        }

        self.put_multipart(&remote, key, first_part, &mut reader)
            .await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ByteReader> {
        let remote = self.remote_bucket(bucket);
        match self
            .client
            .get_object()
            .bucket(&remote)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Box::new(output.body.into_async_read())),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    Err(Error::FileNotFound(format!("{}/{}", bucket, key)))
                } else {
                    Err(Error::S3(format!(
                        "Failed to get {}/{}: {}",
                        bucket, key, service_error
                    )))
                }
            }
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let remote = self.remote_bucket(bucket);
        // S3 DeleteObject succeeds for absent keys, which matches the
        // idempotence contract directly.
        self.client
            .delete_object()
            .bucket(&remote)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::S3(format!("Failed to delete {}/{}: {}", bucket, key, e)))?;
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let remote = self.remote_bucket(bucket);
        match self
            .client
            .head_object()
            .bucket(&remote)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(Error::S3(format!(
                        "Failed to head {}/{}: {}",
                        bucket, key, service_error
                    )))
                }
            }
        }
    }
}
