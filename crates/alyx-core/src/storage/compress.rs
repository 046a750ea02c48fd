//! Transparent streaming compression decorator.
//!
//! Wraps any backend: `put` pipes bytes through a compressor into the
//! inner backend and `get` wraps the inner reader in the matching
//! decompressor, so neither direction buffers the whole object.
//! `delete` and `exists` pass through unchanged.

use super::{ByteReader, StorageBackend, SIZE_UNKNOWN};
use crate::config::CompressionType;
use crate::error::{Error, Result};
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};

const PIPE_BUFFER: usize = 64 * 1024;

pub struct CompressedBackend {
    inner: Arc<dyn StorageBackend>,
    codec: CompressionType,
}

impl CompressedBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, codec: CompressionType) -> Self {
        Self { inner, codec }
    }

    pub fn codec(&self) -> CompressionType {
        self.codec
    }
}

#[async_trait]
impl StorageBackend for CompressedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        mut reader: ByteReader,
        _size_hint: i64,
    ) -> Result<()> {
        let (pipe_reader, pipe_writer) = tokio::io::duplex(PIPE_BUFFER);
        let codec = self.codec;

        // Compress into one end of the pipe while the inner backend drains
        // the other. The two halves must run concurrently or the pipe
        // deadlocks once its buffer fills.
        let compressor = tokio::spawn(async move {
            match codec {
                CompressionType::Gzip => {
                    let mut encoder = GzipEncoder::new(pipe_writer);
                    tokio::io::copy(&mut reader, &mut encoder).await?;
                    encoder.shutdown().await?;
                }
                CompressionType::Zstd => {
                    let mut encoder = ZstdEncoder::new(pipe_writer);
                    tokio::io::copy(&mut reader, &mut encoder).await?;
                    encoder.shutdown().await?;
                }
            }
            Ok::<_, std::io::Error>(())
        });

        let put_result = self
            .inner
            .put(bucket, key, Box::new(pipe_reader), SIZE_UNKNOWN)
            .await;

        match compressor.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Compressor failure trumps whatever the inner put reported:
                // the object (if any) holds truncated data, so remove it.
                let _ = self.inner.delete(bucket, key).await;
                return Err(e.into());
            }
            Err(join_err) => {
                let _ = self.inner.delete(bucket, key).await;
                return Err(Error::Storage(format!(
                    "compression task panicked: {}",
                    join_err
                )));
            }
        }
        put_result
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ByteReader> {
        let inner_reader = self.inner.get(bucket, key).await?;
        let buffered = BufReader::new(inner_reader);
        Ok(match self.codec {
            CompressionType::Gzip => Box::new(GzipDecoder::new(buffered)),
            CompressionType::Zstd => Box::new(ZstdDecoder::new(buffered)),
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner.delete(bucket, key).await
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        self.inner.exists(bucket, key).await
    }
}
