//! DiskShardsBuffer (`spec.md` §4.4): a ShardsBuffer whose flush sink
//! appends a length-prefixed framing of each shard to a file named by the
//! destination output partition, under a run-scoped scratch directory.

use crate::shards_buffer::{FlushSink, ShardsBuffer, Weighted};
use crate::OutputPartitionId;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

impl Weighted for Bytes {
    fn byte_len(&self) -> u64 {
        self.len() as u64
    }
}

struct DiskSink {
    dir: PathBuf,
}

impl DiskSink {
    fn path_for(&self, partition: &OutputPartitionId) -> PathBuf {
        self.dir.join(partition.0.to_string())
    }
}

#[async_trait]
impl FlushSink<OutputPartitionId, Bytes> for DiskSink {
    async fn flush(&self, destination: &OutputPartitionId, items: &[Bytes]) -> Result<(), String> {
        let path = self.path_for(destination);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| format!("opening {}: {e}", path.display()))?;

        for item in items {
            let len = item.len() as u32;
            file.write_all(&len.to_le_bytes())
                .await
                .map_err(|e| e.to_string())?;
            file.write_all(item).await.map_err(|e| e.to_string())?;
        }
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// DiskShardsBuffer stages inbound shards per output partition and spools
/// them to local disk, eagerly creating its scratch directory and
/// recursively deleting it on close.
pub struct DiskShardsBuffer {
    inner: ShardsBuffer<OutputPartitionId, Bytes>,
    dir: PathBuf,
}

impl DiskShardsBuffer {
    pub async fn new(
        limiter: Arc<crate::limiter::ResourceLimiter>,
        concurrency: usize,
        dir: PathBuf,
    ) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let sink = Arc::new(DiskSink { dir: dir.clone() });
        Ok(DiskShardsBuffer {
            inner: ShardsBuffer::new(limiter, concurrency, sink),
            dir,
        })
    }

    pub async fn write(
        &self,
        batch: HashMap<OutputPartitionId, Vec<Bytes>>,
    ) -> Result<(), String> {
        self.inner.write(batch).await
    }

    pub async fn flush(&self) -> Result<(), String> {
        self.inner.flush().await
    }

    pub fn raise_on_exception(&self) -> Result<(), String> {
        self.inner.raise_on_exception()
    }

    pub fn heartbeat(&self) -> crate::shards_buffer::Heartbeat {
        self.inner.heartbeat()
    }

    /// Reads back the frames previously flushed for `partition`, in append
    /// order. Requires a prior `flush()` to observe in-flight writes.
    /// Returns `None` if no shard ever landed for this partition.
    pub async fn read(&self, partition: OutputPartitionId) -> std::io::Result<Option<Vec<Bytes>>> {
        let path = self.dir.join(partition.0.to_string());
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut frames = Vec::new();
        let mut off = 0usize;
        while off + 4 <= bytes.len() {
            let len = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            if off + len > bytes.len() {
                break;
            }
            frames.push(Bytes::copy_from_slice(&bytes[off..off + len]));
            off += len;
        }
        Ok(Some(frames))
    }

    /// Closes the buffer and recursively deletes its scratch directory.
    pub async fn close(&self) {
        self.inner.close().await;
        let _ = tokio::fs::remove_dir_all(&self.dir).await;
    }
}
