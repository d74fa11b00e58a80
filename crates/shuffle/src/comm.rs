//! CommShardsBuffer (`spec.md` §4.3): a ShardsBuffer whose flush sink calls
//! `rpc(address).shuffle_receive(shards, shuffle_id, run_id)`.

use crate::peer::{PeerClient, WireShard};
use crate::shards_buffer::{FlushSink, ShardsBuffer, Weighted};
use crate::types::Shard;
use crate::{RunId, ShuffleId, WorkerAddress};
use async_trait::async_trait;
use std::sync::Arc;

/// The default number of concurrent flushers for a CommShardsBuffer,
/// bounding the number of open peer connections (`spec.md` §4.3).
pub const DEFAULT_COMM_CONCURRENCY: usize = 10;

impl Weighted for Shard {
    fn byte_len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

struct PeerSink<P> {
    peer: Arc<P>,
    shuffle_id: ShuffleId,
    run_id: RunId,
}

#[async_trait]
impl<P> FlushSink<WorkerAddress, Shard> for PeerSink<P>
where
    P: PeerClient + 'static,
{
    async fn flush(&self, destination: &WorkerAddress, items: &[Shard]) -> Result<(), String> {
        let data = items
            .iter()
            .map(|s| WireShard {
                input_partition: s.input_partition.0,
                bytes: s.bytes.clone(),
            })
            .collect();
        self.peer
            .shuffle_receive(destination, &self.shuffle_id, self.run_id, data)
            .await
    }
}

/// CommShardsBuffer stages outbound shards per destination worker and
/// delivers them via [`PeerClient::shuffle_receive`].
pub struct CommShardsBuffer {
    inner: ShardsBuffer<WorkerAddress, Shard>,
}

impl CommShardsBuffer {
    pub fn new<P>(
        limiter: Arc<crate::limiter::ResourceLimiter>,
        concurrency: usize,
        peer: Arc<P>,
        shuffle_id: ShuffleId,
        run_id: RunId,
    ) -> Self
    where
        P: PeerClient + 'static,
    {
        let sink = Arc::new(PeerSink {
            peer,
            shuffle_id,
            run_id,
        });
        CommShardsBuffer {
            inner: ShardsBuffer::new(limiter, concurrency, sink),
        }
    }

    pub async fn write(
        &self,
        batch: std::collections::HashMap<WorkerAddress, Vec<Shard>>,
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

    pub async fn close(&self) {
        self.inner.close().await
    }
}
