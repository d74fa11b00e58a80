//! The peer worker RPC boundary the core consumes (`spec.md` §6). The real
//! transport ("a reliable RPC that delivers byte payloads between named
//! workers") is an explicit Non-goal; `PeerClient` is the trait interface
//! the core is written against, analogous to how `gazette::journal::Client`
//! wraps a routed transport behind a small async surface.

use crate::{RunId, ShuffleId, WorkerAddress};
use async_trait::async_trait;
use bytes::Bytes;

/// One (input_partition_id, serialized_sub_table_bytes) pair as carried over
/// the wire to a peer.
#[derive(Debug, Clone)]
pub struct WireShard {
    pub input_partition: u64,
    pub bytes: Bytes,
}

#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Delivers shards to the peer at `address` for (shuffle_id, run_id).
    /// Errors are surfaced as the sticky `PeerFailed` exception by the
    /// caller (`CommShardsBuffer`'s flush sink).
    async fn shuffle_receive(
        &self,
        address: &WorkerAddress,
        shuffle_id: &ShuffleId,
        run_id: RunId,
        data: Vec<WireShard>,
    ) -> Result<(), String>;
}
