use crate::{InputPartitionId, OutputPartitionId, WorkerAddress};
use bytes::Bytes;
use std::collections::BTreeMap;

/// WorkerFor is the total mapping output_partition_id -> WorkerAddress for
/// one run. It is immutable for the lifetime of the run and determines both
/// the destination of ingest shards and the local ownership of output
/// partitions.
#[derive(Debug, Clone)]
pub struct WorkerFor(BTreeMap<OutputPartitionId, WorkerAddress>);

impl WorkerFor {
    pub fn new(map: BTreeMap<OutputPartitionId, WorkerAddress>) -> Self {
        WorkerFor(map)
    }

    pub fn npartitions(&self) -> u64 {
        self.0.len() as u64
    }

    pub fn worker_for(&self, partition: OutputPartitionId) -> Option<&WorkerAddress> {
        self.0.get(&partition)
    }

    /// PartitionsOf is the inverse of WorkerFor restricted to `local`: the
    /// set of output partition ids this worker will ultimately assemble.
    pub fn partitions_of(&self, local: &WorkerAddress) -> Vec<OutputPartitionId> {
        self.0
            .iter()
            .filter(|(_, addr)| *addr == local)
            .map(|(part, _)| *part)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutputPartitionId, &WorkerAddress)> {
        self.0.iter()
    }
}

/// Shard is the outbound form of one serialized sub-table addressed to one
/// destination: the input_partition_id is carried so the receiver can
/// deduplicate retransmissions.
#[derive(Debug, Clone)]
pub struct Shard {
    pub input_partition: InputPartitionId,
    pub bytes: Bytes,
}

/// ShardBatch is the inbound form of a `shuffle_receive` RPC: a list of
/// shards received in one delivery.
pub type ShardBatch = Vec<Shard>;
