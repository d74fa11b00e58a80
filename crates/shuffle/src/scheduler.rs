//! The scheduler RPC boundary the core consumes (`spec.md` §6). The
//! scheduler's own bookkeeping is out of scope; `SchedulerClient` is the
//! trait interface through which the core looks up or registers a run and
//! synchronizes the global barrier.

use crate::{OutputPartitionId, RunId, ShuffleId, WorkerAddress};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

/// The scheduler's reply to a `shuffle_get` lookup-or-create call: the
/// authoritative configuration of one run.
#[derive(Debug, Clone)]
pub struct ShuffleGetReply {
    pub run_id: RunId,
    pub worker_for: BTreeMap<OutputPartitionId, WorkerAddress>,
    pub output_workers: Vec<WorkerAddress>,
    pub schema: Bytes,
    pub column: String,
    pub npartitions: u64,
}

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Looks up the current run for `shuffle_id`, registering a new one if
    /// `empty_schema` is supplied and the scheduler has not seen this id
    /// before. Returns `Err` with a human-readable message on
    /// `{status: ERROR}`.
    async fn shuffle_get(
        &self,
        shuffle_id: &ShuffleId,
        empty_schema: Option<&Bytes>,
        column: Option<&str>,
        npartitions: Option<u64>,
        worker: &WorkerAddress,
    ) -> Result<ShuffleGetReply, String>;

    /// Announces that this worker has reached the barrier for
    /// (shuffle_id, run_id). The scheduler fans `shuffle_inputs_done` out to
    /// every participating worker, including this one, before replying.
    async fn shuffle_barrier(&self, shuffle_id: &ShuffleId, run_id: RunId) -> Result<(), String>;
}
