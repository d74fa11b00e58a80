//! In-process fake scheduler and peer mesh shared by the integration and
//! property tests: a handful of [`shuffle::extension::ShuffleWorkerExtension`]s,
//! each wired to the same [`MeshScheduler`] and [`MeshPeer`], standing in
//! for the real scheduler RPCs and worker-to-worker transport.

use async_trait::async_trait;
use bytes::Bytes;
use shuffle::extension::ShuffleWorkerExtension;
use shuffle::peer::{PeerClient, WireShard};
use shuffle::scheduler::{SchedulerClient, ShuffleGetReply};
use shuffle::table::{SimpleTable, ShuffleTable};
use shuffle::types::Shard;
use shuffle::{InputPartitionId, OutputPartitionId, RunId, ShuffleId, WorkerAddress};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct Registry {
    workers: Mutex<BTreeMap<String, Arc<ShuffleWorkerExtension<SimpleTable>>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Registry {
            workers: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn insert(&self, name: &str, ext: Arc<ShuffleWorkerExtension<SimpleTable>>) {
        self.workers.lock().unwrap().insert(name.to_string(), ext);
    }

    fn get(&self, name: &str) -> Option<Arc<ShuffleWorkerExtension<SimpleTable>>> {
        self.workers.lock().unwrap().get(name).cloned()
    }
}

/// A scheduler shared by every worker in a mesh: one logical shuffle, a
/// caller-controlled run_id, and a fixed worker_for mapping. Replying to
/// `shuffle_barrier` fans `shuffle_inputs_done` out to every worker that
/// owns an output partition, modeling the real scheduler's fan-out.
pub struct MeshScheduler {
    pub run_id: AtomicU64,
    pub worker_for: BTreeMap<OutputPartitionId, WorkerAddress>,
    registry: Arc<Registry>,
}

impl MeshScheduler {
    pub fn new(
        run_id: u64,
        worker_for: BTreeMap<OutputPartitionId, WorkerAddress>,
        registry: Arc<Registry>,
    ) -> Self {
        MeshScheduler {
            run_id: AtomicU64::new(run_id),
            worker_for,
            registry,
        }
    }
}

#[async_trait]
impl SchedulerClient for MeshScheduler {
    async fn shuffle_get(
        &self,
        _shuffle_id: &ShuffleId,
        empty_schema: Option<&Bytes>,
        _column: Option<&str>,
        _npartitions: Option<u64>,
        _worker: &WorkerAddress,
    ) -> Result<ShuffleGetReply, String> {
        let schema = empty_schema.cloned().unwrap_or_else(|| {
            SimpleTable::schema_to_bytes(&shuffle::table::SimpleSchema::default())
        });
        Ok(ShuffleGetReply {
            run_id: RunId(self.run_id.load(Ordering::SeqCst)),
            worker_for: self.worker_for.clone(),
            output_workers: self.worker_for.values().cloned().collect(),
            schema,
            column: "k".to_string(),
            npartitions: self.worker_for.len() as u64,
        })
    }

    async fn shuffle_barrier(&self, shuffle_id: &ShuffleId, run_id: RunId) -> Result<(), String> {
        let mut targets: Vec<WorkerAddress> = self.worker_for.values().cloned().collect();
        targets.sort();
        targets.dedup();
        for addr in targets {
            if let Some(ext) = self.registry.get(&addr.0) {
                ext.shuffle_inputs_done(shuffle_id, run_id)
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }
}

/// Routes `shuffle_receive` to the extension owning the destination
/// address, standing in for the real worker-to-worker RPC transport. Can
/// be told to fail the next delivery to a named destination exactly once.
pub struct MeshPeer {
    registry: Arc<Registry>,
    fail_once_for: Mutex<Option<String>>,
}

impl MeshPeer {
    pub fn new(registry: Arc<Registry>) -> Self {
        MeshPeer {
            registry,
            fail_once_for: Mutex::new(None),
        }
    }

    pub fn fail_next_delivery_to(&self, name: &str) {
        *self.fail_once_for.lock().unwrap() = Some(name.to_string());
    }
}

#[async_trait]
impl PeerClient for MeshPeer {
    async fn shuffle_receive(
        &self,
        address: &WorkerAddress,
        shuffle_id: &ShuffleId,
        run_id: RunId,
        data: Vec<WireShard>,
    ) -> Result<(), String> {
        {
            let mut fail_once = self.fail_once_for.lock().unwrap();
            if fail_once.as_deref() == Some(address.0.as_str()) {
                *fail_once = None;
                return Err(format!("connection refused to {address}"));
            }
        }

        let ext = self
            .registry
            .get(&address.0)
            .ok_or_else(|| format!("unknown peer {address}"))?;
        let shards: Vec<Shard> = data
            .into_iter()
            .map(|w| Shard {
                input_partition: InputPartitionId(w.input_partition),
                bytes: w.bytes,
            })
            .collect();
        ext.shuffle_receive(shuffle_id, run_id, shards)
            .await
            .map_err(|e| e.to_string())
    }
}
