//! ShuffleWorkerExtension (`spec.md` §4.6): the per-worker registry that
//! creates, retrieves, versions, and tears down [`ShuffleRun`]s, dispatches
//! incoming RPCs to the correct run, and mediates with the scheduler.

use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::limiter::ResourceLimiter;
use crate::peer::PeerClient;
use crate::run::{ShuffleRun, ShuffleRunConfig};
use crate::scheduler::SchedulerClient;
use crate::shards_buffer::Heartbeat;
use crate::table::ShuffleTable;
use crate::types::Shard;
use crate::{InputPartitionId, OutputPartitionId, RunId, ShuffleId, WorkerAddress};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::task::JoinHandle;

/// Default comm-buffer memory cap across every shuffle on a worker: 100 MiB
/// (`spec.md` §5).
pub const DEFAULT_COMM_BYTES: u64 = 100 * 1024 * 1024;

/// Default disk-spool memory cap across every shuffle on a worker: 1 GiB
/// (`spec.md` §5).
pub const DEFAULT_DISK_BYTES: u64 = 1024 * 1024 * 1024;

/// Default concurrent disk flushers per run. Not specified numerically by
/// `spec.md` (only the comm default is); chosen conservatively since disk
/// writes within one run are already split across output partitions.
pub const DEFAULT_DISK_CONCURRENCY: usize = 4;

/// A point-in-time snapshot of one shuffle's operational state, as exposed
/// to the embedding application (`spec.md` §6 Heartbeat).
#[derive(Debug, Clone)]
pub struct ShuffleHeartbeat {
    pub disk: Heartbeat,
    pub comm: Heartbeat,
    pub diagnostics: HashMap<String, f64>,
    pub start: SystemTime,
}

pub struct ShuffleWorkerExtension<T: ShuffleTable> {
    local_address: WorkerAddress,
    scheduler: Arc<dyn SchedulerClient>,
    peer: Arc<dyn PeerClient>,
    comm_limiter: Arc<ResourceLimiter>,
    disk_limiter: Arc<ResourceLimiter>,
    comm_concurrency: usize,
    disk_concurrency: usize,
    cpu_threads: usize,
    scratch_root: PathBuf,
    shuffles: Mutex<HashMap<ShuffleId, Arc<ShuffleRun<T>>>>,
    background_closes: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: ShuffleTable> ShuffleWorkerExtension<T> {
    pub fn new(
        local_address: WorkerAddress,
        scheduler: Arc<dyn SchedulerClient>,
        peer: Arc<dyn PeerClient>,
        scratch_root: PathBuf,
    ) -> Self {
        let cpu_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        ShuffleWorkerExtension {
            local_address,
            scheduler,
            peer,
            comm_limiter: Arc::new(ResourceLimiter::new(DEFAULT_COMM_BYTES)),
            disk_limiter: Arc::new(ResourceLimiter::new(DEFAULT_DISK_BYTES)),
            comm_concurrency: crate::comm::DEFAULT_COMM_CONCURRENCY,
            disk_concurrency: DEFAULT_DISK_CONCURRENCY,
            cpu_threads,
            scratch_root,
            shuffles: Mutex::new(HashMap::new()),
            background_closes: Mutex::new(Vec::new()),
        }
    }

    /// Resolves the local run for `(shuffle_id, run_id)`, refreshing from
    /// the scheduler if the local view is stale or absent.
    pub async fn get_shuffle_run(
        &self,
        shuffle_id: &ShuffleId,
        run_id: RunId,
    ) -> Result<Arc<ShuffleRun<T>>> {
        let existing = self.shuffles.lock().unwrap().get(shuffle_id).cloned();

        match existing {
            Some(run) if run.run_id() == run_id => {
                if let Some(e) = run.exception() {
                    return Err(e);
                }
                Ok(run)
            }
            Some(run) if run.run_id() > run_id => Err(Error::StaleShuffle {
                shuffle_id: shuffle_id.clone(),
                requested: run_id,
                current: run.run_id(),
            }),
            _ => {
                let refreshed = self.refresh_shuffle(shuffle_id, None, None, None).await?;
                if refreshed.run_id() < run_id {
                    return Err(Error::InvalidShuffleState {
                        shuffle_id: shuffle_id.clone(),
                        requested: run_id,
                        current: refreshed.run_id(),
                    });
                }
                if refreshed.run_id() > run_id {
                    return Err(Error::StaleShuffle {
                        shuffle_id: shuffle_id.clone(),
                        requested: run_id,
                        current: refreshed.run_id(),
                    });
                }
                if let Some(e) = refreshed.exception() {
                    return Err(e);
                }
                Ok(refreshed)
            }
        }
    }

    /// Called from ingest: returns the local run if one exists, otherwise
    /// registers a new one with the scheduler using the caller-supplied
    /// empty schema and partitioning spec.
    pub async fn get_or_create_shuffle(
        &self,
        shuffle_id: &ShuffleId,
        empty_schema: T::Schema,
        column: String,
        npartitions: u64,
    ) -> Result<Arc<ShuffleRun<T>>> {
        if let Some(run) = self.shuffles.lock().unwrap().get(shuffle_id).cloned() {
            if let Some(e) = run.exception() {
                return Err(e);
            }
            return Ok(run);
        }

        let schema_bytes = T::schema_to_bytes(&empty_schema);
        self.refresh_shuffle(shuffle_id, Some(schema_bytes), Some(column), Some(npartitions))
            .await
    }

    async fn refresh_shuffle(
        &self,
        shuffle_id: &ShuffleId,
        empty_schema: Option<bytes::Bytes>,
        column: Option<String>,
        npartitions: Option<u64>,
    ) -> Result<Arc<ShuffleRun<T>>> {
        let reply = self
            .scheduler
            .shuffle_get(
                shuffle_id,
                empty_schema.as_ref(),
                column.as_deref(),
                npartitions,
                &self.local_address,
            )
            .await
            .map_err(|message| Error::SchedulerError {
                shuffle_id: shuffle_id.clone(),
                message,
            })?;

        let existing = self.shuffles.lock().unwrap().get(shuffle_id).cloned();
        if let Some(existing) = &existing {
            if existing.run_id() >= reply.run_id {
                return Ok(existing.clone());
            }
        }

        let schema = T::schema_from_bytes(&reply.schema).map_err(|message| Error::CodecError {
            shuffle_id: shuffle_id.clone(),
            message,
        })?;

        let scratch_dir = self
            .scratch_root
            .join(format!("shuffle-{}-{}", shuffle_id, reply.run_id));

        let run = Arc::new(
            ShuffleRun::new(ShuffleRunConfig {
                shuffle_id: shuffle_id.clone(),
                run_id: reply.run_id,
                worker_for: crate::types::WorkerFor::new(reply.worker_for),
                schema,
                local_address: self.local_address.clone(),
                scheduler: self.scheduler.clone(),
                peer: self.peer.clone(),
                comm_limiter: self.comm_limiter.clone(),
                disk_limiter: self.disk_limiter.clone(),
                comm_concurrency: self.comm_concurrency,
                disk_concurrency: self.disk_concurrency,
                cpu_threads: self.cpu_threads,
                scratch_dir,
            })
            .await?,
        );

        if let Some(stale) = existing {
            self.spawn_background_close(stale, None);
        }

        self.shuffles
            .lock()
            .unwrap()
            .insert(shuffle_id.clone(), run.clone());
        Ok(run)
    }

    fn spawn_background_close(&self, run: Arc<ShuffleRun<T>>, exc: Option<Error>) {
        let handle = tokio::spawn(async move {
            if let Some(exc) = exc {
                run.fail(exc);
            }
            run.close().await;
        });
        self.background_closes.lock().unwrap().push(handle);
    }

    /// `shuffle_receive` RPC handler (server-side).
    pub async fn shuffle_receive(
        &self,
        shuffle_id: &ShuffleId,
        run_id: RunId,
        data: Vec<Shard>,
    ) -> Result<()> {
        let run = self.get_shuffle_run(shuffle_id, run_id).await?;
        run.receive(data).await
    }

    /// `shuffle_inputs_done` RPC handler, fanned out by the scheduler once
    /// every participant has reached the barrier.
    pub async fn shuffle_inputs_done(&self, shuffle_id: &ShuffleId, run_id: RunId) -> Result<()> {
        let run = self.get_shuffle_run(shuffle_id, run_id).await?;
        run.inputs_done().await
    }

    /// `shuffle_fail` stream handler. Synchronous by contract: the run is
    /// removed from the registry immediately so no concurrent
    /// `get_shuffle_run` can resurrect it, with the actual teardown
    /// deferred to a background task. Stale `run_id` is a silent no-op.
    pub fn shuffle_fail(&self, shuffle_id: &ShuffleId, run_id: RunId, message: String) {
        let removed = {
            let mut shuffles = self.shuffles.lock().unwrap();
            match shuffles.get(shuffle_id) {
                Some(run) if run.run_id() == run_id => shuffles.remove(shuffle_id),
                _ => None,
            }
        };

        if let Some(run) = removed {
            self.spawn_background_close(
                run,
                Some(Error::PeerFailed {
                    shuffle_id: shuffle_id.clone(),
                    run_id,
                    message,
                }),
            );
        }
    }

    /// Thread-facing `add_partition` entrypoint: resolves or creates the
    /// run, then offloads and dispatches `table`.
    pub fn add_partition_blocking(
        &self,
        bridge: &Bridge,
        shuffle_id: &ShuffleId,
        table: T,
        input_partition: InputPartitionId,
        empty_schema: T::Schema,
        column: String,
        npartitions: u64,
    ) -> Result<RunId> {
        bridge.block_on(async {
            let run = self
                .get_or_create_shuffle(shuffle_id, empty_schema, column, npartitions)
                .await?;
            run.add_partition(table, input_partition).await
        })
    }

    /// Thread-facing `barrier` entrypoint. Asserts every caller-supplied
    /// `run_ids` entry agrees, per `spec.md` §6.
    pub fn barrier_blocking(
        &self,
        bridge: &Bridge,
        shuffle_id: &ShuffleId,
        run_ids: &[RunId],
    ) -> Result<RunId> {
        let run_id = *run_ids.first().ok_or_else(|| Error::SchedulerError {
            shuffle_id: shuffle_id.clone(),
            message: "barrier called with no run ids".to_string(),
        })?;
        if run_ids.iter().any(|r| *r != run_id) {
            return Err(Error::InvalidShuffleState {
                shuffle_id: shuffle_id.clone(),
                requested: run_id,
                current: run_id,
            });
        }

        bridge.block_on(async {
            let run = self.get_shuffle_run(shuffle_id, run_id).await?;
            run.barrier().await?;
            Ok(run_id)
        })
    }

    /// Thread-facing `get_output_partition` entrypoint.
    pub fn get_output_partition_blocking(
        &self,
        bridge: &Bridge,
        shuffle_id: &ShuffleId,
        run_id: RunId,
        partition: OutputPartitionId,
    ) -> Result<T> {
        bridge.block_on(async {
            let run = self.get_shuffle_run(shuffle_id, run_id).await?;
            run.get_output_partition(partition).await
        })
    }

    pub fn heartbeat(&self, shuffle_id: &ShuffleId) -> Option<ShuffleHeartbeat> {
        let run = self.shuffles.lock().unwrap().get(shuffle_id).cloned()?;
        Some(ShuffleHeartbeat {
            disk: run.disk_heartbeat(),
            comm: run.comm_heartbeat(),
            diagnostics: run.diagnostics(),
            start: run.start(),
        })
    }

    /// Closes every run and awaits every background close scheduled by a
    /// supersession or `shuffle_fail`, per `spec.md` §9's open question on
    /// tracking background closes during shutdown.
    pub async fn close(&self) {
        let runs: Vec<Arc<ShuffleRun<T>>> = {
            let mut shuffles = self.shuffles.lock().unwrap();
            shuffles.drain().map(|(_, run)| run).collect()
        };
        for run in runs {
            run.close().await;
        }

        let background = std::mem::take(&mut *self.background_closes.lock().unwrap());
        for handle in background {
            let _ = handle.await;
        }
    }
}
