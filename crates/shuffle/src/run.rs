//! ShuffleRun (`spec.md` §4.5): the state machine for one (shuffle_id,
//! run_id) on one worker. Composes an inbound [`DiskShardsBuffer`], an
//! outbound [`CommShardsBuffer`], a CPU offload pool, and the immutable
//! run configuration handed down by the scheduler.

use crate::comm::CommShardsBuffer;
use crate::disk::DiskShardsBuffer;
use crate::error::{Error, Result};
use crate::limiter::ResourceLimiter;
use crate::peer::PeerClient;
use crate::scheduler::SchedulerClient;
use crate::shards_buffer::Heartbeat;
use crate::table::ShuffleTable;
use crate::types::{Shard, WorkerFor};
use crate::{InputPartitionId, OutputPartitionId, RunId, ShuffleId, WorkerAddress};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tokio::sync::{Notify, Semaphore};

struct State {
    transferred: bool,
    received: HashSet<InputPartitionId>,
    total_recvd: u64,
}

/// Configuration handed down from the scheduler's `shuffle_get` reply,
/// sufficient to construct one ShuffleRun.
pub struct ShuffleRunConfig<T: ShuffleTable> {
    pub shuffle_id: ShuffleId,
    pub run_id: RunId,
    pub worker_for: WorkerFor,
    pub schema: T::Schema,
    pub local_address: WorkerAddress,
    pub scheduler: Arc<dyn SchedulerClient>,
    pub peer: Arc<dyn PeerClient>,
    pub comm_limiter: Arc<ResourceLimiter>,
    pub disk_limiter: Arc<ResourceLimiter>,
    pub comm_concurrency: usize,
    pub disk_concurrency: usize,
    pub cpu_threads: usize,
    pub scratch_dir: PathBuf,
}

pub struct ShuffleRun<T: ShuffleTable> {
    shuffle_id: ShuffleId,
    run_id: RunId,
    worker_for: WorkerFor,
    schema: T::Schema,
    npartitions: u64,
    local_address: WorkerAddress,
    scheduler: Arc<dyn SchedulerClient>,
    comm: CommShardsBuffer,
    disk: DiskShardsBuffer,
    cpu: Arc<Semaphore>,
    state: Mutex<State>,
    exception: Mutex<Option<Error>>,
    closed: AtomicBool,
    closed_done: AtomicBool,
    closed_notify: Notify,
    diagnostics: Mutex<HashMap<String, f64>>,
    start: SystemTime,
}

impl<T: ShuffleTable> ShuffleRun<T> {
    pub async fn new(config: ShuffleRunConfig<T>) -> Result<Self> {
        let npartitions = config.worker_for.npartitions();
        let comm = CommShardsBuffer::new(
            config.comm_limiter,
            config.comm_concurrency,
            config.peer,
            config.shuffle_id.clone(),
            config.run_id,
        );
        let disk = DiskShardsBuffer::new(
            config.disk_limiter,
            config.disk_concurrency,
            config.scratch_dir,
        )
        .await
        .map_err(|e| Error::CodecError {
            shuffle_id: config.shuffle_id.clone(),
            message: format!("creating scratch directory: {e}"),
        })?;

        Ok(ShuffleRun {
            shuffle_id: config.shuffle_id,
            run_id: config.run_id,
            worker_for: config.worker_for,
            schema: config.schema,
            npartitions,
            local_address: config.local_address,
            scheduler: config.scheduler,
            comm,
            disk,
            cpu: Arc::new(Semaphore::new(config.cpu_threads.max(1))),
            state: Mutex::new(State {
                transferred: false,
                received: HashSet::new(),
                total_recvd: 0,
            }),
            exception: Mutex::new(None),
            closed: AtomicBool::new(false),
            closed_done: AtomicBool::new(false),
            closed_notify: Notify::new(),
            diagnostics: Mutex::new(HashMap::new()),
            start: SystemTime::now(),
        })
    }

    pub fn shuffle_id(&self) -> &ShuffleId {
        &self.shuffle_id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn exception(&self) -> Option<Error> {
        self.exception.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        if let Some(e) = self.exception.lock().unwrap().clone() {
            return Err(e);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuffleClosed {
                shuffle_id: self.shuffle_id.clone(),
            });
        }
        Ok(())
    }

    /// Latches the first failure observed by this run. Later failures do
    /// not overwrite it: the sticky exception always reports the original
    /// cause.
    fn latch(&self, err: Error) -> Error {
        let mut exc = self.exception.lock().unwrap();
        if exc.is_none() {
            *exc = Some(err.clone());
        }
        err
    }

    fn record(&self, name: &str, started: Instant) {
        let dur = started.elapsed().as_secs_f64();
        *self
            .diagnostics
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0.0) += dur;
    }

    /// Runs `f` on the CPU offload pool, bounded to `cpu_threads` concurrent
    /// tasks. Mirrors the source's `run_in_executor` hand-off: `f` receives
    /// no access to the run's shared mutable state.
    async fn offload<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> std::result::Result<R, String> + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .cpu
            .clone()
            .acquire_owned()
            .await
            .expect("cpu semaphore is never closed");
        let shuffle_id = self.shuffle_id.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| Error::CodecError {
            shuffle_id: shuffle_id.clone(),
            message: format!("offload task panicked: {e}"),
        })?
        .map_err(|message| Error::CodecError {
            shuffle_id,
            message,
        })
    }

    /// Splits `table` across destination workers via WorkerFor and hands
    /// the resulting shards to the comm buffer. Every destination worker
    /// receives exactly one shard for this input partition, even when it
    /// owns several output partitions: `receive` deduplicates by
    /// `input_partition` alone, so a second shard carrying the same
    /// `input_partition` would be silently dropped. Returns the run_id so
    /// callers can assert every input partition used the same run.
    pub async fn add_partition(&self, table: T, input_partition: InputPartitionId) -> Result<RunId> {
        self.check()?;
        {
            let state = self.state.lock().unwrap();
            if state.transferred {
                return Err(self.latch(Error::BarrierOrderingViolation {
                    shuffle_id: self.shuffle_id.clone(),
                    run_id: self.run_id,
                }));
            }
        }

        let started = Instant::now();
        let worker_for = self.worker_for.clone();
        let npartitions = self.npartitions;
        let schema = self.schema.clone();
        let grouped: HashMap<WorkerAddress, Vec<Shard>> = self
            .offload(move || {
                let mut by_worker: HashMap<WorkerAddress, Vec<T>> = HashMap::new();
                for (partition, subtable) in table.split_by_output_partition(npartitions) {
                    let address = worker_for
                        .worker_for(partition)
                        .cloned()
                        .ok_or_else(|| format!("no worker assigned to output partition {partition}"))?;
                    by_worker.entry(address).or_default().push(subtable);
                }
                let mut out: HashMap<WorkerAddress, Vec<Shard>> = HashMap::new();
                for (address, subtables) in by_worker {
                    let merged = T::concat(&schema, subtables)?;
                    out.insert(
                        address,
                        vec![Shard {
                            input_partition,
                            bytes: merged.to_bytes(),
                        }],
                    );
                }
                Ok(out)
            })
            .await
            .map_err(|e| self.latch(e))?;

        self.comm.write(grouped).await.map_err(|message| {
            self.latch(Error::PeerFailed {
                shuffle_id: self.shuffle_id.clone(),
                run_id: self.run_id,
                message,
            })
        })?;

        self.record("add_partition", started);
        Ok(self.run_id)
    }

    /// Deduplicates incoming shards by `input_partition`, merges survivors,
    /// re-splits by output partition, and spools the result to disk.
    pub async fn receive(&self, data: Vec<Shard>) -> Result<()> {
        self.check()?;

        let started = Instant::now();
        let survivors: Vec<(InputPartitionId, Bytes)> = {
            let mut state = self.state.lock().unwrap();
            let mut survivors = Vec::new();
            for shard in data {
                if state.received.insert(shard.input_partition) {
                    state.total_recvd += shard.bytes.len() as u64;
                    survivors.push((shard.input_partition, shard.bytes));
                }
            }
            survivors
        };

        if survivors.is_empty() {
            return Ok(());
        }

        let schema = self.schema.clone();
        let npartitions = self.npartitions;
        let grouped: HashMap<OutputPartitionId, Vec<Bytes>> = self
            .offload(move || {
                let tables = survivors
                    .iter()
                    .map(|(_, bytes)| T::from_bytes(&schema, bytes))
                    .collect::<std::result::Result<Vec<_>, String>>()?;
                let merged = T::concat(&schema, tables)?;
                let mut out = HashMap::new();
                for (partition, subtable) in merged.split_by_output_partition(npartitions) {
                    out.insert(partition, vec![subtable.to_bytes()]);
                }
                Ok(out)
            })
            .await
            .map_err(|e| self.latch(e))?;

        self.disk.write(grouped).await.map_err(|message| {
            self.latch(Error::CodecError {
                shuffle_id: self.shuffle_id.clone(),
                message,
            })
        })?;

        self.record("receive", started);
        Ok(())
    }

    pub fn total_received_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_recvd
    }

    /// Announces that this worker has reached the barrier. The scheduler
    /// fans `shuffle_inputs_done` out to every participating worker,
    /// including this one, before replying.
    pub async fn barrier(&self) -> Result<()> {
        self.check()?;
        let started = Instant::now();
        self.scheduler
            .shuffle_barrier(&self.shuffle_id, self.run_id)
            .await
            .map_err(|message| {
                self.latch(Error::SchedulerError {
                    shuffle_id: self.shuffle_id.clone(),
                    message,
                })
            })?;
        self.record("barrier", started);
        Ok(())
    }

    /// Marks ingest complete and waits for every locally-produced shard to
    /// be dispatched. Asserts it has not already been called.
    pub async fn inputs_done(&self) -> Result<()> {
        self.check()?;
        {
            let mut state = self.state.lock().unwrap();
            if state.transferred {
                return Err(self.latch(Error::BarrierOrderingViolation {
                    shuffle_id: self.shuffle_id.clone(),
                    run_id: self.run_id,
                }));
            }
            state.transferred = true;
        }

        self.comm.flush().await.map_err(|message| {
            self.latch(Error::PeerFailed {
                shuffle_id: self.shuffle_id.clone(),
                run_id: self.run_id,
                message,
            })
        })?;
        self.comm.raise_on_exception().map_err(|message| {
            self.latch(Error::PeerFailed {
                shuffle_id: self.shuffle_id.clone(),
                run_id: self.run_id,
                message,
            })
        })?;
        Ok(())
    }

    pub fn is_transferred(&self) -> bool {
        self.state.lock().unwrap().transferred
    }

    /// Reads back the assembled output partition `i`. Well-defined only
    /// once ingest has completed and `i` is owned by this worker.
    pub async fn get_output_partition(&self, partition: OutputPartitionId) -> Result<T> {
        self.check()?;
        if !self.is_transferred() {
            return Err(self.latch(Error::BarrierOrderingViolation {
                shuffle_id: self.shuffle_id.clone(),
                run_id: self.run_id,
            }));
        }
        assert_eq!(
            self.worker_for.worker_for(partition),
            Some(&self.local_address),
            "get_output_partition called for a partition not owned by this worker"
        );

        let started = Instant::now();
        self.disk.flush().await.map_err(|message| {
            self.latch(Error::CodecError {
                shuffle_id: self.shuffle_id.clone(),
                message,
            })
        })?;

        let frames = self.disk.read(partition).await.map_err(|e| {
            self.latch(Error::CodecError {
                shuffle_id: self.shuffle_id.clone(),
                message: e.to_string(),
            })
        })?;

        let result = match frames {
            None => T::empty(&self.schema),
            Some(frames) => {
                let schema = self.schema.clone();
                self.offload(move || {
                    let tables = frames
                        .iter()
                        .map(|bytes| T::from_bytes(&schema, bytes))
                        .collect::<std::result::Result<Vec<_>, String>>()?;
                    T::concat(&schema, tables)
                })
                .await
                .map_err(|e| self.latch(e))?
            }
        };

        self.record("get_output_partition", started);
        Ok(result)
    }

    /// Latches `exc` as the run's sticky exception, unless already closed.
    /// Does not itself close the run.
    pub fn fail(&self, exc: Error) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut exception = self.exception.lock().unwrap();
        if exception.is_none() {
            *exception = Some(exc);
        }
    }

    /// Idempotent, latchable close: concurrent callers all observe the
    /// same completion rather than racing to tear buffers down twice.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            while !self.closed_done.load(Ordering::SeqCst) {
                let notified = self.closed_notify.notified();
                if self.closed_done.load(Ordering::SeqCst) {
                    break;
                }
                notified.await;
            }
            return;
        }

        self.comm.close().await;
        self.disk.close().await;
        self.closed_done.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
    }

    pub fn comm_heartbeat(&self) -> Heartbeat {
        self.comm.heartbeat()
    }

    pub fn disk_heartbeat(&self) -> Heartbeat {
        self.disk.heartbeat()
    }

    pub fn diagnostics(&self) -> HashMap<String, f64> {
        self.diagnostics.lock().unwrap().clone()
    }

    pub fn start(&self) -> SystemTime {
        self.start
    }
}
