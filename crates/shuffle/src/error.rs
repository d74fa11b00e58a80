use crate::{RunId, ShuffleId};

/// Error is the sticky, cloneable failure type latched into a [`crate::run::ShuffleRun`]
/// or [`crate::extension::ShuffleWorkerExtension`]. Every public entry point checks for
/// a latched `Error` before doing any work, and re-raises it verbatim to every caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("shuffle {shuffle_id} has been closed")]
    ShuffleClosed { shuffle_id: ShuffleId },

    #[error("shuffle {shuffle_id} run {requested} is stale (current run is {current})")]
    StaleShuffle {
        shuffle_id: ShuffleId,
        requested: RunId,
        current: RunId,
    },

    #[error(
        "shuffle {shuffle_id} run {requested} is newer than the locally refreshed run {current}: protocol violation"
    )]
    InvalidShuffleState {
        shuffle_id: ShuffleId,
        requested: RunId,
        current: RunId,
    },

    #[error("add_partition called after inputs_done for shuffle {shuffle_id} run {run_id}")]
    BarrierOrderingViolation {
        shuffle_id: ShuffleId,
        run_id: RunId,
    },

    #[error("peer failed shuffle {shuffle_id} run {run_id}: {message}")]
    PeerFailed {
        shuffle_id: ShuffleId,
        run_id: RunId,
        message: String,
    },

    #[error("scheduler rejected shuffle {shuffle_id}: {message}")]
    SchedulerError {
        shuffle_id: ShuffleId,
        message: String,
    },

    #[error("codec error in shuffle {shuffle_id}: {message}")]
    CodecError {
        shuffle_id: ShuffleId,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
