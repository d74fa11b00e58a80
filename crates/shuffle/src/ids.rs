use std::fmt;

/// ShuffleId is an opaque, globally-unique identifier of one logical shuffle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShuffleId(pub String);

impl fmt::Display for ShuffleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShuffleId {
    fn from(s: &str) -> Self {
        ShuffleId(s.to_string())
    }
}

impl From<String> for ShuffleId {
    fn from(s: String) -> Self {
        ShuffleId(s)
    }
}

/// RunId is a monotonically-increasing identifier issued by the scheduler.
/// A (ShuffleId, RunId) pair identifies one attempt at a shuffle; a later
/// RunId always supersedes an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// WorkerAddress is an opaque, transport-routable identifier of a worker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerAddress(pub String);

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerAddress {
    fn from(s: &str) -> Self {
        WorkerAddress(s.to_string())
    }
}

impl From<String> for WorkerAddress {
    fn from(s: String) -> Self {
        WorkerAddress(s)
    }
}

/// InputPartitionId identifies one input partition held by some worker
/// prior to the shuffle. It is carried alongside outbound shards so the
/// receiver can deduplicate retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputPartitionId(pub u64);

impl fmt::Display for InputPartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// OutputPartitionId identifies one output bucket produced by the shuffle,
/// owned by exactly one worker for the life of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputPartitionId(pub u64);

impl fmt::Display for OutputPartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
