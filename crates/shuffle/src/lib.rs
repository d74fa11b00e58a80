//! shuffle is the per-worker runtime of a peer-to-peer data shuffle: it
//! ingests input partitions, splits each into shards addressed to peer
//! workers, transmits those shards, receives peers' shards, spools them to
//! local disk, and at query time reassembles one output partition from the
//! spooled shards.
//!
//! The columnar codec, the wire transport, and the scheduler's own
//! bookkeeping are external collaborators, reached only through the
//! [`table::ShuffleTable`], [`peer::PeerClient`], and
//! [`scheduler::SchedulerClient`] traits.

pub mod bridge;
pub mod comm;
pub mod disk;
pub mod error;
pub mod extension;
mod ids;
pub mod limiter;
pub mod peer;
pub mod run;
pub mod scheduler;
pub mod shards_buffer;
pub mod table;
pub mod types;

pub use error::{Error, Result};
pub use ids::{InputPartitionId, OutputPartitionId, RunId, ShuffleId, WorkerAddress};
