//! The thread/loop bridge (`spec.md` §9): worker task threads call the
//! blocking entrypoints of [`crate::extension::ShuffleWorkerExtension`], but
//! every mutable piece of shuffle state is only ever touched from the
//! single async IO loop. `Bridge` is the "run this coroutine on the loop
//! and wait" primitive that connects the two: it wraps a
//! [`tokio::runtime::Handle`] and blocks the calling thread until the
//! submitted future resolves on that runtime.
//!
//! This is deliberately `tokio::runtime::Handle::block_on` rather than
//! `futures::executor::block_on`: the shuffle state (buffers, background
//! flushers, the CPU offload semaphore) is driven by tasks spawned onto a
//! specific tokio runtime, and a coroutine bridged in from a worker thread
//! must be polled from that same runtime to observe and mutate that state
//! safely.

use std::future::Future;

/// Bridges a blocking worker-thread call onto the shuffle extension's
/// single async IO loop.
#[derive(Clone)]
pub struct Bridge {
    handle: tokio::runtime::Handle,
}

impl Bridge {
    /// Captures the handle of the currently-running tokio runtime. Must be
    /// constructed from within that runtime (e.g. during worker startup).
    pub fn current() -> Self {
        Bridge {
            handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Bridge { handle }
    }

    /// Runs `fut` to completion on the bridged runtime, blocking the
    /// calling thread. Panics if called from within that same runtime's
    /// own worker threads, matching `Handle::block_on`'s own contract.
    pub fn block_on<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        self.handle.block_on(fut)
    }
}
