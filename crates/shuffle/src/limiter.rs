use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// ResourceLimiter is a bounded counter over bytes, providing coarse
/// async back-pressure. `acquire(n)` suspends until admitting `n` more
/// bytes would not push `in_use` over `capacity`, then credits `n` to
/// `in_use`; `release(n)` debits it back. Waiters are served FIFO, so the
/// limiter is starvation-free.
///
/// An oversized acquire (`n > capacity`) is still admitted: it waits until
/// `in_use` drops to zero and then proceeds alone, rather than deadlocking
/// forever. This lets a single very large shard pass through a limiter
/// whose capacity is smaller than that shard.
pub struct ResourceLimiter {
    capacity: u64,
    state: Mutex<State>,
}

struct State {
    in_use: u64,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    amount: u64,
    notify: oneshot::Sender<()>,
}

impl ResourceLimiter {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                in_use: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Snapshot of bytes currently credited against the limiter.
    pub fn in_use(&self) -> u64 {
        self.state.lock().unwrap().in_use
    }

    /// Suspends until `n` bytes can be admitted, then admits them.
    pub async fn acquire(&self, n: u64) {
        let rx = {
            let mut state = self.state.lock().unwrap();

            if state.waiters.is_empty() && Self::admits(self.capacity, state.in_use, n) {
                state.in_use += n;
                return;
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                amount: n,
                notify: tx,
            });
            rx
        };

        // The queued waiter is woken only once it has been admitted by a
        // concurrent `release`, so there is nothing left to check here.
        let _ = rx.await;
    }

    /// Releases `n` previously-acquired bytes, waking any waiters that can
    /// now be admitted.
    pub fn release(&self, n: u64) {
        let mut state = self.state.lock().unwrap();
        state.in_use = state.in_use.saturating_sub(n);

        while let Some(front) = state.waiters.front() {
            if Self::admits(self.capacity, state.in_use, front.amount) {
                let waiter = state.waiters.pop_front().unwrap();
                state.in_use += waiter.amount;
                // Ignore a dropped receiver: the waiting task gave up.
                let _ = waiter.notify.send(());
            } else {
                break;
            }
        }
    }

    fn admits(capacity: u64, in_use: u64, n: u64) -> bool {
        in_use == 0 || in_use + n <= capacity
    }
}
