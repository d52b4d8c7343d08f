// Bounded FIFO between a runner's background task and its single consumer.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded queue with backpressure on `add`.
///
/// Free slots are tracked by a semaphore: the producer takes a permit per
/// item, the consumer returns permits for the items it removes. The consumer
/// is woken through a `Notify` whose stored permit covers a push that happens
/// before the consumer starts waiting.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    slots: Semaphore,
    ready: Notify,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            slots: Semaphore::new(capacity),
            ready: Notify::new(),
            capacity,
        }
    }

    /// Append `item`, waiting for a free slot while the queue is full.
    ///
    /// Returns `false` (dropping the item) if `stop` fires or the queue is
    /// closed before a slot frees up.
    pub async fn add(&self, item: T, stop: &CancellationToken) -> bool {
        if self.slots.available_permits() == 0 {
            trace!("queue full ({} items), producer waiting", self.capacity);
        }
        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => return false,
            permit = self.slots.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };
        permit.forget();

        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.items.push_back(item);
        }
        self.ready.notify_one();
        true
    }

    /// Move up to `max` items into `out`, freeing their slots. Returns the count moved.
    pub fn take_into(&self, out: &mut VecDeque<T>, max: usize) -> usize {
        let moved = {
            let mut state = self.state.lock();
            let n = max.min(state.items.len());
            out.extend(state.items.drain(..n));
            n
        };
        if moved > 0 {
            self.slots.add_permits(moved);
        }
        moved
    }

    /// `(buffered item count, closed)` observed atomically.
    pub fn snapshot(&self) -> (usize, bool) {
        let state = self.state.lock();
        (state.items.len(), state.closed)
    }

    /// Closed and fully drained: nothing more will ever be delivered.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.items.is_empty()
    }

    /// Stop accepting items. Blocked producers are released; buffered items stay readable.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.slots.close();
        self.ready.notify_one();
    }

    /// Drop everything still buffered.
    pub fn clear(&self) {
        let dropped = {
            let mut state = self.state.lock();
            let n = state.items.len();
            state.items.clear();
            n
        };
        if dropped > 0 && !self.slots.is_closed() {
            self.slots.add_permits(dropped);
        }
    }

    /// Wake the consumer without adding data (abort, disposal).
    pub fn wake(&self) {
        self.ready.notify_one();
    }

    /// Resolves after the next push, close, or wake.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }
}
