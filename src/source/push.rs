// Push-side handle — lets a producer closure feed a runner's queue directly.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;

use crate::engine::queue::BoundedQueue;
use crate::engine::state::RunnerId;

/// Producer handle given to push-based runner bodies.
///
/// `add` waits while the runner's queue is full and fails once the runner is
/// aborted or disposed, so a producer loop written as `producer.add(x).await?`
/// stops on its own.
pub struct Producer<T> {
    id: RunnerId,
    queue: Arc<BoundedQueue<T>>,
    stop: CancellationToken,
}

impl<T> Producer<T> {
    pub(crate) fn new(id: RunnerId, queue: Arc<BoundedQueue<T>>, stop: CancellationToken) -> Self {
        Self { id, queue, stop }
    }

    pub async fn add(&self, item: T) -> Result<()> {
        if self.queue.add(item, &self.stop).await {
            Ok(())
        } else {
            Err(anyhow!("{} stopped accepting items", self.id))
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Fires when the runner is aborted or disposed.
    pub fn stopped(&self) -> CancellationToken {
        self.stop.clone()
    }
}
