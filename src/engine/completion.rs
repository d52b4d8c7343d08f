// Completion handle — a cloneable, awaitable "this work has finished" signal.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Resolves once the associated cleanup or disposal work has finished.
///
/// Cloning is cheap; every clone observes the same completion.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    done: CancellationToken,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            done: CancellationToken::new(),
        }
    }

    /// A handle that is already complete.
    pub fn completed() -> Self {
        let completion = Self::new();
        completion.complete();
        completion
    }

    /// Mark the work as finished. Idempotent.
    pub fn complete(&self) {
        self.done.cancel();
    }

    pub fn is_complete(&self) -> bool {
        self.done.is_cancelled()
    }

    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    /// Wait at most `timeout`. Returns `true` if the work finished in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_completion() {
        let completion = Completion::new();
        let observer = completion.clone();
        assert!(!observer.is_complete());

        let waiter = tokio::spawn(async move { observer.wait().await });
        completion.complete();
        waiter.await.unwrap();
        assert!(completion.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_reports_unfinished_work() {
        let completion = Completion::new();
        assert!(!completion.wait_timeout(Duration::from_millis(50)).await);
        assert!(Completion::completed().wait_timeout(Duration::ZERO).await);
    }
}
