// Pull source contract — the async trait every runner feed drains.

use anyhow::Result;
use async_trait::async_trait;

/// Pull-based data source drained by a runner's background task.
///
/// `Ok(None)` ends the stream (the runner completes once consumers drain the
/// queue); `Err` ends it with a failure that is surfaced as `Failed`.
/// A pending `next` may be dropped at any time when the runner is aborted or
/// disposed, so implementations must not rely on running to completion.
#[async_trait]
pub trait PullSource<T>: Send {
    async fn next(&mut self) -> Result<Option<T>>;
}

#[async_trait]
impl<T, S> PullSource<T> for Box<S>
where
    T: Send,
    S: PullSource<T> + ?Sized,
{
    async fn next(&mut self) -> Result<Option<T>> {
        (**self).next().await
    }
}
