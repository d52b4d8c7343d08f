// Iterator adapters — turn plain sequences into pull sources.

use anyhow::Result;
use async_trait::async_trait;

use super::traits::PullSource;

/// Pull source over an infallible iterator.
pub struct IterSource<I> {
    inner: I,
}

impl<I> IterSource<I> {
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<I> PullSource<I::Item> for IterSource<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    async fn next(&mut self) -> Result<Option<I::Item>> {
        Ok(self.inner.next())
    }
}

/// Pull source over an iterator of results; the first `Err` fails the runner.
pub struct TryIterSource<I> {
    inner: I,
}

impl<I> TryIterSource<I> {
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<I, T> PullSource<T> for TryIterSource<I>
where
    I: Iterator<Item = Result<T>> + Send,
    T: Send,
{
    async fn next(&mut self) -> Result<Option<T>> {
        self.inner.next().transpose()
    }
}
