// Streaming runner — a background task drains a pull or push source into a bounded queue
// that consumers poll or await.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::completion::Completion;
use super::queue::BoundedQueue;
use super::runner::{ReadRequest, Runner, RunnerChunk, RunnerContext, RunnerControl};
use super::state::{RunnerCore, RunnerId, RunnerStatus};
use crate::config::RunnerOptions;
use crate::error::{Error, Result};
use crate::source::{Producer, PullSource};

type PushBody<T> =
    Box<dyn FnOnce(Producer<T>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// What feeds a streaming runner.
pub enum Feed<T> {
    /// The background task pulls items one by one.
    Pull(Box<dyn PullSource<T>>),
    /// The background task runs a body that pushes items through a [`Producer`].
    Push(PushBody<T>),
}

/// How the background task ended.
#[derive(Clone)]
enum Outcome {
    Completed,
    Failed(Arc<anyhow::Error>),
    Aborted,
}

/// State shared between the runner handle and its background task.
///
/// `stop` halts the background task as soon as the runner aborts. The core
/// token is held back until the consumer has received the final chunk.
struct Shared<T> {
    core: RunnerCore,
    stop: CancellationToken,
    queue: Arc<BoundedQueue<T>>,
    outcome: Mutex<Option<Outcome>>,
    finished: Completion,
}

impl<T> Shared<T> {
    fn abort(&self) -> bool {
        self.core.abort(true, || {
            self.stop.cancel();
            self.queue.wake();
        })
    }

    fn finish(&self, outcome: Outcome) {
        match &outcome {
            Outcome::Completed => debug!("{} source completed", self.core.id()),
            Outcome::Failed(e) => debug!("{} source failed: {}", self.core.id(), e),
            Outcome::Aborted => debug!("{} source stopped", self.core.id()),
        }
        *self.outcome.lock() = Some(outcome);
        self.queue.close();
        self.finished.complete();
    }
}

/// Runner backed by a bounded queue.
///
/// Background failures are not thrown: once the consumer has drained every
/// item produced before the failure, the next read reports `Failed` with the
/// error attached.
pub struct StreamingRunner<T> {
    shared: Arc<Shared<T>>,
    /// Items already taken off the queue but not yet delivered.
    stash: tokio::sync::Mutex<VecDeque<T>>,
    disposing: CancellationToken,
    result_type: &'static str,
}

impl<T: Send + 'static> StreamingRunner<T> {
    /// Create the runner and spawn its background task on the current tokio runtime.
    ///
    /// When `session_token` fires, the runner aborts itself.
    pub fn spawn(
        id: RunnerId,
        options: &RunnerOptions,
        session_token: Option<CancellationToken>,
        feed: Feed<T>,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            core: RunnerCore::new(id),
            stop: CancellationToken::new(),
            queue: Arc::new(BoundedQueue::new(options.queue_capacity)),
            outcome: Mutex::new(None),
            finished: Completion::new(),
        });
        let runner = Arc::new(Self {
            shared: shared.clone(),
            stash: tokio::sync::Mutex::new(VecDeque::new()),
            disposing: CancellationToken::new(),
            result_type: std::any::type_name::<T>(),
        });

        let session_token = session_token.unwrap_or_default();
        tokio::spawn(async move {
            let outcome = Self::drive(&shared, feed, session_token).await;
            shared.finish(outcome);
        });

        runner
    }

    pub fn pull(
        id: RunnerId,
        options: &RunnerOptions,
        session_token: Option<CancellationToken>,
        source: impl PullSource<T> + 'static,
    ) -> Arc<Self> {
        Self::spawn(id, options, session_token, Feed::Pull(Box::new(source)))
    }

    pub fn push<F, Fut>(
        id: RunnerId,
        options: &RunnerOptions,
        session_token: Option<CancellationToken>,
        body: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Producer<T>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let body: PushBody<T> = Box::new(move |producer| Box::pin(body(producer)));
        Self::spawn(id, options, session_token, Feed::Push(body))
    }

    /// Single-result runner: runs `body` once and yields its value.
    ///
    /// `body` receives a token that fires when the runner is aborted.
    pub fn function<F, Fut>(
        id: RunnerId,
        options: &RunnerOptions,
        session_token: Option<CancellationToken>,
        body: F,
    ) -> Arc<Self>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::push(id, options, session_token, move |producer| async move {
            let value = body(producer.stopped()).await?;
            producer.add(value).await
        })
    }

    async fn drive(shared: &Shared<T>, feed: Feed<T>, session_token: CancellationToken) -> Outcome {
        shared.core.mark_started();
        let stop = shared.stop.clone();

        match feed {
            Feed::Pull(mut source) => loop {
                let next = tokio::select! {
                    biased;
                    _ = stop.cancelled() => return Outcome::Aborted,
                    _ = session_token.cancelled() => {
                        debug!("{} owning session ended", shared.core.id());
                        shared.abort();
                        return Outcome::Aborted;
                    }
                    next = source.next() => next,
                };
                match next {
                    Ok(Some(item)) => {
                        let added = tokio::select! {
                            biased;
                            _ = session_token.cancelled() => {
                                shared.abort();
                                false
                            }
                            added = shared.queue.add(item, &stop) => added,
                        };
                        if !added {
                            return Outcome::Aborted;
                        }
                    }
                    Ok(None) => return Outcome::Completed,
                    Err(e) => return Outcome::Failed(Arc::new(e)),
                }
            },
            Feed::Push(body) => {
                let producer = Producer::new(shared.core.id().clone(), shared.queue.clone(), stop.clone());
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => Outcome::Aborted,
                    _ = session_token.cancelled() => {
                        debug!("{} owning session ended", shared.core.id());
                        shared.abort();
                        Outcome::Aborted
                    }
                    result = body(producer) => match result {
                        Ok(()) => Outcome::Completed,
                        Err(_) if stop.is_cancelled() => Outcome::Aborted,
                        Err(e) => Outcome::Failed(Arc::new(e)),
                    },
                }
            }
        }
    }
}

impl<T> StreamingRunner<T> {
    /// Resolves once the background task has stopped.
    pub fn finished(&self) -> Completion {
        self.shared.finished.clone()
    }

    /// Items waiting in the queue (not counting stashed items).
    pub fn buffered(&self) -> usize {
        self.shared.queue.snapshot().0
    }

    fn check_live(&self) -> Result<()> {
        if self.disposing.is_cancelled() {
            return Err(Error::disposed(self.shared.core.id()));
        }
        Ok(())
    }

    fn begin_read(
        &self,
        request: &ReadRequest,
    ) -> Result<tokio::sync::MutexGuard<'_, VecDeque<T>>> {
        self.check_live()?;
        let id = self.shared.core.id();
        let stash = self
            .stash
            .try_lock()
            .map_err(|_| Error::ConcurrentRead(id.to_string()))?;

        if let Some(requested) = request.start_position {
            let actual = self.shared.core.position();
            if requested != actual {
                return Err(Error::PositionMismatch {
                    runner: id.to_string(),
                    requested,
                    actual,
                });
            }
        }
        self.shared.core.mark_started();
        if !stash.is_empty() {
            debug!("{} serving {} stashed items first", id, stash.len());
        }
        Ok(stash)
    }

    fn deliver(
        &self,
        stash: &mut VecDeque<T>,
        limit: Option<usize>,
        trace_id: Option<&str>,
    ) -> RunnerChunk<T> {
        let core = &self.shared.core;
        let limit = if core.status() == RunnerStatus::Aborted {
            // Abort flushes everything still buffered as the final chunk.
            self.shared.queue.take_into(stash, usize::MAX);
            usize::MAX
        } else {
            limit.unwrap_or(usize::MAX)
        };

        let count = limit.min(stash.len());
        let data: Vec<T> = stash.drain(..count).collect();
        let position = core.advance(count as u64);
        let status = self.settle(stash);
        if status == RunnerStatus::Aborted {
            core.signal_terminal();
        }
        let error = if status == RunnerStatus::Failed {
            core.error()
        } else {
            None
        };

        debug!(
            "{} delivered {} items status={} position={} trace={}",
            core.id(),
            count,
            status,
            position,
            trace_id.unwrap_or("-")
        );
        RunnerChunk {
            data,
            status,
            position,
            error,
        }
    }

    /// Derive the status after a delivery and record it on the core.
    fn settle(&self, stash: &VecDeque<T>) -> RunnerStatus {
        let core = &self.shared.core;
        let current = core.status();
        if current.is_terminal() {
            return current;
        }

        let (buffered, closed) = self.shared.queue.snapshot();
        if !stash.is_empty() || buffered > 0 {
            return self.move_to(RunnerStatus::Progressed);
        }
        if !closed {
            return self.move_to(RunnerStatus::Stalled);
        }

        let outcome = self.shared.outcome.lock().clone();
        match outcome {
            Some(Outcome::Failed(error)) => {
                let _ = core.fail(error, false);
                core.status()
            }
            Some(Outcome::Aborted) => {
                self.shared.abort();
                core.status()
            }
            Some(Outcome::Completed) | None => self.move_to(RunnerStatus::Completed),
        }
    }

    fn move_to(&self, to: RunnerStatus) -> RunnerStatus {
        match self.shared.core.transition(to, false) {
            Ok(_) => to,
            // Lost a race against abort; report what the core settled on.
            Err(_) => self.shared.core.status(),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> RunnerControl for StreamingRunner<T> {
    fn id(&self) -> &RunnerId {
        self.shared.core.id()
    }

    fn status(&self) -> RunnerStatus {
        self.shared.core.status()
    }

    fn position(&self) -> u64 {
        self.shared.core.position()
    }

    fn result_type(&self) -> &'static str {
        self.result_type
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.shared.core.token().clone()
    }

    fn abort(&self) {
        self.shared.abort();
    }

    async fn dispose(&self) {
        let first = !self.disposing.is_cancelled();
        self.disposing.cancel();
        self.shared.abort();
        self.shared.finished.wait().await;
        self.shared.core.signal_terminal();

        if first {
            self.shared.queue.clear();
            if let Ok(mut stash) = self.stash.try_lock() {
                stash.clear();
            }
            debug!("{} disposed", self.shared.core.id());
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[async_trait]
impl<T: Send + 'static> Runner for StreamingRunner<T> {
    type Item = T;

    fn get_available(&self, request: ReadRequest) -> Result<RunnerChunk<T>> {
        let mut stash = self.begin_read(&request)?;
        let limit = request.advance;
        let missing = limit.unwrap_or(usize::MAX).saturating_sub(stash.len());
        self.shared.queue.take_into(&mut stash, missing);
        Ok(self.deliver(&mut stash, limit, request.trace_id.as_deref()))
    }

    async fn get_required(
        &self,
        request: ReadRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<RunnerChunk<T>> {
        let mut stash = self.begin_read(&request)?;
        let want = request.advance.unwrap_or(1);
        let fill_limit = request.advance.unwrap_or(usize::MAX);
        let cancel = cancel.unwrap_or_default();
        let core = &self.shared.core;

        loop {
            let missing = fill_limit.saturating_sub(stash.len());
            self.shared.queue.take_into(&mut stash, missing);
            if stash.len() >= want || core.status().is_terminal() || self.shared.queue.is_drained()
            {
                break;
            }

            tokio::select! {
                biased;
                _ = self.disposing.cancelled() => return Err(Error::disposed(core.id())),
                _ = cancel.cancelled() => {
                    debug!("{} read cancelled with {} items stashed", core.id(), stash.len());
                    return Err(Error::Cancelled(core.id().to_string()));
                }
                _ = self.shared.queue.ready() => {}
                _ = self.shared.stop.cancelled() => {}
            }
        }

        self.check_live()?;
        Ok(self.deliver(&mut stash, request.advance, request.trace_id.as_deref()))
    }
}

impl<T> std::fmt::Debug for StreamingRunner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingRunner")
            .field("id", self.shared.core.id())
            .field("status", &self.shared.core.status())
            .finish()
    }
}

impl<T> Drop for StreamingRunner<T> {
    fn drop(&mut self) {
        if !self.shared.core.status().is_terminal() {
            debug!("{} dropped while running, aborting", self.shared.core.id());
            self.shared.abort();
        }
        self.shared.core.signal_terminal();
    }
}

impl RunnerContext {
    /// Spawn a pull-fed streaming runner bound to this context's session.
    pub fn pull<T: Send + 'static>(
        &self,
        options: &RunnerOptions,
        source: impl PullSource<T> + 'static,
    ) -> Arc<StreamingRunner<T>> {
        StreamingRunner::pull(
            self.id.clone(),
            options,
            Some(self.session_token.clone()),
            source,
        )
    }

    /// Spawn a push-fed streaming runner bound to this context's session.
    pub fn push<T, F, Fut>(&self, options: &RunnerOptions, body: F) -> Arc<StreamingRunner<T>>
    where
        T: Send + 'static,
        F: FnOnce(Producer<T>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        StreamingRunner::push(
            self.id.clone(),
            options,
            Some(self.session_token.clone()),
            body,
        )
    }
}
