// Runner contract — the control surface the store manages and the consumer surface callers read from.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::state::{RunnerId, RunnerStatus};
use crate::error::Result;

/// Arguments of a consumer read.
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    /// Maximum number of items to return. `None` means "everything buffered"
    /// for `get_available` and "at least one item" for `get_required`.
    pub advance: Option<usize>,
    /// Expected current position; a mismatch is a caller bug.
    pub start_position: Option<u64>,
    /// Correlation id carried into logs.
    pub trace_id: Option<String>,
}

impl ReadRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(advance: usize) -> Self {
        Self {
            advance: Some(advance),
            ..Self::default()
        }
    }

    pub fn at(mut self, start_position: u64) -> Self {
        self.start_position = Some(start_position);
        self
    }

    pub fn traced(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Result of a consumer read.
#[derive(Debug)]
pub struct RunnerChunk<T> {
    pub data: Vec<T>,
    pub status: RunnerStatus,
    /// Position after this chunk, i.e. the number of items delivered so far.
    pub position: u64,
    /// Set when `status` is `Failed`.
    pub error: Option<Arc<anyhow::Error>>,
}

/// Inputs handed to a runner factory by the session store.
#[derive(Debug, Clone)]
pub struct RunnerContext {
    pub id: RunnerId,
    /// Owning session's completion token; runners abort when it fires.
    pub session_token: CancellationToken,
    pub trace_id: Option<String>,
}

/// Type-erased control surface. This is what the store caches and the
/// runner manager tracks.
#[async_trait]
pub trait RunnerControl: Send + Sync + 'static {
    fn id(&self) -> &RunnerId;

    fn status(&self) -> RunnerStatus;

    fn position(&self) -> u64;

    /// Name of the item type, recorded in the per-request type marker.
    fn result_type(&self) -> &'static str;

    /// Cancelled when the runner reaches a terminal state. After an abort it
    /// fires once the final chunk has been delivered or the runner is disposed.
    fn cancellation_token(&self) -> CancellationToken;

    /// Stop the runner. No-op once terminal.
    fn abort(&self);

    /// Stop the runner and wait until its background work reached a safe point.
    /// Idempotent.
    async fn dispose(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Consumer surface. Only one read may be outstanding per runner.
#[async_trait]
pub trait Runner: RunnerControl {
    type Item: Send + 'static;

    /// Drain already-produced items without waiting.
    fn get_available(&self, request: ReadRequest) -> Result<RunnerChunk<Self::Item>>;

    /// Wait for `advance` items (or terminal status) and return at most `advance` items.
    ///
    /// If `cancel` fires while waiting, the call fails with `Error::Cancelled`;
    /// items already collected are kept and lead the next read.
    async fn get_required(
        &self,
        request: ReadRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<RunnerChunk<Self::Item>>;
}
