// Runner resolution seam — finds runners that are only known from per-request markers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::runner::RunnerControl;
use crate::engine::state::RunnerId;

/// What the per-request markers record about one runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerMarker {
    pub id: RunnerId,
    pub trace_id: Option<String>,
    pub result_type: Option<String>,
}

/// Looks up a runner the local cache does not hold, e.g. one owned by another node.
#[async_trait]
pub trait RunnerResolver: Send + Sync {
    async fn resolve(&self, marker: &RunnerMarker) -> anyhow::Result<Option<Arc<dyn RunnerControl>>>;
}
