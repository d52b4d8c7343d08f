// Runner state machine — status model, identity, and the transition core every runner composes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::session::SessionKey;

/// Lifecycle status of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerStatus {
    NotStarted,
    /// Running, nothing buffered for the consumer right now.
    Stalled,
    /// Running, more data is buffered than was just returned.
    Progressed,
    Completed,
    Failed,
    Aborted,
}

impl RunnerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Stalled | Self::Progressed)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: RunnerStatus) -> bool {
        if self.is_terminal() || to == Self::NotStarted {
            return false;
        }
        !(self == Self::NotStarted && to == Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Stalled => "stalled",
            Self::Progressed => "progressed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a runner: owning session, its generation, and the runner number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerId {
    pub session: SessionKey,
    pub generation: u32,
    pub number: u32,
}

impl RunnerId {
    pub fn new(session: SessionKey, generation: u32, number: u32) -> Self {
        Self {
            session,
            generation,
            number,
        }
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runner {}#{}-{}", self.session, self.generation, self.number)
    }
}

struct CoreState {
    status: RunnerStatus,
    position: u64,
    error: Option<Arc<anyhow::Error>>,
}

/// Shared state-machine base composed into every runner.
///
/// Holds status, position and terminal error behind one lock, and the runner's
/// own cancellation token. The token is independent of the owning session's token.
pub struct RunnerCore {
    id: RunnerId,
    state: Mutex<CoreState>,
    token: CancellationToken,
}

impl RunnerCore {
    pub fn new(id: RunnerId) -> Self {
        Self {
            id,
            state: Mutex::new(CoreState {
                status: RunnerStatus::NotStarted,
                position: 0,
                error: None,
            }),
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &RunnerId {
        &self.id
    }

    pub fn status(&self) -> RunnerStatus {
        self.state.lock().status
    }

    pub fn position(&self) -> u64 {
        self.state.lock().position
    }

    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.state.lock().error.clone()
    }

    /// Cancelled once the runner reaches a terminal state.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Move from `NotStarted` to `Stalled`. Does nothing in any other state.
    pub fn mark_started(&self) {
        let mut state = self.state.lock();
        if state.status == RunnerStatus::NotStarted {
            state.status = RunnerStatus::Stalled;
        }
    }

    /// Transition to `to`.
    ///
    /// Returns `Ok(false)` when already in the (non-terminal) target state.
    /// Entering a terminal state cancels the runner token unless `defer_signal`
    /// is set, in which case the caller must invoke [`RunnerCore::signal_terminal`].
    pub fn transition(&self, to: RunnerStatus, defer_signal: bool) -> Result<bool> {
        {
            let mut state = self.state.lock();
            let from = state.status;
            if from == to && !from.is_terminal() {
                return Ok(false);
            }
            if !from.can_transition_to(to) {
                return Err(Error::InvalidTransition { from, to });
            }
            state.status = to;
        }
        if to.is_terminal() {
            debug!("{} entered {}", self.id, to);
            if !defer_signal {
                self.token.cancel();
            }
        }
        Ok(true)
    }

    /// Record `error` and enter `Failed`.
    pub fn fail(&self, error: Arc<anyhow::Error>, defer_signal: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.status.can_transition_to(RunnerStatus::Failed) {
                return Err(Error::InvalidTransition {
                    from: state.status,
                    to: RunnerStatus::Failed,
                });
            }
            state.status = RunnerStatus::Failed;
            state.error = Some(error);
        }
        debug!("{} entered {}", self.id, RunnerStatus::Failed);
        if !defer_signal {
            self.token.cancel();
        }
        Ok(())
    }

    /// Fire the terminal signal held back by a deferred transition.
    pub fn signal_terminal(&self) {
        self.token.cancel();
    }

    /// Advance the position by `count` delivered items; returns the new position.
    pub fn advance(&self, count: u64) -> u64 {
        let mut state = self.state.lock();
        state.position += count;
        state.position
    }

    /// Force `Aborted` unless already terminal, then run `teardown`.
    ///
    /// With `defer_signal` the token stays live until [`RunnerCore::signal_terminal`].
    /// Returns `true` if this call performed the abort.
    pub fn abort(&self, defer_signal: bool, teardown: impl FnOnce()) -> bool {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = RunnerStatus::Aborted;
        }
        debug!("{} aborted", self.id);
        if !defer_signal {
            self.token.cancel();
        }
        teardown();
        true
    }
}
