// Error taxonomy — usage, lifecycle, and creation failures surfaced by the store and runners.

use thiserror::Error;

use crate::engine::state::RunnerStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported synchronously to callers.
///
/// Background failures inside a runner's data source are not reported through
/// this type; they are captured and surfaced as `RunnerStatus::Failed` on the
/// chunk returned by the next read.
#[derive(Debug, Error)]
pub enum Error {
    /// The named object (store, session, manager, runner) was already disposed.
    #[error("{0} is disposed")]
    Disposed(String),

    /// The store stopped accepting sessions.
    #[error("session store is shutting down")]
    ShuttingDown,

    /// `start_position` did not match the runner's current position.
    #[error("{runner}: start position {requested} does not match current position {actual}")]
    PositionMismatch {
        runner: String,
        requested: u64,
        actual: u64,
    },

    /// A second consumer call was made while one is still outstanding.
    #[error("{0}: another read is already in progress")]
    ConcurrentRead(String),

    /// The caller's cancel signal fired while waiting for data.
    #[error("{0}: read cancelled")]
    Cancelled(String),

    /// Attempted an invalid runner status transition.
    #[error("invalid runner transition: {from:?} -> {to:?}")]
    InvalidTransition { from: RunnerStatus, to: RunnerStatus },

    /// A runner manager was used by a session other than its owner.
    #[error("runner manager belongs to {owner}, not {caller}")]
    WrongSession { owner: String, caller: String },

    /// No runner numbers are left in the configured range.
    #[error("{session}: runner numbers exhausted in range [{min}, {max})")]
    NumbersExhausted { session: String, min: u32, max: u32 },

    /// A runner number was registered twice or was never allocated.
    #[error("{session}: runner number {number} is not available for registration")]
    InvalidRunnerNumber { session: String, number: u32 },

    /// The cached runner does not have the requested concrete type.
    #[error("runner {runner} has result type {actual}")]
    RunnerTypeMismatch { runner: String, actual: &'static str },

    /// Session or runner construction failed; partial state was rolled back.
    #[error("creation failed: {0}")]
    Creation(#[source] anyhow::Error),

    /// The runner resolver failed to look up a runner known only from markers.
    #[error("runner resolution failed: {0}")]
    Resolution(#[source] anyhow::Error),
}

impl Error {
    /// Machine-readable code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Disposed(_) => "DISPOSED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::PositionMismatch { .. } => "POSITION_MISMATCH",
            Self::ConcurrentRead(_) => "CONCURRENT_READ",
            Self::Cancelled(_) => "CANCELLED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::WrongSession { .. } => "WRONG_SESSION",
            Self::NumbersExhausted { .. } => "NUMBERS_EXHAUSTED",
            Self::InvalidRunnerNumber { .. } => "INVALID_RUNNER_NUMBER",
            Self::RunnerTypeMismatch { .. } => "RUNNER_TYPE_MISMATCH",
            Self::Creation(_) => "CREATION_FAILED",
            Self::Resolution(_) => "RESOLUTION_FAILED",
        }
    }

    /// Returns `true` if retrying the same call later may succeed.
    ///
    /// Only a cancelled wait qualifies: the stashed data is served by the next read.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed(_))
    }

    pub(crate) fn disposed(what: impl std::fmt::Display) -> Self {
        Self::Disposed(what.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposed_error_names_the_object() {
        let err = Error::disposed("runner alice#1-3");
        assert_eq!(err.code(), "DISPOSED");
        assert!(err.is_disposed());
        assert!(err.to_string().contains("alice#1-3"));
    }

    #[test]
    fn only_cancellation_is_recoverable() {
        assert!(Error::Cancelled("r".into()).is_recoverable());
        assert!(!Error::ShuttingDown.is_recoverable());
        assert!(!Error::ConcurrentRead("r".into()).is_recoverable());
    }

    #[test]
    fn creation_keeps_source() {
        let err = Error::Creation(anyhow::anyhow!("factory exploded"));
        assert_eq!(err.code(), "CREATION_FAILED");
        assert!(std::error::Error::source(&err).is_some());
    }
}
