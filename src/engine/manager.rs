// Runner manager — per-session runner registry, number allocation, and cleanup coordination.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::completion::Completion;
use super::runner::RunnerControl;
use crate::error::{Error, Result};
use crate::session::SessionIdentity;

/// A runner as tracked by its manager.
#[derive(Clone)]
pub struct RegisteredRunner {
    pub runner: Arc<dyn RunnerControl>,
    pub result_type: &'static str,
    pub trace_id: Option<String>,
}

/// Outstanding-work counter. Starts at 1 for the owning session.
struct WorkCounter {
    count: AtomicUsize,
    drained: Completion,
}

impl WorkCounter {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
            drained: Completion::new(),
        }
    }

    fn acquire(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.complete();
        }
    }

    fn outstanding(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

struct ManagerState {
    owner: Option<SessionIdentity>,
    next_number: u64,
    /// Numbers handed out but not registered yet.
    allocated: HashSet<u32>,
    runners: HashMap<u32, RegisteredRunner>,
    cleanup: Option<Completion>,
    disposed: bool,
}

/// Single-owner registry of the runners of one session.
pub struct RunnerManager {
    min: u32,
    max: u32,
    state: Mutex<ManagerState>,
    work: Arc<WorkCounter>,
}

impl RunnerManager {
    /// Manager allocating numbers from `[min, max)`.
    pub fn new(min: u32, max: u32) -> Self {
        Self {
            min,
            max,
            state: Mutex::new(ManagerState {
                owner: None,
                next_number: u64::from(min),
                allocated: HashSet::new(),
                runners: HashMap::new(),
                cleanup: None,
                disposed: false,
            }),
            work: Arc::new(WorkCounter::new()),
        }
    }

    fn describe(state: &ManagerState) -> String {
        match &state.owner {
            Some(owner) => format!("runner manager of {}", owner),
            None => "runner manager".to_string(),
        }
    }

    fn check_owner(state: &ManagerState, identity: &SessionIdentity) -> Result<()> {
        match &state.owner {
            Some(owner) if owner == identity => Ok(()),
            Some(owner) => Err(Error::WrongSession {
                owner: owner.to_string(),
                caller: identity.to_string(),
            }),
            None => Err(Error::WrongSession {
                owner: "<unregistered>".to_string(),
                caller: identity.to_string(),
            }),
        }
    }

    /// Owner check plus "still accepting work".
    fn check_open(state: &ManagerState, identity: &SessionIdentity) -> Result<()> {
        if state.disposed || state.cleanup.is_some() {
            return Err(Error::disposed(Self::describe(state)));
        }
        Self::check_owner(state, identity)
    }

    /// Bind the manager to its session. Repeating the call for the same
    /// session is a no-op.
    pub fn register_session(&self, identity: &SessionIdentity) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(Error::disposed(Self::describe(&state)));
        }
        match &state.owner {
            None => {
                state.owner = Some(identity.clone());
                Ok(())
            }
            Some(_) => Self::check_owner(&state, identity),
        }
    }

    /// Allocate a runner number. Numbers are never handed out twice, even after
    /// the runner holding one is gone.
    pub fn get_new_runner_number(
        &self,
        identity: &SessionIdentity,
        trace_id: Option<&str>,
    ) -> Result<u32> {
        let mut state = self.state.lock();
        Self::check_open(&state, identity)?;

        if state.next_number >= u64::from(self.max) {
            return Err(Error::NumbersExhausted {
                session: identity.to_string(),
                min: self.min,
                max: self.max,
            });
        }
        let number = state.next_number as u32;
        state.next_number += 1;
        state.allocated.insert(number);
        debug!(
            "{}: allocated runner number {} trace={}",
            identity,
            number,
            trace_id.unwrap_or("-")
        );
        Ok(number)
    }

    /// Give back a number that was allocated but never registered. The number
    /// stays consumed.
    pub fn release_number(&self, number: u32) -> bool {
        self.state.lock().allocated.remove(&number)
    }

    pub fn register_runner(
        &self,
        identity: &SessionIdentity,
        number: u32,
        runner: Arc<dyn RunnerControl>,
        result_type: &'static str,
        trace_id: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state, identity)?;
        if !state.allocated.remove(&number) {
            return Err(Error::InvalidRunnerNumber {
                session: identity.to_string(),
                number,
            });
        }

        self.work.acquire();
        state.runners.insert(
            number,
            RegisteredRunner {
                runner,
                result_type,
                trace_id,
            },
        );
        debug!("{}: registered runner {} ({})", identity, number, result_type);
        Ok(())
    }

    /// Remove a runner and dispose it in the background.
    ///
    /// Returns a handle to the disposal, or `None` if `number` was not registered.
    /// Works while cleanup is in progress, since cleanup waits on it.
    pub fn unregister_runner(
        &self,
        identity: &SessionIdentity,
        number: u32,
    ) -> Result<Option<Completion>> {
        let removed = {
            let mut state = self.state.lock();
            Self::check_owner(&state, identity)?;
            state.runners.remove(&number)
        };
        let Some(entry) = removed else {
            return Ok(None);
        };

        debug!("{}: unregistering runner {}", identity, number);
        let done = Completion::new();
        let work = self.work.clone();
        let signal = done.clone();
        tokio::spawn(async move {
            entry.runner.dispose().await;
            work.release();
            signal.complete();
        });
        Ok(Some(done))
    }

    /// Abort every registered runner. Safe on an empty or disposed manager.
    pub fn abort_all(&self, identity: &SessionIdentity) -> Result<()> {
        let runners: Vec<Arc<dyn RunnerControl>> = {
            let state = self.state.lock();
            Self::check_owner(&state, identity)?;
            state.runners.values().map(|r| r.runner.clone()).collect()
        };
        if !runners.is_empty() {
            debug!("{}: aborting {} runners", identity, runners.len());
        }
        for runner in runners {
            runner.abort();
        }
        Ok(())
    }

    /// Release the session's own share of the work counter, wait until every
    /// runner has been unregistered, then dispose the manager.
    ///
    /// A second call returns the same handle.
    pub fn perform_runners_cleanup(
        self: &Arc<Self>,
        identity: &SessionIdentity,
    ) -> Result<Completion> {
        let done = {
            let mut state = self.state.lock();
            Self::check_owner(&state, identity)?;
            if let Some(existing) = &state.cleanup {
                return Ok(existing.clone());
            }
            if state.disposed {
                return Err(Error::disposed(Self::describe(&state)));
            }
            let done = Completion::new();
            state.cleanup = Some(done.clone());
            done
        };

        let pending = self.work.outstanding().saturating_sub(1);
        debug!("{}: runner cleanup started, {} runners outstanding", identity, pending);
        let manager = self.clone();
        let signal = done.clone();
        tokio::spawn(async move {
            manager.work.release();
            manager.work.drained.wait().await;
            manager.dispose();
            signal.complete();
        });
        Ok(done)
    }

    /// Idempotent. Runners still registered are dropped without being disposed.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        if !state.runners.is_empty() {
            warn!(
                "{} disposed with {} runners still registered",
                Self::describe(&state),
                state.runners.len()
            );
        }
        state.runners.clear();
        state.allocated.clear();
        debug!("{} disposed", Self::describe(&state));
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn lookup(&self, number: u32) -> Option<RegisteredRunner> {
        self.state.lock().runners.get(&number).cloned()
    }

    pub fn registered_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self.state.lock().runners.keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn runner_count(&self) -> usize {
        self.state.lock().runners.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RunnerOptions;
    use crate::engine::state::{RunnerId, RunnerStatus};
    use crate::engine::streaming::StreamingRunner;
    use crate::session::SessionKey;
    use crate::source::IterSource;

    fn identity(name: &str) -> SessionIdentity {
        SessionIdentity::new(SessionKey::new(name, None), 1)
    }

    fn endless(identity: &SessionIdentity, number: u32) -> Arc<StreamingRunner<u64>> {
        StreamingRunner::pull(
            RunnerId::new(identity.key.clone(), identity.generation, number),
            &RunnerOptions::with_queue_capacity(2),
            None,
            IterSource::new(0..),
        )
    }

    #[test]
    fn numbers_come_from_range_and_exhaust() {
        let alice = identity("alice");
        let manager = RunnerManager::new(0, 2);
        manager.register_session(&alice).unwrap();

        assert_eq!(manager.get_new_runner_number(&alice, None).unwrap(), 0);
        assert_eq!(manager.get_new_runner_number(&alice, Some("t1")).unwrap(), 1);
        let err = manager.get_new_runner_number(&alice, None).unwrap_err();
        assert!(matches!(err, Error::NumbersExhausted { min: 0, max: 2, .. }));

        manager.release_number(1);
        assert!(manager.get_new_runner_number(&alice, None).is_err());
    }

    #[test]
    fn manager_has_a_single_owner() {
        let alice = identity("alice");
        let manager = RunnerManager::new(0, 10);
        manager.register_session(&alice).unwrap();
        manager.register_session(&alice).unwrap();

        let err = manager.register_session(&identity("bob")).unwrap_err();
        assert_eq!(err.code(), "WRONG_SESSION");
        let next_generation = SessionIdentity::new(alice.key.clone(), 2);
        assert!(manager.get_new_runner_number(&next_generation, None).is_err());
    }

    #[tokio::test]
    async fn registration_requires_allocated_number() {
        let alice = identity("alice");
        let manager = RunnerManager::new(0, 10);
        manager.register_session(&alice).unwrap();

        let runner = endless(&alice, 5);
        let err = manager
            .register_runner(&alice, 5, runner.clone(), "u64", None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRunnerNumber { number: 5, .. }));

        let number = manager.get_new_runner_number(&alice, None).unwrap();
        manager
            .register_runner(&alice, number, runner.clone(), "u64", None)
            .unwrap();
        assert!(manager
            .register_runner(&alice, number, runner.clone(), "u64", None)
            .is_err());
        assert_eq!(manager.registered_numbers(), vec![number]);
        runner.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_waits_for_every_runner() {
        let alice = identity("alice");
        let manager = Arc::new(RunnerManager::new(0, 10));
        manager.register_session(&alice).unwrap();

        let mut runners = Vec::new();
        for _ in 0..2 {
            let number = manager.get_new_runner_number(&alice, None).unwrap();
            let runner = endless(&alice, number);
            manager
                .register_runner(&alice, number, runner.clone(), "u64", None)
                .unwrap();
            runners.push(runner);
        }

        let cleanup = manager.perform_runners_cleanup(&alice).unwrap();
        assert!(manager.get_new_runner_number(&alice, None).unwrap_err().is_disposed());
        assert!(!cleanup.wait_timeout(Duration::from_millis(50)).await);
        assert!(!manager.is_disposed());

        manager.abort_all(&alice).unwrap();
        for number in manager.registered_numbers() {
            let disposal = manager.unregister_runner(&alice, number).unwrap().unwrap();
            disposal.wait().await;
        }
        assert!(cleanup.wait_timeout(Duration::from_secs(1)).await);
        assert!(manager.is_disposed());
        assert!(runners.iter().all(|r| r.status() == RunnerStatus::Aborted));

        let again = manager.perform_runners_cleanup(&alice).unwrap();
        assert!(again.is_complete());
        manager.abort_all(&alice).unwrap();
    }

    #[tokio::test]
    async fn unregister_unknown_number_is_none() {
        let alice = identity("alice");
        let manager = RunnerManager::new(0, 10);
        manager.register_session(&alice).unwrap();
        assert!(manager.unregister_runner(&alice, 3).unwrap().is_none());
        manager.abort_all(&alice).unwrap();
    }
}
