// Session — one generation of a session slot with its runner manager and service scope.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::group::SessionGroup;
use super::keys::{SessionIdentity, SessionKey};
use crate::engine::completion::Completion;
use crate::engine::manager::RunnerManager;

/// Type-keyed service container owned by a session. Cleared on disposal.
#[derive(Default)]
pub struct SessionScope {
    services: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl SessionScope {
    pub fn insert<T: Send + Sync + 'static>(&self, service: T) -> Option<Arc<T>> {
        self.services
            .lock()
            .insert(TypeId::of::<T>(), Arc::new(service))
            .and_then(|old| old.downcast::<T>().ok())
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let service = self.services.lock().get(&TypeId::of::<T>())?.clone();
        service.downcast::<T>().ok()
    }

    pub fn get_or_insert_with<T: Send + Sync + 'static>(&self, init: impl FnOnce() -> T) -> Arc<T> {
        let mut services = self.services.lock();
        if let Some(existing) = services
            .get(&TypeId::of::<T>())
            .and_then(|s| s.clone().downcast::<T>().ok())
        {
            return existing;
        }
        let service = Arc::new(init());
        services.insert(TypeId::of::<T>(), service.clone());
        service
    }

    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        let services: Vec<_> = self.services.lock().drain().collect();
        drop(services);
    }
}

/// A live session. Created by the store; handed out as `Arc<Session>`.
pub struct Session {
    identity: SessionIdentity,
    token: CancellationToken,
    scope: SessionScope,
    runners: Arc<RunnerManager>,
    group: Arc<SessionGroup>,
    disposed: AtomicBool,
    cleanup: Completion,
}

impl Session {
    pub(crate) fn new(
        identity: SessionIdentity,
        runners: Arc<RunnerManager>,
        group: Arc<SessionGroup>,
    ) -> Self {
        Self {
            identity,
            token: CancellationToken::new(),
            scope: SessionScope::default(),
            runners,
            group,
            disposed: AtomicBool::new(false),
            cleanup: Completion::new(),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn key(&self) -> &SessionKey {
        &self.identity.key
    }

    pub fn generation(&self) -> u32 {
        self.identity.generation
    }

    /// Cancelled when the session is disposed; owned runners abort on it.
    pub fn completion_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }

    pub fn runners(&self) -> &Arc<RunnerManager> {
        &self.runners
    }

    pub fn group(&self) -> &Arc<SessionGroup> {
        &self.group
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Resolves once eviction cleanup finished.
    pub fn cleanup(&self) -> Completion {
        self.cleanup.clone()
    }

    /// Flip the disposed flag; `true` for the caller that gets to run cleanup.
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn finish_cleanup(&self) {
        self.cleanup.complete();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Counter(u32);

    #[test]
    fn scope_is_keyed_by_type() {
        let scope = SessionScope::default();
        assert!(scope.get::<Counter>().is_none());
        scope.insert(Counter(1));
        assert_eq!(*scope.get::<Counter>().unwrap(), Counter(1));

        let existing = scope.get_or_insert_with(|| Counter(9));
        assert_eq!(*existing, Counter(1));
        let text = scope.get_or_insert_with(|| String::from("x"));
        assert_eq!(text.as_str(), "x");
        assert_eq!(scope.len(), 2);

        scope.clear();
        assert!(scope.is_empty());
    }
}
