// Session store — cache-backed registry that creates sessions once, tracks generations,
// and turns cache evictions into asynchronous session and runner cleanup.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::external::ExternalSession;
use super::group::SessionGroup;
use super::identity::{GuidSessionIdSupplier, SessionIdSupplier};
use super::keys::{MarkerKeys, SessionIdentity, SessionKey};
use super::resolver::{RunnerMarker, RunnerResolver};
use super::session::Session;
use crate::cache::{EntryOptions, EvictionReason, ExpiringCache, MemoryCache, MemoryCacheOptions};
use crate::config::StoreConfig;
use crate::engine::completion::Completion;
use crate::engine::manager::RunnerManager;
use crate::engine::runner::{RunnerContext, RunnerControl};
use crate::engine::state::RunnerId;
use crate::engine::stats::{StatsCollector, StoreStatistics};
use crate::error::{Error, Result};

/// Cache key: sessions and runners share one cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Session(SessionKey),
    Runner(RunnerId),
}

#[derive(Clone)]
pub enum StoreEntry {
    Session(Arc<Session>),
    Runner(Arc<dyn RunnerControl>),
}

pub type StoreCache = Arc<dyn ExpiringCache<StoreKey, StoreEntry>>;

/// Runs while a session is being created; an error aborts the creation.
pub type SessionInitializer = Arc<dyn Fn(&Session) -> anyhow::Result<()> + Send + Sync>;

/// Generation to serve for a marker value, and whether the previous one was terminated.
fn target_generation(marker: Option<i64>) -> (u32, bool) {
    let clamp = |g: u64| u32::try_from(g).unwrap_or(u32::MAX);
    match marker {
        Some(g) if g < 0 => (clamp(g.unsigned_abs().saturating_add(1)), true),
        Some(g) => (clamp((g as u64).max(1)), false),
        None => (1, false),
    }
}

pub struct SessionStoreBuilder {
    config: StoreConfig,
    cache: Option<StoreCache>,
    id_supplier: Option<Arc<dyn SessionIdSupplier>>,
    resolver: Option<Arc<dyn RunnerResolver>>,
    initializer: Option<SessionInitializer>,
}

impl SessionStoreBuilder {
    /// Use an external cache instead of the in-process one.
    pub fn cache(mut self, cache: StoreCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn id_supplier(mut self, supplier: Arc<dyn SessionIdSupplier>) -> Self {
        self.id_supplier = Some(supplier);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn RunnerResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn on_session_created(
        mut self,
        init: impl Fn(&Session) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.initializer = Some(Arc::new(init));
        self
    }

    /// Must be called inside a tokio runtime when no cache was supplied.
    pub fn build(self) -> Arc<SessionStore> {
        let config = self.config;
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(MemoryCache::new(MemoryCacheOptions::from_config(&config)))
        });
        let id_supplier = self
            .id_supplier
            .unwrap_or_else(|| Arc::new(GuidSessionIdSupplier::default()));

        Arc::new_cyclic(|me| SessionStore {
            markers: MarkerKeys::new(config.marker_prefix.clone()),
            stats: config.track_statistics.then(StatsCollector::new),
            config,
            cache,
            id_supplier,
            resolver: self.resolver,
            initializer: self.initializer,
            groups: Mutex::new(HashMap::new()),
            store_lock: tokio::sync::Mutex::new(()),
            live: Mutex::new(HashMap::new()),
            lingering: Mutex::new(HashMap::new()),
            stopping: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
            shutdown_clean: AtomicBool::new(false),
            shutdown_done: Completion::new(),
            me: me.clone(),
        })
    }
}

/// Registry of live sessions and their runners.
pub struct SessionStore {
    config: StoreConfig,
    markers: MarkerKeys,
    cache: StoreCache,
    id_supplier: Arc<dyn SessionIdSupplier>,
    resolver: Option<Arc<dyn RunnerResolver>>,
    initializer: Option<SessionInitializer>,
    groups: Mutex<HashMap<String, Arc<SessionGroup>>>,
    /// Used instead of the group locks when `per_group_locks` is off.
    store_lock: tokio::sync::Mutex<()>,
    live: Mutex<HashMap<SessionKey, Arc<Session>>>,
    /// Last disposed generation per slot with its cleanup handle; gates marker purging.
    lingering: Mutex<HashMap<SessionKey, (u32, Completion)>>,
    stats: Option<StatsCollector>,
    stopping: CancellationToken,
    shutdown_started: AtomicBool,
    shutdown_clean: AtomicBool,
    shutdown_done: Completion,
    me: Weak<SessionStore>,
}

impl SessionStore {
    pub fn builder(config: StoreConfig) -> SessionStoreBuilder {
        SessionStoreBuilder {
            config,
            cache: None,
            id_supplier: None,
            resolver: None,
            initializer: None,
        }
    }

    /// Store with the in-process cache and GUID base ids.
    pub fn new(config: StoreConfig) -> Arc<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn markers(&self) -> &MarkerKeys {
        &self.markers
    }

    // ── Sessions ──────────────────────────────────────────────────────

    /// Return the current session for the caller's slot, creating it if needed.
    ///
    /// Every successful call takes a group reference that the caller gives
    /// back with [`SessionStore::detach`].
    pub async fn fetch_or_create(
        self: &Arc<Self>,
        external: &dyn ExternalSession,
        request_id: &str,
        suffix: Option<&str>,
    ) -> Result<Arc<Session>> {
        if self.stopping.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let key = SessionKey::new(self.id_supplier.base_session_id(external), suffix);
        let group = self.acquire_group(key.base_id());

        match self.fetch_in_group(external, request_id, &key, &group).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.release_group(&group);
                Err(e)
            }
        }
    }

    async fn fetch_in_group(
        self: &Arc<Self>,
        external: &dyn ExternalSession,
        request_id: &str,
        key: &SessionKey,
        group: &Arc<SessionGroup>,
    ) -> Result<Arc<Session>> {
        let (generation, terminated) = target_generation(self.read_generation(external, key));
        if !terminated {
            if let Some(session) = self.cached_session(key) {
                if session.generation() == generation && !session.is_disposed() {
                    self.settle_markers(external, key, generation);
                    return Ok(session);
                }
            }
        }

        let _guard = if self.config.per_group_locks {
            group.create_lock().lock().await
        } else {
            self.store_lock.lock().await
        };
        if self.stopping.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        // Another request may have created or rolled over the session while we waited.
        let (generation, terminated) = target_generation(self.read_generation(external, key));
        if let Some(existing) = self.cached_session(key) {
            if existing.generation() == generation && !terminated && !existing.is_disposed() {
                debug!(
                    "{} joined after concurrent creation (request {})",
                    existing.identity(),
                    request_id
                );
                self.settle_markers(external, key, generation);
                return Ok(existing);
            }
            info!(
                "{} is stale, replacing with generation {}",
                existing.identity(),
                generation
            );
            self.evict_session(&existing);
        }

        self.create_session(external, request_id, key, generation, terminated, group)
    }

    fn create_session(
        self: &Arc<Self>,
        external: &dyn ExternalSession,
        request_id: &str,
        key: &SessionKey,
        generation: u32,
        terminated: bool,
        group: &Arc<SessionGroup>,
    ) -> Result<Arc<Session>> {
        let identity = SessionIdentity::new(key.clone(), generation);
        let manager = Arc::new(RunnerManager::new(
            self.config.runner_number_min,
            self.config.runner_number_max,
        ));
        manager.register_session(&identity)?;
        let session = Arc::new(Session::new(identity, manager, group.clone()));

        if let Some(init) = &self.initializer {
            if let Err(e) = init(&session) {
                warn!("{} initialization failed: {:#}", session.identity(), e);
                session.mark_disposed();
                session.completion_token().cancel();
                session.scope().clear();
                session.runners().dispose();
                session.finish_cleanup();
                return Err(Error::Creation(e));
            }
        }

        // Reference held by the cached session, released by its cleanup.
        group.acquire();
        if let Some(stats) = &self.stats {
            stats.session_added(self.config.session_entry_size);
        }
        self.live.lock().insert(key.clone(), session.clone());

        let weak = self.me.clone();
        let options = EntryOptions::new()
            .sliding(self.config.session_sliding_expiration())
            .size(self.config.session_entry_size)
            .on_evicted(move |_key: &StoreKey, value: &StoreEntry, reason| {
                if let StoreEntry::Session(session) = value {
                    match weak.upgrade() {
                        Some(store) => store.on_session_evicted(session, reason),
                        None => session.completion_token().cancel(),
                    }
                }
            });
        let stored = self.cache.insert(
            StoreKey::Session(key.clone()),
            StoreEntry::Session(session.clone()),
            options,
        );
        if !stored {
            return Err(Error::Creation(anyhow!(
                "cache refused {}",
                session.identity()
            )));
        }

        external.set_string(&self.markers.generation(key), &generation.to_string());
        if terminated {
            self.rollover_markers(external, key, generation);
        }
        info!("{} created (request {})", session.identity(), request_id);
        Ok(session)
    }

    /// Give back the group reference taken by `fetch_or_create`.
    pub fn detach(&self, session: &Session) {
        self.release_group(session.group());
    }

    /// Mark the slot terminated and evict the session.
    ///
    /// The next fetch for the slot creates the next generation. The returned
    /// handle resolves once runners, manager and scope are cleaned up.
    pub fn terminate(self: &Arc<Self>, external: &dyn ExternalSession, session: &Arc<Session>) -> Completion {
        let marker = -i64::from(session.generation());
        external.set_string(&self.markers.generation(session.key()), &marker.to_string());
        info!("{} terminated", session.identity());
        self.evict_session(session)
    }

    fn cached_session(&self, key: &SessionKey) -> Option<Arc<Session>> {
        match self.cache.try_get(&StoreKey::Session(key.clone())) {
            Some(StoreEntry::Session(session)) => Some(session),
            _ => None,
        }
    }

    /// Remove `session` from the cache if it is the cached instance, and make sure cleanup runs.
    fn evict_session(self: &Arc<Self>, session: &Arc<Session>) -> Completion {
        if let Some(cached) = self.cached_session(session.key()) {
            if Arc::ptr_eq(&cached, session) {
                self.cache.remove(&StoreKey::Session(session.key().clone()));
            }
        }
        self.cleanup_session(session)
    }

    fn on_session_evicted(self: &Arc<Self>, session: &Arc<Session>, reason: EvictionReason) {
        debug!("{} evicted: {}", session.identity(), reason);
        if let Some(stats) = &self.stats {
            stats.session_removed(self.config.session_entry_size);
        }
        {
            let mut live = self.live.lock();
            if live
                .get(session.key())
                .is_some_and(|s| Arc::ptr_eq(s, session))
            {
                live.remove(session.key());
            }
        }
        self.cleanup_session(session);
    }

    /// Start cleanup once per session; later calls return the same handle.
    fn cleanup_session(self: &Arc<Self>, session: &Arc<Session>) -> Completion {
        let done = session.cleanup();
        if !session.mark_disposed() {
            return done;
        }

        self.lingering
            .lock()
            .insert(session.key().clone(), (session.generation(), done.clone()));

        let store = self.clone();
        let target = session.clone();
        tokio::spawn(async move {
            store.run_cleanup(&target).await;
        });

        if let Some(limit) = self.config.cleanup_log_timeout() {
            let identity = session.identity().clone();
            let watched = done.clone();
            tokio::spawn(async move {
                if watched.wait_timeout(limit).await {
                    debug!("{} cleanup finished within {:?}", identity, limit);
                } else {
                    warn!("{} cleanup still running after {:?}", identity, limit);
                }
            });
        }
        done
    }

    async fn run_cleanup(&self, session: &Session) {
        let identity = session.identity().clone();
        let manager = session.runners().clone();
        session.completion_token().cancel();
        let _ = manager.abort_all(&identity);

        for number in manager.registered_numbers() {
            let id = RunnerId::new(identity.key.clone(), identity.generation, number);
            self.cache.remove(&StoreKey::Runner(id));
        }
        // Runners the cache no longer held.
        for number in manager.registered_numbers() {
            let _ = manager.unregister_runner(&identity, number);
        }

        match manager.perform_runners_cleanup(&identity) {
            Ok(done) => done.wait().await,
            Err(e) => warn!("{} runner cleanup failed: {}", identity, e),
        }
        session.scope().clear();
        self.release_group(session.group());
        session.finish_cleanup();
        debug!("{} cleanup finished", identity);
    }

    // ── Groups ────────────────────────────────────────────────────────

    fn acquire_group(&self, base_id: &str) -> Arc<SessionGroup> {
        loop {
            let group = self
                .groups
                .lock()
                .entry(base_id.to_string())
                .or_insert_with(|| Arc::new(SessionGroup::new(base_id)))
                .clone();
            if group.acquire() {
                return group;
            }
            // Raced with the last release; replace the disposed group.
            let mut groups = self.groups.lock();
            if groups.get(base_id).is_some_and(|g| Arc::ptr_eq(g, &group)) {
                groups.remove(base_id);
            }
        }
    }

    fn release_group(&self, group: &Arc<SessionGroup>) {
        if group.release() > 0 {
            return;
        }
        let mut groups = self.groups.lock();
        if groups
            .get(group.base_id())
            .is_some_and(|g| Arc::ptr_eq(g, group))
        {
            groups.remove(group.base_id());
        }
        debug!("session group {} disposed", group.base_id());
    }

    /// Current reference count of a base id's group, `None` if no group is live.
    pub fn group_ref_count(&self, base_id: &str) -> Option<usize> {
        self.groups.lock().get(base_id).map(|g| g.ref_count())
    }

    // ── Markers ───────────────────────────────────────────────────────

    fn read_generation(&self, external: &dyn ExternalSession, key: &SessionKey) -> Option<i64> {
        let raw = external.get_string(&self.markers.generation(key))?;
        match raw.trim().parse() {
            Ok(generation) => Some(generation),
            Err(_) => {
                warn!("ignoring unreadable generation marker {:?} for {}", raw, key);
                None
            }
        }
    }

    /// After a rollover to `generation`: drop markers older than the previous
    /// generation now, and the previous generation's too if its cleanup is done.
    fn rollover_markers(&self, external: &dyn ExternalSession, key: &SessionKey, generation: u32) {
        let prior_settled = {
            let mut lingering = self.lingering.lock();
            match lingering.get(key) {
                Some((prior, done)) if prior.saturating_add(1) == generation && !done.is_complete() => false,
                _ => {
                    lingering.remove(key);
                    true
                }
            }
        };
        let floor = if prior_settled {
            generation
        } else {
            generation - 1
        };
        self.purge_markers(external, key, floor);
    }

    /// Drop the previous generation's markers once its cleanup has completed.
    fn settle_markers(&self, external: &dyn ExternalSession, key: &SessionKey, generation: u32) {
        {
            let mut lingering = self.lingering.lock();
            match lingering.get(key) {
                None => return,
                Some((prior, _)) if *prior >= generation => {
                    lingering.remove(key);
                    return;
                }
                Some((_, done)) if done.is_complete() => {
                    lingering.remove(key);
                }
                Some(_) => return,
            }
        }
        self.purge_markers(external, key, generation);
    }

    fn purge_markers(&self, external: &dyn ExternalSession, key: &SessionKey, below: u32) -> usize {
        let stale: Vec<String> = external
            .keys()
            .into_iter()
            .filter(|k| {
                self.markers
                    .parse_runner(key, k)
                    .is_some_and(|(generation, _)| generation < below)
            })
            .collect();
        for marker in &stale {
            external.remove(marker);
        }
        if !stale.is_empty() {
            debug!("{}: purged {} markers below generation {}", key, stale.len(), below);
        }
        stale.len()
    }

    /// Markers recorded for `number` in the session's generation.
    pub fn find_marker(
        &self,
        external: &dyn ExternalSession,
        session: &Session,
        number: u32,
    ) -> Option<RunnerMarker> {
        let id = RunnerId::new(session.key().clone(), session.generation(), number);
        let trace_id = external.get_string(&self.markers.runner(&id))?;
        let result_type = external.get_string(&self.markers.runner_type(&id));
        Some(RunnerMarker {
            id,
            trace_id: (!trace_id.is_empty()).then_some(trace_id),
            result_type,
        })
    }

    /// Every runner marker recorded for the session's generation, ordered by number.
    pub fn runner_markers(&self, external: &dyn ExternalSession, session: &Session) -> Vec<RunnerMarker> {
        let numbers: BTreeSet<u32> = external
            .keys()
            .iter()
            .filter_map(|k| self.markers.parse_runner(session.key(), k))
            .filter(|(generation, _)| *generation == session.generation())
            .map(|(_, number)| number)
            .collect();
        numbers
            .into_iter()
            .filter_map(|number| self.find_marker(external, session, number))
            .collect()
    }

    // ── Runners ───────────────────────────────────────────────────────

    /// Allocate a number, build the runner with `factory`, register and cache it.
    ///
    /// On any failure the number, registration and cache entry are rolled back.
    pub fn create_runner<R, F>(
        self: &Arc<Self>,
        external: &dyn ExternalSession,
        session: &Arc<Session>,
        trace_id: Option<&str>,
        factory: F,
    ) -> Result<Arc<R>>
    where
        R: RunnerControl,
        F: FnOnce(RunnerContext) -> anyhow::Result<Arc<R>>,
    {
        if session.is_disposed() {
            return Err(Error::disposed(session.identity()));
        }
        let identity = session.identity().clone();
        let manager = session.runners().clone();
        let number = manager.get_new_runner_number(&identity, trace_id)?;
        let id = RunnerId::new(identity.key.clone(), identity.generation, number);

        let context = RunnerContext {
            id: id.clone(),
            session_token: session.completion_token(),
            trace_id: trace_id.map(str::to_string),
        };
        let runner = match factory(context) {
            Ok(runner) => runner,
            Err(e) => {
                manager.release_number(number);
                warn!("{} construction failed: {:#}", id, e);
                return Err(Error::Creation(e));
            }
        };
        let control: Arc<dyn RunnerControl> = runner.clone();

        if let Err(e) = manager.register_runner(
            &identity,
            number,
            control.clone(),
            control.result_type(),
            trace_id.map(str::to_string),
        ) {
            manager.release_number(number);
            control.abort();
            tokio::spawn(async move { control.dispose().await });
            return Err(e);
        }

        if let Some(stats) = &self.stats {
            stats.runner_added(self.config.runner_entry_size);
        }
        let mut options = EntryOptions::new()
            .sliding(self.config.runner_sliding_expiration())
            .size(self.config.runner_entry_size)
            .invalidate_on(control.cancellation_token())
            .on_evicted(self.runner_eviction_callback(identity, manager));
        if let Some(after) = self.config.runner_absolute_expiration() {
            options = options.absolute_in(after);
        }
        if !self
            .cache
            .insert(StoreKey::Runner(id.clone()), StoreEntry::Runner(control.clone()), options)
        {
            return Err(Error::Creation(anyhow!("cache refused {}", id)));
        }

        external.set_string(&self.markers.runner(&id), trace_id.unwrap_or_default());
        external.set_string(&self.markers.runner_type(&id), control.result_type());
        debug!("{} created ({})", id, control.result_type());
        Ok(runner)
    }

    fn runner_eviction_callback(
        &self,
        identity: SessionIdentity,
        manager: Arc<RunnerManager>,
    ) -> impl Fn(&StoreKey, &StoreEntry, EvictionReason) + Send + Sync + 'static {
        let weak = self.me.clone();
        let size = self.config.runner_entry_size;
        move |_key: &StoreKey, value: &StoreEntry, reason: EvictionReason| {
            let StoreEntry::Runner(runner) = value else {
                return;
            };
            debug!("{} evicted: {}", runner.id(), reason);
            if let Some(stats) = weak.upgrade().as_ref().and_then(|s| s.stats.as_ref()) {
                stats.runner_removed(size);
            }
            runner.abort();
            // Markers stay; they are purged on generation rollover.
            match manager.unregister_runner(&identity, runner.id().number) {
                Ok(Some(_)) => {}
                _ => {
                    let runner = runner.clone();
                    tokio::spawn(async move { runner.dispose().await });
                }
            }
        }
    }

    /// Cached runner `number` of the session, refreshing its sliding expiration.
    pub fn get_runner(&self, session: &Session, number: u32) -> Option<Arc<dyn RunnerControl>> {
        let id = RunnerId::new(session.key().clone(), session.generation(), number);
        match self.cache.try_get(&StoreKey::Runner(id)) {
            Some(StoreEntry::Runner(runner)) => Some(runner),
            _ => None,
        }
    }

    /// Like [`SessionStore::get_runner`], downcast to the concrete runner type.
    pub fn get_runner_as<R: RunnerControl>(&self, session: &Session, number: u32) -> Result<Option<Arc<R>>> {
        let Some(runner) = self.get_runner(session, number) else {
            return Ok(None);
        };
        let name = runner.id().to_string();
        let actual = runner.result_type();
        runner
            .into_any()
            .downcast::<R>()
            .map(Some)
            .map_err(|_| Error::RunnerTypeMismatch {
                runner: name,
                actual,
            })
    }

    /// Local lookup, falling back to the configured resolver when the markers
    /// know the runner but this store does not.
    pub async fn get_runner_async(
        &self,
        external: &dyn ExternalSession,
        session: &Session,
        number: u32,
    ) -> Result<Option<Arc<dyn RunnerControl>>> {
        if let Some(runner) = self.get_runner(session, number) {
            return Ok(Some(runner));
        }
        let Some(resolver) = &self.resolver else {
            return Ok(None);
        };
        let Some(marker) = self.find_marker(external, session, number) else {
            return Ok(None);
        };
        debug!("{} not cached locally, asking resolver", marker.id);
        resolver.resolve(&marker).await.map_err(Error::Resolution)
    }

    // ── Statistics & shutdown ─────────────────────────────────────────

    /// `None` unless statistics tracking is enabled.
    pub fn current_statistics(&self) -> Option<StoreStatistics> {
        self.stats.as_ref().map(StatsCollector::snapshot)
    }

    pub fn live_session_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_accepting(&self) -> bool {
        !self.stopping.is_cancelled()
    }

    /// `Some(clean)` once shutdown finished waiting.
    pub fn shutdown_was_clean(&self) -> Option<bool> {
        self.shutdown_done
            .is_complete()
            .then(|| self.shutdown_clean.load(Ordering::Acquire))
    }

    /// Stop accepting sessions, evict every live session and wait (bounded by
    /// the shutdown timeout) for their cleanup. Returns whether the wait was clean.
    pub async fn dispose(self: &Arc<Self>) -> bool {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            self.shutdown_done.wait().await;
            return self.shutdown_clean.load(Ordering::Acquire);
        }
        self.stopping.cancel();

        let sessions: Vec<Arc<Session>> = self.live.lock().values().cloned().collect();
        info!("session store shutting down, {} live sessions", sessions.len());
        let handles: Vec<Completion> = sessions.iter().map(|s| self.evict_session(s)).collect();

        let timeout = self.config.shutdown_timeout();
        let clean = tokio::time::timeout(timeout, async {
            for handle in &handles {
                handle.wait().await;
            }
        })
        .await
        .is_ok();

        if clean {
            info!("session store shut down cleanly");
        } else {
            warn!(
                "session store shutdown timed out after {:?}, cleanup continues in background",
                timeout
            );
        }
        self.shutdown_clean.store(clean, Ordering::Release);
        self.shutdown_done.complete();
        clean
    }

    /// Dispose the store when `signal` fires.
    pub fn watch_stopping(self: &Arc<Self>, signal: CancellationToken) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            signal.cancelled().await;
            if let Some(store) = weak.upgrade() {
                info!("stopping signal received");
                store.dispose().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionState;

    #[test]
    fn generation_from_marker() {
        assert_eq!(target_generation(None), (1, false));
        assert_eq!(target_generation(Some(0)), (1, false));
        assert_eq!(target_generation(Some(4)), (4, false));
        assert_eq!(target_generation(Some(-1)), (2, true));
        assert_eq!(target_generation(Some(-4)), (5, true));
        assert_eq!(target_generation(Some(i64::MIN)), (u32::MAX, true));
    }

    #[tokio::test]
    async fn join_under_lock_settles_markers() {
        let store = SessionStore::new(StoreConfig {
            per_group_locks: false,
            ..StoreConfig::default()
        });
        let external = Arc::new(MemorySessionState::new());
        let session = store
            .fetch_or_create(external.as_ref(), "r1", None)
            .await
            .unwrap();
        let key = session.key().clone();
        let stale = store.markers.runner(&RunnerId::new(key.clone(), 0, 3));
        external.set_string(&stale, "");
        let prior = Completion::new();
        store.lingering.lock().insert(key.clone(), (0, prior.clone()));

        // Hold the creation lock while the slot reads as terminated.
        let guard = store.store_lock.lock().await;
        external.set_string(&store.markers.generation(&key), "-1");
        let joining = {
            let store = store.clone();
            let external = external.clone();
            tokio::spawn(async move { store.fetch_or_create(external.as_ref(), "r2", None).await })
        };
        tokio::task::yield_now().await;
        assert!(!joining.is_finished());

        // Another request restored the slot and the prior cleanup finished meanwhile.
        external.set_string(&store.markers.generation(&key), "1");
        prior.complete();
        drop(guard);

        let joined = joining.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&joined, &session));
        assert!(external.get(&stale).is_none());
        assert!(store.lingering.lock().get(&key).is_none());
    }
}
