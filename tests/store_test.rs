// Integration tests for the SessionStore: creation races, ref counts, generations, shutdown.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use session_runner_engine::engine::RunnerCore;
use session_runner_engine::session::identity::DEFAULT_BASE_ID_KEY;
use session_runner_engine::source::IterSource;
use session_runner_engine::{
    Error, ExternalSession, MemorySessionState, RunnerControl, RunnerId, RunnerOptions,
    RunnerStatus, SessionLease, SessionStore, StoreConfig,
};

/// Runner whose disposal blocks until the gate opens.
struct GatedRunner {
    core: RunnerCore,
    gate: CancellationToken,
}

#[async_trait]
impl RunnerControl for GatedRunner {
    fn id(&self) -> &RunnerId {
        self.core.id()
    }

    fn status(&self) -> RunnerStatus {
        self.core.status()
    }

    fn position(&self) -> u64 {
        self.core.position()
    }

    fn result_type(&self) -> &'static str {
        "gated"
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.core.token().clone()
    }

    fn abort(&self) {
        self.core.abort(false, || {});
    }

    async fn dispose(&self) {
        self.abort();
        self.gate.cancelled().await;
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetches_create_one_session() {
    let created = Arc::new(AtomicUsize::new(0));
    let store = {
        let created = created.clone();
        SessionStore::builder(StoreConfig::default())
            .on_session_created(move |_session| {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
    };
    let external = Arc::new(MemorySessionState::new());

    let mut tasks = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        let external = external.clone();
        tasks.push(tokio::spawn(async move {
            store
                .fetch_or_create(external.as_ref(), &format!("req-{}", i), None)
                .await
                .unwrap()
        }));
    }
    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await.unwrap());
    }

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    let base_id = sessions[0].key().base_id().to_string();
    assert_eq!(store.group_ref_count(&base_id), Some(17));

    for session in &sessions {
        store.detach(session);
    }
    assert_eq!(store.group_ref_count(&base_id), Some(1));

    // Repeat the round on the warm session: the count returns to its prior value.
    for i in 0..8 {
        let session = store
            .fetch_or_create(external.as_ref(), &format!("again-{}", i), None)
            .await
            .unwrap();
        store.detach(&session);
    }
    assert_eq!(store.group_ref_count(&base_id), Some(1));

    let cleanup = store.terminate(external.as_ref(), &sessions[0]);
    assert!(cleanup.wait_timeout(Duration::from_secs(5)).await);
    assert_eq!(store.group_ref_count(&base_id), None);
    assert_eq!(created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_suffixes_are_separate_sessions_in_one_group() {
    let store = SessionStore::new(StoreConfig::default());
    let external = MemorySessionState::new();

    let main = store.fetch_or_create(&external, "r1", None).await.unwrap();
    let tab = store.fetch_or_create(&external, "r2", Some("tab")).await.unwrap();
    assert!(!Arc::ptr_eq(&main, &tab));
    assert_eq!(main.key().base_id(), tab.key().base_id());
    assert_eq!(tab.key().suffix(), Some("tab"));
    assert_eq!(store.group_ref_count(main.key().base_id()), Some(4));
    assert_eq!(store.live_session_count(), 2);
}

#[tokio::test]
async fn test_generation_rollover_purges_markers_lazily() {
    let store = SessionStore::new(StoreConfig::default());
    let external = MemorySessionState::new();
    let markers = store.markers().clone();

    let first = store.fetch_or_create(&external, "r1", None).await.unwrap();
    assert_eq!(first.generation(), 1);
    let key = first.key().clone();

    let ancient = markers.runner(&RunnerId::new(key.clone(), 0, 7));
    external.set_string(&ancient, "old");

    let gate = CancellationToken::new();
    let runner = store
        .create_runner(&external, &first, Some("t-1"), |ctx| {
            Ok(Arc::new(GatedRunner {
                core: RunnerCore::new(ctx.id),
                gate: gate.clone(),
            }))
        })
        .unwrap();
    let previous = markers.runner(runner.id());
    let previous_type = markers.runner_type(runner.id());
    assert_eq!(external.get_string(&previous_type).as_deref(), Some("gated"));

    let cleanup = store.terminate(&external, &first);
    store.detach(&first);
    assert_eq!(
        external.get_string(&markers.generation(&key)).as_deref(),
        Some("-1")
    );

    let second = store.fetch_or_create(&external, "r2", None).await.unwrap();
    assert_eq!(second.generation(), 2);
    assert!(first.is_disposed());
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(
        external.get_string(&markers.generation(&key)).as_deref(),
        Some("2")
    );
    assert!(external.get(&ancient).is_none(), "older generations purge at rollover");
    assert!(external.get(&previous).is_some(), "previous generation waits for its cleanup");
    assert!(!cleanup.is_complete());

    gate.cancel();
    assert!(cleanup.wait_timeout(Duration::from_secs(5)).await);
    assert_eq!(runner.status(), RunnerStatus::Aborted);

    let again = store.fetch_or_create(&external, "r3", None).await.unwrap();
    assert!(Arc::ptr_eq(&again, &second));
    assert!(external.get(&previous).is_none());
    assert!(external.get(&previous_type).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_expires_and_is_recreated() {
    let store = SessionStore::new(StoreConfig {
        session_sliding_expiration_ms: 1_000,
        expiration_scan_ms: 100,
        ..StoreConfig::default()
    });
    let external = MemorySessionState::new();

    let first = store.fetch_or_create(&external, "r1", None).await.unwrap();
    let token = first.completion_token();
    store.detach(&first);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    first.cleanup().wait().await;
    assert!(first.is_disposed());
    assert!(token.is_cancelled());
    assert_eq!(store.group_ref_count(first.key().base_id()), None);

    let second = store.fetch_or_create(&external, "r2", None).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.generation(), 1);
}

#[tokio::test]
async fn test_dispose_aborts_runners_and_rejects_fetches() {
    let store = SessionStore::new(StoreConfig::default());
    let external = MemorySessionState::new();
    let session = store.fetch_or_create(&external, "r1", None).await.unwrap();
    let runner = store
        .create_runner(&external, &session, None, |ctx| {
            Ok(ctx.pull(&RunnerOptions::with_queue_capacity(2), IterSource::new(0u64..)))
        })
        .unwrap();

    assert!(store.dispose().await);
    assert_eq!(store.shutdown_was_clean(), Some(true));
    assert_eq!(runner.status(), RunnerStatus::Aborted);
    assert!(session.is_disposed());

    let err = store.fetch_or_create(&external, "r2", None).await.unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
    assert!(store.dispose().await);
}

#[tokio::test]
async fn test_dispose_times_out_on_stuck_cleanup() {
    let store = SessionStore::new(StoreConfig {
        shutdown_timeout_ms: 50,
        ..StoreConfig::default()
    });
    let external = MemorySessionState::new();
    let session = store.fetch_or_create(&external, "r1", None).await.unwrap();
    let gate = CancellationToken::new();
    store
        .create_runner(&external, &session, None, |ctx| {
            Ok(Arc::new(GatedRunner {
                core: RunnerCore::new(ctx.id),
                gate: gate.clone(),
            }))
        })
        .unwrap();

    assert!(!store.dispose().await);
    assert_eq!(store.shutdown_was_clean(), Some(false));

    gate.cancel();
    assert!(session.cleanup().wait_timeout(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_stopping_signal_triggers_shutdown() {
    let store = SessionStore::new(StoreConfig::default());
    let external = MemorySessionState::new();
    let session = store.fetch_or_create(&external, "r1", None).await.unwrap();

    let stopping = CancellationToken::new();
    store.watch_stopping(stopping.clone());
    stopping.cancel();

    assert!(session.cleanup().wait_timeout(Duration::from_secs(5)).await);
    assert!(!store.is_accepting());
    assert!(store.fetch_or_create(&external, "r2", None).await.is_err());
}

#[tokio::test]
async fn test_failed_initializer_rolls_back() {
    let store = SessionStore::builder(StoreConfig::default())
        .on_session_created(|session| {
            anyhow::ensure!(session.key().suffix() != Some("broken"), "no broken sessions");
            Ok(())
        })
        .build();
    let external = MemorySessionState::new();

    let err = store
        .fetch_or_create(&external, "r1", Some("broken"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CREATION_FAILED");
    assert_eq!(store.live_session_count(), 0);

    let ok = store.fetch_or_create(&external, "r2", None).await.unwrap();
    assert_eq!(store.group_ref_count(ok.key().base_id()), Some(2));
}

#[tokio::test]
async fn test_lease_detaches_on_drop() {
    let store = SessionStore::new(StoreConfig::default());
    let external = MemorySessionState::new();

    let base_id = {
        let lease = SessionLease::acquire(&store, &external, "r1", None).await.unwrap();
        assert_eq!(lease.generation(), 1);
        let base_id = lease.key().base_id().to_string();
        assert_eq!(store.group_ref_count(&base_id), Some(2));
        base_id
    };
    assert_eq!(store.group_ref_count(&base_id), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_wide_lock_creates_one_session() {
    let created = Arc::new(AtomicUsize::new(0));
    let store = {
        let created = created.clone();
        SessionStore::builder(StoreConfig {
            per_group_locks: false,
            ..StoreConfig::default()
        })
        .on_session_created(move |_session| {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
    };
    let alice = Arc::new(MemorySessionState::new());
    let bob = Arc::new(MemorySessionState::new());

    let mut tasks = Vec::new();
    for i in 0..12 {
        let store = store.clone();
        let external = if i % 2 == 0 { alice.clone() } else { bob.clone() };
        tasks.push(tokio::spawn(async move {
            store
                .fetch_or_create(external.as_ref(), &format!("req-{}", i), None)
                .await
                .unwrap()
        }));
    }
    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await.unwrap());
    }

    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(store.live_session_count(), 2);
    for session in &sessions {
        assert_eq!(store.group_ref_count(session.key().base_id()), Some(7));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_creation_does_not_block_other_groups() {
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = parking_lot::Mutex::new(release_rx);
    let entered = Arc::new(AtomicUsize::new(0));
    let store = {
        let entered = entered.clone();
        SessionStore::builder(StoreConfig::default())
            .on_session_created(move |session| {
                if session.key().base_id() == "slow-base" {
                    entered.fetch_add(1, Ordering::SeqCst);
                    let _ = release_rx.lock().recv();
                }
                Ok(())
            })
            .build()
    };
    let slow = Arc::new(MemorySessionState::new());
    slow.set_string(DEFAULT_BASE_ID_KEY, "slow-base");
    let fast = MemorySessionState::new();

    let creating = {
        let store = store.clone();
        let slow = slow.clone();
        tokio::spawn(async move { store.fetch_or_create(slow.as_ref(), "r1", None).await })
    };
    while entered.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let same_group = {
        let store = store.clone();
        let slow = slow.clone();
        tokio::spawn(async move { store.fetch_or_create(slow.as_ref(), "r2", None).await })
    };

    let other = tokio::time::timeout(
        Duration::from_secs(2),
        store.fetch_or_create(&fast, "r3", None),
    )
    .await
    .expect("other group must not wait for the slow creation")
    .unwrap();
    assert_ne!(other.key().base_id(), "slow-base");
    assert!(!creating.is_finished());
    assert!(!same_group.is_finished());

    release_tx.send(()).unwrap();
    let first = creating.await.unwrap().unwrap();
    let second = same_group.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(entered.load(Ordering::SeqCst), 1);
    assert_eq!(store.group_ref_count("slow-base"), Some(3));
}

#[tokio::test]
async fn test_refused_session_entry_rolls_back() {
    let store = SessionStore::new(StoreConfig {
        cache_size_limit: Some(5),
        session_entry_size: 10,
        track_statistics: true,
        ..StoreConfig::default()
    });
    let external = MemorySessionState::new();

    let err = store.fetch_or_create(&external, "r1", None).await.unwrap_err();
    assert_eq!(err.code(), "CREATION_FAILED");
    assert_eq!(store.live_session_count(), 0);
    assert_eq!(store.current_statistics().unwrap().session_count, 0);

    let base_id = external.get_string(DEFAULT_BASE_ID_KEY).unwrap();
    for _ in 0..400 {
        if store.group_ref_count(&base_id).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(store.group_ref_count(&base_id), None);
    assert_eq!(external.keys(), vec![DEFAULT_BASE_ID_KEY.to_string()]);
}

#[tokio::test]
async fn test_refused_runner_entry_rolls_back() {
    let store = SessionStore::new(StoreConfig {
        cache_size_limit: Some(5),
        runner_entry_size: 10,
        track_statistics: true,
        ..StoreConfig::default()
    });
    let external = MemorySessionState::new();
    let session = store.fetch_or_create(&external, "r1", None).await.unwrap();

    let mut built = None;
    let err = store
        .create_runner(&external, &session, Some("t-1"), |ctx| {
            let runner = ctx.pull(&RunnerOptions::default(), IterSource::new(0u32..));
            built = Some(runner.clone());
            Ok(runner)
        })
        .unwrap_err();
    assert_eq!(err.code(), "CREATION_FAILED");

    let runner = built.unwrap();
    assert_eq!(runner.status(), RunnerStatus::Aborted);
    assert!(runner.finished().wait_timeout(Duration::from_secs(5)).await);
    assert_eq!(session.runners().runner_count(), 0);
    assert!(store.runner_markers(&external, &session).is_empty());
    assert_eq!(store.current_statistics().unwrap().runner_count, 0);
    assert!(store.get_runner(&session, 0).is_none());
    assert!(!session.is_disposed());
}
