//! Leadership properties across several nodes sharing one election

use leader_core::task::until_cancelled;
use leader_core::{
    leader_task, CampaignRetry, Coordinator, CoordinatorConfig, ElectionBackend, LeaderError,
    LeadershipState, MemoryBackend, Supervisor, Work,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config(prefix: &str) -> CoordinatorConfig {
    CoordinatorConfig::new()
        .with_key_prefix(prefix)
        .with_log_interval(Duration::ZERO)
}

async fn supervisor(backend: &MemoryBackend, prefix: &str) -> Arc<Supervisor> {
    let config = config(prefix);
    let session = backend.open_session(config.session_ttl).await.unwrap();
    Arc::new(Supervisor::new(session.election(prefix), &config))
}

/// Poll `check` until it holds or `WAIT` elapses
async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let polled = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_at_most_one_node_leads() {
    let prefix = "/single-leader/";
    let backend = MemoryBackend::new();

    let mut nodes = Vec::new();
    for _ in 0..3 {
        let coordinator = Arc::new(Coordinator::new(config(prefix)).unwrap());
        coordinator.initialize(&backend).await.unwrap();
        nodes.push(coordinator);
    }

    let mut current = Vec::new();
    for node in &nodes {
        current.push(node.supervisor().await.unwrap());
    }
    let supervisors = Arc::new(Mutex::new(current));

    // Snapshots are taken without yielding, so they are consistent on
    // the current-thread runtime.
    let sampling = Arc::new(AtomicBool::new(true));
    let sampler = {
        let sampling = sampling.clone();
        let supervisors = supervisors.clone();
        tokio::spawn(async move {
            let mut samples = 0usize;
            while sampling.load(Ordering::SeqCst) {
                let leading = supervisors
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|s| s.is_leading())
                    .count();
                assert!(leading <= 1, "{} supervisors leading at once", leading);
                samples += 1;
                tokio::task::yield_now().await;
            }
            samples
        })
    };

    for round in 0..6 {
        let leader = tokio::time::timeout(WAIT, async {
            loop {
                let leading = supervisors.lock().unwrap().iter().position(|s| s.is_leading());
                if let Some(i) = leading {
                    return i;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no leader in round {}", round));

        nodes[leader].resign().await.unwrap();
        nodes[leader].initialize(&backend).await.unwrap();
        let replacement = nodes[leader].supervisor().await.unwrap();
        supervisors.lock().unwrap()[leader] = replacement;
    }

    sampling.store(false, Ordering::SeqCst);
    let samples = sampler.await.unwrap();
    assert!(samples > 0);

    for node in &nodes {
        node.resign().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_generation_waits_for_old_work() {
    let prefix = "/generation-drain/";
    let backend = MemoryBackend::new();

    let a = supervisor(&backend, prefix).await;
    a.start().unwrap();
    eventually("A to lead", || a.is_leading()).await;
    assert_eq!(a.state(), LeadershipState::Leading { generation: 1 });

    let b = supervisor(&backend, prefix).await;
    b.start().unwrap();

    // Work that ignores cancellation and outlives the first generation.
    let finished = Arc::new(AtomicBool::new(false));
    let saw_cancel = Arc::new(AtomicBool::new(false));
    let (work, handle) = {
        let finished = finished.clone();
        let saw_cancel = saw_cancel.clone();
        Work::new(leader_task(move |token| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            saw_cancel.store(token.is_cancelled(), Ordering::SeqCst);
            finished.store(true, Ordering::SeqCst);
            Ok::<(), LeaderError>(())
        }))
    };
    a.exec(work).await.unwrap();
    eventually("work to start", || a.work_in_flight() == 1).await;

    assert!(backend.evict(prefix, a.node_name()));
    tokio::time::timeout(WAIT, b.wait_leader()).await.unwrap();
    eventually("A to step down", || !a.is_leading()).await;
    assert!(!finished.load(Ordering::SeqCst));

    let mut a_state = a.subscribe();
    b.stop().await.unwrap();

    let state = tokio::time::timeout(WAIT, a_state.wait_for(|s| s.is_leading()))
        .await
        .unwrap()
        .map(|s| *s)
        .unwrap();
    assert!(
        finished.load(Ordering::SeqCst),
        "generation started while old work was running"
    );
    assert_eq!(state, LeadershipState::Leading { generation: 2 });
    assert!(saw_cancel.load(Ordering::SeqCst));
    handle.into_result().await.unwrap();
    assert_eq!(a.metrics().demotions.get(), 1);
    assert_eq!(a.metrics().generations.get(), 2);

    a.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_demotion_cancels_running_work() {
    let prefix = "/cancel-on-demotion/";
    let backend = MemoryBackend::new();
    let coordinator = Arc::new(Coordinator::new(config(prefix)).unwrap());
    coordinator.initialize(&backend).await.unwrap();
    coordinator.wait_leader().await.unwrap();
    let supervisor = coordinator.supervisor().await.unwrap();

    let running = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run_task(leader_task(until_cancelled)).await })
    };
    eventually("work to start", || supervisor.work_in_flight() == 1).await;

    assert!(backend.evict(prefix, supervisor.node_name()));

    let result = tokio::time::timeout(WAIT, running)
        .await
        .expect("work did not observe cancellation")
        .unwrap();
    assert!(matches!(result, Err(LeaderError::Cancelled)));

    // The node re-campaigns alone and leads again.
    eventually("re-election", || supervisor.is_leading()).await;
    coordinator
        .run(|_token| async { Ok::<(), LeaderError>(()) })
        .await
        .unwrap();

    coordinator.resign().await.unwrap();
}

#[tokio::test]
async fn test_run_without_initialize_does_not_block() {
    let coordinator = Coordinator::new(config("/not-initialized/")).unwrap();

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        coordinator.run(|_token| async { Ok::<(), LeaderError>(()) }),
    )
    .await
    .expect("run blocked without a supervisor");
    assert!(matches!(result, Err(LeaderError::NotInitialized)));

    assert!(matches!(
        coordinator.set_log_interval(Duration::from_secs(1)).await,
        Err(LeaderError::NotInitialized)
    ));
    assert!(coordinator.resign().await.is_ok());
}

#[tokio::test]
async fn test_run_after_resign_does_not_block() {
    let backend = MemoryBackend::new();
    let coordinator = Coordinator::new(config("/after-resign/")).unwrap();
    coordinator.initialize(&backend).await.unwrap();
    coordinator.resign().await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        coordinator.run(|_token| async { Ok::<(), LeaderError>(()) }),
    )
    .await
    .expect("run blocked after resign");
    assert!(matches!(result, Err(LeaderError::NotInitialized)));
    assert!(backend.candidates("/after-resign/").is_empty());
}

#[tokio::test]
async fn test_override_runs_without_election() {
    let backend = MemoryBackend::new();
    let coordinator = Coordinator::new(config("/override/")).unwrap();
    coordinator.override_coordination().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    coordinator
        .run(move |_token| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), LeaderError>(())
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!coordinator.is_initialized().await);
    assert_eq!(backend.active_sessions(), 0);

    let err = coordinator
        .run(|_token| async { Err::<(), _>(LeaderError::Internal { message: "local".into() }) })
        .await
        .unwrap_err();
    assert!(matches!(err, LeaderError::Internal { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failover_between_two_supervisors() {
    let prefix = "/failover-e2e/";
    let backend = MemoryBackend::new();

    let a = supervisor(&backend, prefix).await;
    a.start().unwrap();
    tokio::time::timeout(WAIT, a.wait_leader()).await.unwrap();

    let b = supervisor(&backend, prefix).await;
    b.start().unwrap();
    eventually("B to observe A", || b.leader_name() == a.node_name()).await;
    assert!(!b.is_leader());
    assert!(a.is_leader());

    a.stop().await.unwrap();
    tokio::time::timeout(WAIT, b.wait_leader())
        .await
        .expect("B never took over");
    assert!(b.is_leader());

    let before = b.work_performed();
    let runs = Arc::new(AtomicUsize::new(0));
    let (work, handle) = {
        let runs = runs.clone();
        Work::new(leader_task(move |_token| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<(), LeaderError>(())
        }))
    };
    b.exec(work).await.unwrap();
    handle.into_result().await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(b.work_performed(), before + 1);
    assert_eq!(a.work_performed(), 0);

    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_campaign_retries_with_backoff() {
    let prefix = "/campaign-retry/";
    let backend = MemoryBackend::new();
    backend.inject_campaign_failures(2);

    let config = config(prefix).with_campaign_retry(CampaignRetry::Backoff {
        initial: Duration::from_millis(5),
        max: Duration::from_millis(20),
        multiplier: 2.0,
        max_attempts: None,
    });
    let coordinator = Coordinator::new(config).unwrap();
    coordinator.initialize(&backend).await.unwrap();

    tokio::time::timeout(WAIT, coordinator.wait_leader())
        .await
        .unwrap()
        .unwrap();
    let supervisor = coordinator.supervisor().await.unwrap();
    assert_eq!(supervisor.metrics().campaign_failures.get(), 2);

    coordinator.resign().await.unwrap();
}

#[tokio::test]
async fn test_campaign_gives_up_without_retry() {
    let prefix = "/campaign-never/";
    let backend = MemoryBackend::new();
    backend.inject_campaign_failures(1);

    let coordinator =
        Coordinator::new(config(prefix).with_campaign_retry(CampaignRetry::Never)).unwrap();
    coordinator.initialize(&backend).await.unwrap();
    let supervisor = coordinator.supervisor().await.unwrap();

    eventually("campaign to give up", || {
        supervisor.metrics().campaign_failures.get() == 1
            && supervisor.state() == LeadershipState::Idle
    })
    .await;
    assert!(backend.candidates(prefix).is_empty());

    coordinator.resign().await.unwrap();
}

#[tokio::test]
async fn test_closed_backend_leaves_election() {
    let prefix = "/backend-closed/";
    let backend = MemoryBackend::new();
    let coordinator = Coordinator::new(config(prefix)).unwrap();
    coordinator.initialize(&backend).await.unwrap();
    coordinator.wait_leader().await.unwrap();
    let supervisor = coordinator.supervisor().await.unwrap();

    backend.close();
    eventually("supervisor to go idle", || {
        supervisor.state() == LeadershipState::Idle
    })
    .await;
    assert_eq!(supervisor.metrics().is_leader.get(), 0);
    assert_eq!(supervisor.metrics().demotions.get(), 1);

    assert!(matches!(
        coordinator.resign().await,
        Err(LeaderError::Resign { .. })
    ));
}

#[tokio::test]
async fn test_follower_leaves_closed_election() {
    let prefix = "/follower-closed/";
    let backend = MemoryBackend::new();

    let a = supervisor(&backend, prefix).await;
    a.start().unwrap();
    eventually("A to lead", || a.is_leading()).await;

    let b = supervisor(&backend, prefix).await;
    b.start().unwrap();
    eventually("B to queue", || backend.candidates(prefix).len() == 2).await;

    backend.close();
    eventually("B to go idle", || b.state() == LeadershipState::Idle).await;

    // Longer than the default backoff; a retry would be back to campaigning.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(b.state(), LeadershipState::Idle, "follower rejoined a closed election");
    assert_eq!(b.metrics().campaign_failures.get(), 1);
    assert_eq!(b.metrics().demotions.get(), 0);
}

#[tokio::test]
async fn test_expired_lease_ends_leadership() {
    let prefix = "/leader-expired/";
    let backend = MemoryBackend::new();
    let config = config(prefix);
    let session = backend.open_session(config.session_ttl).await.unwrap();
    let sup = Arc::new(Supervisor::new(session.election(prefix), &config));
    sup.start().unwrap();
    eventually("leadership", || sup.is_leading()).await;

    assert!(backend.expire_session(session.lease_id()));
    eventually("supervisor to go idle", || {
        sup.state() == LeadershipState::Idle
    })
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sup.state(), LeadershipState::Idle);
    assert_eq!(sup.metrics().demotions.get(), 1);
    assert_eq!(sup.metrics().campaign_failures.get(), 1);
    assert_eq!(sup.metrics().is_leader.get(), 0);
    assert!(backend.candidates(prefix).is_empty());

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn test_follower_exec_queues_without_running() {
    let prefix = "/follower-exec/";
    let backend = MemoryBackend::new();

    let a = supervisor(&backend, prefix).await;
    a.start().unwrap();
    eventually("A to lead", || a.is_leading()).await;

    let b = supervisor(&backend, prefix).await;
    b.start().unwrap();
    eventually("B to queue", || backend.candidates(prefix).len() == 2).await;

    let (work, mut handle) = Work::new(leader_task(|_token| async { Ok::<(), LeaderError>(()) }));
    tokio::time::timeout(Duration::from_millis(100), b.exec(work))
        .await
        .expect("exec on a follower waited for leadership")
        .unwrap();

    let early = tokio::time::timeout(Duration::from_millis(50), handle.err()).await;
    assert!(early.is_err(), "follower ran work");
    assert_eq!(b.work_performed(), 0);

    a.stop().await.unwrap();
    let result = tokio::time::timeout(WAIT, handle.into_result()).await.unwrap();
    assert!(result.is_ok());
    assert_eq!(b.work_performed(), 1);

    b.stop().await.unwrap();
}
