//! End-to-end save pipeline tests driven by a scripted job spawner.
//!
//! The mock spawner records every command, lets tests fire (or withhold)
//! exit callbacks, and simulates jobs that die silently, so the completion
//! races the coordinator has to settle can be reproduced deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use oxidesync::job::{ExitCallback, JobId, JobSpawner};
use oxidesync::lsp::{LspBridge, ProxyManager, SaveGate, SaveLifecycle};
use oxidesync::{
    SpawnError, StartOutcome, WriteCoordinator, WriteEvent, WriteSettings, SYNTHETIC_EXIT_CODE,
};

const RESOURCE: &str = "scp://host/proj/a.txt";

#[derive(Clone, Copy)]
enum MockBehavior {
    /// Deliver the exit callback synchronously at spawn time.
    Exit(i32, &'static str),
    /// Keep the job running until the test fires or vanishes it.
    StayAlive,
    /// Refuse to spawn.
    FailSpawn,
}

struct MockJobState {
    alive: AtomicBool,
    terminated: AtomicBool,
}

struct MockSpawner {
    next_id: AtomicU64,
    plan: parking_lot::Mutex<VecDeque<MockBehavior>>,
    spawned: parking_lot::Mutex<Vec<Vec<String>>>,
    jobs: DashMap<JobId, MockJobState>,
    pending: parking_lot::Mutex<HashMap<JobId, ExitCallback>>,
}

impl MockSpawner {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            plan: parking_lot::Mutex::new(VecDeque::new()),
            spawned: parking_lot::Mutex::new(Vec::new()),
            jobs: DashMap::new(),
            pending: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn plan(&self, behavior: MockBehavior) {
        self.plan.lock().push_back(behavior);
    }

    fn spawn_count(&self) -> usize {
        self.spawned.lock().len()
    }

    fn argv(&self, index: usize) -> Vec<String> {
        self.spawned.lock()[index].clone()
    }

    /// Deliver the real exit callback for a StayAlive job.
    fn fire_exit(&self, job: JobId, code: i32, stderr: &str) {
        if let Some(state) = self.jobs.get(&job) {
            state.alive.store(false, Ordering::SeqCst);
        }
        let callback = self.pending.lock().remove(&job);
        if let Some(cb) = callback {
            cb(code, stderr.to_string());
        }
    }

    /// Make the job look dead without ever delivering its callback.
    fn vanish(&self, job: JobId) {
        if let Some(state) = self.jobs.get(&job) {
            state.alive.store(false, Ordering::SeqCst);
        }
    }

    fn is_terminated(&self, job: JobId) -> bool {
        self.jobs
            .get(&job)
            .map(|s| s.terminated.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn wait_for_spawns(&self, count: usize) {
        while self.spawn_count() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl JobSpawner for MockSpawner {
    async fn spawn(&self, argv: &[String], on_exit: ExitCallback) -> Result<JobId, SpawnError> {
        let behavior = self
            .plan
            .lock()
            .pop_front()
            .unwrap_or(MockBehavior::Exit(0, ""));

        if let MockBehavior::FailSpawn = behavior {
            return Err(SpawnError::EmptyCommand);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.spawned.lock().push(argv.to_vec());

        match behavior {
            MockBehavior::Exit(code, stderr) => {
                self.jobs.insert(
                    id,
                    MockJobState {
                        alive: AtomicBool::new(false),
                        terminated: AtomicBool::new(false),
                    },
                );
                on_exit(code, stderr.to_string());
            }
            MockBehavior::StayAlive => {
                self.jobs.insert(
                    id,
                    MockJobState {
                        alive: AtomicBool::new(true),
                        terminated: AtomicBool::new(false),
                    },
                );
                self.pending.lock().insert(id, on_exit);
            }
            MockBehavior::FailSpawn => unreachable!(),
        }

        Ok(id)
    }

    fn is_alive(&self, job: JobId) -> bool {
        self.jobs
            .get(&job)
            .map(|s| s.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn terminate(&self, job: JobId) {
        if let Some(state) = self.jobs.get(&job) {
            state.terminated.store(true, Ordering::SeqCst);
            state.alive.store(false, Ordering::SeqCst);
        }
    }
}

fn build_coordinator(
    spawner: &Arc<MockSpawner>,
    settings: WriteSettings,
    lifecycle: Option<Arc<dyn SaveLifecycle>>,
) -> (Arc<WriteCoordinator>, mpsc::Receiver<WriteEvent>) {
    let (tx, rx) = mpsc::channel(16);
    let mut coordinator = WriteCoordinator::new(spawner.clone() as Arc<dyn JobSpawner>)
        .with_settings(settings)
        .with_event_sender(tx);
    if let Some(lifecycle) = lifecycle {
        coordinator = coordinator.with_lifecycle(lifecycle);
    }
    (Arc::new(coordinator), rx)
}

/// Wait until the coordinator has registered exactly one in-flight write
/// and return its job id. Registration happens shortly after the transfer
/// job spawn, so tests poll rather than assume ordering.
async fn wait_in_flight(coordinator: &Arc<WriteCoordinator>) -> oxidesync::JobId {
    loop {
        let status = coordinator.get_status();
        if let Some(entry) = status.first() {
            return entry.job_id;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

async fn expect_started(rx: &mut mpsc::Receiver<WriteEvent>) {
    match rx.recv().await {
        Some(WriteEvent::Started { resource }) => assert_eq!(resource, RESOURCE),
        other => panic!("Expected Started event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_successful_save_roundtrip() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::Exit(0, "")); // mkdir
    spawner.plan(MockBehavior::StayAlive); // transfer

    let gate = Arc::new(SaveGate::new(Duration::from_secs(30)));
    let (coordinator, mut rx) =
        build_coordinator(&spawner, WriteSettings::default(), Some(gate.clone()));

    let outcome = coordinator.start_save(RESOURCE, b"hello").await.unwrap();
    assert_eq!(outcome, StartOutcome::Accepted);
    expect_started(&mut rx).await;

    spawner.wait_for_spawns(2).await;
    let job_id = wait_in_flight(&coordinator).await;

    // Directory-ensure ran first, over the remote shell
    assert_eq!(
        spawner.argv(0),
        vec!["ssh", "-q", "host", "mkdir -p proj"]
    );

    // Transfer copies the staged snapshot to host:path
    let transfer = spawner.argv(1);
    assert_eq!(transfer[0], "scp");
    assert_eq!(transfer[transfer.len() - 1], "host:proj/a.txt");

    // The staged snapshot holds the buffer content while in flight
    let staged = tokio::fs::read(&transfer[2]).await.unwrap();
    assert_eq!(staged, b"hello");

    // Save window is open, status lists the operation
    assert!(gate.is_saving(RESOURCE));
    let status = coordinator.get_status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].host, "host");

    spawner.fire_exit(job_id, 0, "");

    match rx.recv().await {
        Some(WriteEvent::Completed { resource, .. }) => assert_eq!(resource, RESOURCE),
        other => panic!("Expected Completed event, got {:?}", other),
    }

    assert!(coordinator.get_status().is_empty());
    assert!(!gate.is_saving(RESOURCE));

    // Temp staging is cleaned up (best-effort, async)
    let staged_path = std::path::PathBuf::from(&transfer[2]);
    for _ in 0..200 {
        if !staged_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!staged_path.exists());
}

#[tokio::test]
async fn test_transfer_failure_reports_stderr() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::Exit(0, "")); // mkdir
    spawner.plan(MockBehavior::Exit(1, "Permission denied")); // transfer

    let (coordinator, mut rx) = build_coordinator(&spawner, WriteSettings::default(), None);

    let outcome = coordinator.start_save(RESOURCE, b"hello").await.unwrap();
    assert_eq!(outcome, StartOutcome::Accepted);
    expect_started(&mut rx).await;

    match rx.recv().await {
        Some(WriteEvent::Failed { resource, error }) => {
            assert_eq!(resource, RESOURCE);
            assert!(error.contains("Permission denied"), "error was: {}", error);
        }
        other => panic!("Expected Failed event, got {:?}", other),
    }
    assert!(coordinator.get_status().is_empty());
}

#[tokio::test]
async fn test_mkdir_failure_aborts_before_transfer() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::Exit(1, "ssh: no such host"));

    let gate = Arc::new(SaveGate::new(Duration::from_secs(30)));
    let (coordinator, mut rx) =
        build_coordinator(&spawner, WriteSettings::default(), Some(gate.clone()));

    coordinator.start_save(RESOURCE, b"hello").await.unwrap();
    expect_started(&mut rx).await;

    match rx.recv().await {
        Some(WriteEvent::Failed { error, .. }) => {
            assert!(error.contains("no such host"), "error was: {}", error);
        }
        other => panic!("Expected Failed event, got {:?}", other),
    }

    // Only the mkdir job ran; the slot and the save window are clean
    assert_eq!(spawner.spawn_count(), 1);
    assert!(coordinator.get_status().is_empty());
    assert!(!gate.is_saving(RESOURCE));
}

#[tokio::test]
async fn test_transfer_spawn_failure_reported() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::Exit(0, "")); // mkdir
    spawner.plan(MockBehavior::FailSpawn); // transfer

    let (coordinator, mut rx) = build_coordinator(&spawner, WriteSettings::default(), None);

    coordinator.start_save(RESOURCE, b"hello").await.unwrap();
    expect_started(&mut rx).await;

    match rx.recv().await {
        Some(WriteEvent::Failed { error, .. }) => {
            assert!(
                error.contains("Failed to start transfer job"),
                "error was: {}",
                error
            );
        }
        other => panic!("Expected Failed event, got {:?}", other),
    }
    assert!(coordinator.get_status().is_empty());
}

#[tokio::test]
async fn test_second_save_rejected_while_in_flight() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::Exit(0, ""));
    spawner.plan(MockBehavior::StayAlive);

    let (coordinator, mut rx) = build_coordinator(&spawner, WriteSettings::default(), None);

    let first = coordinator.start_save(RESOURCE, b"one").await.unwrap();
    assert_eq!(first, StartOutcome::Accepted);
    expect_started(&mut rx).await;
    wait_in_flight(&coordinator).await;

    let second = coordinator.start_save(RESOURCE, b"two").await.unwrap();
    assert_eq!(second, StartOutcome::AlreadyInProgress);

    // No second job sequence was started
    assert_eq!(spawner.spawn_count(), 2);
    assert_eq!(coordinator.get_status().len(), 1);
}

#[tokio::test]
async fn test_non_remote_resource_is_ignored() {
    let spawner = Arc::new(MockSpawner::new());
    let (coordinator, _rx) = build_coordinator(&spawner, WriteSettings::default(), None);

    let outcome = coordinator
        .start_save("/local/path/a.txt", b"hello")
        .await
        .unwrap();
    assert_eq!(outcome, StartOutcome::NotRemote);
    assert_eq!(spawner.spawn_count(), 0);
    assert!(coordinator.get_status().is_empty());
}

#[tokio::test]
async fn test_completion_is_idempotent() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::Exit(0, ""));
    spawner.plan(MockBehavior::StayAlive);

    let (coordinator, mut rx) = build_coordinator(&spawner, WriteSettings::default(), None);

    coordinator.start_save(RESOURCE, b"hello").await.unwrap();
    expect_started(&mut rx).await;
    let job_id = wait_in_flight(&coordinator).await;

    coordinator.complete(RESOURCE, job_id, 0, None).await;
    coordinator.complete(RESOURCE, job_id, 0, None).await;

    match rx.recv().await {
        Some(WriteEvent::Completed { .. }) => {}
        other => panic!("Expected Completed event, got {:?}", other),
    }
    // The duplicate signal produced no second report
    assert!(rx.try_recv().is_err());
    assert!(coordinator.get_status().is_empty());
}

#[tokio::test]
async fn test_stale_job_id_is_ignored() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::Exit(0, ""));
    spawner.plan(MockBehavior::StayAlive);

    let (coordinator, mut rx) = build_coordinator(&spawner, WriteSettings::default(), None);

    coordinator.start_save(RESOURCE, b"hello").await.unwrap();
    expect_started(&mut rx).await;
    let job_id = wait_in_flight(&coordinator).await;

    coordinator.complete(RESOURCE, job_id + 40, 0, None).await;

    // No state mutation: the operation is still registered, no event fired
    assert_eq!(coordinator.get_status().len(), 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_vanished_job_forces_silent_success() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::Exit(0, ""));
    spawner.plan(MockBehavior::StayAlive);

    let (coordinator, mut rx) = build_coordinator(&spawner, WriteSettings::default(), None);

    coordinator.start_save(RESOURCE, b"hello").await.unwrap();
    expect_started(&mut rx).await;
    let job_id = wait_in_flight(&coordinator).await;

    // Job disappears without ever signalling exit; the watchdog's next
    // poll treats it as a silent success.
    spawner.vanish(job_id);

    match rx.recv().await {
        Some(WriteEvent::Completed { resource, .. }) => assert_eq!(resource, RESOURCE),
        other => panic!("Expected Completed event, got {:?}", other),
    }
    assert!(coordinator.get_status().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_forces_failure_and_terminate() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::Exit(0, ""));
    spawner.plan(MockBehavior::StayAlive);

    let settings = WriteSettings {
        timeout_secs: 2,
        check_interval_ms: 100,
        debug: false,
    };
    let (coordinator, mut rx) = build_coordinator(&spawner, settings, None);

    coordinator.start_save(RESOURCE, b"hello").await.unwrap();
    expect_started(&mut rx).await;
    let job_id = wait_in_flight(&coordinator).await;

    match rx.recv().await {
        Some(WriteEvent::Failed { error, .. }) => {
            assert!(error.contains("Timeout after 2s"), "error was: {}", error);
        }
        other => panic!("Expected Failed event, got {:?}", other),
    }
    assert!(spawner.is_terminated(job_id));
    assert!(coordinator.get_status().is_empty());
}

#[tokio::test]
async fn test_cancel_mid_transfer() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::Exit(0, ""));
    spawner.plan(MockBehavior::StayAlive);

    let (coordinator, mut rx) = build_coordinator(&spawner, WriteSettings::default(), None);

    coordinator.start_save(RESOURCE, b"hello").await.unwrap();
    expect_started(&mut rx).await;
    let job_id = wait_in_flight(&coordinator).await;

    coordinator.cancel(RESOURCE).await.unwrap();

    match rx.recv().await {
        Some(WriteEvent::Failed { error, .. }) => {
            assert!(error.contains("Cancelled by user"), "error was: {}", error);
        }
        other => panic!("Expected Failed event, got {:?}", other),
    }
    assert!(spawner.is_terminated(job_id));
    assert!(coordinator.get_status().is_empty());

    // A late real exit signal for the cancelled job is stale and harmless
    spawner.fire_exit(job_id, SYNTHETIC_EXIT_CODE, "");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_force_complete_success() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::Exit(0, ""));
    spawner.plan(MockBehavior::StayAlive);

    let (coordinator, mut rx) = build_coordinator(&spawner, WriteSettings::default(), None);

    coordinator.start_save(RESOURCE, b"hello").await.unwrap();
    expect_started(&mut rx).await;
    wait_in_flight(&coordinator).await;

    coordinator.force_complete(RESOURCE, true).await.unwrap();
    match rx.recv().await {
        Some(WriteEvent::Completed { .. }) => {}
        other => panic!("Expected Completed event, got {:?}", other),
    }
    assert!(coordinator.get_status().is_empty());
}

#[tokio::test]
async fn test_save_window_suspends_proxy_teardown() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::StayAlive); // proxy process

    let gate = Arc::new(SaveGate::new(Duration::from_secs(30)));
    let proxies = Arc::new(ProxyManager::new(
        spawner.clone() as Arc<dyn JobSpawner>,
        gate.clone(),
    ));
    let bridge = LspBridge::new(gate.clone(), proxies.clone());

    proxies
        .attach_buffer(
            "rust-analyzer",
            "host",
            RESOURCE,
            Some("proj"),
            &["rust-analyzer".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(proxies.server_count(), 1);
    let proxy_job = proxies.server_for(RESOURCE).unwrap().job_id;

    // Buffer closed mid-save: teardown is suspended
    bridge.save_start(RESOURCE);
    assert!(!proxies.detach_buffer(RESOURCE));
    assert_eq!(proxies.server_count(), 1);
    assert!(!spawner.is_terminated(proxy_job));

    // Save window closes; the deferred detach is applied by the follow-up
    bridge.save_end(RESOURCE);
    for _ in 0..200 {
        if proxies.server_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(proxies.server_count(), 0);
    assert!(spawner.is_terminated(proxy_job));
}

#[tokio::test]
async fn test_detach_outside_save_window_tears_down() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::StayAlive);

    let gate = Arc::new(SaveGate::new(Duration::from_secs(30)));
    let proxies = Arc::new(ProxyManager::new(
        spawner.clone() as Arc<dyn JobSpawner>,
        gate.clone(),
    ));

    proxies
        .attach_buffer("gopls", "host", RESOURCE, None, &["gopls".to_string()])
        .await
        .unwrap();
    let proxy_job = proxies.server_for(RESOURCE).unwrap().job_id;

    assert!(proxies.detach_buffer(RESOURCE));
    assert_eq!(proxies.server_count(), 0);
    assert!(spawner.is_terminated(proxy_job));
}

#[tokio::test]
async fn test_proxy_restarted_after_dying_in_save_window() {
    let spawner = Arc::new(MockSpawner::new());
    spawner.plan(MockBehavior::StayAlive); // first proxy
    spawner.plan(MockBehavior::StayAlive); // respawned proxy

    let gate = Arc::new(SaveGate::new(Duration::from_secs(30)));
    let proxies = Arc::new(ProxyManager::new(
        spawner.clone() as Arc<dyn JobSpawner>,
        gate.clone(),
    ));

    proxies
        .attach_buffer("gopls", "host", RESOURCE, None, &["gopls".to_string()])
        .await
        .unwrap();
    let first_job = proxies.server_for(RESOURCE).unwrap().job_id;

    gate.mark_start(RESOURCE);
    spawner.vanish(first_job);
    gate.mark_end(RESOURCE);

    proxies.reconcile_after_save(RESOURCE).await;

    let restarted = proxies.server_for(RESOURCE).unwrap();
    assert_ne!(restarted.job_id, first_job);
    assert_eq!(proxies.server_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_save_flag_sweep() {
    let gate = Arc::new(SaveGate::new(Duration::from_secs(30)));
    gate.spawn_sweeper(Duration::from_secs(15));

    gate.mark_start(RESOURCE);
    assert!(gate.is_saving(RESOURCE));

    // No save-end ever arrives; the sweep clears the flag once it is older
    // than the max-save-duration.
    tokio::time::sleep(Duration::from_secs(31)).await;
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert!(!gate.is_saving(RESOURCE));
}
