//! Write Coordinator
//!
//! Owns a save attempt end to end: parse the target, reserve the write
//! slot, stage content locally, notify the LSP side, run the
//! mkdir-then-transfer job sequence, start the watchdog, and settle every
//! finish path through the single `complete()` funnel.
//!
//! `complete()` is the only place allowed to remove an in-flight entry and
//! the only place that reports a save's final outcome. The job-exit
//! listener, the watchdog and the manual cancel/force paths all call it;
//! the registry's atomic remove-if-job-id-matches makes racing calls safe.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::WriteSettings;
use crate::error::WriteError;
use crate::job::{ExitCallback, JobId, JobSpawner};
use crate::lsp::{NoopLifecycle, SaveLifecycle};
use crate::target::{Protocol, RemoteTarget};
use crate::write::registry::{RegistryError, WriteOperation, WriteRegistry};
use crate::write::staging::{stage_content, StagedContent};
use crate::write::{runner, watchdog};

/// Exit code used for completions the coordinator forces itself (timeout,
/// cancel, forced failure). No POSIX process reports it, so synthetic
/// completions stay distinguishable in logs.
pub const SYNTHETIC_EXIT_CODE: i32 = -1;

/// Immediate answer to a save request. The transfer outcome itself arrives
/// later as a [`WriteEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Staging succeeded and the transfer pipeline is running.
    Accepted,
    /// The identifier is not a remote resource; nothing was done.
    NotRemote,
    /// A write for this resource is already in flight; the request is
    /// rejected, not queued.
    AlreadyInProgress,
}

/// Outcome stream for the embedding layer. Final success/failure reports
/// come exclusively from the completion funnel.
#[derive(Debug, Clone)]
pub enum WriteEvent {
    Started {
        resource: String,
    },
    Completed {
        resource: String,
        elapsed: Duration,
    },
    Failed {
        resource: String,
        error: String,
    },
}

/// Point-in-time view of one in-flight write.
#[derive(Debug, Clone, Serialize)]
pub struct WriteStatus {
    pub resource: String,
    pub protocol: Protocol,
    pub host: String,
    pub job_id: JobId,
    pub elapsed_secs: u64,
    pub started_at: chrono::DateTime<chrono::Local>,
}

pub struct WriteCoordinator {
    registry: Arc<WriteRegistry>,
    spawner: Arc<dyn JobSpawner>,
    lifecycle: Arc<dyn SaveLifecycle>,
    settings: parking_lot::RwLock<WriteSettings>,
    event_tx: Option<mpsc::Sender<WriteEvent>>,
}

impl WriteCoordinator {
    pub fn new(spawner: Arc<dyn JobSpawner>) -> Self {
        Self {
            registry: Arc::new(WriteRegistry::new()),
            spawner,
            lifecycle: Arc::new(NoopLifecycle),
            settings: parking_lot::RwLock::new(WriteSettings::default()),
            event_tx: None,
        }
    }

    /// Inject the LSP save-lifecycle collaborator.
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn SaveLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Set event sender for observing save outcomes.
    pub fn with_event_sender(mut self, tx: mpsc::Sender<WriteEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_settings(self, settings: WriteSettings) -> Self {
        *self.settings.write() = settings;
        self
    }

    /// Replace the runtime settings. Applies to new watchdog ticks
    /// immediately; running transfers keep their jobs.
    pub fn configure(&self, settings: WriteSettings) {
        info!(
            "Write settings updated: timeout {}s, check interval {}ms",
            settings.timeout_secs, settings.check_interval_ms
        );
        *self.settings.write() = settings;
    }

    pub fn settings(&self) -> WriteSettings {
        self.settings.read().clone()
    }

    pub(crate) fn registry(&self) -> &WriteRegistry {
        &self.registry
    }

    pub(crate) fn spawner(&self) -> &Arc<dyn JobSpawner> {
        &self.spawner
    }

    /// Begin saving `content` to the remote resource.
    ///
    /// Returns once the local snapshot exists and the remote job sequence
    /// has been handed off; the outcome arrives as a [`WriteEvent`].
    /// Staging failure is the only error reported here directly, and it
    /// leaves no registry entry and no remote-side state.
    pub async fn start_save(
        self: &Arc<Self>,
        resource: &str,
        content: &[u8],
    ) -> Result<StartOutcome, WriteError> {
        let Some(target) = RemoteTarget::parse(resource) else {
            debug!("{} is not a remote resource", resource);
            return Ok(StartOutcome::NotRemote);
        };

        if self.registry.begin(resource).is_err() {
            info!("Save already in progress for {}", resource);
            return Ok(StartOutcome::AlreadyInProgress);
        }

        let staged = match stage_content(resource, content).await {
            Ok(staged) => staged,
            Err(e) => {
                self.registry.abandon(resource);
                return Err(WriteError::Staging(e));
            }
        };

        // Save-start must be flagged before any remote job exists, so the
        // LSP side suspends teardown for the whole write window.
        self.lifecycle.save_start(resource);
        self.emit(WriteEvent::Started {
            resource: resource.to_string(),
        })
        .await;

        let this = Arc::clone(self);
        let resource = resource.to_string();
        tokio::spawn(async move {
            this.run_transfer(resource, target, staged).await;
        });

        Ok(StartOutcome::Accepted)
    }

    async fn run_transfer(self: Arc<Self>, resource: String, target: RemoteTarget, staged: StagedContent) {
        if let Err(e) = runner::ensure_remote_dir(&self.spawner, &target).await {
            self.abort_before_transfer(&resource, &staged, e).await;
            return;
        }

        let argv = runner::transfer_argv(&target, &staged.file);
        debug!("Spawning transfer: {}", argv.join(" "));

        let (exit_tx, exit_rx) = oneshot::channel::<(i32, String)>();
        let on_exit: ExitCallback = Box::new(move |code, stderr| {
            let _ = exit_tx.send((code, stderr));
        });

        let job_id = match self.spawner.spawn(&argv, on_exit).await {
            Ok(id) => id,
            Err(e) => {
                self.abort_before_transfer(&resource, &staged, WriteError::Spawn(e))
                    .await;
                return;
            }
        };

        let op = WriteOperation {
            job_id,
            started_at: Instant::now(),
            started_wall: chrono::Local::now(),
            elapsed: Duration::ZERO,
            temp_file: staged.file.clone(),
            temp_dir: staged.dir.clone(),
            target,
        };

        if self.registry.activate(&resource, op).is_err() {
            // The reserved slot vanished while the jobs came up; stand the
            // transfer down rather than run it unsupervised.
            warn!("Write slot for {} disappeared during spawn, aborting", resource);
            self.spawner.terminate(job_id);
            cleanup_staged(staged.dir.clone());
            self.lifecycle.save_end(&resource);
            return;
        }

        info!("Transfer job {} started for {}", job_id, resource);
        watchdog::spawn_watchdog(Arc::clone(&self), resource.clone(), job_id);

        // Sole consumer of the real exit signal. The oneshot buffers an
        // exit that lands before this listener runs, so nothing is lost.
        let this = Arc::clone(&self);
        tokio::spawn(async move {
            if let Ok((code, stderr)) = exit_rx.await {
                let message = match (code, stderr.is_empty()) {
                    (0, _) => None,
                    (_, false) => Some(WriteError::Transfer(stderr).to_string()),
                    (_, true) => {
                        Some(WriteError::Transfer(format!("exit code {}", code)).to_string())
                    }
                };
                this.complete(&resource, job_id, code, message).await;
            }
        });
    }

    /// Abort path for failures before a transfer job exists: release the
    /// slot, drop the staged snapshot, close the save window, report.
    async fn abort_before_transfer(&self, resource: &str, staged: &StagedContent, error: WriteError) {
        warn!("Save aborted for {}: {}", resource, error);
        self.registry.abandon(resource);
        cleanup_staged(staged.dir.clone());
        self.lifecycle.save_end(resource);
        self.emit(WriteEvent::Failed {
            resource: resource.to_string(),
            error: error.to_string(),
        })
        .await;
    }

    /// Completion funnel. Idempotent and race-safe: the job-exit listener,
    /// the watchdog and manual completion all end up here, and only the
    /// first caller whose `job_id` matches the registered operation
    /// performs any effect.
    pub async fn complete(
        &self,
        resource: &str,
        job_id: JobId,
        exit_code: i32,
        error_message: Option<String>,
    ) {
        let Some(op) = self.registry.complete_matching(resource, job_id) else {
            match self.registry.get(resource) {
                Some(current) => warn!(
                    "Stale completion signal for {}: job {} no longer current (now {})",
                    resource, job_id, current.job_id
                ),
                None => debug!("Completion for {} already handled", resource),
            }
            return;
        };

        // Entry is out of the registry before anyone is notified, so a new
        // save request for this resource sees a clean slot.
        cleanup_staged(op.temp_dir.clone());
        self.lifecycle.save_end(resource);

        if exit_code == 0 {
            let elapsed = op.started_at.elapsed();
            info!(
                "Saved {} in {:.2}s (job {})",
                resource,
                elapsed.as_secs_f64(),
                job_id
            );
            self.emit(WriteEvent::Completed {
                resource: resource.to_string(),
                elapsed,
            })
            .await;
        } else {
            let error = error_message
                .unwrap_or_else(|| WriteError::Transfer(format!("exit code {}", exit_code)).to_string());
            warn!("Save failed for {}: {}", resource, error);
            self.emit(WriteEvent::Failed {
                resource: resource.to_string(),
                error,
            })
            .await;
        }
    }

    /// Cancel an in-flight write. Best-effort terminate on the job,
    /// deterministic settlement through the completion funnel.
    pub async fn cancel(&self, resource: &str) -> Result<(), RegistryError> {
        let op = self
            .registry
            .get(resource)
            .ok_or_else(|| RegistryError::OperationNotFound(resource.to_string()))?;

        info!("Cancelling write for {} (job {})", resource, op.job_id);
        self.spawner.terminate(op.job_id);
        self.complete(
            resource,
            op.job_id,
            SYNTHETIC_EXIT_CODE,
            Some(WriteError::Cancelled.to_string()),
        )
        .await;
        Ok(())
    }

    /// Force an in-flight write to settle now, as success or failure.
    pub async fn force_complete(&self, resource: &str, success: bool) -> Result<(), RegistryError> {
        let op = self
            .registry
            .get(resource)
            .ok_or_else(|| RegistryError::OperationNotFound(resource.to_string()))?;

        if success {
            self.complete(resource, op.job_id, 0, None).await;
        } else {
            self.spawner.terminate(op.job_id);
            self.complete(
                resource,
                op.job_id,
                SYNTHETIC_EXIT_CODE,
                Some("Completion forced by user".to_string()),
            )
            .await;
        }
        Ok(())
    }

    /// All in-flight writes.
    pub fn get_status(&self) -> Vec<WriteStatus> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|(resource, op)| WriteStatus {
                resource,
                protocol: op.target.protocol,
                host: op.target.host.clone(),
                job_id: op.job_id,
                elapsed_secs: op.started_at.elapsed().as_secs(),
                started_at: op.started_wall,
            })
            .collect()
    }

    async fn emit(&self, event: WriteEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }
}

/// Best-effort async removal of a staged snapshot. Failures are logged and
/// swallowed; cleanup never affects the write outcome.
fn cleanup_staged(dir: PathBuf) {
    tokio::spawn(async move {
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            debug!("Temp cleanup failed for {}: {}", dir.display(), e);
        }
    });
}
