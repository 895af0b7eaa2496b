//! External job spawning
//!
//! The write pipeline and the LSP proxy manager both drive external
//! processes (ssh, scp, rsync, proxy commands). They go through the
//! [`JobSpawner`] trait so tests can substitute a scripted spawner; the real
//! implementation wraps `tokio::process`.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::SpawnError;

/// Opaque handle identifying a spawned job.
pub type JobId = u64;

/// Invoked exactly once with the exit code and captured stderr.
pub type ExitCallback = Box<dyn FnOnce(i32, String) + Send + 'static>;

/// Exit code reported when the real one is unavailable (killed by signal,
/// or a completion forced by the coordinator).
pub const EXIT_CODE_KILLED: i32 = -1;

/// How much stderr is retained for failure reports.
const STDERR_CAPTURE_LIMIT: u64 = 8 * 1024;

/// Spawns and supervises external processes.
#[async_trait]
pub trait JobSpawner: Send + Sync {
    /// Spawn `argv` as an external process. `on_exit` fires exactly once
    /// when the process terminates, from the spawner's supervision context.
    async fn spawn(&self, argv: &[String], on_exit: ExitCallback) -> Result<JobId, SpawnError>;

    /// Whether the job is still running. Returns false once the exit
    /// callback has been delivered (or for an unknown id).
    fn is_alive(&self, job: JobId) -> bool;

    /// Best-effort terminate signal. The exit callback still fires.
    fn terminate(&self, job: JobId);
}

struct JobEntry {
    kill_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

/// Real spawner backed by `tokio::process`. One supervision task per child
/// waits for exit, races it against the kill signal, and delivers the exit
/// callback with the stderr tail.
pub struct TokioJobSpawner {
    jobs: Arc<DashMap<JobId, JobEntry>>,
    next_id: AtomicU64,
}

impl TokioJobSpawner {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of jobs currently under supervision.
    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }
}

impl Default for TokioJobSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobSpawner for TokioJobSpawner {
    async fn spawn(&self, argv: &[String], on_exit: ExitCallback) -> Result<JobId, SpawnError> {
        let (program, args) = argv.split_first().ok_or(SpawnError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        self.jobs.insert(
            id,
            JobEntry {
                kill_tx: parking_lot::Mutex::new(Some(kill_tx)),
            },
        );

        debug!("Job {} spawned: {}", id, argv.join(" "));

        let stderr = child.stderr.take();
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            let stderr_task = stderr.map(|s| tokio::spawn(read_stderr_tail(s)));

            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    debug!("Job {} terminate requested", id);
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code().unwrap_or(EXIT_CODE_KILLED),
                Err(e) => {
                    warn!("Job {}: wait failed: {}", id, e);
                    EXIT_CODE_KILLED
                }
            };

            let stderr_text = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };

            debug!("Job {} exited with code {}", id, code);
            on_exit(code, stderr_text);

            // Removed only after delivery, so is_alive holds until the
            // callback has run.
            jobs.remove(&id);
        });

        Ok(id)
    }

    fn is_alive(&self, job: JobId) -> bool {
        self.jobs.contains_key(&job)
    }

    fn terminate(&self, job: JobId) {
        if let Some(entry) = self.jobs.get(&job) {
            if let Some(tx) = entry.kill_tx.lock().take() {
                let _ = tx.send(());
            }
        }
    }
}

async fn read_stderr_tail(stream: ChildStderr) -> String {
    let mut buf = Vec::new();
    let mut limited = stream.take(STDERR_CAPTURE_LIMIT);
    let _ = limited.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}
