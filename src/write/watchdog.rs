//! Watchdog
//!
//! One recurring task per in-flight write. Each tick it re-reads the
//! registry, bumps the operation's elapsed time, detects jobs that finished
//! without delivering their exit callback, and enforces the configured
//! timeout. It self-stops as soon as the registry no longer holds the
//! operation, so completion through any path also disposes the watchdog.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::WriteError;
use crate::job::JobId;
use crate::write::coordinator::{WriteCoordinator, SYNTHETIC_EXIT_CODE};

pub(crate) fn spawn_watchdog(
    coordinator: Arc<WriteCoordinator>,
    resource: String,
    job_id: JobId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(coordinator.settings().check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of tokio's interval fires immediately; consume it
        // so the loop starts one interval after spawn.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(op) = coordinator.registry().get(&resource) else {
                debug!("Watchdog for {} stopping: operation completed", resource);
                break;
            };
            if op.job_id != job_id {
                debug!("Watchdog for {} stopping: operation superseded", resource);
                break;
            }

            let elapsed = op.started_at.elapsed();
            coordinator.registry().touch(&resource, elapsed);

            if !coordinator.spawner().is_alive(job_id) {
                // The job is gone but its exit callback never arrived. The
                // transport cannot tell silent success from silent failure;
                // assume success and leave a trace of the inference.
                warn!(
                    "Watchdog: job {} for {} vanished without exit signal, assuming success",
                    job_id, resource
                );
                coordinator.complete(&resource, job_id, 0, None).await;
                break;
            }

            let timeout = coordinator.settings().timeout();
            if elapsed >= timeout {
                warn!(
                    "Watchdog: job {} for {} exceeded {}s, terminating",
                    job_id,
                    resource,
                    timeout.as_secs()
                );
                coordinator.spawner().terminate(job_id);
                coordinator
                    .complete(
                        &resource,
                        job_id,
                        SYNTHETIC_EXIT_CODE,
                        Some(WriteError::Timeout(timeout.as_secs()).to_string()),
                    )
                    .await;
                break;
            }
        }
    })
}
