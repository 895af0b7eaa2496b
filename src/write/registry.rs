//! Write-State Registry
//!
//! Single source of truth for in-flight remote writes. At most one write
//! exists per resource at any time; a second save request for a busy
//! resource is rejected, never queued. In-flight entries are removed only
//! through the completion funnel, which settles races between the job-exit
//! callback, the watchdog and manual completion.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use dashmap::DashMap;
use tracing::debug;

use crate::job::JobId;
use crate::target::RemoteTarget;

/// The in-flight record of a single save-to-remote attempt.
#[derive(Debug, Clone)]
pub struct WriteOperation {
    /// Handle of the transfer job. Completion signals carrying any other id
    /// are stale and ignored.
    pub job_id: JobId,
    pub started_at: Instant,
    /// Wall-clock start, for status display.
    pub started_wall: DateTime<Local>,
    /// Last elapsed time observed by the watchdog.
    pub elapsed: Duration,
    pub temp_file: PathBuf,
    pub temp_dir: PathBuf,
    pub target: RemoteTarget,
}

/// State of the write slot for one resource.
#[derive(Debug, Clone)]
enum WriteState {
    /// Slot reserved while content is staged and the job sequence comes up.
    Preparing { reserved_at: Instant },
    /// Transfer job running.
    InFlight(WriteOperation),
}

/// Registry error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Write already in progress for {0}")]
    AlreadyInProgress(String),

    #[error("No write operation registered for {0}")]
    OperationNotFound(String),
}

/// Resource → write-slot map.
pub struct WriteRegistry {
    slots: DashMap<String, WriteState>,
    /// Lock for begin() to prevent TOCTOU race between check and insert.
    begin_lock: parking_lot::Mutex<()>,
}

impl WriteRegistry {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            begin_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Reserve the write slot for `resource`. Fails if any write (preparing
    /// or in flight) already holds it.
    pub fn begin(&self, resource: &str) -> Result<(), RegistryError> {
        let _guard = self.begin_lock.lock();

        if self.slots.contains_key(resource) {
            return Err(RegistryError::AlreadyInProgress(resource.to_string()));
        }

        self.slots.insert(
            resource.to_string(),
            WriteState::Preparing {
                reserved_at: Instant::now(),
            },
        );
        debug!("Write slot reserved for {}", resource);
        Ok(())
    }

    /// Promote a reserved slot to an in-flight operation.
    pub fn activate(&self, resource: &str, op: WriteOperation) -> Result<(), RegistryError> {
        match self.slots.get_mut(resource) {
            Some(mut slot) => {
                *slot = WriteState::InFlight(op);
                Ok(())
            }
            None => Err(RegistryError::OperationNotFound(resource.to_string())),
        }
    }

    /// Release a slot that never made it to the transfer job (staging or
    /// mkdir failure). In-flight entries are left alone: those are owned by
    /// the completion funnel.
    pub fn abandon(&self, resource: &str) {
        if let Some((_, WriteState::Preparing { reserved_at })) = self
            .slots
            .remove_if(resource, |_, state| matches!(state, WriteState::Preparing { .. }))
        {
            debug!(
                "Write slot for {} released after {:?}",
                resource,
                reserved_at.elapsed()
            );
        }
    }

    /// Snapshot of the in-flight operation for `resource`, if any.
    pub fn get(&self, resource: &str) -> Option<WriteOperation> {
        self.slots.get(resource).and_then(|slot| match slot.value() {
            WriteState::InFlight(op) => Some(op.clone()),
            WriteState::Preparing { .. } => None,
        })
    }

    /// Merge the watchdog-observed elapsed time into the operation.
    pub fn touch(&self, resource: &str, elapsed: Duration) {
        if let Some(mut slot) = self.slots.get_mut(resource) {
            if let WriteState::InFlight(op) = slot.value_mut() {
                op.elapsed = elapsed;
            }
        }
    }

    /// Atomically remove the entry iff it is in flight under `job_id`.
    ///
    /// This is the completion funnel's removal primitive: the winner of a
    /// completion race gets the operation back, every other caller gets
    /// `None` and must treat the signal as stale or already handled.
    pub fn complete_matching(&self, resource: &str, job_id: JobId) -> Option<WriteOperation> {
        self.slots
            .remove_if(resource, |_, state| {
                matches!(state, WriteState::InFlight(op) if op.job_id == job_id)
            })
            .and_then(|(_, state)| match state {
                WriteState::InFlight(op) => Some(op),
                WriteState::Preparing { .. } => None,
            })
    }

    /// Whether any write (preparing or in flight) holds the slot.
    pub fn contains(&self, resource: &str) -> bool {
        self.slots.contains_key(resource)
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// All in-flight operations, for status listings.
    pub fn snapshot(&self) -> Vec<(String, WriteOperation)> {
        self.slots
            .iter()
            .filter_map(|entry| match entry.value() {
                WriteState::InFlight(op) => Some((entry.key().clone(), op.clone())),
                WriteState::Preparing { .. } => None,
            })
            .collect()
    }
}

impl Default for WriteRegistry {
    fn default() -> Self {
        Self::new()
    }
}
