//! Save-Lifecycle Bridge
//!
//! The write coordinator tells the LSP side when a save starts and ends so
//! that buffer-close teardown can be suspended for the duration of the
//! write window. The trait defaults to no-ops; [`SaveGate`] is the real
//! collaborator-side flag tracker, and [`LspBridge`] wires it to the proxy
//! manager's post-save reconciliation.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, warn};

use super::proxy::ProxyManager;

/// Callbacks the write coordinator drives around each save.
///
/// `save_start` gates the decision to proceed with a save and must return
/// fast; neither method may block.
pub trait SaveLifecycle: Send + Sync {
    fn save_start(&self, _resource: &str) {}
    fn save_end(&self, _resource: &str) {}
}

/// Default collaborator: nothing listens.
pub struct NoopLifecycle;

impl SaveLifecycle for NoopLifecycle {}

/// Per-resource save-in-progress flags with a supervisory sweep.
///
/// While a flag is set, resource-close events must not tear down
/// resource-scoped LSP state. The sweep clears flags older than the
/// max-save-duration, a second-layer safety net independent of the write
/// watchdog, so a lost save-end notification cannot suspend teardown
/// forever.
pub struct SaveGate {
    flags: DashMap<String, Instant>,
    max_save: Duration,
}

impl SaveGate {
    pub fn new(max_save: Duration) -> Self {
        Self {
            flags: DashMap::new(),
            max_save,
        }
    }

    pub fn mark_start(&self, resource: &str) {
        self.flags.insert(resource.to_string(), Instant::now());
        debug!("Save window opened for {}", resource);
    }

    pub fn mark_end(&self, resource: &str) {
        if self.flags.remove(resource).is_some() {
            debug!("Save window closed for {}", resource);
        }
    }

    /// Whether a save is currently flagged for `resource`.
    pub fn is_saving(&self, resource: &str) -> bool {
        self.flags.contains_key(resource)
    }

    pub fn active_count(&self) -> usize {
        self.flags.len()
    }

    /// Clear flags older than the max-save-duration. Returns how many were
    /// stuck.
    pub fn sweep(&self) -> usize {
        let stuck: Vec<String> = self
            .flags
            .iter()
            .filter(|entry| entry.value().elapsed() > self.max_save)
            .map(|entry| entry.key().clone())
            .collect();

        for resource in &stuck {
            warn!("Clearing stuck save flag for {}", resource);
            self.flags.remove(resource);
        }

        stuck.len()
    }

    /// Start the periodic supervisory sweep.
    pub fn spawn_sweeper(self: &Arc<Self>, sweep_interval: Duration) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gate.sweep();
            }
        })
    }
}

impl SaveLifecycle for SaveGate {
    fn save_start(&self, resource: &str) {
        self.mark_start(resource);
    }

    fn save_end(&self, resource: &str) {
        self.mark_end(resource);
    }
}

/// Full LSP collaborator: the gate plus post-save proxy reconciliation.
pub struct LspBridge {
    gate: Arc<SaveGate>,
    proxies: Arc<ProxyManager>,
}

impl LspBridge {
    pub fn new(gate: Arc<SaveGate>, proxies: Arc<ProxyManager>) -> Self {
        Self { gate, proxies }
    }

    pub fn gate(&self) -> &Arc<SaveGate> {
        &self.gate
    }

    pub fn proxies(&self) -> &Arc<ProxyManager> {
        &self.proxies
    }
}

impl SaveLifecycle for LspBridge {
    fn save_start(&self, resource: &str) {
        self.gate.mark_start(resource);
    }

    fn save_end(&self, resource: &str) {
        self.gate.mark_end(resource);

        // Follow-up reconciliation is scheduled, never run on the
        // completion funnel's stack.
        let proxies = Arc::clone(&self.proxies);
        let resource = resource.to_string();
        tokio::spawn(async move {
            proxies.reconcile_after_save(&resource).await;
        });
    }
}
