//! Remote LSP proxy lifecycle
//!
//! Each remote language server is reached through an external stdio proxy
//! hosted over SSH. This module owns those processes: one per
//! (server, host), refcounted by the buffers attached to it, and torn down
//! when the last buffer detaches, unless that buffer is mid-save, in which
//! case teardown is deferred until the save window closes. The proxy's
//! protocol translation stays external; only its process is supervised
//! here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::job::{ExitCallback, JobId, JobSpawner};
use crate::write::runner::shell_quote;

use super::bridge::SaveGate;

/// Read-only view of one running proxy server.
#[derive(Debug, Clone)]
pub struct ProxyServerInfo {
    pub id: String,
    pub server_name: String,
    pub host: String,
    pub job_id: JobId,
    pub buffer_count: usize,
    pub uptime_secs: u64,
}

struct ProxyEntry {
    id: String,
    server_name: String,
    host: String,
    job_id: JobId,
    root_dir: Option<String>,
    lsp_command: Vec<String>,
    buffers: HashSet<String>,
    /// Buffers whose detach arrived during their save window.
    deferred_detach: HashSet<String>,
    started_at: Instant,
}

/// Supervises remote LSP proxy processes and their buffer attachments.
pub struct ProxyManager {
    servers: DashMap<String, ProxyEntry>,
    /// resource → server key, for detach and post-save lookups.
    by_resource: DashMap<String, String>,
    spawner: Arc<dyn JobSpawner>,
    gate: Arc<SaveGate>,
}

impl ProxyManager {
    pub fn new(spawner: Arc<dyn JobSpawner>, gate: Arc<SaveGate>) -> Self {
        Self {
            servers: DashMap::new(),
            by_resource: DashMap::new(),
            spawner,
            gate,
        }
    }

    fn server_key(server_name: &str, host: &str) -> String {
        format!("{}@{}", server_name, host)
    }

    /// Attach a buffer to the proxy for (`server_name`, `host`), spawning
    /// the proxy process on first use. Returns the server instance id.
    pub async fn attach_buffer(
        &self,
        server_name: &str,
        host: &str,
        resource: &str,
        root_dir: Option<&str>,
        lsp_command: &[String],
    ) -> Result<String, ProxyError> {
        let key = Self::server_key(server_name, host);

        if let Some(mut entry) = self.servers.get_mut(&key) {
            if self.spawner.is_alive(entry.job_id) {
                entry.buffers.insert(resource.to_string());
                entry.deferred_detach.remove(resource);
                let id = entry.id.clone();
                drop(entry);
                self.by_resource.insert(resource.to_string(), key);
                debug!("Buffer {} attached to running proxy {}", resource, id);
                return Ok(id);
            }
            // Dead proxy still registered: drop and respawn below.
            warn!("Proxy {} found dead on attach, respawning", key);
            drop(entry);
            self.servers.remove(&key);
        }

        let argv = proxy_command(host, root_dir, lsp_command);
        info!("Starting proxy {}: {}", key, argv.join(" "));

        let log_key = key.clone();
        let on_exit: ExitCallback = Box::new(move |code, stderr| {
            // Exit logging only; restart decisions happen in reconcile
            // passes where the save window is known.
            if code == 0 {
                info!("Proxy {} exited cleanly", log_key);
            } else {
                warn!("Proxy {} exited with code {}: {}", log_key, code, stderr);
            }
        });

        let job_id = self
            .spawner
            .spawn(&argv, on_exit)
            .await
            .map_err(|source| ProxyError::Spawn {
                server: server_name.to_string(),
                host: host.to_string(),
                source,
            })?;

        let id = uuid::Uuid::new_v4().to_string();
        let mut buffers = HashSet::new();
        buffers.insert(resource.to_string());

        self.servers.insert(
            key.clone(),
            ProxyEntry {
                id: id.clone(),
                server_name: server_name.to_string(),
                host: host.to_string(),
                job_id,
                root_dir: root_dir.map(str::to_string),
                lsp_command: lsp_command.to_vec(),
                buffers,
                deferred_detach: HashSet::new(),
                started_at: Instant::now(),
            },
        );
        self.by_resource.insert(resource.to_string(), key);

        Ok(id)
    }

    /// Buffer-close path. While the buffer's save window is open, teardown
    /// is suspended and the detach deferred; otherwise the refcount drops
    /// and the last detach shuts the server down. Returns true when the
    /// server was shut down.
    pub fn detach_buffer(&self, resource: &str) -> bool {
        let Some(key) = self.by_resource.get(resource).map(|e| e.value().clone()) else {
            return false;
        };

        if self.gate.is_saving(resource) {
            if let Some(mut entry) = self.servers.get_mut(&key) {
                entry.deferred_detach.insert(resource.to_string());
            }
            debug!(
                "Detach of {} deferred: save in progress, teardown suspended",
                resource
            );
            return false;
        }

        self.remove_buffer(&key, resource)
    }

    fn remove_buffer(&self, key: &str, resource: &str) -> bool {
        self.by_resource.remove(resource);

        let last_buffer_gone = match self.servers.get_mut(key) {
            Some(mut entry) => {
                entry.buffers.remove(resource);
                entry.deferred_detach.remove(resource);
                entry.buffers.is_empty()
            }
            None => false,
        };

        if last_buffer_gone {
            if let Some((_, entry)) = self.servers.remove(key) {
                info!(
                    "Shutting down proxy {} (last buffer detached, job {})",
                    key, entry.job_id
                );
                self.spawner.terminate(entry.job_id);
            }
        }
        last_buffer_gone
    }

    /// Post-save follow-up scheduled from save-end: apply a detach that was
    /// deferred while the save was in flight, and restart a proxy whose
    /// process died during the write window.
    pub async fn reconcile_after_save(&self, resource: &str) {
        let Some(key) = self.by_resource.get(resource).map(|e| e.value().clone()) else {
            return;
        };

        let deferred = self
            .servers
            .get(&key)
            .map(|entry| entry.deferred_detach.contains(resource))
            .unwrap_or(false);
        if deferred {
            debug!("Applying deferred detach of {}", resource);
            self.remove_buffer(&key, resource);
            return;
        }

        let respawn = self.servers.get(&key).and_then(|entry| {
            if self.spawner.is_alive(entry.job_id) {
                None
            } else {
                Some((
                    entry.server_name.clone(),
                    entry.host.clone(),
                    entry.root_dir.clone(),
                    entry.lsp_command.clone(),
                    entry.buffers.clone(),
                ))
            }
        });

        if let Some((server_name, host, root_dir, lsp_command, buffers)) = respawn {
            warn!("Proxy {} died during save window, restarting", key);
            self.servers.remove(&key);
            for buffer in buffers {
                if let Err(e) = self
                    .attach_buffer(&server_name, &host, &buffer, root_dir.as_deref(), &lsp_command)
                    .await
                {
                    warn!("Proxy restart failed for {}: {}", buffer, e);
                }
            }
        }
    }

    /// The proxy server a resource is attached to, if any.
    pub fn server_for(&self, resource: &str) -> Option<ProxyServerInfo> {
        let key = self.by_resource.get(resource)?.value().clone();
        self.servers.get(&key).map(|entry| entry_info(&entry))
    }

    /// All running proxy servers.
    pub fn list(&self) -> Vec<ProxyServerInfo> {
        self.servers.iter().map(|entry| entry_info(&entry)).collect()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Terminate every proxy (editor shutdown).
    pub fn shutdown_all(&self) {
        let keys: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        info!("Shutting down {} proxy servers", keys.len());

        for key in keys {
            if let Some((_, entry)) = self.servers.remove(&key) {
                self.spawner.terminate(entry.job_id);
            }
        }
        self.by_resource.clear();
    }
}

fn entry_info(entry: &ProxyEntry) -> ProxyServerInfo {
    ProxyServerInfo {
        id: entry.id.clone(),
        server_name: entry.server_name.clone(),
        host: entry.host.clone(),
        job_id: entry.job_id,
        buffer_count: entry.buffers.len(),
        uptime_secs: entry.started_at.elapsed().as_secs(),
    }
}

/// Build the SSH command line hosting a remote LSP server behind the stdio
/// proxy. Keepalives and disabled control sockets keep the channel stable
/// for long-lived servers.
pub(crate) fn proxy_command(
    host: &str,
    root_dir: Option<&str>,
    lsp_command: &[String],
) -> Vec<String> {
    let command = lsp_command.join(" ");
    let remote_command = match root_dir {
        Some(root) => format!("cd {} && {}", shell_quote(root), command),
        None => command,
    };

    vec![
        "ssh".to_string(),
        "-q".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=10".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=6".to_string(),
        "-o".to_string(),
        "TCPKeepAlive=yes".to_string(),
        "-o".to_string(),
        "ControlMaster=no".to_string(),
        "-o".to_string(),
        "ControlPath=none".to_string(),
        host.to_string(),
        remote_command,
    ]
}
