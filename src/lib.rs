//! OxideSync - asynchronous remote-write coordination
//!
//! Saves editor buffer contents to remote hosts over `scp`/`rsync` with
//! supervised transfer jobs, and keeps remote LSP server lifecycles
//! consistent while writes are in flight. The embedding layer (an editor
//! integration) supplies buffer content and consumes the outcome events;
//! staging, job sequencing, watchdog recovery, completion reconciliation
//! and save-window gating all live here.

pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod lsp;
pub mod target;
pub mod write;

pub use config::{ConfigStorage, LspSettings, StorageError, SyncConfig, WriteSettings};
pub use error::{ProxyError, SpawnError, WriteError};
pub use job::{JobId, JobSpawner, TokioJobSpawner};
pub use logging::init_logging;
pub use lsp::{LspBridge, NoopLifecycle, ProxyManager, ProxyServerInfo, SaveGate, SaveLifecycle};
pub use target::{Protocol, RemoteTarget};
pub use write::{
    StartOutcome, WriteCoordinator, WriteEvent, WriteRegistry, WriteStatus, SYNTHETIC_EXIT_CODE,
};
