//! LSP save lifecycle and remote proxy supervision
//!
//! Provides the bridge the write coordinator notifies around each save, the
//! save-in-progress gate with its supervisory sweep, and the lifecycle
//! manager for the SSH-hosted LSP proxy processes.

pub mod bridge;
pub mod proxy;

pub use bridge::{LspBridge, NoopLifecycle, SaveGate, SaveLifecycle};
pub use proxy::{ProxyManager, ProxyServerInfo};
