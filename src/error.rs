//! Error types for the write pipeline and proxy supervision

use thiserror::Error;

/// Errors surfaced by the remote write pipeline.
///
/// Everything user-visible about a save funnels through the completion
/// handler; these variants are the vocabulary it reports with.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Local temp staging failed before any remote job was spawned.
    #[error("Failed to stage local copy: {0}")]
    Staging(#[from] std::io::Error),

    /// The remote `mkdir -p` job exited non-zero; the transfer was never started.
    #[error("Remote directory creation failed: {0}")]
    RemoteDir(String),

    /// The transfer job could not be started.
    #[error("Failed to start transfer job: {0}")]
    Spawn(#[from] SpawnError),

    /// The transfer job exited non-zero.
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// The watchdog gave up on a job that exceeded the configured timeout.
    #[error("Timeout after {0}s")]
    Timeout(u64),

    /// The user cancelled the write mid-flight.
    #[error("Cancelled by user")]
    Cancelled,
}

/// Errors from the job spawning primitive.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Process spawn failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the remote LSP proxy lifecycle manager.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to start proxy for {server} on {host}: {source}")]
    Spawn {
        server: String,
        host: String,
        source: SpawnError,
    },

    #[error("No proxy server registered for {0}")]
    ServerNotFound(String),
}
