//! Transfer job construction
//!
//! Builds the external commands for a remote write and runs the
//! directory-ensure step. The sequence is strict: the remote parent
//! directory job must exit 0 before the transfer job may be spawned, and no
//! step is retried. A failed step is terminal for the attempt.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::WriteError;
use crate::job::{ExitCallback, JobSpawner};
use crate::target::{Protocol, RemoteTarget};

/// The remote shell command run to ensure the target's parent directory.
pub(crate) fn mkdir_argv(target: &RemoteTarget) -> Vec<String> {
    // "." when the file lives at the top of the login directory; mkdir -p
    // on it is a harmless no-op and keeps the job sequence uniform.
    let parent = target.parent_dir().unwrap_or(".");
    vec![
        "ssh".to_string(),
        "-q".to_string(),
        target.host.clone(),
        format!("mkdir -p {}", shell_quote(parent)),
    ]
}

/// The local transfer command copying the staged file to `host:path`.
pub(crate) fn transfer_argv(target: &RemoteTarget, temp_file: &Path) -> Vec<String> {
    let local = temp_file.to_string_lossy().to_string();
    let flags = match target.protocol {
        Protocol::Scp => "-q",
        Protocol::Rsync => "-az",
    };
    vec![
        target.protocol.transfer_program().to_string(),
        flags.to_string(),
        local,
        target.remote_spec(),
    ]
}

/// Quote a string for the remote shell (single-quote escaping).
pub(crate) fn shell_quote(s: &str) -> String {
    let safe = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'));
    if safe && !s.is_empty() {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Run the directory-ensure job and wait for its exit.
pub(crate) async fn ensure_remote_dir(
    spawner: &Arc<dyn JobSpawner>,
    target: &RemoteTarget,
) -> Result<(), WriteError> {
    let argv = mkdir_argv(target);
    debug!("Ensuring remote directory: {}", argv.join(" "));

    let (exit_tx, exit_rx) = oneshot::channel::<(i32, String)>();
    let on_exit: ExitCallback = Box::new(move |code, stderr| {
        let _ = exit_tx.send((code, stderr));
    });

    spawner.spawn(&argv, on_exit).await?;

    match exit_rx.await {
        Ok((0, _)) => Ok(()),
        Ok((code, stderr)) if stderr.is_empty() => Err(WriteError::RemoteDir(format!(
            "mkdir exited with code {}",
            code
        ))),
        Ok((_, stderr)) => Err(WriteError::RemoteDir(stderr)),
        Err(_) => Err(WriteError::RemoteDir(
            "mkdir job ended without reporting".to_string(),
        )),
    }
}
