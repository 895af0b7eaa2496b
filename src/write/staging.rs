//! Temp staging
//!
//! Persists buffer content into a fresh temporary directory before any
//! remote job is spawned. A failed staging aborts the save attempt, so the
//! remote side is never touched for content that could not be snapshotted
//! locally.

use std::io;
use std::path::PathBuf;

use tracing::debug;

/// Paths of a staged snapshot. Cleanup is owned by the completion funnel,
/// not by drop.
#[derive(Debug, Clone)]
pub struct StagedContent {
    pub dir: PathBuf,
    pub file: PathBuf,
}

/// Write `content` to a new temp file inside a new temp directory.
pub async fn stage_content(resource: &str, content: &[u8]) -> io::Result<StagedContent> {
    let dir = tempfile::Builder::new().prefix("oxidesync-").tempdir()?;
    // Detach from the guard; the completion funnel deletes the directory
    // once the transfer settles.
    let dir = dir.keep();

    let file = dir.join(file_name_for(resource));
    if let Err(e) = tokio::fs::write(&file, content).await {
        let _ = tokio::fs::remove_dir_all(&dir).await;
        return Err(e);
    }

    debug!(
        "Staged {} bytes for {} at {}",
        content.len(),
        resource,
        file.display()
    );

    Ok(StagedContent { dir, file })
}

/// Keep the original file name so transfer-tool output stays readable.
fn file_name_for(resource: &str) -> String {
    resource
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("content")
        .to_string()
}
