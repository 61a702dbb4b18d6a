//! Served-callsign file loading.
//!
//! The file holds one callsign per line; blank lines and `#` comments are
//! skipped.

use anyhow::{Context, Result};
use aprsgate_core::MemoryDirectory;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parse a callsign list.
#[must_use]
pub fn parse_callsigns(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read a callsign file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn load_callsigns(path: &Path) -> Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read directory file: {}", path.display()))?;
    Ok(parse_callsigns(&contents))
}

/// Load `path` into `directory` alongside the static callsigns.
///
/// # Errors
///
/// Returns an error if the file cannot be read; the directory is unchanged.
pub async fn reload(directory: &MemoryDirectory, path: &Path, fixed: &[String]) -> Result<usize> {
    let mut callsigns = load_callsigns(path).await?;
    callsigns.extend(fixed.iter().cloned());
    Ok(directory.replace(callsigns).await)
}

/// Reload the directory from `path` every `period`.
pub fn spawn_refresher(
    directory: Arc<MemoryDirectory>,
    path: PathBuf,
    fixed: Vec<String>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    info!(path = %path.display(), period_secs = period.as_secs(), "Starting directory refresher");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match reload(&directory, &path, &fixed).await {
                Ok(count) => debug!(path = %path.display(), callsigns = count, "Directory reloaded"),
                Err(e) => warn!(error = %e, "Directory reload failed, keeping previous set"),
            }
        }
    })
}
