//! Atomic sidecar persistence: the write-temp-then-rename discipline shared
//! by the Progress Tracker's iteration sidecar and the Context Monitor's
//! report sidecar, so a reader never observes a half-written record.

use std::path::Path;

use serde::Serialize;
use tokio::fs;

use crate::Result;

/// Serialize `value` to pretty JSON and write it atomically to `path`: the
/// bytes land in a sibling temp file first, then an atomic rename replaces
/// the target so a reader never observes a half-written sidecar.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = tmp_path_for(path);
    fs::write(&tmp_path, json).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let file_name = path
        .file_name()
        .map(|n| format!(".{}.tmp", n.to_string_lossy()))
        .unwrap_or_else(|| ".sidecar.tmp".to_string());
    match path.parent() {
        Some(parent) => parent.join(file_name),
        None => std::path::PathBuf::from(file_name),
    }
}

/// Read and deserialize a JSON sidecar, returning `None` if it does not exist.
pub async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).await?;
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&contents)?))
}
