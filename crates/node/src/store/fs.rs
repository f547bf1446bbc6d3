//! Filesystem primitives shared by the stores and the installer.

use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

/// Create `path` and its parents if missing.
pub fn ensure_dir<P>(path: P) -> Result<()>
where P: AsRef<Path> {
    if !path.as_ref().is_dir() {
        std::fs::create_dir_all(&path).map_err(|e| Error::CreateFileError(e.to_string()))?;
    }
    Ok(())
}

/// Read a JSON snapshot, returning `default` when the file is missing or
/// does not parse.
pub fn read_json_or<T, P>(path: P, default: T) -> T
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let Ok(data) = std::fs::read(&path) else {
        return default;
    };
    match serde_json::from_slice(&data) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Discarding unreadable snapshot {:?}: {e}", path.as_ref());
            default
        }
    }
}

/// Write a JSON snapshot via temp file + rename on the same filesystem.
pub fn write_json_atomic<T, P>(path: P, value: &T) -> Result<()>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let parent = path.parent().ok_or(Error::ParentDirError)?;
    ensure_dir(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "snapshot".to_string()),
        std::process::id(),
    ));
    let data = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, data).map_err(|e| Error::CreateFileError(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::CreateFileError(e.to_string())
    })?;
    Ok(())
}

/// Milliseconds since the epoch, used to tag rollback directories.
pub fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Transactional directory replace: move `staging` to `target` so that
/// `target` is either the old content or the new content, never a partial
/// merge.
///
/// If `target` exists it is parked at `<target>.old-<epoch>` first; the
/// parked copy is deleted on success and restored on failure.
pub fn atomic_replace_dir<P, Q>(staging: P, target: Q) -> Result<()>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let staging = staging.as_ref();
    let target = target.as_ref();
    let parent = target.parent().ok_or(Error::ParentDirError)?;
    ensure_dir(parent)?;

    let parked = if target.exists() {
        let parked = parent.join(format!(
            "{}.old-{}",
            target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "target".to_string()),
            epoch_millis(),
        ));
        std::fs::rename(target, &parked)
            .map_err(|e| Error::AtomicMoveFailed(format!("park existing target: {e}")))?;
        Some(parked)
    } else {
        None
    };

    if let Err(e) = std::fs::rename(staging, target) {
        if let Some(parked) = &parked {
            if let Err(restore) = std::fs::rename(parked, target) {
                tracing::error!("Rollback of {:?} failed: {restore}", target);
            }
        }
        return Err(Error::AtomicMoveFailed(e.to_string()));
    }

    if let Some(parked) = parked {
        if let Err(e) = std::fs::remove_dir_all(&parked) {
            tracing::warn!("Could not delete parked directory {:?}: {e}", parked);
        }
    }
    Ok(())
}
