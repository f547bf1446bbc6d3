//! Utilities for configuration paths.
#![warn(missing_docs)]

use std::path::Path;
use std::path::PathBuf;

use crate::error::Error;
use crate::error::Result;

/// Expand path with "~" to absolute path.
pub fn expand_home<P>(path: P) -> Result<PathBuf>
where P: AsRef<Path> {
    let Ok(stripped) = path.as_ref().strip_prefix("~") else {
        return Ok(path.as_ref().to_path_buf());
    };

    let Some(home) = std::env::var_os("HOME").map(PathBuf::from) else {
        return Err(Error::HomeDirError);
    };

    Ok(home.join(stripped))
}

/// Create parent directory of a path if not exists.
pub fn ensure_parent_dir<P>(path: P) -> Result<()>
where P: AsRef<Path> {
    let path = expand_home(path)?;
    let parent = path.parent().ok_or(Error::ParentDirError)?;
    if !parent.is_dir() {
        std::fs::create_dir_all(parent).map_err(|e| Error::CreateFileError(e.to_string()))?;
    };
    Ok(())
}
