//! Atomic binary installation.
//!
//! Replacement goes through a temp file created in the destination's own
//! directory, guaranteeing the final rename is atomic on a single
//! filesystem. A reader of the destination path only ever sees the old
//! complete file or the new complete file, never a partial write.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

/// Permission mode every installed binary must carry.
pub const INSTALL_MODE: u32 = 0o755;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("source does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("destination has no parent directory: {0}")]
    NoParent(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Atomically install the file at `src` to `dest` with permission `mode`.
///
/// The destination's parent directory is created if missing. On any
/// failure after the temp file exists it is removed before the error
/// propagates (the removal itself is best-effort and never replaces the
/// triggering error). Returns the final destination path.
pub fn atomic_install(src: &Path, dest: &Path, mode: u32) -> Result<PathBuf, InstallError> {
    if !src.exists() {
        return Err(InstallError::SourceMissing(src.to_path_buf()));
    }

    let dest = if dest.is_absolute() {
        dest.to_path_buf()
    } else {
        std::env::current_dir()?.join(dest)
    };
    let parent = dest
        .parent()
        .ok_or_else(|| InstallError::NoParent(dest.clone()))?;
    fs::create_dir_all(parent)?;

    // Temp file in the destination directory keeps the rename on one
    // filesystem; dropping it on any error path deletes it.
    let tmp = NamedTempFile::new_in(parent)?;
    fs::copy(src, tmp.path())?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))?;
    tmp.persist(&dest).map_err(|e| InstallError::Io(e.error))?;

    tracing::info!(src = %src.display(), dest = %dest.display(), "installed binary");
    Ok(dest)
}

/// True only if `path` is a regular file with exactly `expected_mode`
/// permission bits.
pub fn validate_installed(path: &Path, expected_mode: u32) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o7777 == expected_mode,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_missing_path() {
        assert!(!validate_installed(Path::new("/nonexistent/warden-binary"), INSTALL_MODE));
    }

    #[test]
    fn validate_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!validate_installed(dir.path(), 0o755));
    }
}
