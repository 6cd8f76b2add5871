//! Filesystem primitives
//!
//! Every mutation is either atomic (write-then-rename, link-then-rename)
//! or idempotent, so a crash mid-operation leaves the old state or the new
//! one. The `*_without_raise` helpers are for clean-up paths.

use crate::error::{BootError, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Creates `dir` (and parents) if absent, applying `mode` only to what was created.
///
/// Returns whether the directory was created.
pub fn ensure_dir(dir: &Path, mode: Option<u32>) -> Result<bool> {
    if dir.is_dir() {
        return Ok(false);
    }
    fs::create_dir_all(dir).map_err(BootError::fs(dir))?;
    if let Some(mode) = mode {
        fs::set_permissions(dir, fs::Permissions::from_mode(mode)).map_err(BootError::fs(dir))?;
    }
    debug!("Created directory {}", dir.display());
    Ok(true)
}

/// Replaces `path` with `content` through a temporary file in the same directory
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = parent_dir(path)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)
        .map_err(BootError::fs(parent))?;
    tmp.write_all(content).map_err(BootError::fs(tmp.path()))?;
    tmp.as_file().sync_all().map_err(BootError::fs(tmp.path()))?;
    tmp.persist(path).map_err(|e| BootError::Filesystem {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Whether `path` holds exactly `content`
pub fn has_content(path: &Path, content: &[u8]) -> bool {
    fs::read(path).map(|existing| existing == content).unwrap_or(false)
}

/// Points the symlink at `link` to `target`, replacing whatever was there.
///
/// Returns `false` when the link already pointed at `target`.
pub fn symlink_atomic(target: &Path, link: &Path) -> Result<bool> {
    if fs::read_link(link).map(|t| t == target).unwrap_or(false) {
        return Ok(false);
    }
    let tmp = sibling_tmp_path(link)?;
    symlink(target, &tmp).map_err(BootError::fs(&tmp))?;
    if let Err(e) = fs::rename(&tmp, link) {
        unlink_without_raise(&tmp);
        return Err(BootError::Filesystem {
            path: link.to_path_buf(),
            source: e,
        });
    }
    Ok(true)
}

/// Hard-links `source` at `dest`, replacing whatever was there
pub fn hard_link_atomic(source: &Path, dest: &Path) -> Result<()> {
    let tmp = sibling_tmp_path(dest)?;
    fs::hard_link(source, &tmp).map_err(BootError::fs(&tmp))?;
    if let Err(e) = fs::rename(&tmp, dest) {
        unlink_without_raise(&tmp);
        return Err(BootError::Filesystem {
            path: dest.to_path_buf(),
            source: e,
        });
    }
    Ok(())
}

/// Removes a file or link; absence is not an error and failures are only logged
pub fn unlink_without_raise(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Removes a directory tree; absence is not an error and failures are only logged
pub fn rmtree_without_raise(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!("Removed directory {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove directory {}: {}", path.display(), e),
    }
}

fn parent_dir(path: &Path) -> Result<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            BootError::Configuration(format!("{} has no parent directory", path.display()))
        })
}

fn sibling_tmp_path(path: &Path) -> Result<PathBuf> {
    let parent = parent_dir(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(parent.join(format!(
        ".{}.{}.tmp",
        name,
        uuid::Uuid::new_v4().simple()
    )))
}
