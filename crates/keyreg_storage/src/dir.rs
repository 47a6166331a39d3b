//! Directory durability.

use crate::error::StorageResult;
use std::path::Path;

/// Flushes the entries of the directory at `path`.
///
/// After creating, renaming, or deleting a file, the containing directory
/// must be synced for the change to survive a crash.
///
/// On Windows, directory fsync is not supported in the same way as Unix;
/// NTFS journals metadata operations, so this is a no-op there.
///
/// # Errors
///
/// Returns an error if the directory cannot be opened or synced.
#[cfg(unix)]
pub fn sync_dir(path: &Path) -> StorageResult<()> {
    let dir = std::fs::File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

/// Flushes the entries of the directory at `path`.
///
/// No-op on this platform.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(unix))]
pub fn sync_dir(_path: &Path) -> StorageResult<()> {
    Ok(())
}
