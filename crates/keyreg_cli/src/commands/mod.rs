//! CLI command implementations.

pub mod inspect;
pub mod rekey;
pub mod verify;

use keyreg_core::{CoreError, StorageKey, KEY_REGISTRY_FILE};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Registry operation failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Storage layer failed.
    #[error(transparent)]
    Storage(#[from] keyreg_storage::StorageError),

    /// Reading a key file failed.
    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        /// The key file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON output failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// No registry file in the given directory.
    #[error("no key registry found in {}", .0.display())]
    NoRegistry(PathBuf),

    /// Verification found a damaged record.
    #[error("verification failed after {valid} valid records: {reason}")]
    VerifyFailed {
        /// Records read successfully before the failure.
        valid: usize,
        /// Description of the failure.
        reason: String,
    },
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Loads a storage key from a file of raw key bytes. `None` means plaintext.
pub fn load_storage_key(path: Option<&Path>) -> CliResult<StorageKey> {
    let Some(path) = path else {
        return Ok(StorageKey::none());
    };
    let bytes = fs::read(path).map_err(|source| CliError::KeyFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(StorageKey::from_bytes(&bytes)?)
}

/// Returns the registry file path in `dir`, failing if it does not exist.
pub fn registry_path(dir: &Path) -> CliResult<PathBuf> {
    let path = dir.join(KEY_REGISTRY_FILE);
    if !path.exists() {
        return Err(CliError::NoRegistry(dir.to_path_buf()));
    }
    Ok(path)
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_key_file_means_plaintext() {
        assert!(load_storage_key(None).unwrap().is_empty());
    }

    #[test]
    fn key_file_holds_raw_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key");
        fs::write(&path, [3u8; 24]).unwrap();
        let key = load_storage_key(Some(&path)).unwrap();
        assert_eq!(key.as_bytes(), &[3u8; 24]);

        fs::write(&path, [3u8; 7]).unwrap();
        assert!(matches!(
            load_storage_key(Some(&path)),
            Err(CliError::Core(CoreError::InvalidKeySize { actual: 7 }))
        ));
    }

    #[test]
    fn absent_registry_is_reported() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            registry_path(dir.path()),
            Err(CliError::NoRegistry(_))
        ));
    }
}
