//! Verify command implementation.

use super::{load_storage_key, registry_path, CliError, CliResult};
use keyreg_core::KeyRegistryIterator;
use keyreg_storage::{FileBackend, OpenMode, StorageBackend};
use std::collections::HashSet;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of records read successfully.
    pub valid_records: usize,
    /// Highest key ID seen.
    pub max_key_id: u64,
    /// Bytes covered by valid records and the header.
    pub verified_bytes: u64,
    /// First problem found, if any.
    pub error: Option<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs the verify command.
pub fn run(dir: &Path, key_file: Option<&Path>) -> CliResult<()> {
    println!("Verifying key registry in {}", dir.display());
    println!();

    let result = verify(dir, key_file)?;
    println!("  Valid records: {}", result.valid_records);
    println!("  Max key ID:    {}", result.max_key_id);
    println!("  Verified:      {} bytes", result.verified_bytes);
    println!();

    match result.error {
        None => {
            println!("✓ Key registry verification passed");
            Ok(())
        }
        Some(reason) => {
            println!("✗ Key registry verification failed: {reason}");
            Err(CliError::VerifyFailed {
                valid: result.valid_records,
                reason,
            })
        }
    }
}

/// Replays every record and reports the first integrity problem.
///
/// A wrong storage key is returned as an error rather than recorded, since
/// nothing can be checked without the right key.
pub fn verify(dir: &Path, key_file: Option<&Path>) -> CliResult<VerifyResult> {
    let backend = FileBackend::open(&registry_path(dir)?, OpenMode::ReadOnly)?;
    let storage_key = load_storage_key(key_file)?;

    let mut result = VerifyResult::default();
    let mut iter = KeyRegistryIterator::new(&backend, &storage_key)?;
    let mut seen = HashSet::new();

    for record in iter.by_ref() {
        match record {
            Ok(key) => {
                if key.key_id() == 0 {
                    result.error = Some("record with reserved key id 0".to_string());
                    break;
                }
                if !seen.insert(key.key_id()) {
                    result.error = Some(format!("duplicate key id {}", key.key_id()));
                    break;
                }
                result.valid_records += 1;
                result.max_key_id = result.max_key_id.max(key.key_id());
            }
            Err(err) => {
                result.error = Some(err.to_string());
                break;
            }
        }
    }

    result.verified_bytes = if result.is_ok() {
        backend.size()?
    } else {
        // The iterator stops at the start of the bad record.
        iter.offset()
    };
    Ok(result)
}
