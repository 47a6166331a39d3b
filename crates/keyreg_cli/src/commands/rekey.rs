//! Rekey command implementation.

use super::{load_storage_key, registry_path, CliResult};
use keyreg_core::{CoreError, KeyRegistry, RegistryConfig};
use std::path::Path;
use tracing::info;

/// Re-encrypts the registry in `dir` under the key in `new_key_file`.
///
/// `old_key_file` of `None` means the registry is currently plaintext.
pub fn run(dir: &Path, old_key_file: Option<&Path>, new_key_file: &Path) -> CliResult<()> {
    registry_path(dir)?;
    let old_key = load_storage_key(old_key_file)?;
    let new_key = load_storage_key(Some(new_key_file))?;
    if new_key.is_empty() {
        return Err(CoreError::InvalidKeySize { actual: 0 }.into());
    }

    let registry = KeyRegistry::open(RegistryConfig::new(dir).storage_key(old_key))?;
    let count = registry.len();
    registry.rekey(new_key)?;
    registry.close()?;

    info!(keys = count, dir = %dir.display(), "re-encrypted key registry");
    println!("✓ Re-encrypted {count} data keys");
    Ok(())
}
