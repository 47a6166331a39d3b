//! Inspect command implementation.

use super::{load_storage_key, registry_path, CliResult};
use keyreg_core::{KeyRegistry, RegistryConfig};
use keyreg_storage::{FileBackend, OpenMode, StorageBackend};
use serde::Serialize;
use std::path::Path;

/// Registry inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Registry directory.
    pub path: String,
    /// Registry file size in bytes.
    pub file_size: u64,
    /// Whether data keys are encrypted at rest.
    pub encrypted: bool,
    /// Number of data keys.
    pub key_count: usize,
    /// Highest key ID assigned so far.
    pub next_key_id: u64,
    /// Creation time of the newest key (unix seconds).
    pub last_created_at: i64,
    /// Per-key metadata in ID order.
    pub keys: Vec<KeyInfo>,
}

/// Metadata of a single data key.
#[derive(Debug, Serialize)]
pub struct KeyInfo {
    /// Key ID.
    pub key_id: u64,
    /// Creation time (unix seconds).
    pub created_at: i64,
    /// Key material length in bytes.
    pub length: usize,
}

/// Runs the inspect command.
pub fn run(dir: &Path, key_file: Option<&Path>, format: &str) -> CliResult<()> {
    let result = inspect(dir, key_file)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects registry metadata without printing it.
pub fn inspect(dir: &Path, key_file: Option<&Path>) -> CliResult<InspectResult> {
    let file_size = FileBackend::open(&registry_path(dir)?, OpenMode::ReadOnly)?.size()?;
    let storage_key = load_storage_key(key_file)?;

    let config = RegistryConfig::new(dir)
        .read_only(true)
        .storage_key(storage_key);
    let registry = KeyRegistry::open(config)?;

    let mut keys = Vec::with_capacity(registry.len());
    for key_id in registry.key_ids() {
        if let Some(key) = registry.data_key(key_id)? {
            keys.push(KeyInfo {
                key_id,
                created_at: key.created_at(),
                length: key.data().len(),
            });
        }
    }

    let result = InspectResult {
        path: dir.display().to_string(),
        file_size,
        encrypted: registry.is_encrypted(),
        key_count: keys.len(),
        next_key_id: registry.next_key_id(),
        last_created_at: registry.last_created_at(),
        keys,
    };
    registry.close()?;
    Ok(result)
}

fn print_text_output(result: &InspectResult) {
    println!("Key Registry Inspection");
    println!("=======================");
    println!();
    println!("Path:       {}", result.path);
    println!("File size:  {} bytes", result.file_size);
    println!("Encrypted:  {}", if result.encrypted { "yes" } else { "no" });
    println!();
    println!("Keys:");
    println!("  Count:           {}", result.key_count);
    println!("  Next key ID:     {}", result.next_key_id);
    println!("  Last created at: {}", result.last_created_at);

    if !result.keys.is_empty() {
        println!();
        for key in &result.keys {
            println!(
                "  [{}] created at {}, {} bytes",
                key.key_id, key.created_at, key.length
            );
        }
    }
}
