//! Full rewrite of the registry file with atomic replacement.

use crate::crypto::{DataKey, StorageKey};
use crate::error::{CoreError, CoreResult};
use crate::registry::record::{encode_header, encode_record};
use crate::registry::{KEY_REGISTRY_FILE, KEY_REGISTRY_REWRITE_FILE};
use keyreg_storage::{sync_dir, FileBackend, OpenMode, StorageBackend};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Encodes a complete registry image: a fresh header followed by every key.
///
/// Keys are written in ascending `key_id` order so that identical registry
/// contents produce identical record sequences.
///
/// # Errors
///
/// Returns an error if the storage key has an invalid length.
pub fn encode_registry<'a, I>(storage_key: &StorageKey, keys: I) -> CoreResult<Vec<u8>>
where
    I: IntoIterator<Item = &'a DataKey>,
{
    let mut keys: Vec<&DataKey> = keys.into_iter().collect();
    keys.sort_by_key(|key| key.key_id());

    let mut image = encode_header(storage_key)?;
    for key in keys {
        image.extend_from_slice(&encode_record(key, storage_key)?);
    }
    Ok(image)
}

/// Replaces the registry file in `dir` with a fresh one holding `keys`.
///
/// Uses the write-then-rename pattern for crash safety:
/// 1. Write the image to `REWRITE-KEYREGISTRY`
/// 2. Sync the temporary file to disk
/// 3. Rename it over `KEYREGISTRY`
/// 4. Fsync the directory so the rename is durable
///
/// Any failure before the rename leaves the existing registry untouched.
///
/// # Errors
///
/// Returns an error if encoding or any file operation fails.
pub fn write_registry<'a, I>(dir: &Path, storage_key: &StorageKey, keys: I) -> CoreResult<()>
where
    I: IntoIterator<Item = &'a DataKey>,
{
    let mut writer = RegistryWriter::create(dir, storage_key)?;
    for key in keys {
        writer.write_key(key)?;
    }
    writer.finish()
}

/// A staged replacement of the registry file.
///
/// The header and the encoded records are buffered in memory and written to
/// `REWRITE-KEYREGISTRY` in one go by [`finish`](Self::finish), which then
/// renames the file into place. Dropping the writer without finishing
/// removes the temporary file and leaves the current registry as it was.
pub struct RegistryWriter {
    dir: PathBuf,
    tmp_path: PathBuf,
    storage_key: StorageKey,
    header: Vec<u8>,
    records: BTreeMap<u64, Vec<u8>>,
    backend: Option<Box<dyn StorageBackend>>,
    committed: bool,
}

impl RegistryWriter {
    /// Creates (or truncates) the temporary rewrite file in `dir` and
    /// prepares a fresh header for `storage_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage key is invalid or the file cannot be
    /// created.
    pub fn create(dir: &Path, storage_key: &StorageKey) -> CoreResult<Self> {
        let header = encode_header(storage_key)?;
        let tmp_path = dir.join(KEY_REGISTRY_REWRITE_FILE);
        let backend = FileBackend::open(&tmp_path, OpenMode::CreateTruncate)?;
        Ok(Self::with_backend(dir, tmp_path, storage_key, header, Box::new(backend)))
    }

    fn with_backend(
        dir: &Path,
        tmp_path: PathBuf,
        storage_key: &StorageKey,
        header: Vec<u8>,
        backend: Box<dyn StorageBackend>,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            tmp_path,
            storage_key: storage_key.clone(),
            header,
            records: BTreeMap::new(),
            backend: Some(backend),
            committed: false,
        }
    }

    /// Path of the temporary file.
    #[must_use]
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Number of keys staged so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no key has been staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encodes `key` under the writer's storage key and stages the record.
    ///
    /// Records are written in key ID order regardless of staging order.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be encrypted.
    pub fn write_key(&mut self, key: &DataKey) -> CoreResult<()> {
        let record = encode_record(key, &self.storage_key)?;
        self.records.insert(key.key_id(), record);
        Ok(())
    }

    /// Writes the staged image, syncs and closes the temporary file, renames
    /// it over the registry, and syncs the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. Failures before the rename remove
    /// the temporary file.
    pub fn finish(mut self) -> CoreResult<()> {
        let mut backend = self.backend.take().ok_or(CoreError::RegistryClosed)?;

        let size = self.header.len() + self.records.values().map(Vec::len).sum::<usize>();
        let mut image = Vec::with_capacity(size);
        image.extend_from_slice(&self.header);
        for record in self.records.values() {
            image.extend_from_slice(record);
        }

        backend.append(&image)?;
        backend.sync()?;
        drop(backend);

        fs::rename(&self.tmp_path, self.dir.join(KEY_REGISTRY_FILE))?;
        self.committed = true;

        sync_dir(&self.dir)?;
        Ok(())
    }
}

impl std::fmt::Debug for RegistryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryWriter")
            .field("tmp_path", &self.tmp_path)
            .field("records", &self.records.len())
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

impl Drop for RegistryWriter {
    fn drop(&mut self) {
        if !self.committed {
            self.backend.take();
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
