//! The in-memory key registry backed by an append-only file.

use crate::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::crypto::{DataKey, StorageKey};
use crate::error::{CoreError, CoreResult};
use crate::registry::record::encode_record;
use crate::registry::writer::{encode_registry, write_registry};
use crate::registry::{KeyRegistryIterator, KEY_REGISTRY_FILE};
use keyreg_storage::{FileBackend, InMemoryBackend, OpenMode, StorageBackend};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The authoritative set of data keys.
///
/// The registry answers "key by ID" and "current key" from memory and mints a
/// new key, appended to the registry file, whenever the current one is older
/// than the rotation period.
///
/// # Concurrency
///
/// All state sits behind one reader/writer lock. Lookups and the
/// no-rotation path of [`latest_data_key`](Self::latest_data_key) take the
/// shared lock. Rotation holds the exclusive lock from ID allocation to map
/// insertion, so IDs are handed out in the same order as records are
/// appended and no reader sees a half-built key.
///
/// # Example
///
/// ```no_run
/// use keyreg_core::{KeyRegistry, RegistryConfig, StorageKey};
///
/// let config = RegistryConfig::new("/var/lib/engine")
///     .storage_key(StorageKey::from_bytes(&[0u8; 32])?);
/// let registry = KeyRegistry::open(config)?;
///
/// let current = registry.latest_data_key()?.expect("encryption is enabled");
/// let same = registry.data_key(current.key_id())?;
/// assert_eq!(same.as_deref(), Some(&*current));
/// registry.close()?;
/// # Ok::<(), keyreg_core::CoreError>(())
/// ```
pub struct KeyRegistry {
    state: RwLock<RegistryState>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

struct RegistryState {
    /// All known keys by ID.
    data_keys: HashMap<u64, Arc<DataKey>>,
    /// Highest key ID assigned so far; also the current key.
    next_key_id: u64,
    /// Creation time of the newest key.
    last_created: i64,
    /// Key used for records appended from now on.
    storage_key: StorageKey,
    /// Registry file handle; `None` for a read-only registry with no file
    /// or after close.
    backend: Option<Box<dyn StorageBackend>>,
    closed: bool,
}

impl RegistryState {
    fn empty(storage_key: StorageKey, backend: Option<Box<dyn StorageBackend>>) -> Self {
        Self {
            data_keys: HashMap::new(),
            next_key_id: 0,
            last_created: 0,
            storage_key,
            backend,
            closed: false,
        }
    }

    /// Replays every record of `backend` into a fresh state.
    fn load(backend: Box<dyn StorageBackend>, storage_key: StorageKey) -> CoreResult<Self> {
        let mut data_keys = HashMap::new();
        let mut next_key_id = 0;
        let mut last_created = 0;

        // No locking needed: nothing else can see the registry yet.
        for result in KeyRegistryIterator::new(backend.as_ref(), &storage_key)? {
            let key = result?;
            if key.key_id() == 0 {
                return Err(CoreError::corruption("data key record with reserved id 0"));
            }
            next_key_id = next_key_id.max(key.key_id());
            last_created = last_created.max(key.created_at());
            data_keys.insert(key.key_id(), Arc::new(key));
        }

        Ok(Self {
            data_keys,
            next_key_id,
            last_created,
            storage_key,
            backend: Some(backend),
            closed: false,
        })
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed {
            return Err(CoreError::RegistryClosed);
        }
        Ok(())
    }

    fn current_key(&self) -> Option<Arc<DataKey>> {
        self.data_keys.get(&self.next_key_id).cloned()
    }

    fn rotation_due(&self, now: i64, period_secs: i64) -> bool {
        self.next_key_id == 0 || now.saturating_sub(self.last_created) >= period_secs
    }
}

impl KeyRegistry {
    /// Opens the registry described by `config` using the system clock.
    ///
    /// # Errors
    ///
    /// See [`open_with_clock`](Self::open_with_clock).
    pub fn open(config: RegistryConfig) -> CoreResult<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Opens the registry, reading time from `clock`.
    ///
    /// - In-memory configs start empty and never touch the filesystem.
    /// - An existing file is replayed and kept open for appends.
    /// - A missing file is created (unless read-only, in which case the
    ///   registry starts empty and stays without a file).
    ///
    /// # Errors
    ///
    /// Returns `EncryptionKeyMismatch` for a wrong storage key,
    /// `BadChecksum`/`Truncated`/`Corruption` for a damaged file,
    /// `InvalidConfig` for a bad config, and I/O errors annotated with the
    /// failing step.
    pub fn open_with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        config.validate()?;
        let storage_key = config.storage_key.clone();

        if config.in_memory {
            let backend = in_memory_backend(&storage_key, std::iter::empty())?;
            info!(encrypted = !storage_key.is_empty(), "opened in-memory key registry");
            return Ok(Self::from_state(
                RegistryState::empty(storage_key, Some(backend)),
                config,
                clock,
            ));
        }

        let path = config.dir.join(KEY_REGISTRY_FILE);
        let mode = if config.read_only {
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWrite
        };

        let backend = match FileBackend::open(&path, mode) {
            Ok(backend) => backend,
            Err(err) if err.is_not_found() => {
                if config.read_only {
                    info!(path = %path.display(), "no key registry found, opening empty read-only registry");
                    return Ok(Self::from_state(
                        RegistryState::empty(storage_key, None),
                        config,
                        clock,
                    ));
                }
                write_registry(&config.dir, &storage_key, std::iter::empty())
                    .map_err(|e| e.context("creating key registry"))?;
                info!(path = %path.display(), "created key registry");
                FileBackend::open(&path, mode)
                    .map_err(|e| CoreError::from(e).context("opening key registry"))?
            }
            Err(err) => return Err(CoreError::from(err).context("opening key registry")),
        };

        let state = RegistryState::load(Box::new(backend), storage_key)
            .map_err(|e| e.context("reading key registry"))?;
        info!(
            path = %path.display(),
            keys = state.data_keys.len(),
            next_key_id = state.next_key_id,
            read_only = config.read_only,
            "opened key registry"
        );
        Ok(Self::from_state(state, config, clock))
    }

    fn from_state(state: RegistryState, config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(state),
            config,
            clock,
        }
    }

    /// Returns the data key with `key_id`.
    ///
    /// ID 0 means "plaintext" and always returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDataKeyId` for an unknown non-zero ID and
    /// `RegistryClosed` after [`close`](Self::close).
    pub fn data_key(&self, key_id: u64) -> CoreResult<Option<Arc<DataKey>>> {
        if key_id == 0 {
            return Ok(None);
        }
        let state = self.state.read();
        state.ensure_open()?;
        state
            .data_keys
            .get(&key_id)
            .cloned()
            .map(Some)
            .ok_or(CoreError::InvalidDataKeyId { key_id })
    }

    /// Returns the key new data should be encrypted with.
    ///
    /// Returns `Ok(None)` when no storage key is configured. Otherwise the
    /// current key is returned while it is younger than the rotation period;
    /// once it is due, a new key is generated, appended to the registry file
    /// and returned. Read-only registries never rotate and return the newest
    /// existing key.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from the append (the registry is left unchanged),
    /// `RegistryDetached` when a rotation is due after a failed post-rewrite
    /// reopen, and `RegistryClosed` after [`close`](Self::close).
    pub fn latest_data_key(&self) -> CoreResult<Option<Arc<DataKey>>> {
        let period = self.config.rotation_period_secs();
        {
            let state = self.state.read();
            state.ensure_open()?;
            if state.storage_key.is_empty() {
                return Ok(None);
            }
            if self.config.read_only || !state.rotation_due(self.clock.now(), period) {
                return Ok(state.current_key());
            }
        }

        let mut state = self.state.write();
        state.ensure_open()?;
        // Another caller may have rotated while we waited for the lock.
        let now = self.clock.now();
        if !state.rotation_due(now, period) {
            return Ok(state.current_key());
        }
        self.rotate(&mut state, now).map(Some)
    }

    fn rotate(&self, state: &mut RegistryState, now: i64) -> CoreResult<Arc<DataKey>> {
        let key_id = state
            .next_key_id
            .checked_add(1)
            .ok_or_else(|| CoreError::corruption("data key id space exhausted"))?;
        let key = DataKey::generate(key_id, state.storage_key.len(), now)?;
        let record = encode_record(&key, &state.storage_key)?;

        let backend = state.backend.as_mut().ok_or(CoreError::RegistryDetached)?;
        append_record(backend.as_mut(), &record, self.config.sync_writes)
            .map_err(|e| e.context("persisting data key"))?;

        let key = Arc::new(key);
        state.next_key_id = key_id;
        state.last_created = now;
        state.data_keys.insert(key_id, Arc::clone(&key));
        debug!(key_id, created_at = now, "rotated data key");
        Ok(key)
    }

    /// Rewrites the registry file from the in-memory state.
    ///
    /// The new file gets a fresh header IV and the records in key ID order,
    /// and atomically replaces the old one; the open handle is switched to
    /// the new file.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` for read-only registries, `RegistryClosed` after
    /// close, or the I/O error of the failed step. The registry on disk is
    /// unchanged if the rewrite fails before its rename. If the renamed file
    /// cannot be reopened the registry stays detached: lookups work, rotation
    /// fails with `RegistryDetached` until a later rewrite succeeds.
    pub fn rewrite(&self) -> CoreResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        if self.config.read_only {
            return Err(CoreError::ReadOnly);
        }
        let storage_key = state.storage_key.clone();
        self.rematerialize(&mut state, storage_key)?;
        info!(keys = state.data_keys.len(), "rewrote key registry");
        Ok(())
    }

    /// Re-encrypts every data key under `new_key` and makes it the storage
    /// key for future appends.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeySize` for an empty key, otherwise as
    /// [`rewrite`](Self::rewrite).
    pub fn rekey(&self, new_key: StorageKey) -> CoreResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        if self.config.read_only {
            return Err(CoreError::ReadOnly);
        }
        if new_key.is_empty() {
            return Err(CoreError::InvalidKeySize { actual: 0 });
        }
        self.rematerialize(&mut state, new_key)?;
        info!(keys = state.data_keys.len(), "re-encrypted key registry under a new storage key");
        Ok(())
    }

    fn rematerialize(&self, state: &mut RegistryState, storage_key: StorageKey) -> CoreResult<()> {
        self.rematerialize_with(state, storage_key, |path| {
            let backend: Box<dyn StorageBackend> =
                Box::new(FileBackend::open(path, OpenMode::ReadWrite)?);
            Ok(backend)
        })
    }

    fn rematerialize_with<F>(
        &self,
        state: &mut RegistryState,
        storage_key: StorageKey,
        reopen: F,
    ) -> CoreResult<()>
    where
        F: FnOnce(&Path) -> CoreResult<Box<dyn StorageBackend>>,
    {
        let keys = state.data_keys.values().map(|key| &**key);

        if self.config.in_memory {
            let backend = in_memory_backend(&storage_key, keys)?;
            state.backend = Some(backend);
            state.storage_key = storage_key;
            return Ok(());
        }

        write_registry(&self.config.dir, &storage_key, keys)
            .map_err(|e| e.context("rewriting key registry"))?;

        // The file on disk is now under `storage_key` and the old handle
        // points at the replaced file.
        state.storage_key = storage_key;
        state.backend = None;

        let path = self.config.dir.join(KEY_REGISTRY_FILE);
        match reopen(&path) {
            Ok(backend) => {
                state.backend = Some(backend);
                Ok(())
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "key registry detached after rewrite");
                Err(err.context("reopening key registry after rewrite"))
            }
        }
    }

    /// Releases the registry file.
    ///
    /// Calling it again is a no-op. Every other operation except
    /// `data_key(0)` fails with `RegistryClosed` afterwards.
    ///
    /// # Errors
    ///
    /// Returns the error of the final sync; the registry is closed anyway.
    pub fn close(&self) -> CoreResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if let Some(mut backend) = state.backend.take() {
            backend
                .sync()
                .map_err(|e| CoreError::from(e).context("closing key registry"))?;
        }
        debug!("closed key registry");
        Ok(())
    }

    /// IDs of all known keys in ascending order.
    #[must_use]
    pub fn key_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.read().data_keys.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of known keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().data_keys.len()
    }

    /// Returns `true` if no key has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest key ID assigned so far (0 if none).
    #[must_use]
    pub fn next_key_id(&self) -> u64 {
        self.state.read().next_key_id
    }

    /// Creation time of the newest key in unix seconds (0 if none).
    #[must_use]
    pub fn last_created_at(&self) -> i64 {
        self.state.read().last_created
    }

    /// Returns `true` if a storage key is configured.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        !self.state.read().storage_key.is_empty()
    }

    /// Returns `true` if the registry was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Path of the registry file, or `None` for in-memory registries.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        (!self.config.in_memory).then(|| self.config.dir.join(KEY_REGISTRY_FILE))
    }
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("KeyRegistry")
            .field("dir", &self.config.dir)
            .field("keys", &state.data_keys.len())
            .field("next_key_id", &state.next_key_id)
            .field("read_only", &self.config.read_only)
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

/// Builds an in-memory backend holding a full registry image.
fn in_memory_backend<'a, I>(storage_key: &StorageKey, keys: I) -> CoreResult<Box<dyn StorageBackend>>
where
    I: IntoIterator<Item = &'a DataKey>,
{
    let mut backend = InMemoryBackend::new();
    backend.append(&encode_registry(storage_key, keys)?)?;
    Ok(Box::new(backend))
}

/// Appends one fully encoded record, rolling the file back if the write or
/// the sync fails so that no partial record stays behind.
fn append_record(backend: &mut dyn StorageBackend, record: &[u8], sync: bool) -> CoreResult<()> {
    let offset = backend.size()?;
    let result = backend
        .append(record)
        .and_then(|_| if sync { backend.sync() } else { backend.flush() });

    if let Err(err) = result {
        if let Err(rollback) = backend.truncate(offset) {
            warn!(offset, error = %rollback, "failed to roll back partial key registry append");
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use keyreg_storage::{StorageError, StorageResult};
    use std::time::Duration;

    fn storage_key() -> StorageKey {
        StorageKey::from_bytes(&[0u8; 16]).unwrap()
    }

    fn in_memory(clock: &Arc<ManualClock>) -> KeyRegistry {
        let config = RegistryConfig::in_memory()
            .storage_key(storage_key())
            .rotation_period(Duration::from_secs(10));
        KeyRegistry::open_with_clock(config, clock.clone()).unwrap()
    }

    #[test]
    fn zero_id_is_plaintext() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = in_memory(&clock);
        assert!(registry.data_key(0).unwrap().is_none());
        registry.close().unwrap();
        assert!(registry.data_key(0).unwrap().is_none());
    }

    #[test]
    fn unknown_id_is_an_error() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = in_memory(&clock);
        assert!(matches!(
            registry.data_key(1),
            Err(CoreError::InvalidDataKeyId { key_id: 1 })
        ));
    }

    #[test]
    fn rotation_gate() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = in_memory(&clock);

        let first = registry.latest_data_key().unwrap().unwrap();
        assert_eq!(first.key_id(), 1);
        assert_eq!(first.data().len(), 16);

        clock.set(9);
        assert_eq!(registry.latest_data_key().unwrap().unwrap().key_id(), 1);

        clock.set(10);
        let second = registry.latest_data_key().unwrap().unwrap();
        assert_eq!(second.key_id(), 2);
        assert_eq!(second.created_at(), 10);
        assert_ne!(first.data(), second.data());
        assert_eq!(registry.key_ids(), vec![1, 2]);
        assert_eq!(registry.last_created_at(), 10);
    }

    #[test]
    fn fractional_period_is_not_truncated() {
        let clock = Arc::new(ManualClock::new(0));
        let config = RegistryConfig::in_memory()
            .storage_key(storage_key())
            .rotation_period(Duration::from_millis(1500));
        let registry = KeyRegistry::open_with_clock(config, clock.clone()).unwrap();
        assert_eq!(registry.latest_data_key().unwrap().unwrap().key_id(), 1);

        clock.set(1);
        assert_eq!(registry.latest_data_key().unwrap().unwrap().key_id(), 1);

        clock.set(2);
        assert_eq!(registry.latest_data_key().unwrap().unwrap().key_id(), 2);
    }

    #[test]
    fn failed_reopen_after_rekey_detaches_without_closing() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let old_key = storage_key();
        let new_key = StorageKey::from_bytes(&[6u8; 32]).unwrap();
        let config = RegistryConfig::new(dir.path())
            .storage_key(old_key)
            .rotation_period(Duration::from_secs(10));
        let registry = KeyRegistry::open_with_clock(config, clock.clone()).unwrap();
        let first = registry.latest_data_key().unwrap().unwrap();

        let err = {
            let mut state = registry.state.write();
            registry
                .rematerialize_with(&mut state, new_key.clone(), |_| {
                    Err(CoreError::Io(std::io::Error::other("reopen failed")))
                })
                .unwrap_err()
        };
        assert!(err.to_string().contains("reopening key registry after rewrite"));
        assert!(matches!(err.root(), CoreError::Io(_)));

        // Memory follows the file that is now on disk.
        assert_eq!(registry.state.read().storage_key.as_bytes(), new_key.as_bytes());
        assert!(!registry.is_closed());
        assert_eq!(registry.data_key(1).unwrap().unwrap(), first);
        assert_eq!(registry.latest_data_key().unwrap().unwrap(), first);

        clock.set(10);
        assert!(matches!(
            registry.latest_data_key(),
            Err(CoreError::RegistryDetached)
        ));

        // A successful rewrite reattaches the file.
        registry.rewrite().unwrap();
        assert_eq!(registry.latest_data_key().unwrap().unwrap().key_id(), 2);
        registry.close().unwrap();

        let reopened = KeyRegistry::open_with_clock(
            RegistryConfig::new(dir.path()).storage_key(new_key),
            clock,
        )
        .unwrap();
        assert_eq!(reopened.key_ids(), vec![1, 2]);
        assert_eq!(reopened.data_key(1).unwrap().unwrap(), first);
    }

    #[test]
    fn clock_going_backwards_keeps_current_key() {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = in_memory(&clock);
        registry.latest_data_key().unwrap();
        clock.set(0);
        assert_eq!(registry.latest_data_key().unwrap().unwrap().key_id(), 1);
    }

    #[test]
    fn no_storage_key_means_no_encryption() {
        let registry = KeyRegistry::open(RegistryConfig::in_memory()).unwrap();
        assert!(!registry.is_encrypted());
        assert!(registry.latest_data_key().unwrap().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn closed_registry_rejects_operations() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = in_memory(&clock);
        registry.latest_data_key().unwrap();
        registry.close().unwrap();
        registry.close().unwrap();

        assert!(registry.is_closed());
        assert!(matches!(registry.data_key(1), Err(CoreError::RegistryClosed)));
        assert!(matches!(registry.latest_data_key(), Err(CoreError::RegistryClosed)));
        assert!(matches!(registry.rewrite(), Err(CoreError::RegistryClosed)));
    }

    #[test]
    fn in_memory_rekey_keeps_keys() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = in_memory(&clock);
        let key = registry.latest_data_key().unwrap().unwrap();

        registry.rekey(StorageKey::from_bytes(&[9u8; 32]).unwrap()).unwrap();
        assert_eq!(registry.data_key(1).unwrap().unwrap(), key);

        clock.advance(Duration::from_secs(10));
        let next = registry.latest_data_key().unwrap().unwrap();
        assert_eq!(next.key_id(), 2);
        assert_eq!(next.data().len(), 32);
        assert!(matches!(
            registry.rekey(StorageKey::none()),
            Err(CoreError::InvalidKeySize { actual: 0 })
        ));
    }

    /// Backend whose appends write half the data and then fail.
    struct TornBackend {
        inner: InMemoryBackend,
    }

    impl StorageBackend for TornBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }

        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            self.inner.append(&data[..data.len() / 2])?;
            Err(StorageError::Io(std::io::Error::other("disk full")))
        }

        fn flush(&mut self) -> StorageResult<()> {
            Ok(())
        }

        fn size(&self) -> StorageResult<u64> {
            self.inner.size()
        }

        fn sync(&mut self) -> StorageResult<()> {
            Ok(())
        }

        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.inner.truncate(new_size)
        }
    }

    #[test]
    fn failed_append_leaves_state_and_file_unchanged() {
        let storage = storage_key();
        let image = encode_registry(&storage, std::iter::empty()).unwrap();
        let backend = TornBackend {
            inner: InMemoryBackend::with_data(image.clone()),
        };
        let config = RegistryConfig::in_memory().storage_key(storage.clone());
        let registry = KeyRegistry::from_state(
            RegistryState::load(Box::new(backend), storage).unwrap(),
            config,
            Arc::new(ManualClock::new(0)),
        );

        let err = registry.latest_data_key().unwrap_err();
        assert!(matches!(err, CoreError::Context { .. }));
        assert!(err.to_string().contains("persisting data key"));
        assert_eq!(registry.next_key_id(), 0);
        assert!(registry.is_empty());

        let state = registry.state.read();
        let backend = state.backend.as_ref().unwrap();
        assert_eq!(backend.size().unwrap(), image.len() as u64);
    }
}
