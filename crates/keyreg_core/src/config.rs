//! Key registry configuration.

use crate::crypto::StorageKey;
use crate::error::{CoreError, CoreResult};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default rotation period: 10 days.
pub const DEFAULT_ROTATION_PERIOD: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Configuration for opening a key registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory holding the registry file.
    pub dir: PathBuf,

    /// Open without write access. The registry is never created, rotated or
    /// rewritten.
    pub read_only: bool,

    /// Keep the registry purely in memory; nothing touches the filesystem.
    pub in_memory: bool,

    /// Master key encrypting data keys at rest. Empty disables encryption.
    pub storage_key: StorageKey,

    /// Age after which the current data key is replaced.
    pub rotation_period: Duration,

    /// Whether to fsync the registry file after every append.
    pub sync_writes: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            read_only: false,
            in_memory: false,
            storage_key: StorageKey::none(),
            rotation_period: DEFAULT_ROTATION_PERIOD,
            sync_writes: true,
        }
    }
}

impl RegistryConfig {
    /// Creates a configuration for the registry in `dir`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Creates a configuration for an in-memory registry.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Self::default()
        }
    }

    /// Sets read-only mode.
    #[must_use]
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the storage key.
    #[must_use]
    pub fn storage_key(mut self, key: StorageKey) -> Self {
        self.storage_key = key;
        self
    }

    /// Sets the rotation period.
    #[must_use]
    pub fn rotation_period(mut self, period: Duration) -> Self {
        self.rotation_period = period;
        self
    }

    /// Sets whether appends are fsynced.
    #[must_use]
    pub fn sync_writes(mut self, value: bool) -> Self {
        self.sync_writes = value;
        self
    }

    /// Checks the configuration before a registry is opened with it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a zero rotation period.
    pub fn validate(&self) -> CoreResult<()> {
        if self.rotation_period.is_zero() {
            return Err(CoreError::invalid_config("rotation period must be non-zero"));
        }
        Ok(())
    }

    /// The rotation period rounded up to whole seconds, at least 1.
    ///
    /// The clock has second resolution, so an elapsed time `n` is below the
    /// period exactly when it is below the rounded-up value.
    pub(crate) fn rotation_period_secs(&self) -> i64 {
        let period = &self.rotation_period;
        let secs = period
            .as_secs()
            .saturating_add(u64::from(period.subsec_nanos() > 0));
        i64::try_from(secs).unwrap_or(i64::MAX).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RegistryConfig::default();
        assert!(!config.read_only);
        assert!(!config.in_memory);
        assert!(config.sync_writes);
        assert!(config.storage_key.is_empty());
        assert_eq!(config.rotation_period, DEFAULT_ROTATION_PERIOD);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = RegistryConfig::new("/tmp/db")
            .read_only(true)
            .sync_writes(false)
            .rotation_period(Duration::from_secs(10))
            .storage_key(StorageKey::from_bytes(&[0u8; 16]).unwrap());

        assert_eq!(config.dir, PathBuf::from("/tmp/db"));
        assert!(config.read_only);
        assert!(!config.sync_writes);
        assert_eq!(config.rotation_period_secs(), 10);
        assert_eq!(config.storage_key.len(), 16);
    }

    #[test]
    fn zero_rotation_period_is_rejected() {
        let config = RegistryConfig::in_memory().rotation_period(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn sub_second_period_rounds_up() {
        let config = RegistryConfig::in_memory().rotation_period(Duration::from_millis(10));
        assert_eq!(config.rotation_period_secs(), 1);
    }

    #[test]
    fn fractional_period_rounds_up() {
        let config = RegistryConfig::in_memory().rotation_period(Duration::from_millis(1500));
        assert_eq!(config.rotation_period_secs(), 2);

        let whole = RegistryConfig::in_memory().rotation_period(Duration::from_secs(3));
        assert_eq!(whole.rotation_period_secs(), 3);
    }
}
