//! Error types for the key registry.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in key registry operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] keyreg_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An I/O-level failure annotated with the operation that failed.
    #[error("{context}: {source}")]
    Context {
        /// The operation that failed.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<CoreError>,
    },

    /// A record's stored checksum does not match its payload.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    BadChecksum {
        /// Checksum stored in the record header.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// The sanity marker did not decrypt to the expected plaintext.
    #[error("encryption key mismatch: the storage key does not match the key registry")]
    EncryptionKeyMismatch,

    /// A non-zero data key ID that the registry does not know.
    #[error("invalid data key id {key_id}")]
    InvalidDataKeyId {
        /// The requested key ID.
        key_id: u64,
    },

    /// Key length is not a valid AES key length.
    #[error("invalid key size: expected 16, 24 or 32 bytes, got {actual}")]
    InvalidKeySize {
        /// Actual size in bytes.
        actual: usize,
    },

    /// IV length does not equal the cipher block size.
    #[error("invalid IV size: expected {expected} bytes, got {actual}")]
    InvalidIvSize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// The registry file ended in the middle of a header or record.
    #[error("key registry truncated: {message}")]
    Truncated {
        /// Description of what was cut short.
        message: String,
    },

    /// A record payload could not be decoded.
    #[error("key registry corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// A write was attempted on a registry opened read-only.
    #[error("key registry is read-only")]
    ReadOnly,

    /// The registry has been closed.
    #[error("key registry is closed")]
    RegistryClosed,

    /// A rewrite replaced the registry file but the new file could not be
    /// reopened. Keys can still be looked up; a successful
    /// [`rewrite`](crate::KeyRegistry::rewrite) reattaches the file.
    #[error("key registry file is detached after a failed reopen")]
    RegistryDetached,

    /// The configuration cannot be used.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates a truncation error.
    pub fn truncated(message: impl Into<String>) -> Self {
        Self::Truncated {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Wraps I/O-level errors with the operation that failed.
    ///
    /// Registry-level errors (checksum, key mismatch, lookups) are returned
    /// unchanged so callers can match on them directly.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        match self {
            Self::Storage(_) | Self::Io(_) | Self::Context { .. } => Self::Context {
                context: context.into(),
                source: Box::new(self),
            },
            other => other,
        }
    }

    /// Returns the innermost error beneath any context annotations.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns `true` if the root cause is a missing file.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Self::Storage(err) => err.is_not_found(),
            Self::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyreg_storage::StorageError;

    #[test]
    fn context_wraps_io_errors_only() {
        let io = CoreError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        let wrapped = io.context("opening key registry");
        assert!(matches!(wrapped, CoreError::Context { .. }));
        assert!(wrapped.to_string().starts_with("opening key registry: "));
        assert!(matches!(wrapped.root(), CoreError::Io(_)));

        let mismatch = CoreError::EncryptionKeyMismatch.context("opening key registry");
        assert!(matches!(mismatch, CoreError::EncryptionKeyMismatch));
    }

    #[test]
    fn not_found_is_seen_through_context() {
        let err = CoreError::from(StorageError::Io(io::Error::from(io::ErrorKind::NotFound)))
            .context("a")
            .context("b");
        assert!(err.is_not_found());
        assert!(!CoreError::ReadOnly.is_not_found());
    }
}
