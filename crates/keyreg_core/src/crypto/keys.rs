//! Storage and data key types.

use super::cipher::{generate_iv, generate_key, validate_key_size, BLOCK_SIZE};
use crate::error::CoreResult;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The master secret that encrypts data keys at rest.
///
/// An empty storage key means the registry runs without at-rest encryption
/// and the engine writes plaintext. A non-empty key must be a valid AES key
/// length; data keys minted under it get the same length.
///
/// The bytes are zeroized when the key is dropped.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct StorageKey {
    bytes: Vec<u8>,
}

impl StorageKey {
    /// Returns the empty key (encryption disabled).
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a key from raw bytes.
    ///
    /// An empty slice yields [`StorageKey::none`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeySize` if the slice is non-empty and not 16, 24 or
    /// 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if !bytes.is_empty() {
            validate_key_size(bytes.len())?;
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Generates a random storage key of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeySize` if `len` is not 16, 24 or 32.
    pub fn generate(len: usize) -> CoreResult<Self> {
        Ok(Self {
            bytes: generate_key(len)?,
        })
    }

    /// Returns the key bytes.
    ///
    /// Don't log or serialize the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns `true` if no key is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

impl std::fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageKey")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// One version of a data-encryption key.
///
/// In memory the material is always plaintext; the record codec encrypts a
/// copy of it when the key is written to disk.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key_id: u64,
    data: Vec<u8>,
    iv: [u8; BLOCK_SIZE],
    created_at: i64,
}

impl DataKey {
    /// Creates a data key from its parts.
    #[must_use]
    pub fn new(key_id: u64, data: Vec<u8>, iv: [u8; BLOCK_SIZE], created_at: i64) -> Self {
        Self {
            key_id,
            data,
            iv,
            created_at,
        }
    }

    /// Generates a data key with fresh random material and IV.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeySize` if `key_len` is not 16, 24 or 32.
    pub fn generate(key_id: u64, key_len: usize, created_at: i64) -> CoreResult<Self> {
        Ok(Self::new(
            key_id,
            generate_key(key_len)?,
            generate_iv(),
            created_at,
        ))
    }

    /// The key version. Never 0 for a stored key.
    #[must_use]
    pub fn key_id(&self) -> u64 {
        self.key_id
    }

    /// The plaintext key material.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The per-key IV.
    #[must_use]
    pub fn iv(&self) -> &[u8; BLOCK_SIZE] {
        &self.iv
    }

    /// Creation time in unix seconds.
    #[must_use]
    pub fn created_at(&self) -> i64 {
        self.created_at
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("key_id", &self.key_id)
            .field("data", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
