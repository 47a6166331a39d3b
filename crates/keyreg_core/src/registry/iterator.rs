//! Forward-only iterator over the records of a registry file.

use crate::crypto::{DataKey, StorageKey};
use crate::error::{CoreError, CoreResult};
use crate::registry::record::{
    decode_record, parse_record_header, validate_header, HEADER_SIZE, RECORD_HEADER_SIZE,
};
use keyreg_storage::StorageBackend;

/// An iterator over the data keys of a registry file.
///
/// Construction reads the file header and checks the storage key against
/// the sanity text, so no record is ever decoded under a wrong key. Each
/// call to `next` then reads one record header, exactly that many payload
/// bytes, verifies the checksum and decrypts the material.
///
/// # Error Handling
///
/// - End of file on a record boundary ends the iteration
/// - End of file inside a record header or payload is `Truncated`
/// - CRC mismatches are `BadChecksum`
///
/// Every error is returned once and ends the iteration. The iterator cannot
/// be rewound; build a new one to scan again.
///
/// # Example
///
/// ```ignore
/// for result in KeyRegistryIterator::new(&backend, &storage_key)? {
///     let key = result?;
///     // ...
/// }
/// ```
pub struct KeyRegistryIterator<'a> {
    /// Backend holding the registry file.
    backend: &'a dyn StorageBackend,
    /// Key used to decrypt the stored material.
    storage_key: &'a StorageKey,
    /// Size of the file when the iterator was created.
    total_size: u64,
    /// Offset of the next record.
    offset: u64,
    /// Whether we've hit an error or the end.
    finished: bool,
}

impl<'a> KeyRegistryIterator<'a> {
    /// Validates the header and positions the iterator on the first record.
    ///
    /// # Errors
    ///
    /// Returns `EncryptionKeyMismatch` if `storage_key` is not the key the
    /// registry was written with, `Truncated` if the header is incomplete,
    /// or a storage error.
    pub fn new(backend: &'a dyn StorageBackend, storage_key: &'a StorageKey) -> CoreResult<Self> {
        let total_size = backend.size()?;
        if total_size < HEADER_SIZE as u64 {
            return Err(CoreError::truncated(format!(
                "header needs {HEADER_SIZE} bytes, file has {total_size}"
            )));
        }
        let header = backend.read_at(0, HEADER_SIZE)?;
        validate_header(&header, storage_key)?;

        Ok(Self {
            backend,
            storage_key,
            total_size,
            offset: HEADER_SIZE as u64,
            finished: false,
        })
    }

    /// Offset of the next unread record.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_next_key(&mut self) -> CoreResult<Option<DataKey>> {
        let remaining = self.total_size - self.offset;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < RECORD_HEADER_SIZE as u64 {
            return Err(CoreError::truncated(format!(
                "partial record header at offset {}: {remaining} of {RECORD_HEADER_SIZE} bytes",
                self.offset
            )));
        }

        let header = self.backend.read_at(self.offset, RECORD_HEADER_SIZE)?;
        let header: [u8; RECORD_HEADER_SIZE] = header
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::truncated("short record header read"))?;
        let (len, crc) = parse_record_header(&header);

        let available = remaining - RECORD_HEADER_SIZE as u64;
        if u64::from(len) > available {
            return Err(CoreError::truncated(format!(
                "record at offset {} needs {len} payload bytes, {available} available",
                self.offset
            )));
        }

        let payload = self
            .backend
            .read_at(self.offset + RECORD_HEADER_SIZE as u64, len as usize)?;
        let key = decode_record(crc, &payload, self.storage_key)?;

        self.offset += RECORD_HEADER_SIZE as u64 + u64::from(len);
        Ok(Some(key))
    }
}

impl Iterator for KeyRegistryIterator<'_> {
    type Item = CoreResult<DataKey>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_next_key() {
            Ok(Some(key)) => Some(Ok(key)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for KeyRegistryIterator<'_> {}
