//! The data key registry and its on-disk format.
//!
//! ## File Format
//!
//! ```text
//! | IV (16) | sanity text (12) | record | record | ... |
//!
//! record := | length (4, BE) | crc32c (4, BE) | payload (length) |
//! ```
//!
//! The sanity text is encrypted with the storage key and the header IV when
//! a storage key is configured; opening with any other key fails with
//! `EncryptionKeyMismatch` before a single record is read.
//!
//! The payload is the protobuf encoding of
//! `{ key_id: u64 = 1, data: bytes = 2, iv: bytes = 3, created_at: i64 = 4 }`,
//! with `data` encrypted under the storage key and the record's own IV.
//!
//! ## Invariants
//!
//! - The registry file is **append-only**; it is otherwise only replaced as a
//!   whole by an atomic rename
//! - Key IDs start at 1, are never reused, and are appended in increasing order
//! - Checksum failures are **fatal** - no repair is attempted
//! - Data keys are plaintext in memory and encrypted on disk

mod iterator;
mod key_registry;
pub mod record;
mod writer;

pub use iterator::KeyRegistryIterator;
pub use key_registry::KeyRegistry;
pub use writer::{encode_registry, write_registry, RegistryWriter};

/// File name of the registry inside the engine's data directory.
pub const KEY_REGISTRY_FILE: &str = "KEYREGISTRY";

/// File name of the temporary file used by full rewrites.
pub const KEY_REGISTRY_REWRITE_FILE: &str = "REWRITE-KEYREGISTRY";
