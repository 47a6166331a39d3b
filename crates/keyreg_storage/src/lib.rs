//! # keyreg storage
//!
//! Platform layer underneath the keyreg key registry.
//!
//! Backends are **opaque byte stores**: they read, append, flush and sync
//! bytes and never interpret the registry format. The registry crate owns
//! all format knowledge.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - The exclusively owned handle of an on-disk registry file
//! - [`InMemoryBackend`] - For tests and purely in-memory registries
//!
//! ## Directory durability
//!
//! [`sync_dir`] flushes a directory's entries so that a preceding
//! create or rename survives a crash.
//!
//! ## Example
//!
//! ```rust
//! use keyreg_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod dir;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use dir::sync_dir;
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, OpenMode};
pub use memory::InMemoryBackend;
