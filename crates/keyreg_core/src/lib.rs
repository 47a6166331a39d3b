//! # keyreg core
//!
//! Data key registry for an embedded key-value engine with encryption at
//! rest.
//!
//! This crate provides:
//! - AES-CTR helpers shared by every encrypted file of the engine
//! - The append-only `KEYREGISTRY` file format
//! - [`KeyRegistry`]: lookup of data keys by ID and time-based rotation
//! - Atomic rewrite and re-encryption of the registry under a new storage key

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod crypto;
mod error;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RegistryConfig, DEFAULT_ROTATION_PERIOD};
pub use crypto::{DataKey, StorageKey};
pub use error::{CoreError, CoreResult};
pub use registry::{
    encode_registry, write_registry, KeyRegistry, KeyRegistryIterator, RegistryWriter,
    KEY_REGISTRY_FILE, KEY_REGISTRY_REWRITE_FILE,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
