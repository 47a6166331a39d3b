//! Cryptographic primitives for the key registry.
//!
//! ## Stream cipher
//!
//! Every byte the registry encrypts goes through AES in counter mode
//! ([`xor_block`], [`xor_stream`]). Counter mode turns AES into a keystream
//! that is XORed with the data, so encryption and decryption are the same
//! operation. The IV is the initial 16-byte counter block and is incremented
//! as a big-endian integer.
//!
//! ## Keys
//!
//! - [`StorageKey`] - the master secret supplied by the engine; encrypts data
//!   keys at rest. May be empty, which disables encryption.
//! - [`DataKey`] - one version of a data-encryption key, with its own IV.
//!
//! Both are zeroized on drop and never print their bytes in `Debug` output.
//!
//! ## Usage
//!
//! ```
//! use keyreg_core::crypto::{generate_iv, xor_block};
//!
//! let key = [7u8; 16];
//! let iv = generate_iv();
//! let ciphertext = xor_block(b"secret data", &key, &iv)?;
//! let plaintext = xor_block(&ciphertext, &key, &iv)?;
//! assert_eq!(plaintext, b"secret data");
//! # Ok::<(), keyreg_core::CoreError>(())
//! ```

mod cipher;
mod keys;

pub use cipher::{
    generate_iv, generate_key, validate_key_size, xor_block, xor_block_in_place, xor_stream,
    BLOCK_SIZE, VALID_KEY_SIZES,
};
pub use keys::{DataKey, StorageKey};
