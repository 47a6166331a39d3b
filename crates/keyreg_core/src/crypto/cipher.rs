//! AES counter-mode stream cipher.

use crate::error::{CoreError, CoreResult};
use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;
use std::io::{ErrorKind, Read, Write};

/// AES block size in bytes; also the IV size.
pub const BLOCK_SIZE: usize = 16;

/// Key sizes accepted by the cipher (AES-128, AES-192, AES-256).
pub const VALID_KEY_SIZES: [usize; 3] = [16, 24, 32];

/// Chunk size used by [`xor_stream`].
const STREAM_CHUNK_SIZE: usize = 1024;

/// Keystream generator for one (key, IV) pair.
///
/// Keeps its counter position between calls, so feeding data in pieces
/// produces the same output as one call over the whole buffer.
enum Keystream {
    Aes128(Ctr128BE<Aes128>),
    Aes192(Ctr128BE<Aes192>),
    Aes256(Ctr128BE<Aes256>),
}

impl Keystream {
    fn new(key: &[u8], iv: &[u8]) -> CoreResult<Self> {
        validate_key_size(key.len())?;
        if iv.len() != BLOCK_SIZE {
            return Err(CoreError::InvalidIvSize {
                expected: BLOCK_SIZE,
                actual: iv.len(),
            });
        }

        let invalid = |_| CoreError::InvalidKeySize { actual: key.len() };
        Ok(match key.len() {
            16 => Self::Aes128(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
            24 => Self::Aes192(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
            _ => Self::Aes256(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
        })
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.apply_keystream(buf),
            Self::Aes192(c) => c.apply_keystream(buf),
            Self::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

/// Checks that `len` is a valid AES key length.
///
/// # Errors
///
/// Returns `InvalidKeySize` for anything other than 16, 24 or 32.
pub fn validate_key_size(len: usize) -> CoreResult<()> {
    if VALID_KEY_SIZES.contains(&len) {
        Ok(())
    } else {
        Err(CoreError::InvalidKeySize { actual: len })
    }
}

/// XORs `data` with the AES-CTR keystream for `key` and `iv`.
///
/// Applying this twice with the same key and IV returns the original data.
///
/// # Errors
///
/// Returns an error if the key is not 16, 24 or 32 bytes, or the IV is not
/// [`BLOCK_SIZE`] bytes.
pub fn xor_block(data: &[u8], key: &[u8], iv: &[u8]) -> CoreResult<Vec<u8>> {
    let mut out = data.to_vec();
    xor_block_in_place(&mut out, key, iv)?;
    Ok(out)
}

/// In-place variant of [`xor_block`].
///
/// # Errors
///
/// Same as [`xor_block`]; `buf` is untouched on error.
pub fn xor_block_in_place(buf: &mut [u8], key: &[u8], iv: &[u8]) -> CoreResult<()> {
    Keystream::new(key, iv)?.apply(buf);
    Ok(())
}

/// Streams `reader` through the keystream into `writer`.
///
/// Data is processed in 1 KiB chunks with one continuous keystream, so the
/// output is byte-identical to [`xor_block`] over the whole input. Returns the
/// number of bytes written.
///
/// # Errors
///
/// Returns key/IV size errors before reading anything, and I/O errors from
/// either side as they occur.
pub fn xor_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &[u8],
    iv: &[u8],
) -> CoreResult<u64> {
    let mut keystream = Keystream::new(key, iv)?;
    let mut buf = [0u8; STREAM_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        keystream.apply(&mut buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }

    writer.flush()?;
    Ok(total)
}

/// Generates a random IV from the thread-local CSPRNG.
#[must_use]
pub fn generate_iv() -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Generates random key material of a valid AES key length.
///
/// # Errors
///
/// Returns `InvalidKeySize` if `len` is not 16, 24 or 32.
pub fn generate_key(len: usize) -> CoreResult<Vec<u8>> {
    validate_key_size(len)?;
    let mut key = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut key);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn aes128_ctr_known_vector() {
        // NIST SP 800-38A F.5.1, first block.
        let key = [
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
            0x4f, 0x3c,
        ];
        let iv = [
            0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd,
            0xfe, 0xff,
        ];
        let plaintext = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ];
        let expected = [
            0x87, 0x4d, 0x61, 0x91, 0xb6, 0x20, 0xe3, 0x26, 0x1b, 0xef, 0x68, 0x64, 0x99, 0x0d,
            0xb6, 0xce,
        ];
        assert_eq!(xor_block(&plaintext, &key, &iv).unwrap(), expected);
    }

    #[test]
    fn rejects_bad_key_sizes() {
        let iv = [0u8; BLOCK_SIZE];
        for len in [0, 1, 15, 17, 31, 33, 64] {
            let key = vec![0u8; len];
            assert!(matches!(
                xor_block(b"data", &key, &iv),
                Err(CoreError::InvalidKeySize { actual }) if actual == len
            ));
        }
    }

    #[test]
    fn rejects_bad_iv_sizes() {
        let key = [0u8; 16];
        for len in [0, 8, 12, 15, 17, 32] {
            let iv = vec![0u8; len];
            assert!(matches!(
                xor_block(b"data", &key, &iv),
                Err(CoreError::InvalidIvSize { expected: BLOCK_SIZE, actual }) if actual == len
            ));
        }
    }

    #[test]
    fn in_place_leaves_buffer_untouched_on_error() {
        let mut buf = *b"plaintext";
        assert!(xor_block_in_place(&mut buf, &[0u8; 5], &[0u8; BLOCK_SIZE]).is_err());
        assert_eq!(&buf, b"plaintext");
    }

    #[test]
    fn empty_input_is_fine() {
        let out = xor_block(&[], &[1u8; 32], &[2u8; BLOCK_SIZE]).unwrap();
        assert!(out.is_empty());

        let mut sink = Vec::new();
        let n = xor_stream(&[0u8; 0][..], &mut sink, &[1u8; 32], &[2u8; BLOCK_SIZE]).unwrap();
        assert_eq!(n, 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn stream_writes_transformed_bytes() {
        let key = [9u8; 24];
        let iv = [3u8; BLOCK_SIZE];
        let data = vec![0u8; 3000];

        let mut out = Vec::new();
        xor_stream(data.as_slice(), &mut out, &key, &iv).unwrap();

        assert_ne!(out, data);
        assert_eq!(out, xor_block(&data, &key, &iv).unwrap());
    }

    #[test]
    fn generated_material_has_requested_size() {
        assert_eq!(generate_key(24).unwrap().len(), 24);
        assert!(generate_key(20).is_err());
        assert_ne!(generate_iv(), generate_iv());
    }

    /// Reader that hands out at most `step` bytes per call and reports one
    /// `Interrupted` before the first read.
    struct ShortReads<'a> {
        data: &'a [u8],
        step: usize,
        interrupted: bool,
    }

    impl<'a> ShortReads<'a> {
        fn new(data: &'a [u8], step: usize) -> Self {
            Self {
                data,
                step,
                interrupted: false,
            }
        }
    }

    impl Read for ShortReads<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(ErrorKind::Interrupted.into());
            }
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn keystream_continues_across_mid_block_reads() {
        let key = [0x42u8; 16];
        // All-ones IV wraps the 128-bit counter after the first block.
        let iv = [0xFFu8; BLOCK_SIZE];
        let data: Vec<u8> = (0..200u8).collect();

        let mut out = Vec::new();
        let n = xor_stream(ShortReads::new(&data, 7), &mut out, &key, &iv).unwrap();

        assert_eq!(n, 200);
        assert_eq!(out, xor_block(&data, &key, &iv).unwrap());
    }

    fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
        prop::sample::select(VALID_KEY_SIZES.to_vec())
            .prop_flat_map(|len| prop::collection::vec(any::<u8>(), len))
    }

    proptest! {
        #[test]
        fn xor_is_an_involution(
            key in key_strategy(),
            iv in prop::array::uniform16(any::<u8>()),
            data in prop::collection::vec(any::<u8>(), 0..2048),
        ) {
            let once = xor_block(&data, &key, &iv).unwrap();
            let twice = xor_block(&once, &key, &iv).unwrap();
            prop_assert_eq!(twice, data);
        }

        #[test]
        fn stream_matches_single_call(
            key in key_strategy(),
            iv in prop::array::uniform16(any::<u8>()),
            data in prop::collection::vec(any::<u8>(), 0..5000),
        ) {
            let mut streamed = Vec::new();
            let n = xor_stream(data.as_slice(), &mut streamed, &key, &iv).unwrap();
            prop_assert_eq!(n, data.len() as u64);
            prop_assert_eq!(streamed, xor_block(&data, &key, &iv).unwrap());
        }

        #[test]
        fn stream_matches_single_call_with_short_reads(
            key in key_strategy(),
            iv in prop::array::uniform16(any::<u8>()),
            data in prop::collection::vec(any::<u8>(), 0..600),
            step in 1usize..40,
        ) {
            let mut streamed = Vec::new();
            let n = xor_stream(ShortReads::new(&data, step), &mut streamed, &key, &iv).unwrap();
            prop_assert_eq!(n, data.len() as u64);
            prop_assert_eq!(streamed, xor_block(&data, &key, &iv).unwrap());
        }
    }
}
