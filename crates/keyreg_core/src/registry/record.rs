//! Registry header and data key record codec.

use crate::crypto::{generate_iv, xor_block, DataKey, StorageKey, BLOCK_SIZE};
use crate::error::{CoreError, CoreResult};

/// Known plaintext stored after the header IV.
///
/// Part of the on-disk format: existing registries carry exactly these bytes.
pub const SANITY_TEXT: &[u8; 12] = b"Hello Badger";

/// Size of the file header: IV followed by the (encrypted) sanity text.
pub const HEADER_SIZE: usize = BLOCK_SIZE + SANITY_TEXT.len();

/// Size of a record header: length (4) + CRC32-C (4), both big-endian.
pub const RECORD_HEADER_SIZE: usize = 8;

// Payload field keys: (field number << 3) | wire type.
const FIELD_KEY_ID: u64 = 1 << 3;
const FIELD_DATA: u64 = (2 << 3) | 2;
const FIELD_IV: u64 = (3 << 3) | 2;
const FIELD_CREATED_AT: u64 = 4 << 3;

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

/// Builds a registry file header for `storage_key` with a fresh IV.
///
/// # Errors
///
/// Returns an error if the storage key has an invalid length.
pub fn encode_header(storage_key: &StorageKey) -> CoreResult<Vec<u8>> {
    let iv = generate_iv();
    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(&iv);
    if storage_key.is_empty() {
        header.extend_from_slice(SANITY_TEXT);
    } else {
        header.extend_from_slice(&xor_block(SANITY_TEXT, storage_key.as_bytes(), &iv)?);
    }
    Ok(header)
}

/// Checks a registry file header against `storage_key`.
///
/// # Errors
///
/// Returns `EncryptionKeyMismatch` if the sanity text does not decrypt to
/// the expected plaintext, `Truncated` if fewer than [`HEADER_SIZE`] bytes
/// are given.
pub fn validate_header(header: &[u8], storage_key: &StorageKey) -> CoreResult<()> {
    if header.len() < HEADER_SIZE {
        return Err(CoreError::truncated(format!(
            "header needs {HEADER_SIZE} bytes, found {}",
            header.len()
        )));
    }
    let (iv, marker) = header[..HEADER_SIZE].split_at(BLOCK_SIZE);
    let marker = if storage_key.is_empty() {
        marker.to_vec()
    } else {
        xor_block(marker, storage_key.as_bytes(), iv)?
    };
    if marker != SANITY_TEXT {
        return Err(CoreError::EncryptionKeyMismatch);
    }
    Ok(())
}

/// Encodes a data key as `len | crc32c | payload`.
///
/// With a storage key configured, the payload carries the material encrypted
/// under the storage key and the data key's own IV. `key` itself is not
/// modified.
///
/// # Errors
///
/// Returns an error if the storage key is invalid.
pub fn encode_record(key: &DataKey, storage_key: &StorageKey) -> CoreResult<Vec<u8>> {
    let payload = if storage_key.is_empty() {
        encode_payload(key.key_id(), key.data(), key.iv(), key.created_at())
    } else {
        let sealed = xor_block(key.data(), storage_key.as_bytes(), key.iv())?;
        encode_payload(key.key_id(), &sealed, key.iv(), key.created_at())
    };

    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::corruption("data key record payload too large"))?;

    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(&crc32c(&payload).to_be_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Splits a record header into (payload length, stored checksum).
#[must_use]
pub fn parse_record_header(header: &[u8; RECORD_HEADER_SIZE]) -> (u32, u32) {
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    (len, crc)
}

/// Decodes one record, verifying its checksum before anything else.
///
/// # Errors
///
/// Returns `BadChecksum` if the payload does not match the stored CRC,
/// `Corruption` if the payload is malformed.
pub fn decode_record(
    expected_crc: u32,
    payload: &[u8],
    storage_key: &StorageKey,
) -> CoreResult<DataKey> {
    let actual = crc32c(payload);
    if actual != expected_crc {
        return Err(CoreError::BadChecksum {
            expected: expected_crc,
            actual,
        });
    }

    let stored = decode_payload(payload)?;
    if storage_key.is_empty() {
        return Ok(stored);
    }
    let data = xor_block(stored.data(), storage_key.as_bytes(), stored.iv())?;
    Ok(DataKey::new(
        stored.key_id(),
        data,
        *stored.iv(),
        stored.created_at(),
    ))
}

/// Serializes the data key fields with protobuf wire encoding.
///
/// Zero-valued fields are omitted and fields are written in field order.
fn encode_payload(key_id: u64, data: &[u8], iv: &[u8], created_at: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + iv.len() + 24);
    if key_id != 0 {
        put_varint(&mut buf, FIELD_KEY_ID);
        put_varint(&mut buf, key_id);
    }
    put_bytes(&mut buf, FIELD_DATA, data);
    put_bytes(&mut buf, FIELD_IV, iv);
    if created_at != 0 {
        put_varint(&mut buf, FIELD_CREATED_AT);
        put_varint(&mut buf, created_at as u64);
    }
    buf
}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn put_bytes(buf: &mut Vec<u8>, field: u64, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    put_varint(buf, field);
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Parses a payload, returning the key with its material as stored.
fn decode_payload(payload: &[u8]) -> CoreResult<DataKey> {
    let mut reader = PayloadReader { buf: payload, pos: 0 };
    let mut key_id = 0u64;
    let mut data = Vec::new();
    let mut iv: &[u8] = &[];
    let mut created_at = 0i64;

    while !reader.is_done() {
        let field = reader.read_varint()?;
        match field {
            FIELD_KEY_ID => key_id = reader.read_varint()?,
            FIELD_DATA => data = reader.read_bytes()?.to_vec(),
            FIELD_IV => iv = reader.read_bytes()?,
            FIELD_CREATED_AT => created_at = reader.read_varint()? as i64,
            other => reader.skip(other & 0x7)?,
        }
    }

    let iv: [u8; BLOCK_SIZE] = iv.try_into().map_err(|_| {
        CoreError::corruption(format!(
            "data key {key_id} has a {}-byte IV, expected {BLOCK_SIZE}",
            iv.len()
        ))
    })?;
    Ok(DataKey::new(key_id, data, iv, created_at))
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn is_done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_varint(&mut self) -> CoreResult<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| CoreError::corruption("unexpected end of varint"))?;
            self.pos += 1;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CoreError::corruption("varint longer than 10 bytes"))
    }

    fn read_bytes(&mut self) -> CoreResult<&'a [u8]> {
        let len = usize::try_from(self.read_varint()?)
            .map_err(|_| CoreError::corruption("field length overflow"))?;
        self.take(len)
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| CoreError::corruption("unexpected end of field"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn skip(&mut self, wire_type: u64) -> CoreResult<()> {
        match wire_type {
            WIRE_VARINT => self.read_varint().map(drop),
            WIRE_FIXED64 => self.take(8).map(drop),
            WIRE_LEN => self.read_bytes().map(drop),
            WIRE_FIXED32 => self.take(4).map(drop),
            other => Err(CoreError::corruption(format!(
                "unsupported wire type {other}"
            ))),
        }
    }
}

/// Computes the CRC32-C (Castagnoli) checksum of `data`.
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    const CRC32C_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0x82F6_3B78;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[index];
    }
    !crc
}
