//! Key/value codec contract and the default binary implementation.
//!
//! Backends store encoded bytes; everything above them works on the typed
//! model. The [`Codec`] trait is the seam: the length hints let batch
//! callers pre-size one contiguous buffer for a whole batch, and the
//! `reuse` flag on [`decode_val`](Codec::decode_val) permits zero-copy
//! decoding for callers that do not retain the buffer beyond the call.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::HangarError;
use crate::types::{Expiry, Key};
use crate::valgroup::ValGroup;

/// Serializes keys and value groups to the raw bytes backends store.
pub trait Codec: Send + Sync {
    /// Encodes a key.
    ///
    /// # Errors
    ///
    /// Returns [`HangarError::Codec`] if the key cannot be represented.
    fn encode_key(&self, key: &Key) -> Result<Bytes, HangarError>;

    /// Decodes a key previously produced by [`encode_key`](Codec::encode_key).
    ///
    /// # Errors
    ///
    /// Returns [`HangarError::Codec`] on corruption.
    fn decode_key(&self, buf: &Bytes) -> Result<Key, HangarError>;

    /// Encodes a value group.
    ///
    /// # Errors
    ///
    /// Returns [`HangarError::FieldValueMismatch`] if the group violates the
    /// lock-step invariant, or [`HangarError::Codec`] if it cannot be
    /// represented.
    fn encode_val(&self, group: &ValGroup) -> Result<Bytes, HangarError>;

    /// Decodes a value group.
    ///
    /// With `reuse = true` the returned group may alias `buf`'s backing
    /// bytes directly (zero-copy); callers that retain the decoded data
    /// beyond the call must copy it themselves or pass `reuse = false`.
    ///
    /// # Errors
    ///
    /// Returns [`HangarError::Codec`] on corruption.
    fn decode_val(&self, buf: &Bytes, reuse: bool) -> Result<ValGroup, HangarError>;

    /// Exact encoded size of `key`, for batch buffer pre-sizing.
    fn key_len_hint(&self, key: &Key) -> usize;

    /// Exact encoded size of `group`, for batch buffer pre-sizing.
    fn val_len_hint(&self, group: &ValGroup) -> usize;
}

/// Format version byte shared by key and value encodings.
const VERSION: u8 = 1;

/// Expiry tag bytes in the value encoding.
const EXPIRY_NEVER: u8 = 0;
const EXPIRY_AT: u8 = 1;
const EXPIRY_UNSPECIFIED: u8 = 2;

/// Default codec: a version byte, a tagged expiry, and 32-bit
/// length-prefixed field/value runs. The layout is private to this type.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
    /// Creates the default codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Codec for BinaryCodec {
    fn encode_key(&self, key: &Key) -> Result<Bytes, HangarError> {
        let mut buf = BytesMut::with_capacity(self.key_len_hint(key));
        buf.put_u8(VERSION);
        buf.put_slice(key.as_bytes());
        Ok(buf.freeze())
    }

    fn decode_key(&self, buf: &Bytes) -> Result<Key, HangarError> {
        if buf.is_empty() {
            return Err(HangarError::Codec("empty key buffer".to_string()));
        }
        if buf[0] != VERSION {
            return Err(HangarError::Codec(format!(
                "unknown key format version {}",
                buf[0]
            )));
        }
        Ok(Key(buf.slice(1..)))
    }

    fn encode_val(&self, group: &ValGroup) -> Result<Bytes, HangarError> {
        group.validate()?;

        let mut buf = BytesMut::with_capacity(self.val_len_hint(group));
        buf.put_u8(VERSION);
        match group.expiry {
            Expiry::Never => buf.put_u8(EXPIRY_NEVER),
            Expiry::At(at) => {
                buf.put_u8(EXPIRY_AT);
                buf.put_u64(at);
            }
            Expiry::Unspecified => buf.put_u8(EXPIRY_UNSPECIFIED),
        }
        buf.put_u32(len_u32(group.len())?);
        for field in &group.fields {
            buf.put_u32(len_u32(field.len())?);
            buf.put_slice(field);
        }
        for value in &group.values {
            buf.put_u32(len_u32(value.len())?);
            buf.put_slice(value);
        }
        Ok(buf.freeze())
    }

    fn decode_val(&self, buf: &Bytes, reuse: bool) -> Result<ValGroup, HangarError> {
        let mut pos = 0;
        let version = read_u8(buf, &mut pos)?;
        if version != VERSION {
            return Err(HangarError::Codec(format!(
                "unknown value format version {version}"
            )));
        }

        let expiry = match read_u8(buf, &mut pos)? {
            EXPIRY_NEVER => Expiry::Never,
            EXPIRY_AT => Expiry::At(read_u64(buf, &mut pos)?),
            EXPIRY_UNSPECIFIED => Expiry::Unspecified,
            tag => return Err(HangarError::Codec(format!("unknown expiry tag {tag}"))),
        };

        let count = read_u32(buf, &mut pos)? as usize;
        // Each entry needs at least two length prefixes; reject counts that
        // cannot fit in the remaining bytes before allocating.
        if count > (buf.len() - pos) / 8 {
            return Err(HangarError::Codec(format!(
                "implausible field count {count} for {} remaining bytes",
                buf.len() - pos
            )));
        }

        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_u32(buf, &mut pos)? as usize;
            fields.push(take(buf, &mut pos, len, reuse)?);
        }
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_u32(buf, &mut pos)? as usize;
            values.push(take(buf, &mut pos, len, reuse)?);
        }

        if pos != buf.len() {
            return Err(HangarError::Codec(format!(
                "{} trailing bytes after value",
                buf.len() - pos
            )));
        }

        Ok(ValGroup::with_expiry(fields, values, expiry))
    }

    fn key_len_hint(&self, key: &Key) -> usize {
        1 + key.as_bytes().len()
    }

    fn val_len_hint(&self, group: &ValGroup) -> usize {
        let expiry = match group.expiry {
            Expiry::At(_) => 1 + 8,
            Expiry::Never | Expiry::Unspecified => 1,
        };
        let fields: usize = group.fields.iter().map(|f| 4 + f.len()).sum();
        let values: usize = group.values.iter().map(|v| 4 + v.len()).sum();
        1 + expiry + 4 + fields + values
    }
}

fn len_u32(len: usize) -> Result<u32, HangarError> {
    u32::try_from(len).map_err(|_| HangarError::Codec(format!("length {len} exceeds u32")))
}

fn read_u8(buf: &Bytes, pos: &mut usize) -> Result<u8, HangarError> {
    if *pos >= buf.len() {
        return Err(truncated(*pos));
    }
    let v = buf[*pos];
    *pos += 1;
    Ok(v)
}

fn read_u32(buf: &Bytes, pos: &mut usize) -> Result<u32, HangarError> {
    let end = pos.checked_add(4).filter(|&e| e <= buf.len()).ok_or_else(|| truncated(*pos))?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[*pos..end]);
    *pos = end;
    Ok(u32::from_be_bytes(raw))
}

fn read_u64(buf: &Bytes, pos: &mut usize) -> Result<u64, HangarError> {
    let end = pos.checked_add(8).filter(|&e| e <= buf.len()).ok_or_else(|| truncated(*pos))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[*pos..end]);
    *pos = end;
    Ok(u64::from_be_bytes(raw))
}

/// Slices `len` bytes out of `buf`, aliasing when `reuse` permits it.
fn take(buf: &Bytes, pos: &mut usize, len: usize, reuse: bool) -> Result<Bytes, HangarError> {
    let end = pos.checked_add(len).filter(|&e| e <= buf.len()).ok_or_else(|| truncated(*pos))?;
    let out = if reuse {
        buf.slice(*pos..end)
    } else {
        Bytes::copy_from_slice(&buf[*pos..end])
    };
    *pos = end;
    Ok(out)
}

fn truncated(pos: usize) -> HangarError {
    HangarError::Codec(format!("value truncated at byte {pos}"))
}
