//! Binary codec with integrity framing.
//!
//! Persisted structures (the cache index) and wire payloads are
//! bincode-encoded. Durable files additionally carry an integrity header so
//! corruption from bit flips, partial writes, and format changes is detected
//! before deserialization is attempted.
//!
//! Header layout (20 bytes, integers big-endian):
//! - Bytes 0-3:   caller-supplied magic
//! - Bytes 4-7:   format version (u32)
//! - Bytes 8-11:  CRC32 of payload (u32)
//! - Bytes 12-19: payload length (u64)
//! - Bytes 20+:   payload

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the integrity header prepended by [`wrap`].
pub const INTEGRITY_HEADER_SIZE: usize = 20;

/// Encode a value with the shared binary codec.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Codec(format!("encode: {e}")))
}

/// Decode a value with the shared binary codec.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Codec(format!("decode: {e}")))
}

/// Prepend an integrity header to a payload.
pub fn wrap(magic: &[u8; 4], version: u32, payload: &[u8]) -> Vec<u8> {
    let checksum = crc32fast::hash(payload);
    let mut out = Vec::with_capacity(INTEGRITY_HEADER_SIZE + payload.len());
    out.extend_from_slice(magic);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&checksum.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Verify an integrity header and return the payload.
///
/// Accepts any version up to `max_version`; the caller handles per-version
/// payload migration.
pub fn unwrap<'a>(magic: &[u8; 4], max_version: u32, data: &'a [u8]) -> Result<&'a [u8]> {
    if data.len() < INTEGRITY_HEADER_SIZE {
        return Err(Error::Codec(format!(
            "file too small: {} bytes (minimum {INTEGRITY_HEADER_SIZE})",
            data.len()
        )));
    }

    let found: [u8; 4] = data[0..4]
        .try_into()
        .map_err(|_| Error::Codec("unreadable magic".into()))?;
    if &found != magic {
        return Err(Error::Codec(format!(
            "invalid magic: expected {magic:?}, found {found:?}"
        )));
    }

    let version = u32::from_be_bytes(
        data[4..8]
            .try_into()
            .map_err(|_| Error::Codec("unreadable version".into()))?,
    );
    if version > max_version {
        return Err(Error::Codec(format!(
            "unsupported format version {version} (supported up to {max_version})"
        )));
    }

    let stored_checksum = u32::from_be_bytes(
        data[8..12]
            .try_into()
            .map_err(|_| Error::Codec("unreadable checksum".into()))?,
    );
    let declared_len = u64::from_be_bytes(
        data[12..20]
            .try_into()
            .map_err(|_| Error::Codec("unreadable length".into()))?,
    );

    let payload = &data[INTEGRITY_HEADER_SIZE..];
    if declared_len != payload.len() as u64 {
        return Err(Error::Codec(format!(
            "length mismatch: declared {declared_len}, actual {}",
            payload.len()
        )));
    }

    let computed = crc32fast::hash(payload);
    if computed != stored_checksum {
        return Err(Error::Codec(format!(
            "checksum mismatch: stored {stored_checksum:#010x}, computed {computed:#010x}"
        )));
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: &[u8; 4] = b"TEST";

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let payload = b"some payload bytes";
        let framed = wrap(MAGIC, 1, payload);
        let recovered = unwrap(MAGIC, 1, &framed).unwrap();
        assert_eq!(recovered, payload);
    }

    #[test]
    fn test_unwrap_rejects_wrong_magic() {
        let framed = wrap(MAGIC, 1, b"payload");
        let err = unwrap(b"XXXX", 1, &framed).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_unwrap_rejects_future_version() {
        let framed = wrap(MAGIC, 7, b"payload");
        let err = unwrap(MAGIC, 1, &framed).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_unwrap_detects_corruption() {
        let mut framed = wrap(MAGIC, 1, b"payload bytes here");
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        let err = unwrap(MAGIC, 1, &framed).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_unwrap_detects_truncation() {
        let framed = wrap(MAGIC, 1, b"payload bytes here");
        let err = unwrap(MAGIC, 1, &framed[..framed.len() - 3]).unwrap_err();
        assert!(err.to_string().contains("length"));
    }

    #[test]
    fn test_unwrap_rejects_tiny_file() {
        let err = unwrap(MAGIC, 1, b"abc").unwrap_err();
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Sample {
            name: String,
            count: u64,
        }
        let value = Sample {
            name: "entry".into(),
            count: 42,
        };
        let bytes = encode(&value).unwrap();
        let decoded: Sample = decode(&bytes).unwrap();
        assert_eq!(value, decoded);
    }
}
