//! Base-128 varint encoding for wire length prefixes.
//!
//! Little-endian variable-length encoding where small values use fewer bytes:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - etc.
//!
//! The high bit of each byte is the continuation flag; the low seven bits
//! carry the value, least-significant group first. The only varint on the
//! wire is the payload length prefix, so a varint that overflows 64 bits is
//! reported as [`PushError::InvalidLength`].

#![allow(missing_docs)]

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{PushError, Result};

/// Append a variable-length integer to a `Vec<u8>`
pub fn write_varint_vec(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80; // Set continuation bit
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read a variable-length integer from an async stream
pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                PushError::TruncatedStream("length prefix".to_string())
            }
            _ => PushError::Io(e),
        })?;

        result |= u64::from(byte & 0x7F) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
        if shift >= 64 {
            return Err(PushError::InvalidLength(result));
        }
    }

    Ok(result)
}

/// Read a variable-length integer from a byte slice, returning (value, bytes_consumed)
pub fn read_varint_slice(data: &[u8]) -> Result<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut pos = 0;

    loop {
        if pos >= data.len() {
            return Err(PushError::TruncatedStream("length prefix".to_string()));
        }

        let byte = data[pos];
        pos += 1;

        result |= u64::from(byte & 0x7F) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
        if shift >= 64 {
            return Err(PushError::InvalidLength(result));
        }
    }

    Ok((result, pos))
}

/// Calculate the number of bytes needed to encode a value as a varint
pub fn varint_size(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    let bits = 64 - value.leading_zeros() as usize;
    (bits + 6) / 7 // Ceiling division by 7
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_varint_small() {
        let mut buf = Vec::new();
        write_varint_vec(&mut buf, 0);
        assert_eq!(buf, vec![0x00]);

        buf.clear();
        write_varint_vec(&mut buf, 127);
        assert_eq!(buf, vec![0x7F]);

        buf.clear();
        write_varint_vec(&mut buf, 1);
        assert_eq!(buf, vec![1]);
    }

    #[test]
    fn test_varint_medium() {
        let mut buf = Vec::new();
        write_varint_vec(&mut buf, 128);
        assert_eq!(buf, vec![0x80, 0x01]);

        buf.clear();
        write_varint_vec(&mut buf, 300);
        assert_eq!(buf, vec![0xAC, 0x02]);
    }

    #[tokio::test]
    async fn test_varint_roundtrip() {
        let test_values = [
            0,
            1,
            127,
            128,
            255,
            256,
            16383,
            16384,
            2097151,
            2097152,
            u64::MAX,
        ];

        for &value in &test_values {
            let mut buf = Vec::new();
            write_varint_vec(&mut buf, value);

            let mut cursor = Cursor::new(buf.clone());
            let decoded = read_varint(&mut cursor).await.unwrap();
            assert_eq!(value, decoded, "Roundtrip failed for value {}", value);

            let (sliced, consumed) = read_varint_slice(&buf).unwrap();
            assert_eq!(value, sliced);
            assert_eq!(consumed, buf.len());
        }
    }

    #[tokio::test]
    async fn test_varint_truncated() {
        // Continuation bit set but no following byte.
        let mut cursor = Cursor::new(vec![0x80u8]);
        let err = read_varint(&mut cursor).await.unwrap_err();
        assert!(matches!(err, PushError::TruncatedStream(_)));

        let err = read_varint_slice(&[0x80]).unwrap_err();
        assert!(matches!(err, PushError::TruncatedStream(_)));
    }

    #[test]
    fn test_varint_overflow() {
        // Eleven continuation bytes exceed the 64-bit value range.
        let overlong = [0xFFu8; 11];
        let err = read_varint_slice(&overlong).unwrap_err();
        assert!(matches!(err, PushError::InvalidLength(_)));
    }

    #[test]
    fn test_varint_slice_with_trailing_data() {
        let mut buf = Vec::new();
        write_varint_vec(&mut buf, 12345);
        buf.extend_from_slice(b"extra data");

        let (value, consumed) = read_varint_slice(&buf).unwrap();
        assert_eq!(value, 12345);
        assert!(consumed < buf.len());
    }

    #[test]
    fn test_varint_size() {
        assert_eq!(varint_size(0), 1);
        assert_eq!(varint_size(127), 1);
        assert_eq!(varint_size(128), 2);
        assert_eq!(varint_size(16383), 2);
        assert_eq!(varint_size(16384), 3);
    }
}
