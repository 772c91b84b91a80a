//! Variable-length integer encoding.
//!
//! 7 bits per byte, least significant group first, high bit set on every
//! byte except the last.

use crate::error::{HalberdError, Result};

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80;
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Decode a u64 value; returns the value and the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(HalberdError::other("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, i + 1));
        }

        shift += 7;
    }

    Err(HalberdError::other("Incomplete VarInt"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_u64() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX];

        for &value in &test_values {
            let encoded = encode_u64(value);
            let (decoded, bytes_read) = decode_u64(&encoded).unwrap();

            assert_eq!(value, decoded);
            assert_eq!(encoded.len(), bytes_read);
        }
    }

    #[test]
    fn test_encoding_efficiency() {
        assert_eq!(encode_u64(0).len(), 1);
        assert_eq!(encode_u64(127).len(), 1);
        assert_eq!(encode_u64(128).len(), 2);
        assert_eq!(encode_u64(16384).len(), 3);
        assert_eq!(encode_u64(u64::MAX).len(), 10);
    }

    #[test]
    fn test_incomplete_and_overflow() {
        assert!(decode_u64(&[0x80]).is_err());
        assert!(decode_u64(&[0xFF; 11]).is_err());
    }
}
