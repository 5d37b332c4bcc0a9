//! Unsigned LEB128 varints, the integer encoding used by every tag and
//! length prefix in a data file.

use std::io::Read;

use byteorder::ReadBytesExt;

use crate::error::{Error, Result};

/// A u64 never needs more than ten 7-bit groups.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends `value` to `buf` as a varint.
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Number of bytes `put_varint` writes for `value`.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Decodes a varint from the front of `buf`, returning the value and the
/// number of bytes consumed.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        value |= accumulate(*byte, i)?;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        Err(Error::MalformedFrame("varint longer than 10 bytes".to_string()))
    } else {
        Err(Error::MalformedFrame("truncated varint".to_string()))
    }
}

/// Reads a varint from a byte stream. A stream that ends before the first
/// byte yields an `UnexpectedEof` I/O error.
pub fn read_varint<R: Read>(reader: &mut R) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8()?;
        value |= accumulate(byte, i)?;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::MalformedFrame("varint longer than 10 bytes".to_string()))
}

fn accumulate(byte: u8, position: usize) -> Result<u64> {
    let group = (byte & 0x7f) as u64;
    // The tenth byte may only carry the single remaining bit.
    if position == MAX_VARINT_LEN - 1 && group > 1 {
        return Err(Error::MalformedFrame("varint overflows u64".to_string()));
    }
    Ok(group << (7 * position))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_known_encodings() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (300, &[0xac, 0x02]),
            (16_384, &[0x80, 0x80, 0x01]),
        ];
        for (value, expected) in cases {
            let mut buf = Vec::new();
            put_varint(&mut buf, *value);
            assert_eq!(buf.as_slice(), *expected, "encoding of {}", value);
            assert_eq!(varint_len(*value), expected.len());
            assert_eq!(decode_varint(&buf).unwrap(), (*value, expected.len()));
        }
    }

    #[test]
    fn test_max_value() {
        let mut buf = Vec::new();
        put_varint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
        assert_eq!(varint_len(u64::MAX), MAX_VARINT_LEN);
        assert_eq!(decode_varint(&buf).unwrap(), (u64::MAX, MAX_VARINT_LEN));

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_varint(&mut cursor).unwrap(), (u64::MAX, MAX_VARINT_LEN));
    }

    #[test]
    fn test_truncated_varint() {
        let err = decode_varint(&[0x80, 0x80]).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));

        let mut cursor = Cursor::new(vec![0x80u8, 0x80]);
        match read_varint(&mut cursor).unwrap_err() {
            Error::IoError(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_overflowing_varint() {
        let buf = [0xff; 11];
        assert!(matches!(decode_varint(&buf), Err(Error::MalformedFrame(_))));

        let mut buf = vec![0xff; 9];
        buf.push(0x02);
        assert!(matches!(decode_varint(&buf), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let (value, consumed) = decode_varint(&[0xac, 0x02, 0xff, 0xff]).unwrap();
        assert_eq!(value, 300);
        assert_eq!(consumed, 2);
    }
}
