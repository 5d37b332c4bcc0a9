//! Tags and length-prefixed frames.
//!
//! A tag packs a field number and a wire type into one varint,
//! `(field << 3) | wire`. A length-delimited frame is a tag, a varint
//! payload length, and exactly that many payload bytes.

use std::io::Read;

use super::varint::{decode_varint, put_varint, read_varint, varint_len};
use crate::error::{Error, Result};

/// Largest field number representable in a tag.
pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

impl TryFrom<u8> for WireType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(Error::MalformedFrame(format!(
                "unsupported wire type {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub field: u32,
    pub wire: WireType,
}

impl Tag {
    pub const fn new(field: u32, wire: WireType) -> Self {
        Self { field, wire }
    }

    /// The raw varint value of this tag.
    pub const fn value(&self) -> u64 {
        ((self.field as u64) << 3) | self.wire as u64
    }

    pub fn from_value(value: u64) -> Result<Self> {
        let wire = WireType::try_from((value & 0x7) as u8)?;
        let field = value >> 3;
        if field == 0 || field > MAX_FIELD_NUMBER as u64 {
            return Err(Error::MalformedFrame(format!(
                "invalid field number {}",
                field
            )));
        }
        Ok(Self {
            field: field as u32,
            wire,
        })
    }

    /// Encoded size of this tag in bytes.
    pub fn encoded_len(&self) -> usize {
        varint_len(self.value())
    }
}

/// Encodes a tag as its varint bytes.
pub fn encode_tag(field: u32, wire: WireType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    put_varint(&mut buf, Tag::new(field, wire).value());
    buf
}

/// Decodes a tag from the front of `bytes`, returning it with the number of
/// bytes consumed.
pub fn decode_tag(bytes: &[u8]) -> Result<(Tag, usize)> {
    let (value, consumed) = decode_varint(bytes)?;
    Ok((Tag::from_value(value)?, consumed))
}

/// Reads a tag from a byte stream.
pub fn read_tag<R: Read>(reader: &mut R) -> Result<(Tag, usize)> {
    let (value, consumed) = read_varint(reader)?;
    Ok((Tag::from_value(value)?, consumed))
}

/// Appends the tag and length prefix of a length-delimited frame.
pub fn put_frame_header(buf: &mut Vec<u8>, field: u32, payload_len: usize) {
    put_varint(buf, Tag::new(field, WireType::LengthDelimited).value());
    put_varint(buf, payload_len as u64);
}

/// Size of a complete length-delimited frame carrying `payload_len` bytes.
pub fn frame_len(field: u32, payload_len: usize) -> usize {
    Tag::new(field, WireType::LengthDelimited).encoded_len()
        + varint_len(payload_len as u64)
        + payload_len
}

/// Encodes a complete length-delimited frame.
pub fn encode_len_prefixed(field: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame_len(field, payload.len()));
    put_frame_header(&mut buf, field, payload.len());
    buf.extend_from_slice(payload);
    buf
}

/// Reads a varint length followed by that many bytes. `remaining` is the
/// number of bytes left in the enclosing region; a declared length that
/// does not fit is a malformed frame.
pub fn decode_len_prefixed<R: Read>(reader: &mut R, remaining: u64) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    read_len_prefixed_into(reader, remaining, &mut payload)?;
    Ok(payload)
}

/// Like `decode_len_prefixed`, but fills a caller-owned buffer so it can be
/// reused across frames. Returns the number of bytes consumed, length
/// prefix included.
pub fn read_len_prefixed_into<R: Read>(
    reader: &mut R,
    remaining: u64,
    payload: &mut Vec<u8>,
) -> Result<u64> {
    let (len, prefix_len) = read_varint(reader)?;
    let available = remaining.saturating_sub(prefix_len as u64);
    if len > available {
        return Err(Error::MalformedFrame(format!(
            "declared length {} exceeds remaining {} bytes",
            len, available
        )));
    }
    payload.resize(len as usize, 0);
    reader.read_exact(payload)?;
    Ok(prefix_len as u64 + len)
}
