//! The metadata block written as a fixed-size footer when a file is sealed.
//!
//! ```text
//! +------+-----+---------------------------------------------------------+
//! | 0x0A | 52  | payload                                                 |
//! +------+-----+---------------------------------------------------------+
//!                 field 1 magic            fixed32
//!                 field 2 format version   fixed32
//!                 field 3 file index       fixed32
//!                 field 4 created (millis) fixed64
//!                 field 5 item count       fixed64
//!                 field 6 data size        fixed64
//!                 field 7 compaction level fixed32
//!                 field 8 crc32c           fixed32  (over the payload before it)
//! ```
//!
//! Every field is fixed width, so the block is always `FOOTER_SIZE` bytes
//! and sits at `file_len - FOOTER_SIZE`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};

use super::METADATA_FIELD;
use crate::encoding::{decode_tag, decode_varint, put_frame_header, put_varint, Tag, WireType};
use crate::error::{Error, Result};

pub const MAGIC: u32 = 0x4c44_4631; // "LDF1"
pub const FORMAT_VERSION: u32 = 1;

const PAYLOAD_SIZE: usize = 52;

/// Size of the metadata block including its tag and length prefix.
pub const FOOTER_SIZE: usize = PAYLOAD_SIZE + 2;

/// Block header plus the magic field.
pub(crate) const FOOTER_SIGNATURE_LEN: usize = 7;

const FIELD_MAGIC: u32 = 1;
const FIELD_VERSION: u32 = 2;
const FIELD_INDEX: u32 = 3;
const FIELD_CREATED: u32 = 4;
const FIELD_ITEM_COUNT: u32 = 5;
const FIELD_DATA_SIZE: u32 = 6;
const FIELD_LEVEL: u32 = 7;
const FIELD_CHECKSUM: u32 = 8;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Per-file record stored in the footer of every sealed data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileMetadata {
    pub file_index: u32,
    /// Creation time in milliseconds since the Unix epoch
    pub created_millis: u64,
    pub item_count: u64,
    /// Bytes of item frames preceding the footer
    pub data_size: u64,
    pub compaction_level: u32,
}

impl DataFileMetadata {
    pub fn new(file_index: u32, compaction_level: u32) -> Self {
        Self {
            file_index,
            created_millis: now_millis(),
            item_count: 0,
            data_size: 0,
            compaction_level,
        }
    }

    /// Total size of the sealed file on disk.
    pub fn file_size(&self) -> u64 {
        self.data_size + FOOTER_SIZE as u64
    }

    pub fn created(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.created_millis)
    }

    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        put_frame_header(&mut buf, METADATA_FIELD, PAYLOAD_SIZE);
        let payload_start = buf.len();

        put_fixed32(&mut buf, FIELD_MAGIC, MAGIC);
        put_fixed32(&mut buf, FIELD_VERSION, FORMAT_VERSION);
        put_fixed32(&mut buf, FIELD_INDEX, self.file_index);
        put_fixed64(&mut buf, FIELD_CREATED, self.created_millis);
        put_fixed64(&mut buf, FIELD_ITEM_COUNT, self.item_count);
        put_fixed64(&mut buf, FIELD_DATA_SIZE, self.data_size);
        put_fixed32(&mut buf, FIELD_LEVEL, self.compaction_level);
        let checksum = CASTAGNOLI.checksum(&buf[payload_start..]);
        put_fixed32(&mut buf, FIELD_CHECKSUM, checksum);

        let mut footer = [0u8; FOOTER_SIZE];
        footer.copy_from_slice(&buf);
        footer
    }

    /// Decodes a footer. Any deviation from the expected layout is reported
    /// as a malformed frame.
    pub fn decode(footer: &[u8]) -> Result<Self> {
        let (tag, tag_len) = decode_tag(footer)?;
        if tag != Tag::new(METADATA_FIELD, WireType::LengthDelimited) {
            return Err(Error::MalformedFrame(format!(
                "expected metadata block, found field {} ({:?})",
                tag.field, tag.wire
            )));
        }
        let (len, len_len) = decode_varint(&footer[tag_len..])?;
        let payload = &footer[tag_len + len_len..];
        if len as usize != PAYLOAD_SIZE || payload.len() != PAYLOAD_SIZE {
            return Err(Error::MalformedFrame(format!(
                "metadata block declares {} bytes, {} present",
                len,
                payload.len()
            )));
        }

        let mut fields = Fields::default();
        let mut pos = 0;
        while pos < payload.len() {
            let field_start = pos;
            let (tag, consumed) = decode_tag(&payload[pos..])?;
            pos += consumed;
            let value = match tag.wire {
                WireType::Fixed32 => {
                    let bytes = take(payload, pos, 4)?;
                    pos += 4;
                    LittleEndian::read_u32(bytes) as u64
                }
                WireType::Fixed64 => {
                    let bytes = take(payload, pos, 8)?;
                    pos += 8;
                    LittleEndian::read_u64(bytes)
                }
                other => {
                    return Err(Error::MalformedFrame(format!(
                        "metadata field {} has unexpected wire type {:?}",
                        tag.field, other
                    )))
                }
            };
            if tag.field == FIELD_CHECKSUM {
                let expected = CASTAGNOLI.checksum(&payload[..field_start]);
                if value as u32 != expected || pos != payload.len() {
                    return Err(Error::MalformedFrame(
                        "metadata checksum mismatch".to_string(),
                    ));
                }
                fields.checksummed = true;
            } else {
                fields.set(tag, value)?;
            }
        }
        fields.finish()
    }
}

#[derive(Default)]
struct Fields {
    magic: Option<u32>,
    version: Option<u32>,
    index: Option<u32>,
    created: Option<u64>,
    item_count: Option<u64>,
    data_size: Option<u64>,
    level: Option<u32>,
    checksummed: bool,
}

impl Fields {
    fn set(&mut self, tag: Tag, value: u64) -> Result<()> {
        let expected = match tag.field {
            FIELD_MAGIC | FIELD_VERSION | FIELD_INDEX | FIELD_LEVEL => WireType::Fixed32,
            FIELD_CREATED | FIELD_ITEM_COUNT | FIELD_DATA_SIZE => WireType::Fixed64,
            other => {
                return Err(Error::MalformedFrame(format!(
                    "unknown metadata field {}",
                    other
                )))
            }
        };
        if tag.wire != expected {
            return Err(Error::MalformedFrame(format!(
                "metadata field {} has wire type {:?}, expected {:?}",
                tag.field, tag.wire, expected
            )));
        }
        match tag.field {
            FIELD_MAGIC => self.magic = Some(value as u32),
            FIELD_VERSION => self.version = Some(value as u32),
            FIELD_INDEX => self.index = Some(value as u32),
            FIELD_CREATED => self.created = Some(value),
            FIELD_ITEM_COUNT => self.item_count = Some(value),
            FIELD_DATA_SIZE => self.data_size = Some(value),
            _ => self.level = Some(value as u32),
        }
        Ok(())
    }

    fn finish(self) -> Result<DataFileMetadata> {
        if !self.checksummed {
            return Err(Error::MalformedFrame(
                "metadata checksum missing".to_string(),
            ));
        }
        match self.magic {
            Some(MAGIC) => {}
            other => {
                return Err(Error::MalformedFrame(format!(
                    "bad magic {:#x?}",
                    other
                )))
            }
        }
        match self.version {
            Some(FORMAT_VERSION) => {}
            other => {
                return Err(Error::MalformedFrame(format!(
                    "unsupported format version {:?}",
                    other
                )))
            }
        }
        match (
            self.index,
            self.created,
            self.item_count,
            self.data_size,
            self.level,
        ) {
            (Some(file_index), Some(created_millis), Some(item_count), Some(data_size), Some(level)) => {
                Ok(DataFileMetadata {
                    file_index,
                    created_millis,
                    item_count,
                    data_size,
                    compaction_level: level,
                })
            }
            _ => Err(Error::MalformedFrame(
                "metadata block is missing fields".to_string(),
            )),
        }
    }
}

/// Whether `bytes` starts the way every metadata block does: the block
/// header followed by the magic field. Holds even when later fields or the
/// checksum are damaged.
pub(crate) fn has_footer_signature(bytes: &[u8]) -> bool {
    let mut signature = Vec::with_capacity(FOOTER_SIGNATURE_LEN);
    put_frame_header(&mut signature, METADATA_FIELD, PAYLOAD_SIZE);
    put_fixed32(&mut signature, FIELD_MAGIC, MAGIC);
    bytes.starts_with(&signature)
}

fn put_fixed32(buf: &mut Vec<u8>, field: u32, value: u32) {
    put_varint(buf, Tag::new(field, WireType::Fixed32).value());
    let mut bytes = [0u8; 4];
    LittleEndian::write_u32(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

fn put_fixed64(buf: &mut Vec<u8>, field: u32, value: u64) {
    put_varint(buf, Tag::new(field, WireType::Fixed64).value());
    let mut bytes = [0u8; 8];
    LittleEndian::write_u64(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

fn take(payload: &[u8], pos: usize, len: usize) -> Result<&[u8]> {
    payload
        .get(pos..pos + len)
        .ok_or_else(|| Error::MalformedFrame("metadata field truncated".to_string()))
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
