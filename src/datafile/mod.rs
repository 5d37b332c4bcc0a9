//! Append-only data files.
//!
//! A data file is written once, front to back, by a single
//! [`DataFileWriter`], then sealed and from that point on only read: at
//! random through a [`DataFileReader`] or front to back through a
//! [`DataFileIterator`].
//!
//! ## File Format
//!
//! ```text
//! +-----------------------------+
//! | 0x5A | len | item bytes     |  ← data item, field 11
//! +-----------------------------+
//! | 0x5A | len | item bytes     |
//! +-----------------------------+
//! | ...                         |
//! +-----------------------------+
//! | 0x0A | 52  | metadata       |  ← metadata block, field 1, FOOTER_SIZE bytes
//! +-----------------------------+
//! ```
//!
//! Items are opaque to this layer. Their address is the [`DataLocation`]
//! of the first byte of their frame. A file without a valid footer was
//! never sealed, usually because the process died while writing it.

pub mod iterator;
pub mod location;
pub mod metadata;
pub mod reader;
pub mod writer;

use std::path::{Path, PathBuf};

use crate::encoding::{Tag, WireType};
use crate::error::{Error, Result};

pub use iterator::DataFileIterator;
pub use location::DataLocation;
pub use metadata::{DataFileMetadata, FOOTER_SIZE};
pub use reader::DataFileReader;
pub use writer::DataFileWriter;

/// Field number of the metadata block.
pub const METADATA_FIELD: u32 = 1;

/// Field number of data item blocks.
pub const ITEM_FIELD: u32 = 11;

pub const FILE_EXTENSION: &str = "df";

/// Suffix of compaction output that has not been published yet.
pub const TEMP_EXTENSION: &str = "tmp";

/// The kinds of block a data file may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Item,
    Metadata,
}

impl BlockKind {
    /// Classifies a decoded tag. Anything but the two known blocks is a
    /// format violation.
    pub fn classify(tag: Tag) -> Result<Self> {
        match (tag.field, tag.wire) {
            (ITEM_FIELD, WireType::LengthDelimited) => Ok(BlockKind::Item),
            (METADATA_FIELD, WireType::LengthDelimited) => Ok(BlockKind::Metadata),
            (field, wire) => Err(Error::MalformedFrame(format!(
                "unknown data file block: field {} ({:?})",
                field, wire
            ))),
        }
    }
}

/// Path of the data file with the given index inside `dir`.
pub fn file_path(dir: &Path, file_index: u32) -> PathBuf {
    dir.join(format!("{:08}.{}", file_index, FILE_EXTENSION))
}

/// Path a compaction output is written under until it is published.
pub fn temp_file_path(dir: &Path, file_index: u32) -> PathBuf {
    dir.join(format!("{:08}.{}.{}", file_index, FILE_EXTENSION, TEMP_EXTENSION))
}

/// Parses the file index out of an unpublished compaction output name.
pub fn parse_temp_file_index(path: &Path) -> Option<u32> {
    if path.extension()? != TEMP_EXTENSION {
        return None;
    }
    parse_file_index(Path::new(path.file_stem()?))
}

/// Parses the file index out of a data file name, or `None` for any other file.
pub fn parse_file_index(path: &Path) -> Option<u32> {
    if path.extension()? != FILE_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_naming() {
        let path = file_path(Path::new("/data"), 7);
        assert_eq!(path, PathBuf::from("/data/00000007.df"));
        assert_eq!(parse_file_index(&path), Some(7));
        assert_eq!(parse_file_index(Path::new("/data/datafiles.lock")), None);
        assert_eq!(parse_file_index(Path::new("/data/abc.df")), None);

        let temp = temp_file_path(Path::new("/data"), 7);
        assert_eq!(temp, PathBuf::from("/data/00000007.df.tmp"));
        assert_eq!(parse_file_index(&temp), None);
        assert_eq!(parse_temp_file_index(&temp), Some(7));
        assert_eq!(parse_temp_file_index(&path), None);
        assert_eq!(parse_temp_file_index(Path::new("/data/notes.tmp")), None);
    }

    #[test]
    fn test_classify() {
        let item = Tag::new(ITEM_FIELD, WireType::LengthDelimited);
        let meta = Tag::new(METADATA_FIELD, WireType::LengthDelimited);
        assert_eq!(BlockKind::classify(item).unwrap(), BlockKind::Item);
        assert_eq!(BlockKind::classify(meta).unwrap(), BlockKind::Metadata);
        assert!(BlockKind::classify(Tag::new(2, WireType::LengthDelimited)).is_err());
        assert!(BlockKind::classify(Tag::new(ITEM_FIELD, WireType::Varint)).is_err());
    }
}
