use std::fmt;

use crate::error::{Error, Result};

/// Bits of a location that hold the byte offset.
pub const OFFSET_BITS: u32 = 40;

/// Largest byte offset a location can carry.
pub const MAX_OFFSET: u64 = (1 << OFFSET_BITS) - 1;

/// Largest file index a location can carry. One index value is lost to the
/// `+ 1` that keeps the raw value `0` free.
pub const MAX_FILE_INDEX: u32 = (1 << (64 - OFFSET_BITS)) - 2;

/// Address of one item: the index of the data file holding it and the byte
/// offset at which its frame begins.
///
/// Packed into a u64 as `((file_index + 1) << 40) | offset`, so the raw
/// value `0` never names a real item and can mark an empty index slot.
/// A location only means something to the store that issued it, and it
/// dangles once compaction deletes its file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataLocation(u64);

impl DataLocation {
    /// The "no location" value.
    pub const NONE: DataLocation = DataLocation(0);

    pub fn new(file_index: u32, offset: u64) -> Result<Self> {
        if file_index > MAX_FILE_INDEX {
            return Err(Error::IllegalState(format!(
                "file index {} exceeds {}",
                file_index, MAX_FILE_INDEX
            )));
        }
        if offset > MAX_OFFSET {
            return Err(Error::IllegalState(format!(
                "offset {} exceeds {}",
                offset, MAX_OFFSET
            )));
        }
        Ok(Self(((file_index as u64 + 1) << OFFSET_BITS) | offset))
    }

    /// Reinterprets a raw value previously produced by `as_u64`.
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub const fn file_index(&self) -> u32 {
        ((self.0 >> OFFSET_BITS) as u32).wrapping_sub(1)
    }

    pub const fn offset(&self) -> u64 {
        self.0 & MAX_OFFSET
    }
}

impl fmt::Debug for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "DataLocation(none)")
        } else {
            write!(f, "DataLocation({}@{})", self.file_index(), self.offset())
        }
    }
}

impl fmt::Display for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.file_index(), self.offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack() {
        let loc = DataLocation::new(0, 0).unwrap();
        assert!(!loc.is_none());
        assert_eq!(loc.file_index(), 0);
        assert_eq!(loc.offset(), 0);
        assert_eq!(loc.as_u64(), 1 << 40);

        let loc = DataLocation::new(MAX_FILE_INDEX, MAX_OFFSET).unwrap();
        assert_eq!(loc.file_index(), MAX_FILE_INDEX);
        assert_eq!(loc.offset(), MAX_OFFSET);
        assert_eq!(loc.as_u64(), u64::MAX);

        let loc = DataLocation::new(17, 4096).unwrap();
        assert_eq!(DataLocation::from_u64(loc.as_u64()), loc);
        assert_eq!(loc.to_string(), "17@4096");
    }

    #[test]
    fn test_out_of_range() {
        assert!(DataLocation::new(MAX_FILE_INDEX + 1, 0).is_err());
        assert!(DataLocation::new(0, MAX_OFFSET + 1).is_err());
    }

    #[test]
    fn test_ordering_follows_file_then_offset() {
        let a = DataLocation::new(1, 900).unwrap();
        let b = DataLocation::new(2, 10).unwrap();
        let c = DataLocation::new(2, 11).unwrap();
        assert!(DataLocation::NONE < a);
        assert!(a < b && b < c);
    }
}
