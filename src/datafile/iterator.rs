//! Forward-only scan over every item of a sealed data file.
//!
//! Used by recovery, integrity checks and compaction. The iterator is
//! driven with a `while iter.next()? { ... }` loop:
//!
//! ```text
//!  BeforeFirst ──next()=true──▶ Positioned ──next()=true──▶ Positioned ...
//!       │                           │
//!       └────────next()=false───────┴──────▶ AfterLast
//! ```
//!
//! The item bytes live in a scratch buffer that is reused for every item.
//! A slice returned by [`DataFileIterator::item`] is only valid until the
//! next call to `next`, which the borrow checker enforces.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::sync::Arc;

use super::location::DataLocation;
use super::metadata::DataFileMetadata;
use super::reader::DataFileReader;
use super::BlockKind;
use crate::encoding::{read_len_prefixed_into, read_tag, read_varint};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    BeforeFirst,
    Positioned,
    AfterLast,
}

pub struct DataFileIterator {
    /// Keeps the file reserved while the scan runs.
    file: Arc<DataFileReader>,
    input: BufReader<File>,
    position: u64,
    buffer: Vec<u8>,
    location: DataLocation,
    items_read: u64,
    state: State,
}

impl DataFileIterator {
    pub fn new(file: Arc<DataFileReader>, buffer_size: usize) -> Result<Self> {
        let input = BufReader::with_capacity(buffer_size, File::open(file.path())?);
        Ok(Self {
            file,
            input,
            position: 0,
            buffer: Vec::new(),
            location: DataLocation::NONE,
            items_read: 0,
            state: State::BeforeFirst,
        })
    }

    /// Advances to the next item. Returns `false` once the end of the file
    /// is reached, after checking that the number of items seen matches
    /// the count recorded in the metadata.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool> {
        if self.state == State::AfterLast {
            return Ok(false);
        }

        let metadata = self.file.metadata();
        let file_len = metadata.file_size();
        while self.position < file_len {
            let frame_start = self.position;
            let (tag, tag_len) = read_tag(&mut self.input).map_err(|e| self.corrupt(e, frame_start))?;
            self.position += tag_len as u64;

            match BlockKind::classify(tag).map_err(|e| self.corrupt(e, frame_start))? {
                BlockKind::Item => {
                    if frame_start >= metadata.data_size {
                        return Err(Error::corrupt(
                            self.file.path(),
                            frame_start,
                            "data item found after the data section",
                        ));
                    }
                    let remaining = metadata.data_size - self.position;
                    let consumed =
                        read_len_prefixed_into(&mut self.input, remaining, &mut self.buffer)
                            .map_err(|e| self.corrupt(e, frame_start))?;
                    self.position += consumed;
                    self.location = DataLocation::new(metadata.file_index, frame_start)?;
                    self.items_read += 1;
                    self.state = State::Positioned;
                    return Ok(true);
                }
                BlockKind::Metadata => {
                    let (len, len_len) =
                        read_varint(&mut self.input).map_err(|e| self.corrupt(e, frame_start))?;
                    self.position += len_len as u64;
                    if len > file_len - self.position {
                        return Err(Error::corrupt(
                            self.file.path(),
                            frame_start,
                            format!("metadata block declares {} bytes past end of file", len),
                        ));
                    }
                    let skipped = io::copy(&mut (&mut self.input).take(len), &mut io::sink())?;
                    if skipped != len {
                        return Err(Error::corrupt(
                            self.file.path(),
                            self.position + skipped,
                            "unexpected end of file inside metadata block",
                        ));
                    }
                    self.position += len;
                }
            }
        }

        self.state = State::AfterLast;
        self.buffer.clear();
        if self.items_read != metadata.item_count {
            return Err(Error::corrupt(
                self.file.path(),
                self.position,
                format!(
                    "metadata records {} items but the file holds {}",
                    metadata.item_count, self.items_read
                ),
            ));
        }
        Ok(false)
    }

    /// Bytes of the current item, or `None` outside the positioned state.
    pub fn item(&self) -> Option<&[u8]> {
        match self.state {
            State::Positioned => Some(&self.buffer),
            _ => None,
        }
    }

    /// Location of the current item, or `None` outside the positioned state.
    pub fn location(&self) -> Option<DataLocation> {
        match self.state {
            State::Positioned => Some(self.location),
            _ => None,
        }
    }

    pub fn metadata(&self) -> &DataFileMetadata {
        self.file.metadata()
    }

    /// Items yielded so far.
    pub fn items_read(&self) -> u64 {
        self.items_read
    }

    fn corrupt(&self, err: Error, offset: u64) -> Error {
        err.at_file(self.file.path(), offset)
    }
}
