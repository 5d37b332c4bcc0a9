//! Sequential writer for a new data file.
//!
//! The writer appends item frames at the end of the file and hands back
//! each item's [`DataLocation`]. Sealing writes the metadata footer,
//! fsyncs the file and its directory, and marks the file read-only; after
//! that every append fails with `IllegalState`.
//!
//! A writer is not synchronized. The store serializes appends.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::location::{DataLocation, MAX_OFFSET};
use super::metadata::{DataFileMetadata, FOOTER_SIZE};
use super::ITEM_FIELD;
use crate::encoding::{put_frame_header, MAX_VARINT_LEN};
use crate::error::{Error, Result};

/// Default write buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

pub struct DataFileWriter {
    /// `None` once the file is sealed, discarded or a write failed.
    file: Option<BufWriter<File>>,
    path: PathBuf,
    /// Running metadata: `data_size` is the current end of file.
    metadata: DataFileMetadata,
    /// Prefix of the file known to have left the write buffer.
    flushed: u64,
    /// Scratch space for frame headers.
    header: Vec<u8>,
}

impl DataFileWriter {
    /// Creates a new level-0 data file with the default buffer size.
    pub fn open(path: &Path, file_index: u32) -> Result<Self> {
        Self::open_with(path, file_index, 0, DEFAULT_BUFFER_SIZE)
    }

    /// Creates a new data file. Fails if `path` already exists.
    pub fn open_with(
        path: &Path,
        file_index: u32,
        compaction_level: u32,
        buffer_size: usize,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        tracing::debug!(
            file_index = file_index,
            path = %path.display(),
            compaction_level = compaction_level,
            "Created data file"
        );

        Ok(Self {
            file: Some(BufWriter::with_capacity(buffer_size, file)),
            path: path.to_path_buf(),
            metadata: DataFileMetadata::new(file_index, compaction_level),
            flushed: 0,
            header: Vec::with_capacity(1 + MAX_VARINT_LEN),
        })
    }

    /// Reopens an unsealed file whose first `data_size` bytes hold
    /// `item_count` complete items. Anything past that prefix is cut off.
    pub(crate) fn resume(
        path: &Path,
        file_index: u32,
        data_size: u64,
        item_count: u64,
        buffer_size: usize,
    ) -> Result<Self> {
        let mut permissions = fs::metadata(path)?.permissions();
        if permissions.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
            fs::set_permissions(path, permissions)?;
        }

        let mut file = OpenOptions::new().write(true).open(path)?;
        file.set_len(data_size)?;
        file.seek(SeekFrom::Start(data_size))?;

        let mut metadata = DataFileMetadata::new(file_index, 0);
        metadata.data_size = data_size;
        metadata.item_count = item_count;

        Ok(Self {
            file: Some(BufWriter::with_capacity(buffer_size, file)),
            path: path.to_path_buf(),
            metadata,
            flushed: data_size,
            header: Vec::with_capacity(1 + MAX_VARINT_LEN),
        })
    }

    /// Appends one item and returns its location.
    pub fn append(&mut self, item: &[u8]) -> Result<DataLocation> {
        let file = self.file.as_mut().ok_or_else(|| {
            Error::IllegalState(format!(
                "data file {} is sealed",
                self.metadata.file_index
            ))
        })?;
        if item.len() > u32::MAX as usize {
            return Err(Error::ItemTooLarge {
                size: item.len(),
                limit: u32::MAX as usize,
            });
        }

        let offset = self.metadata.data_size;
        self.header.clear();
        put_frame_header(&mut self.header, ITEM_FIELD, item.len());
        let end = offset + (self.header.len() + item.len()) as u64;
        if end + FOOTER_SIZE as u64 > MAX_OFFSET {
            return Err(Error::IllegalState(format!(
                "data file {} cannot grow past {} bytes",
                self.metadata.file_index, MAX_OFFSET
            )));
        }
        let location = DataLocation::new(self.metadata.file_index, offset)?;

        let written = file
            .write_all(&self.header)
            .and_then(|_| file.write_all(item));
        if let Err(e) = written {
            // The frame may be half written; nothing more can go into this file.
            self.file = None;
            return Err(e.into());
        }

        self.metadata.data_size = end;
        self.metadata.item_count += 1;
        Ok(location)
    }

    /// Pushes buffered bytes to the OS so positioned reads can see them.
    /// Returns the length of the readable prefix.
    pub fn flush(&mut self) -> Result<u64> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            self.flushed = self.metadata.data_size;
        }
        Ok(self.flushed)
    }

    /// Writes the metadata footer, syncs, and marks the file read-only.
    pub fn seal(&mut self) -> Result<DataFileMetadata> {
        let mut file = self.file.take().ok_or_else(|| {
            Error::IllegalState(format!(
                "data file {} is already sealed",
                self.metadata.file_index
            ))
        })?;

        file.write_all(&self.metadata.encode())?;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        let mut permissions = file.metadata()?.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&self.path, permissions)?;
        sync_parent_dir(&self.path)?;

        self.flushed = self.metadata.data_size;

        tracing::info!(
            file_index = self.metadata.file_index,
            items = self.metadata.item_count,
            bytes = self.metadata.file_size(),
            compaction_level = self.metadata.compaction_level,
            "Sealed data file"
        );

        Ok(self.metadata.clone())
    }

    /// Abandons an unsealed file and deletes it.
    pub fn discard(mut self) -> Result<()> {
        self.file.take();
        fs::remove_file(&self.path)?;
        tracing::debug!(
            file_index = self.metadata.file_index,
            "Discarded unsealed data file"
        );
        Ok(())
    }

    pub fn file_index(&self) -> u32 {
        self.metadata.file_index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of item frames written so far.
    pub fn data_size(&self) -> u64 {
        self.metadata.data_size
    }

    pub fn item_count(&self) -> u64 {
        self.metadata.item_count
    }

    /// Length of the prefix visible to positioned reads.
    pub fn flushed_len(&self) -> u64 {
        self.flushed
    }

    pub fn is_sealed(&self) -> bool {
        self.file.is_none()
    }
}

/// Makes the creation or removal of a file in `path`'s directory durable.
pub(crate) fn sync_parent_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)?.sync_all()?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
