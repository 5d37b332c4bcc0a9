//! Random-access reads from a sealed data file.
//!
//! Every read is a positioned read at the caller's offset; the reader keeps
//! no cursor, so one reader can serve any number of threads at once.
//!
//! Readers are shared as `Arc<DataFileReader>`. Each strong reference is a
//! reservation on the file: a file marked for deletion is unlinked only
//! when its last reservation is released.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::location::DataLocation;
use super::metadata::{DataFileMetadata, FOOTER_SIZE};
use super::{parse_file_index, BlockKind};
use crate::encoding::{decode_tag, decode_varint, MAX_VARINT_LEN};
use crate::error::{Error, Result};

/// Longest possible tag plus length prefix.
const MAX_FRAME_HEADER: usize = 5 + MAX_VARINT_LEN;

pub struct DataFileReader {
    file: File,
    path: PathBuf,
    metadata: DataFileMetadata,
    delete_on_release: AtomicBool,
}

impl DataFileReader {
    /// Opens a sealed data file and validates its metadata footer.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_SIZE as u64 {
            return Err(Error::corrupt(
                path,
                0,
                format!("{} bytes is too short for a metadata footer", file_len),
            ));
        }

        let footer_offset = file_len - FOOTER_SIZE as u64;
        let mut footer = [0u8; FOOTER_SIZE];
        read_exact_at(&file, &mut footer, footer_offset)
            .map_err(|e| Error::from(e).at_file(path, footer_offset))?;
        let metadata =
            DataFileMetadata::decode(&footer).map_err(|e| e.at_file(path, footer_offset))?;

        if metadata.data_size != footer_offset {
            return Err(Error::corrupt(
                path,
                footer_offset,
                format!(
                    "metadata records {} data bytes, file holds {}",
                    metadata.data_size, footer_offset
                ),
            ));
        }
        if let Some(named) = parse_file_index(path) {
            if named != metadata.file_index {
                return Err(Error::corrupt(
                    path,
                    footer_offset,
                    format!(
                        "file is named for index {} but metadata says {}",
                        named, metadata.file_index
                    ),
                ));
            }
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            metadata,
            delete_on_release: AtomicBool::new(false),
        })
    }

    /// Reads the item whose frame starts at `offset`.
    pub fn read(&self, offset: u64) -> Result<Vec<u8>> {
        read_item(&self.file, &self.path, offset, self.metadata.data_size)
    }

    /// Reads the item at `location`, which must belong to this file.
    pub fn read_location(&self, location: DataLocation) -> Result<Vec<u8>> {
        if location.file_index() != self.metadata.file_index {
            return Err(Error::IllegalState(format!(
                "location {} does not belong to data file {}",
                location, self.metadata.file_index
            )));
        }
        self.read(location.offset())
    }

    pub fn metadata(&self) -> &DataFileMetadata {
        &self.metadata
    }

    pub fn file_index(&self) -> u32 {
        self.metadata.file_index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the file once the last reservation is released.
    pub fn mark_for_deletion(&self) {
        self.delete_on_release.store(true, Ordering::SeqCst);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.delete_on_release.load(Ordering::SeqCst)
    }

    /// Number of outstanding reservations, this one included.
    pub fn reservations(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }
}

impl Drop for DataFileReader {
    fn drop(&mut self) {
        if !self.is_marked_for_deletion() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::info!(
                file_index = self.metadata.file_index,
                path = %self.path.display(),
                "Deleted retired data file"
            ),
            Err(e) => tracing::warn!(
                file_index = self.metadata.file_index,
                error = %e,
                "Failed to delete retired data file"
            ),
        }
    }
}

/// Read-only view of the file currently being written. Reads are bounded
/// by the prefix the writer has flushed.
pub(crate) struct UnsealedReader {
    file: File,
    path: PathBuf,
}

impl UnsealedReader {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn read(&self, offset: u64, end: u64) -> Result<Vec<u8>> {
        read_item(&self.file, &self.path, offset, end)
    }
}

/// Reads one item frame at `offset`, never looking at bytes at or past `end`.
fn read_item(file: &File, path: &Path, offset: u64, end: u64) -> Result<Vec<u8>> {
    if offset >= end {
        return Err(Error::corrupt(
            path,
            offset,
            format!("offset is outside the {} byte data section", end),
        ));
    }

    let header_len = MAX_FRAME_HEADER.min((end - offset) as usize);
    let mut header = [0u8; MAX_FRAME_HEADER];
    read_exact_at(file, &mut header[..header_len], offset)
        .map_err(|e| Error::from(e).at_file(path, offset))?;
    let header = &header[..header_len];

    let (tag, tag_len) = decode_tag(header).map_err(|e| e.at_file(path, offset))?;
    match BlockKind::classify(tag).map_err(|e| e.at_file(path, offset))? {
        BlockKind::Item => {}
        BlockKind::Metadata => {
            return Err(Error::corrupt(
                path,
                offset,
                "location points at the metadata block",
            ))
        }
    }
    let (len, len_len) = decode_varint(&header[tag_len..]).map_err(|e| e.at_file(path, offset))?;

    let start = offset + (tag_len + len_len) as u64;
    let available = end - start;
    if len > available {
        return Err(Error::corrupt(
            path,
            offset,
            format!(
                "item declares {} bytes but only {} are available",
                len, available
            ),
        ));
    }

    let mut item = vec![0u8; len as usize];
    read_exact_at(file, &mut item, start).map_err(|e| Error::from(e).at_file(path, start))?;
    Ok(item)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafile::{file_path, DataFileWriter};
    use crate::tmpfs::TempDir;
    use std::fs::OpenOptions;

    fn write_sealed(dir: &Path, index: u32, items: &[&[u8]]) -> (PathBuf, Vec<DataLocation>) {
        let path = file_path(dir, index);
        let mut writer = DataFileWriter::open(&path, index).expect("Failed to create writer");
        let locations = items
            .iter()
            .map(|item| writer.append(item).expect("Failed to append"))
            .collect();
        writer.seal().expect("Failed to seal");
        (path, locations)
    }

    fn make_writable(path: &Path) {
        let mut permissions = fs::metadata(path).unwrap().permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions).unwrap();
    }

    #[test]
    fn test_read_items() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (path, locations) = write_sealed(dir.path(), 0, &[b"A", b"BB", b"CCC"]);

        let reader = DataFileReader::open(&path)?;
        assert_eq!(reader.file_index(), 0);
        assert_eq!(reader.metadata().item_count, 3);
        assert_eq!(reader.read_location(locations[1])?, b"BB");
        assert_eq!(reader.read(locations[2].offset())?, b"CCC");
        assert_eq!(reader.read(0)?, b"A");
        Ok(())
    }

    #[test]
    fn test_read_empty_and_large_items() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let large = vec![0xabu8; 300_000];
        let (path, locations) = write_sealed(dir.path(), 1, &[b"", &large, b""]);

        let reader = DataFileReader::open(&path)?;
        assert!(reader.read_location(locations[0])?.is_empty());
        assert_eq!(reader.read_location(locations[1])?, large);
        assert!(reader.read_location(locations[2])?.is_empty());
        Ok(())
    }

    #[test]
    fn test_open_empty_sealed_file() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (path, _) = write_sealed(dir.path(), 2, &[]);
        let reader = DataFileReader::open(&path)?;
        assert_eq!(reader.metadata().item_count, 0);
        assert_eq!(reader.metadata().data_size, 0);
        assert!(reader.read(0).unwrap_err().is_corruption());
        Ok(())
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (path, _) = write_sealed(dir.path(), 0, &[b"A", b"BB", b"CCC"]);
        let full_len = fs::metadata(&path).unwrap().len();
        make_writable(&path);

        for cut in 1..full_len {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.set_len(full_len - cut).unwrap();
            drop(file);

            match DataFileReader::open(&path) {
                Err(e) => assert!(e.is_corruption(), "cut {}: {:?}", cut, e),
                Ok(_) => panic!("truncation by {} bytes went unnoticed", cut),
            }
        }
    }

    #[test]
    fn test_unsealed_file_is_corrupt() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = file_path(dir.path(), 0);
        let mut writer = DataFileWriter::open(&path, 0)?;
        for _ in 0..10 {
            writer.append(&[7u8; 64])?;
        }
        writer.flush()?;

        let err = DataFileReader::open(&path).err().expect("open should fail");
        assert!(err.is_corruption());
        Ok(())
    }

    #[test]
    fn test_misnamed_file_is_corrupt() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (path, _) = write_sealed(dir.path(), 4, &[b"x"]);
        let renamed = file_path(dir.path(), 5);
        fs::rename(&path, &renamed)?;

        let err = DataFileReader::open(&renamed).err().expect("open should fail");
        assert!(err.is_corruption());
        Ok(())
    }

    #[test]
    fn test_bad_offsets() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (path, _) = write_sealed(dir.path(), 0, &[b"A", b"BB"]);
        let reader = DataFileReader::open(&path)?;

        // Past the data section.
        assert!(reader.read(7).unwrap_err().is_corruption());
        // Middle of a frame: 'A' is not a data item tag.
        assert!(reader.read(2).unwrap_err().is_corruption());
        // Wrong file.
        let other = DataLocation::new(9, 0)?;
        assert!(matches!(
            reader.read_location(other),
            Err(Error::IllegalState(_))
        ));
        Ok(())
    }

    #[test]
    fn test_deletion_waits_for_last_reservation() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (path, locations) = write_sealed(dir.path(), 0, &[b"live"]);

        let reader = Arc::new(DataFileReader::open(&path)?);
        let in_flight = Arc::clone(&reader);
        assert_eq!(reader.reservations(), 2);

        reader.mark_for_deletion();
        drop(reader);
        assert!(path.exists());
        assert_eq!(in_flight.read_location(locations[0])?, b"live");

        drop(in_flight);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_concurrent_reads() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let items: Vec<Vec<u8>> = (0..200u32)
            .map(|i| format!("item-{:05}", i).into_bytes())
            .collect();
        let refs: Vec<&[u8]> = items.iter().map(|i| i.as_slice()).collect();
        let (path, locations) = write_sealed(dir.path(), 0, &refs);
        let reader = Arc::new(DataFileReader::open(&path)?);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reader = Arc::clone(&reader);
                let locations = locations.clone();
                let items = items.clone();
                std::thread::spawn(move || {
                    for (i, loc) in locations.iter().enumerate().skip(t).step_by(3) {
                        assert_eq!(reader.read_location(*loc).unwrap(), items[i]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("reader thread panicked");
        }
        Ok(())
    }
}
