use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use super::file_set::FileSet;
use crate::config::{StoreConfig, UnsealedFilePolicy};
use crate::datafile::metadata::{has_footer_signature, FOOTER_SIGNATURE_LEN};
use crate::datafile::{
    parse_file_index, parse_temp_file_index, BlockKind, DataFileIterator, DataFileReader,
    DataFileWriter, FOOTER_SIZE,
};
use crate::encoding::{read_tag, read_varint};
use crate::error::Result;

/// What a directory scan found.
pub(crate) struct Recovered {
    pub files: FileSet,
    pub next_file_index: u32,
}

/// Rebuilds the file set from the data files in `config.dir`.
///
/// Every sealed file is opened and validated. Files that were never sealed
/// are handled according to `config.unsealed_files`; a sealed file that
/// fails validation stops recovery with `CorruptFile`. Leftover output of an
/// unfinished compaction is deleted. The next file index is one past the
/// highest index found on disk, deleted files included, so an index is
/// never handed out twice.
pub(crate) fn recover(config: &StoreConfig) -> Result<Recovered> {
    let mut found = Vec::new();
    let mut highest_orphan = None;
    for entry in fs::read_dir(&config.dir)? {
        let path = entry?.path();
        if let Some(index) = parse_file_index(&path) {
            found.push((index, path));
        } else if let Some(index) = parse_temp_file_index(&path) {
            tracing::warn!(
                file_index = index,
                path = %path.display(),
                "Removing output of an unfinished compaction"
            );
            fs::remove_file(&path)?;
            highest_orphan = highest_orphan.max(Some(index));
        }
    }
    found.sort_by_key(|(index, _)| *index);

    let next_file_index = found
        .last()
        .map(|(index, _)| *index)
        .max(highest_orphan)
        .map(|index| index + 1)
        .unwrap_or(0);
    let mut readers = Vec::with_capacity(found.len());
    let mut discarded = 0usize;
    let mut salvaged = 0usize;

    for (index, path) in found {
        let reader = match DataFileReader::open(&path) {
            Ok(reader) => reader,
            Err(e) if e.is_corruption() => {
                let run = complete_prefix(&path)?;
                if run.ends_in_metadata || has_footer_at_tail(&path)? {
                    tracing::error!(
                        file_index = index,
                        error = %e,
                        "Sealed data file is damaged"
                    );
                    return Err(e);
                }
                match config.unsealed_files {
                    UnsealedFilePolicy::Fail => return Err(e),
                    UnsealedFilePolicy::Discard => {
                        tracing::warn!(
                            file_index = index,
                            error = %e,
                            "Discarding unsealed data file"
                        );
                        fs::remove_file(&path)?;
                        discarded += 1;
                        continue;
                    }
                    UnsealedFilePolicy::Recover => {
                        tracing::warn!(
                            file_index = index,
                            error = %e,
                            "Recovering unsealed data file"
                        );
                        salvaged += 1;
                        salvage(&path, index, run, config.write_buffer_size)?
                    }
                }
            }
            Err(e) => return Err(e),
        };

        let reader = Arc::new(reader);
        if config.verify_on_open {
            verify(&reader, config.iterator_buffer_size)?;
        }
        tracing::debug!(
            file_index = index,
            items = reader.metadata().item_count,
            compaction_level = reader.metadata().compaction_level,
            "Loaded data file"
        );
        readers.push(reader);
    }

    let files = FileSet::new().with_added(readers);
    tracing::info!(
        files = files.len(),
        items = files.total_items(),
        bytes = files.total_bytes(),
        discarded = discarded,
        salvaged = salvaged,
        next_file_index = next_file_index,
        "Data file recovery completed"
    );

    Ok(Recovered {
        files,
        next_file_index,
    })
}

/// Iterates a sealed file end to end, returning its item count. The
/// iterator checks the count against the metadata.
pub(crate) fn verify(reader: &Arc<DataFileReader>, buffer_size: usize) -> Result<u64> {
    let mut iter = DataFileIterator::new(Arc::clone(reader), buffer_size)?;
    while iter.next()? {}
    Ok(iter.items_read())
}

/// Keeps the longest prefix of complete items, drops the rest, and seals
/// the file as a level-0 file.
fn salvage(
    path: &Path,
    file_index: u32,
    run: ItemRun,
    buffer_size: usize,
) -> Result<DataFileReader> {
    let file_len = fs::metadata(path)?.len();

    let mut writer =
        DataFileWriter::resume(path, file_index, run.data_size, run.item_count, buffer_size)?;
    writer.seal()?;

    tracing::info!(
        file_index = file_index,
        items = run.item_count,
        dropped_bytes = file_len - run.data_size,
        "Salvaged unsealed data file"
    );
    DataFileReader::open(path)
}

/// The run of complete data items at the start of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ItemRun {
    data_size: u64,
    item_count: u64,
    /// The run ends at a metadata tag: what is left of a footer.
    ends_in_metadata: bool,
}

/// Scans the run of complete data items at the start of the file. Scanning
/// stops at the first incomplete frame or at anything that is not a data
/// item.
fn complete_prefix(path: &Path) -> Result<ItemRun> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut input = BufReader::new(file);
    let mut run = ItemRun {
        data_size: 0,
        item_count: 0,
        ends_in_metadata: false,
    };

    while run.data_size < file_len {
        let Ok((tag, tag_len)) = read_tag(&mut input) else {
            break;
        };
        match BlockKind::classify(tag) {
            Ok(BlockKind::Item) => {}
            Ok(BlockKind::Metadata) => {
                run.ends_in_metadata = true;
                break;
            }
            Err(_) => break,
        }
        let Ok((len, len_len)) = read_varint(&mut input) else {
            break;
        };
        let end = run.data_size + (tag_len + len_len) as u64 + len;
        if end > file_len {
            break;
        }
        let skipped = io::copy(&mut (&mut input).take(len), &mut io::sink())?;
        if skipped != len {
            break;
        }
        run.data_size = end;
        run.item_count += 1;
    }

    Ok(run)
}

/// Whether the footer position holds the start of a metadata block, intact
/// or not.
fn has_footer_at_tail(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if file_len < FOOTER_SIZE as u64 {
        return Ok(false);
    }
    let mut head = [0u8; FOOTER_SIGNATURE_LEN];
    file.seek(SeekFrom::Start(file_len - FOOTER_SIZE as u64))?;
    file.read_exact(&mut head)?;
    Ok(has_footer_signature(&head))
}
