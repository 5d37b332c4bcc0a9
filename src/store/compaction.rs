//! Compaction: rewrite the live items of old files into new ones.
//!
//! Appends never overwrite, so a file keeps the bytes of every item that
//! was superseded after it was written. Compaction copies the items the
//! external index still points at into fresh files and retires the inputs.
//!
//! # Sequence
//!
//! 1. Iterate the selected files oldest first. For each item, extract its
//!    key and keep the item only if the index still maps that key to the
//!    item's location.
//! 2. Append kept items to output files at the next compaction level,
//!    rolling over at the store's file thresholds, then seal them and give
//!    them their data file names.
//! 3. Publish the outputs into the file set and mark the inputs retired.
//!    Retired files stay readable.
//! 4. The caller applies the returned remaps to its index, then confirms
//!    the [`PendingDeletion`]. Only then are the inputs dropped from the file
//!    set; each is unlinked once its last in-flight reader lets go.
//!
//! A compaction that fails or is cancelled discards its outputs and leaves
//! the published file set untouched.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::file_set::FileSetHandle;
use super::index::{ExternalIndex, KeyExtractor};
use super::store::DataFileStore;
use crate::config::CompactionConfig;
use crate::datafile::writer::sync_parent_dir;
use crate::datafile::{
    file_path, temp_file_path, DataFileIterator, DataFileMetadata, DataFileReader, DataFileWriter,
    DataLocation, ITEM_FIELD,
};
use crate::encoding::frame_len;
use crate::error::{Error, Result};

/// Chooses which sealed files to compact next.
pub trait CompactionPolicy: Send + Sync {
    /// Picks file indices from `files`, the live sealed files ordered by
    /// index. An empty result means nothing needs compacting.
    fn select(&self, files: &[DataFileMetadata]) -> Vec<u32>;
}

/// Compacts the lowest level holding at least `min_files_per_level` files,
/// oldest files first, up to `max_files_per_compaction` at a time. Output
/// lands one level up, capped at `max_compaction_level`.
#[derive(Debug, Clone, Default)]
pub struct TieredCompactionPolicy {
    config: CompactionConfig,
}

impl TieredCompactionPolicy {
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }
}

impl CompactionPolicy for TieredCompactionPolicy {
    fn select(&self, files: &[DataFileMetadata]) -> Vec<u32> {
        let mut levels: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for file in files {
            levels
                .entry(file.compaction_level.min(self.config.max_compaction_level))
                .or_default()
                .push(file.file_index);
        }

        for (_, mut indices) in levels {
            if indices.len() >= self.config.min_files_per_level.max(1) {
                indices.sort_unstable();
                indices.truncate(self.config.max_files_per_compaction);
                return indices;
            }
        }
        Vec::new()
    }
}

/// Level of the files produced by compacting inputs up to `input_level`.
pub fn output_level(input_level: u32, max_level: u32) -> u32 {
    input_level.saturating_add(1).min(max_level)
}

/// Cooperative cancellation for a running compaction, checked between items.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One live item that moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remap {
    pub key: Vec<u8>,
    pub old: DataLocation,
    pub new: DataLocation,
}

pub struct CompactionResult {
    /// Every live item's move, in the order the items were copied.
    pub remaps: Vec<Remap>,
    /// Metadata of the sealed output files.
    pub new_files: Vec<DataFileMetadata>,
    /// Indices of the input files, now retired.
    pub retired: Vec<u32>,
    /// Superseded items left behind.
    pub dropped_items: u64,
    /// Deletion of the inputs, to be confirmed once the index is updated.
    pub pending: PendingDeletion,
}

impl CompactionResult {
    /// `old -> new` view of the remaps.
    pub fn remap_table(&self) -> HashMap<DataLocation, DataLocation> {
        self.remaps.iter().map(|r| (r.old, r.new)).collect()
    }

    /// Applies every remap as a compare-and-set and returns how many took
    /// effect. A remap is skipped when its key was rewritten meanwhile.
    pub fn apply<I: ExternalIndex + ?Sized>(&self, index: &I) -> usize {
        self.remaps
            .iter()
            .filter(|remap| index.update(&remap.key, remap.old, remap.new))
            .count()
    }
}

/// Retired compaction inputs waiting for the caller's go-ahead.
///
/// Dropping it without confirming keeps the inputs readable and on disk;
/// they are picked up again as ordinary files on the next open.
#[must_use = "retired files are only deleted once the deletion is confirmed"]
pub struct PendingDeletion {
    files: Option<FileSetHandle>,
    indices: Vec<u32>,
}

impl PendingDeletion {
    pub(crate) fn new(files: FileSetHandle, indices: Vec<u32>) -> Self {
        Self {
            files: Some(files),
            indices,
        }
    }

    pub(crate) fn none() -> Self {
        Self {
            files: None,
            indices: Vec::new(),
        }
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Removes the retired files from the file set and schedules their
    /// deletion. Each file is unlinked when its last reservation drops.
    pub fn confirm(mut self) {
        let Some(files) = self.files.take() else {
            return;
        };
        let indices = std::mem::take(&mut self.indices);
        let removed: Vec<Arc<DataFileReader>> = files.publish(|set| set.without(&indices));
        for reader in &removed {
            reader.mark_for_deletion();
        }
        tracing::info!(
            files = removed.len(),
            indices = ?indices,
            "Confirmed deletion of compacted data files"
        );
    }
}

/// Runs one compaction over `selected`. Called through
/// [`DataFileStore::compact`].
pub(crate) fn compact<I, K>(
    store: &DataFileStore,
    selected: &[u32],
    index: &I,
    keys: &K,
    cancel: &CancellationFlag,
) -> Result<CompactionResult>
where
    I: ExternalIndex + ?Sized,
    K: KeyExtractor + ?Sized,
{
    let _guard = store.try_start_compaction()?;

    let mut selected = selected.to_vec();
    selected.sort_unstable();
    selected.dedup();
    if selected.is_empty() {
        return Ok(CompactionResult {
            remaps: Vec::new(),
            new_files: Vec::new(),
            retired: Vec::new(),
            dropped_items: 0,
            pending: PendingDeletion::none(),
        });
    }

    let snapshot = store.snapshot();
    let mut inputs = Vec::with_capacity(selected.len());
    for &file_index in &selected {
        if store.active_file_index() == Some(file_index) {
            return Err(Error::IllegalState(format!(
                "cannot compact data file {} while it is being written",
                file_index
            )));
        }
        let reader = snapshot
            .get(file_index)
            .ok_or(Error::UnknownFile(file_index))?;
        if snapshot.is_retired(file_index) {
            return Err(Error::IllegalState(format!(
                "data file {} is already retired",
                file_index
            )));
        }
        inputs.push(Arc::clone(reader));
    }
    drop(snapshot);

    let input_level = inputs
        .iter()
        .map(|r| r.metadata().compaction_level)
        .max()
        .unwrap_or(0);
    let level = output_level(input_level, store.config.compaction.max_compaction_level);

    tracing::info!(
        files = ?selected,
        input_level = input_level,
        output_level = level,
        "Starting compaction"
    );

    let mut output = CompactionOutput::new(store, level);
    let (remaps, dropped_items) =
        match copy_live_items(store, &inputs, index, keys, cancel, &mut output) {
            Ok(copied) => copied,
            Err(Error::CompactionCancelled) => {
                tracing::info!(files = ?selected, "Compaction cancelled");
                return Err(Error::CompactionCancelled);
            }
            Err(e) => {
                tracing::warn!(files = ?selected, error = %e, "Compaction failed");
                return Err(e);
            }
        };
    let outputs = output.finish()?;
    let new_files: Vec<DataFileMetadata> = outputs.iter().map(|r| r.metadata().clone()).collect();

    store
        .files
        .publish(|set| (set.with_added(outputs).with_retired(&selected), ()));

    tracing::info!(
        retired = ?selected,
        new_files = ?new_files.iter().map(|m| m.file_index).collect::<Vec<_>>(),
        live_items = remaps.len(),
        dropped_items = dropped_items,
        "Completed compaction"
    );

    Ok(CompactionResult {
        remaps,
        new_files,
        retired: selected.clone(),
        dropped_items,
        pending: PendingDeletion::new(store.files.clone(), selected),
    })
}

fn copy_live_items<I, K>(
    store: &DataFileStore,
    inputs: &[Arc<DataFileReader>],
    index: &I,
    keys: &K,
    cancel: &CancellationFlag,
    output: &mut CompactionOutput<'_>,
) -> Result<(Vec<Remap>, u64)>
where
    I: ExternalIndex + ?Sized,
    K: KeyExtractor + ?Sized,
{
    let mut remaps = Vec::new();
    let mut dropped = 0u64;

    for input in inputs {
        let mut iter = DataFileIterator::new(Arc::clone(input), store.config.iterator_buffer_size)?;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::CompactionCancelled);
            }
            if !iter.next()? {
                break;
            }
            let (Some(item), Some(old)) = (iter.item(), iter.location()) else {
                break;
            };

            let key = keys.key_of(item)?;
            if index.lookup(&key) == Some(old) {
                let new = output.append(item)?;
                remaps.push(Remap { key, old, new });
            } else {
                dropped += 1;
            }
        }
    }
    Ok((remaps, dropped))
}

/// Output files of one compaction. Files are created lazily, so a run that
/// keeps nothing writes nothing. Outputs are written and sealed under
/// temporary names and only take their data file names in `finish`, so a
/// crash mid-run leaves nothing recovery would load. Unless `finish`
/// succeeds, every output file is deleted when this is dropped.
struct CompactionOutput<'a> {
    store: &'a DataFileStore,
    level: u32,
    writer: Option<DataFileWriter>,
    /// Sealed outputs still under their temporary names.
    sealed: Vec<u32>,
}

impl<'a> CompactionOutput<'a> {
    fn new(store: &'a DataFileStore, level: u32) -> Self {
        Self {
            store,
            level,
            writer: None,
            sealed: Vec::new(),
        }
    }

    fn append(&mut self, item: &[u8]) -> Result<DataLocation> {
        let store = self.store;
        let config = &store.config;
        let overflow = self.writer.as_ref().is_some_and(|w| {
            w.item_count() > 0
                && w.data_size() + frame_len(ITEM_FIELD, item.len()) as u64 > config.max_file_size
        });
        if overflow {
            self.seal_current()?;
        }

        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                let file_index = store.allocate_file_index()?;
                DataFileWriter::open_with(
                    &temp_file_path(&config.dir, file_index),
                    file_index,
                    self.level,
                    config.write_buffer_size,
                )?
            }
        };
        let writer = self.writer.insert(writer);

        let location = writer.append(item)?;
        if writer.data_size() >= config.max_file_size
            || writer.item_count() >= config.max_items_per_file
        {
            self.seal_current()?;
        }
        Ok(location)
    }

    fn seal_current(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        if let Err(e) = writer.seal() {
            let path = writer.path().to_path_buf();
            if let Err(discard) = writer.discard() {
                tracing::warn!(path = %path.display(), error = %discard, "Failed to discard compaction output");
            }
            return Err(e);
        }
        self.sealed.push(writer.file_index());
        Ok(())
    }

    /// Seals the last output and renames every output to its data file name.
    fn finish(mut self) -> Result<Vec<Arc<DataFileReader>>> {
        self.seal_current()?;

        let dir = self.store.config.dir.clone();
        let mut published: Vec<Arc<DataFileReader>> = Vec::with_capacity(self.sealed.len());
        while !self.sealed.is_empty() {
            let file_index = self.sealed.remove(0);
            match promote(&dir, file_index) {
                Ok(reader) => published.push(Arc::new(reader)),
                Err(e) => {
                    for reader in &published {
                        reader.mark_for_deletion();
                    }
                    return Err(e);
                }
            }
        }
        if let Some(reader) = published.first() {
            sync_parent_dir(reader.path())?;
        }
        Ok(published)
    }
}

/// Moves a sealed output to its data file name and opens it.
fn promote(dir: &Path, file_index: u32) -> Result<DataFileReader> {
    let path = file_path(dir, file_index);
    fs::rename(temp_file_path(dir, file_index), &path)?;
    match DataFileReader::open(&path) {
        Ok(reader) => Ok(reader),
        Err(e) => {
            if let Err(remove) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %remove, "Failed to remove compaction output");
            }
            Err(e)
        }
    }
}

impl Drop for CompactionOutput<'_> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            let file_index = writer.file_index();
            if let Err(e) = writer.discard() {
                tracing::warn!(file_index = file_index, error = %e, "Failed to discard compaction output");
            }
        }
        for file_index in self.sealed.drain(..) {
            let path = temp_file_path(&self.store.config.dir, file_index);
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(file_index = file_index, error = %e, "Failed to remove compaction output");
            }
        }
    }
}
