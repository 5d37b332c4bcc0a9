use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::compaction::{self, CancellationFlag, CompactionPolicy, CompactionResult};
use super::file_set::{FileSet, FileSetHandle};
use super::index::{ExternalIndex, KeyExtractor};
use super::recovery;
use crate::config::{StoreConfig, WriteContention};
use crate::datafile::location::MAX_FILE_INDEX;
use crate::datafile::reader::UnsealedReader;
use crate::datafile::{
    file_path, DataFileIterator, DataFileMetadata, DataFileReader, DataFileWriter, DataLocation,
    ITEM_FIELD,
};
use crate::encoding::frame_len;
use crate::error::{Error, Result};
use crate::flock::FileLock;

/// The file currently receiving appends.
struct ActiveFile {
    file_index: u32,
    writer: Mutex<DataFileWriter>,
    reader: UnsealedReader,
    /// Prefix of the file readable through `reader`.
    durable: AtomicU64,
}

impl ActiveFile {
    fn create(config: &StoreConfig, file_index: u32) -> Result<Self> {
        let path = file_path(&config.dir, file_index);
        let writer = DataFileWriter::open_with(&path, file_index, 0, config.write_buffer_size)?;
        let reader = UnsealedReader::open(&path)?;
        Ok(Self {
            file_index,
            writer: Mutex::new(writer),
            reader,
            durable: AtomicU64::new(0),
        })
    }

    /// Reads an item, flushing the write buffer first if the item may not
    /// have reached the file yet.
    fn read(&self, offset: u64) -> Result<Vec<u8>> {
        let mut durable = self.durable.load(Ordering::Acquire);
        if offset >= durable {
            durable = self.writer.lock().flush()?;
            self.durable.fetch_max(durable, Ordering::AcqRel);
        }
        self.reader.read(offset, durable)
    }
}

/// Point-in-time summary of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub sealed_files: usize,
    /// Compacted files still waiting for deletion to be confirmed.
    pub retired_files: usize,
    pub sealed_bytes: u64,
    pub sealed_items: u64,
    pub files_per_level: BTreeMap<u32, usize>,
    pub active_file: Option<u32>,
    pub active_bytes: u64,
    pub active_items: u64,
    pub next_file_index: u32,
}

/// One dataset's data files behind a single append/read/compact API.
///
/// Appends go through one writer lane; reads may come from any number of
/// threads. The set of sealed files is a copy-on-write snapshot, so a read
/// never waits on compaction and a file stays on disk while any read or
/// iterator still uses it.
pub struct DataFileStore {
    pub(crate) config: StoreConfig,
    lock: Option<FileLock>,

    pub(crate) files: FileSetHandle,
    active: RwLock<Option<Arc<ActiveFile>>>,
    writer_lane: Mutex<()>,
    next_file_index: AtomicU32,
    compaction_running: AtomicBool,
}

/// Clears the running flag when a compaction ends, however it ends.
pub(crate) struct CompactionGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl DataFileStore {
    /// Opens the dataset in `config.dir`, creating the directory if needed
    /// and recovering whatever files a previous run left behind.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let lock = FileLock::lock_dir(&config.dir).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock => Error::IllegalState(format!(
                "data file directory {} is in use by another store",
                config.dir.display()
            )),
            _ => Error::from(e),
        })?;

        let recovered = recovery::recover(&config)?;

        tracing::info!(
            dir = %config.dir.display(),
            files = recovered.files.len(),
            next_file_index = recovered.next_file_index,
            "Opened data file store"
        );

        Ok(Self {
            config,
            lock: Some(lock),
            files: FileSetHandle::new(recovered.files),
            active: RwLock::new(None),
            writer_lane: Mutex::new(()),
            next_file_index: AtomicU32::new(recovered.next_file_index),
            compaction_running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Appends an item and returns its location.
    ///
    /// Opens a new file when none is open or when the item would push the
    /// open file past `max_file_size`. The file is sealed as soon as it
    /// reaches a roll-over threshold.
    pub fn append(&self, item: &[u8]) -> Result<DataLocation> {
        if item.len() > self.config.max_item_size {
            return Err(Error::ItemTooLarge {
                size: item.len(),
                limit: self.config.max_item_size,
            });
        }

        let _lane = self.acquire_lane()?;
        let active = match self.current_active() {
            Some(active) if !self.would_overflow(&active, item.len()) => active,
            Some(_) => {
                self.seal_active()?;
                self.open_active()?
            }
            None => self.open_active()?,
        };

        let (location, full) = {
            let mut writer = active.writer.lock();
            let location = writer.append(item)?;
            let full = writer.data_size() >= self.config.max_file_size
                || writer.item_count() >= self.config.max_items_per_file;
            (location, full)
        };
        if full {
            self.seal_active()?;
        }
        Ok(location)
    }

    /// Reads the item at `location`.
    ///
    /// Fails with `UnknownFile` when the location's file is neither open
    /// for writing nor in the current file set.
    pub fn read(&self, location: DataLocation) -> Result<Vec<u8>> {
        if location.is_none() {
            return Err(Error::IllegalState(
                "cannot read the empty location".to_string(),
            ));
        }
        let file_index = location.file_index();

        // The active file is checked first: a roll-over publishes the sealed
        // file before it clears the active slot.
        if let Some(active) = self.current_active() {
            if active.file_index == file_index {
                return active.read(location.offset());
            }
        }

        let files = self.files.snapshot();
        let reader = files.get(file_index).ok_or(Error::UnknownFile(file_index))?;
        reader.read(location.offset())
    }

    /// Opens a forward iterator over a sealed file.
    pub fn open_iterator(&self, file_index: u32) -> Result<DataFileIterator> {
        let reader = self.sealed_file(file_index)?;
        DataFileIterator::new(reader, self.config.iterator_buffer_size)
    }

    /// Seals the file open for writing and returns its metadata. The next
    /// append opens a fresh file.
    pub fn roll_over(&self) -> Result<DataFileMetadata> {
        let _lane = self.acquire_lane()?;
        self.seal_active()?
            .ok_or_else(|| Error::IllegalState("no data file is open for writing".to_string()))
    }

    /// Seals the active file, if any.
    pub fn close(&self) -> Result<Option<DataFileMetadata>> {
        let _lane = self.writer_lane.lock();
        self.seal_active()
    }

    /// Iterates a sealed file end to end and checks its item count against
    /// its metadata. Returns the count.
    pub fn verify_file(&self, file_index: u32) -> Result<u64> {
        let reader = self.sealed_file(file_index)?;
        recovery::verify(&reader, self.config.iterator_buffer_size)
    }

    /// Current snapshot of the sealed files.
    pub fn snapshot(&self) -> Arc<FileSet> {
        self.files.snapshot()
    }

    /// Indices of the sealed files, retired ones included.
    pub fn file_indices(&self) -> Vec<u32> {
        self.files.snapshot().indices()
    }

    pub fn active_file_index(&self) -> Option<u32> {
        self.current_active().map(|active| active.file_index)
    }

    /// Files the policy would compact next.
    pub fn compaction_candidates<P: CompactionPolicy + ?Sized>(&self, policy: &P) -> Vec<u32> {
        policy.select(&self.files.snapshot().live_metadata())
    }

    pub fn needs_compaction<P: CompactionPolicy + ?Sized>(&self, policy: &P) -> bool {
        !self.is_compacting() && !self.compaction_candidates(policy).is_empty()
    }

    pub fn is_compacting(&self) -> bool {
        self.compaction_running.load(Ordering::SeqCst)
    }

    /// Compacts the given sealed files. See [`compaction`] for the sequence
    /// and the caller's part in it.
    ///
    /// [`compaction`]: crate::store::compaction
    pub fn compact<I, K>(
        &self,
        files: &[u32],
        index: &I,
        keys: &K,
        cancel: &CancellationFlag,
    ) -> Result<CompactionResult>
    where
        I: ExternalIndex + ?Sized,
        K: KeyExtractor + ?Sized,
    {
        compaction::compact(self, files, index, keys, cancel)
    }

    pub fn stats(&self) -> StoreStats {
        let files = self.files.snapshot();
        let mut files_per_level = BTreeMap::new();
        for reader in files.live() {
            *files_per_level
                .entry(reader.metadata().compaction_level)
                .or_insert(0) += 1;
        }

        let active = self.current_active();
        let (active_bytes, active_items) = active
            .as_ref()
            .map(|active| {
                let writer = active.writer.lock();
                (writer.data_size(), writer.item_count())
            })
            .unwrap_or_default();

        let stats = StoreStats {
            sealed_files: files.len(),
            retired_files: files.retired_count(),
            sealed_bytes: files.total_bytes(),
            sealed_items: files.total_items(),
            files_per_level,
            active_file: active.map(|active| active.file_index),
            active_bytes,
            active_items,
            next_file_index: self.next_file_index.load(Ordering::SeqCst),
        };
        tracing::debug!(stats = ?stats, "Data file store stats");
        stats
    }

    pub(crate) fn allocate_file_index(&self) -> Result<u32> {
        let file_index = self.next_file_index.fetch_add(1, Ordering::SeqCst);
        if file_index > MAX_FILE_INDEX {
            return Err(Error::IllegalState(format!(
                "file index space exhausted at {}",
                file_index
            )));
        }
        Ok(file_index)
    }

    pub(crate) fn try_start_compaction(&self) -> Result<CompactionGuard<'_>> {
        if self.compaction_running.swap(true, Ordering::SeqCst) {
            return Err(Error::IllegalState(
                "a compaction is already running".to_string(),
            ));
        }
        Ok(CompactionGuard {
            running: &self.compaction_running,
        })
    }

    fn sealed_file(&self, file_index: u32) -> Result<Arc<DataFileReader>> {
        if self.active_file_index() == Some(file_index) {
            return Err(Error::IllegalState(format!(
                "data file {} is still being written",
                file_index
            )));
        }
        self.files
            .snapshot()
            .get(file_index)
            .cloned()
            .ok_or(Error::UnknownFile(file_index))
    }

    fn acquire_lane(&self) -> Result<MutexGuard<'_, ()>> {
        match self.config.write_contention {
            WriteContention::Block => Ok(self.writer_lane.lock()),
            WriteContention::FailFast => self.writer_lane.try_lock().ok_or(Error::WriterBusy),
        }
    }

    fn current_active(&self) -> Option<Arc<ActiveFile>> {
        self.active.read().clone()
    }

    fn would_overflow(&self, active: &ActiveFile, item_len: usize) -> bool {
        let writer = active.writer.lock();
        writer.item_count() > 0
            && writer.data_size() + frame_len(ITEM_FIELD, item_len) as u64
                > self.config.max_file_size
    }

    /// Requires the writer lane.
    fn open_active(&self) -> Result<Arc<ActiveFile>> {
        let file_index = self.allocate_file_index()?;
        let active = Arc::new(ActiveFile::create(&self.config, file_index)?);
        *self.active.write() = Some(Arc::clone(&active));
        Ok(active)
    }

    /// Requires the writer lane.
    fn seal_active(&self) -> Result<Option<DataFileMetadata>> {
        let Some(active) = self.current_active() else {
            return Ok(None);
        };

        let metadata = active.writer.lock().seal()?;
        active.durable.store(metadata.data_size, Ordering::Release);
        let reader = Arc::new(DataFileReader::open(&file_path(
            &self.config.dir,
            active.file_index,
        ))?);

        self.files.publish(|set| (set.with_added([reader]), ()));
        *self.active.write() = None;
        Ok(Some(metadata))
    }
}

impl Drop for DataFileStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to seal active data file on drop");
        }
        // Released last, after the active file is sealed.
        self.lock.take();
    }
}
