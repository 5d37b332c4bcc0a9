//! Copy-on-write mapping from file index to sealed file.
//!
//! A [`FileSet`] is immutable once built. Changes produce a new set that is
//! swapped into the [`FileSetHandle`] under a short write lock, so a reader
//! holding a snapshot never observes a half-applied change and never blocks
//! the publisher for longer than a pointer swap.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::datafile::{DataFileMetadata, DataFileReader};

#[derive(Clone, Default)]
pub struct FileSet {
    files: BTreeMap<u32, Arc<DataFileReader>>,
    /// Files replaced by compaction output that stay readable until the
    /// caller confirms the index no longer points into them.
    retired: BTreeSet<u32>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file_index: u32) -> Option<&Arc<DataFileReader>> {
        self.files.get(&file_index)
    }

    pub fn contains(&self, file_index: u32) -> bool {
        self.files.contains_key(&file_index)
    }

    pub fn is_retired(&self, file_index: u32) -> bool {
        self.retired.contains(&file_index)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All files in index order, retired ones included.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DataFileReader>> {
        self.files.values()
    }

    /// Files that are neither retired nor waiting on retirement, in index order.
    pub fn live(&self) -> impl Iterator<Item = &Arc<DataFileReader>> {
        self.files
            .iter()
            .filter(|(index, _)| !self.retired.contains(index))
            .map(|(_, reader)| reader)
    }

    pub fn indices(&self) -> Vec<u32> {
        self.files.keys().copied().collect()
    }

    /// Metadata of the live files, oldest first.
    pub fn live_metadata(&self) -> Vec<DataFileMetadata> {
        self.live().map(|r| r.metadata().clone()).collect()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    pub fn max_index(&self) -> Option<u32> {
        self.files.keys().next_back().copied()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|r| r.metadata().file_size()).sum()
    }

    pub fn total_items(&self) -> u64 {
        self.files.values().map(|r| r.metadata().item_count).sum()
    }

    pub fn with_added<I>(&self, readers: I) -> Self
    where
        I: IntoIterator<Item = Arc<DataFileReader>>,
    {
        let mut next = self.clone();
        for reader in readers {
            next.files.insert(reader.file_index(), reader);
        }
        next
    }

    /// Marks files as retired without removing them.
    pub fn with_retired(&self, indices: &[u32]) -> Self {
        let mut next = self.clone();
        next.retired
            .extend(indices.iter().copied().filter(|i| self.files.contains_key(i)));
        next
    }

    /// Removes files, returning the new set and the removed readers.
    pub fn without(&self, indices: &[u32]) -> (Self, Vec<Arc<DataFileReader>>) {
        let mut next = self.clone();
        let removed = indices
            .iter()
            .filter_map(|index| {
                next.retired.remove(index);
                next.files.remove(index)
            })
            .collect();
        (next, removed)
    }
}

/// Shared, atomically replaced reference to the current [`FileSet`].
#[derive(Clone, Default)]
pub struct FileSetHandle {
    current: Arc<RwLock<Arc<FileSet>>>,
}

impl FileSetHandle {
    pub fn new(files: FileSet) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(files))),
        }
    }

    /// Current snapshot. Holding it keeps every file in it reserved.
    pub fn snapshot(&self) -> Arc<FileSet> {
        self.current.read().clone()
    }

    /// Replaces the current set with `change(current)`, returning whatever
    /// the change hands back alongside the new set.
    pub fn publish<T>(&self, change: impl FnOnce(&FileSet) -> (FileSet, T)) -> T {
        let mut current = self.current.write();
        let (next, out) = change(&current);
        *current = Arc::new(next);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafile::{file_path, DataFileWriter};
    use crate::tmpfs::TempDir;
    use std::path::Path;

    fn sealed(dir: &Path, index: u32, items: usize) -> Arc<DataFileReader> {
        let path = file_path(dir, index);
        let mut writer = DataFileWriter::open(&path, index).unwrap();
        for i in 0..items {
            writer.append(format!("item-{}", i).as_bytes()).unwrap();
        }
        writer.seal().unwrap();
        Arc::new(DataFileReader::open(&path).unwrap())
    }

    #[test]
    fn test_add_and_remove() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let set = FileSet::new().with_added([sealed(dir.path(), 2, 1), sealed(dir.path(), 0, 3)]);

        assert_eq!(set.indices(), vec![0, 2]);
        assert_eq!(set.max_index(), Some(2));
        assert_eq!(set.total_items(), 4);

        let (smaller, removed) = set.without(&[0, 7]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].file_index(), 0);
        assert_eq!(smaller.indices(), vec![2]);
        // The original snapshot is untouched.
        assert_eq!(set.indices(), vec![0, 2]);
    }

    #[test]
    fn test_retired_files_stay_readable() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let set = FileSet::new().with_added([sealed(dir.path(), 0, 1), sealed(dir.path(), 1, 1)]);
        let set = set.with_retired(&[0]);

        assert!(set.get(0).is_some());
        assert!(set.is_retired(0));
        assert_eq!(set.retired_count(), 1);
        let live: Vec<u32> = set.live_metadata().iter().map(|m| m.file_index).collect();
        assert_eq!(live, vec![1]);

        let (set, _) = set.without(&[0]);
        assert!(!set.is_retired(0));
        assert_eq!(set.retired_count(), 0);
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let handle = FileSetHandle::new(FileSet::new());
        let before = handle.snapshot();

        let reader = sealed(dir.path(), 0, 1);
        handle.publish(|set| (set.with_added([reader]), ()));

        assert!(before.is_empty());
        assert_eq!(handle.snapshot().len(), 1);
    }
}
