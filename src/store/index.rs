//! Contracts with the external index that maps item keys to locations.
//!
//! The store never interprets item bytes. Compaction asks a
//! [`KeyExtractor`] for an item's key and the [`ExternalIndex`] whether the
//! item's location is still current for that key.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::datafile::DataLocation;
use crate::error::Result;

pub trait ExternalIndex: Send + Sync {
    /// Current location of `key`, if any.
    fn lookup(&self, key: &[u8]) -> Option<DataLocation>;

    /// Points `key` at `new` if it still points at `old`. Returns whether
    /// the update was applied. A key rewritten since `old` was read keeps
    /// its newer location.
    fn update(&self, key: &[u8], old: DataLocation, new: DataLocation) -> bool;
}

/// Derives an item's index key from its bytes.
pub trait KeyExtractor: Send + Sync {
    fn key_of(&self, item: &[u8]) -> Result<Vec<u8>>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    fn key_of(&self, item: &[u8]) -> Result<Vec<u8>> {
        self(item)
    }
}

/// Hash map index kept in memory.
#[derive(Default)]
pub struct InMemoryIndex {
    entries: RwLock<HashMap<Vec<u8>, DataLocation>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the location of a fresh write, returning the previous one.
    pub fn insert(&self, key: impl Into<Vec<u8>>, location: DataLocation) -> Option<DataLocation> {
        self.entries.write().insert(key.into(), location)
    }

    pub fn remove(&self, key: &[u8]) -> Option<DataLocation> {
        self.entries.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All current locations.
    pub fn locations(&self) -> Vec<DataLocation> {
        self.entries.read().values().copied().collect()
    }
}

impl ExternalIndex for InMemoryIndex {
    fn lookup(&self, key: &[u8]) -> Option<DataLocation> {
        self.entries.read().get(key).copied()
    }

    fn update(&self, key: &[u8], old: DataLocation, new: DataLocation) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(current) if *current == old => {
                *current = new;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(file: u32, offset: u64) -> DataLocation {
        DataLocation::new(file, offset).unwrap()
    }

    #[test]
    fn test_update_is_compare_and_set() {
        let index = InMemoryIndex::new();
        index.insert(b"k".to_vec(), loc(0, 0));

        assert!(index.update(b"k", loc(0, 0), loc(3, 0)));
        assert_eq!(index.lookup(b"k"), Some(loc(3, 0)));

        // A stale remap loses against the newer location.
        assert!(!index.update(b"k", loc(0, 0), loc(4, 0)));
        assert_eq!(index.lookup(b"k"), Some(loc(3, 0)));

        assert!(!index.update(b"missing", loc(0, 0), loc(4, 0)));
        assert!(index.lookup(b"missing").is_none());
    }

    #[test]
    fn test_closure_key_extractor() {
        let keys = |item: &[u8]| -> Result<Vec<u8>> { Ok(item[..2].to_vec()) };
        assert_eq!(keys.key_of(b"k1=value").unwrap(), b"k1");
    }

    #[test]
    fn test_insert_and_remove() {
        let index = InMemoryIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.insert("a", loc(0, 0)), None);
        assert_eq!(index.insert("a", loc(0, 5)), Some(loc(0, 0)));
        assert_eq!(index.len(), 1);
        assert_eq!(index.remove(b"a"), Some(loc(0, 5)));
        assert!(index.is_empty());
    }
}
