//! Append-only data files for a virtual merkle tree's leaves and hashes.
//!
//! Items are opaque byte strings. Each append returns a [`DataLocation`]
//! that an external index stores and later hands back to read the item.
//! Files are written once, sealed, and then only read, until compaction
//! copies their live items elsewhere and retires them.

pub mod config;
pub mod datafile;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod tmpfs;

pub use config::{CompactionConfig, StoreConfig, UnsealedFilePolicy, WriteContention};
pub use datafile::{DataFileIterator, DataFileMetadata, DataFileReader, DataFileWriter, DataLocation};
pub use error::{Error, Result};
pub use store::{
    CancellationFlag, CompactionResult, CompactionTask, DataFileStore, ExternalIndex,
    InMemoryIndex, KeyExtractor, TieredCompactionPolicy,
};
