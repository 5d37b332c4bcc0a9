//! The dataset layer: many data files behind one append/read/compact API.
//!
//! ```text
//!            append                      read(location)
//!              │                              │
//!              ▼                              ▼
//!     ┌─────────────────┐   seal   ┌─────────────────────┐
//!     │   active file   │ ───────► │ file set (snapshot) │ ◄── compaction
//!     │ (single writer) │          │  index → reader     │     publishes
//!     └─────────────────┘          └─────────────────────┘
//! ```
//!
//! Locations stay valid until compaction retires their file and the caller
//! confirms the retirement after updating its index.

pub mod compaction;
pub mod file_set;
pub mod index;
pub(crate) mod recovery;
#[allow(clippy::module_inception)]
pub mod store;
pub mod tasks;

pub use compaction::{
    CancellationFlag, CompactionPolicy, CompactionResult, PendingDeletion, Remap,
    TieredCompactionPolicy,
};
pub use file_set::FileSet;
pub use index::{ExternalIndex, InMemoryIndex, KeyExtractor};
pub use store::{DataFileStore, StoreStats};
pub use tasks::CompactionTask;
