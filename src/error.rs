use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// A data file failed validation. Fatal for that file.
    #[error("Corrupt data file {} at offset {offset}: {reason}", path.display())]
    CorruptFile {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// An address referenced a file index that is not part of the current file set.
    #[error("Unknown data file index {0}")]
    UnknownFile(u32),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Writer is busy")]
    WriterBusy,

    #[error("Item of {size} bytes exceeds limit of {limit} bytes")]
    ItemTooLarge { size: usize, limit: usize },

    #[error("Compaction cancelled")]
    CompactionCancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl Error {
    pub(crate) fn corrupt(path: &Path, offset: u64, reason: impl Into<String>) -> Self {
        Error::CorruptFile {
            path: path.to_path_buf(),
            offset,
            reason: reason.into(),
        }
    }

    /// Attaches file context to errors raised while decoding file contents.
    ///
    /// Codec failures and short reads become `CorruptFile`; every other
    /// error passes through untouched.
    pub(crate) fn at_file(self, path: &Path, offset: u64) -> Self {
        match self {
            Error::MalformedFrame(reason) => Error::corrupt(path, offset, reason),
            Error::IoError(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Error::corrupt(path, offset, "unexpected end of file")
            }
            other => other,
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::CorruptFile { .. })
    }
}
