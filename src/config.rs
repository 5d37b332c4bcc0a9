use std::path::PathBuf;
use std::time::Duration;

use crate::datafile::location::MAX_OFFSET;
use crate::datafile::metadata::FOOTER_SIZE;
use crate::error::{Error, Result};

/// What an append does when another append holds the writer lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteContention {
    /// Wait for the lane to free up.
    Block,
    /// Fail immediately with `Error::WriterBusy`.
    FailFast,
}

/// What recovery does with a file that was never sealed.
///
/// A file that was sealed and later damaged is always reported as
/// `CorruptFile`, whatever the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsealedFilePolicy {
    /// Delete the file; its contents are replayed from upstream.
    Discard,
    /// Keep every complete item, truncate the rest and seal the file.
    Recover,
    /// Refuse to open the store.
    Fail,
}

/// Configuration for a data file store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the data files of one dataset
    pub dir: PathBuf,

    /// Roll over to a new file once the active file reaches this many bytes (default: 1GB)
    pub max_file_size: u64,

    /// Roll over to a new file once the active file holds this many items (default: 16M)
    pub max_items_per_file: u64,

    /// Largest accepted item payload (default: 16MB)
    pub max_item_size: usize,

    /// Writer buffer size (default: 64KB)
    pub write_buffer_size: usize,

    /// Iterator read-ahead buffer size (default: 1MB)
    pub iterator_buffer_size: usize,

    /// Behaviour of concurrent appends (default: Block)
    pub write_contention: WriteContention,

    /// Handling of unsealed files found at startup (default: Discard)
    pub unsealed_files: UnsealedFilePolicy,

    /// Fully iterate every sealed file at startup (default: false)
    pub verify_on_open: bool,

    /// How often the background lane checks for compaction opportunities (default: 10s)
    pub compaction_interval: Duration,

    /// Compaction configuration
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Number of sealed files a level must hold before it is compacted (default: 3)
    pub min_files_per_level: usize,

    /// Upper bound on files merged by one compaction (default: 16)
    pub max_files_per_compaction: usize,

    /// Highest compaction level; output of this level stays on it (default: 5)
    pub max_compaction_level: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_files_per_level: 3,
            max_files_per_compaction: 16,
            max_compaction_level: 5,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./datafiles"),
            max_file_size: 1024 * 1024 * 1024, // 1GB
            max_items_per_file: 16 * 1024 * 1024,
            max_item_size: 16 * 1024 * 1024, // 16MB
            write_buffer_size: 64 * 1024,    // 64KB
            iterator_buffer_size: 1024 * 1024,
            write_contention: WriteContention::Block,
            unsealed_files: UnsealedFilePolicy::Discard,
            verify_on_open: false,
            compaction_interval: Duration::from_secs(10),
            compaction: CompactionConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    pub fn max_items_per_file(mut self, items: u64) -> Self {
        self.max_items_per_file = items;
        self
    }

    pub fn max_item_size(mut self, size: usize) -> Self {
        self.max_item_size = size;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn iterator_buffer_size(mut self, size: usize) -> Self {
        self.iterator_buffer_size = size;
        self
    }

    pub fn write_contention(mut self, contention: WriteContention) -> Self {
        self.write_contention = contention;
        self
    }

    pub fn unsealed_files(mut self, policy: UnsealedFilePolicy) -> Self {
        self.unsealed_files = policy;
        self
    }

    pub fn verify_on_open(mut self, enabled: bool) -> Self {
        self.verify_on_open = enabled;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Configure compaction settings
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    /// Checks that the thresholds fit the on-disk address format.
    pub fn validate(&self) -> Result<()> {
        if self.max_file_size > MAX_OFFSET - FOOTER_SIZE as u64 {
            return Err(Error::InvalidConfig(format!(
                "max_file_size {} exceeds addressable file size {}",
                self.max_file_size,
                MAX_OFFSET - FOOTER_SIZE as u64
            )));
        }
        if self.max_file_size == 0 || self.max_items_per_file == 0 {
            return Err(Error::InvalidConfig(
                "roll-over thresholds must be non-zero".to_string(),
            ));
        }
        if self.max_item_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_item_size {} exceeds {}",
                self.max_item_size,
                u32::MAX
            )));
        }
        if self.write_buffer_size == 0 || self.iterator_buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "buffer sizes must be non-zero".to_string(),
            ));
        }
        if self.compaction.min_files_per_level == 0 || self.compaction.max_files_per_compaction == 0
        {
            return Err(Error::InvalidConfig(
                "compaction file counts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl CompactionConfig {
    pub fn min_files_per_level(mut self, files: usize) -> Self {
        self.min_files_per_level = files;
        self
    }

    pub fn max_files_per_compaction(mut self, files: usize) -> Self {
        self.max_files_per_compaction = files;
        self
    }

    pub fn max_compaction_level(mut self, level: u32) -> Self {
        self.max_compaction_level = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.dir, PathBuf::from("./datafiles"));
        assert_eq!(config.max_file_size, 1024 * 1024 * 1024);
        assert_eq!(config.write_buffer_size, 64 * 1024);
        assert_eq!(config.write_contention, WriteContention::Block);
        assert_eq!(config.unsealed_files, UnsealedFilePolicy::Discard);
        assert!(!config.verify_on_open);

        assert_eq!(config.compaction.min_files_per_level, 3);
        assert_eq!(config.compaction.max_files_per_compaction, 16);
        assert_eq!(config.compaction.max_compaction_level, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new("/tmp/test")
            .max_file_size(4096)
            .max_items_per_file(10)
            .max_item_size(512)
            .write_contention(WriteContention::FailFast)
            .unsealed_files(UnsealedFilePolicy::Recover)
            .verify_on_open(true)
            .compaction_interval(Duration::from_millis(500))
            .compaction(
                CompactionConfig::default()
                    .min_files_per_level(2)
                    .max_files_per_compaction(4)
                    .max_compaction_level(1),
            );

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.max_file_size, 4096);
        assert_eq!(config.max_items_per_file, 10);
        assert_eq!(config.max_item_size, 512);
        assert_eq!(config.write_contention, WriteContention::FailFast);
        assert_eq!(config.unsealed_files, UnsealedFilePolicy::Recover);
        assert!(config.verify_on_open);
        assert_eq!(config.compaction_interval, Duration::from_millis(500));
        assert_eq!(config.compaction.min_files_per_level, 2);
        assert_eq!(config.compaction.max_files_per_compaction, 4);
        assert_eq!(config.compaction.max_compaction_level, 1);
    }

    #[test]
    fn test_validate_rejects_unaddressable_file_size() {
        let config = StoreConfig::new("/tmp/test").max_file_size(MAX_OFFSET);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = StoreConfig::new("/tmp/test").max_file_size(u64::MAX);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let largest = MAX_OFFSET - FOOTER_SIZE as u64;
        assert!(StoreConfig::new("/tmp/test").max_file_size(largest).validate().is_ok());

        let config = StoreConfig::new("/tmp/test").max_items_per_file(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
