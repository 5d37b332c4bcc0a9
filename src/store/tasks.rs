use std::{sync::Arc, time::Duration};

use super::compaction::{CancellationFlag, CompactionPolicy, TieredCompactionPolicy};
use super::index::{ExternalIndex, KeyExtractor};
use super::store::DataFileStore;
use crate::{
    error::{Error, Result},
    scheduler::{BackgroundTask, Context},
};

/// Periodically compacts whatever the policy selects, updates the index
/// with the remaps, and confirms deletion of the compacted files.
///
/// The compaction itself runs on a blocking thread. A scheduler shutdown
/// cancels it between items and leaves the file set as it was.
pub struct CompactionTask {
    store: Arc<DataFileStore>,
    index: Arc<dyn ExternalIndex>,
    keys: Arc<dyn KeyExtractor>,
    policy: Box<dyn CompactionPolicy>,
}

impl CompactionTask {
    /// Uses a [`TieredCompactionPolicy`] built from the store's configuration.
    pub fn new(
        store: Arc<DataFileStore>,
        index: Arc<dyn ExternalIndex>,
        keys: Arc<dyn KeyExtractor>,
    ) -> Self {
        let policy = TieredCompactionPolicy::new(store.config().compaction.clone());
        Self {
            store,
            index,
            keys,
            policy: Box::new(policy),
        }
    }

    pub fn with_policy(mut self, policy: impl CompactionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.store.config().compaction_interval
    }

    async fn execute(&self, mut ctx: Context) -> Result<()> {
        if self.store.is_compacting() {
            return Ok(());
        }
        let files = self.store.compaction_candidates(self.policy.as_ref());
        if files.is_empty() {
            return Ok(());
        }

        let cancel = CancellationFlag::new();
        let mut job = {
            let store = Arc::clone(&self.store);
            let index = Arc::clone(&self.index);
            let keys = Arc::clone(&self.keys);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                store.compact(&files, index.as_ref(), keys.as_ref(), &cancel)
            })
        };

        let finished = tokio::select! {
            joined = &mut job => Some(joined),
            _ = ctx.shutdown.recv() => None,
        };
        let joined = match finished {
            Some(joined) => joined,
            None => {
                cancel.cancel();
                job.await
            }
        };
        let result = match joined.map_err(|e| Error::Task(format!("compaction join error: {}", e)))? {
            Ok(result) => result,
            Err(Error::CompactionCancelled) => return Ok(()),
            Err(e) => return Err(e),
        };

        let applied = result.apply(self.index.as_ref());
        tracing::info!(
            task = ctx.task_name,
            run_id = ctx.run_id,
            remapped = applied,
            superseded_meanwhile = result.remaps.len() - applied,
            "Applied compaction remaps"
        );
        result.pending.confirm();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompactionConfig, StoreConfig};
    use crate::datafile::DataLocation;
    use crate::scheduler::Scheduler;
    use crate::store::InMemoryIndex;
    use crate::tmpfs::TempDir;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    fn key_of(item: &[u8]) -> Result<Vec<u8>> {
        Ok(item[..1].to_vec())
    }

    fn put(store: &DataFileStore, index: &InMemoryIndex, item: &[u8]) -> DataLocation {
        let location = store.append(item).unwrap();
        index.insert(&item[..1], location);
        location
    }

    /// Holds up the second item until released.
    #[derive(Default)]
    struct StallingKeys {
        calls: AtomicUsize,
        stalled: AtomicBool,
        release: AtomicBool,
    }

    impl KeyExtractor for StallingKeys {
        fn key_of(&self, item: &[u8]) -> Result<Vec<u8>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                self.stalled.store(true, Ordering::SeqCst);
                let deadline = Instant::now() + Duration::from_secs(10);
                while !self.release.load(Ordering::SeqCst) && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            key_of(item)
        }
    }

    fn files_on_disk(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != crate::flock::LOCK_FILE_NAME)
            .collect();
        names.sort();
        names
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_cancels_running_compaction() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = StoreConfig::new(dir.path())
            .max_items_per_file(2)
            .compaction(CompactionConfig::default().min_files_per_level(3));
        let store = Arc::new(DataFileStore::open(config)?);
        let index = Arc::new(InMemoryIndex::new());
        let mut locations = Vec::new();
        for item in [b"a1", b"b1", b"c1", b"d1", b"e1", b"f1"] {
            locations.push((item, put(&store, &index, item)));
        }
        assert_eq!(store.file_indices(), vec![0, 1, 2]);

        let keys = Arc::new(StallingKeys::default());
        let task = Arc::new(CompactionTask::new(
            Arc::clone(&store),
            index.clone(),
            keys.clone(),
        ));
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let run = {
            let task = Arc::clone(&task);
            tokio::spawn(async move {
                task.execute(Context {
                    task_name: "compaction",
                    run_id: 1,
                    shutdown: rx,
                })
                .await
            })
        };

        for _ in 0..500 {
            if keys.stalled.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(keys.stalled.load(Ordering::SeqCst), "compaction never started");
        // The first item already sits in an unpublished output file.
        assert_eq!(files_on_disk(dir.path()).len(), 4);

        tx.send(()).expect("Failed to signal shutdown");
        // Let the task observe the signal before the stalled item completes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        keys.release.store(true, Ordering::SeqCst);

        run.await.expect("compaction task panicked")?;
        assert!(!store.is_compacting());
        assert_eq!(store.file_indices(), vec![0, 1, 2]);
        assert_eq!(store.stats().retired_files, 0);
        assert_eq!(
            files_on_disk(dir.path()),
            vec!["00000000.df", "00000001.df", "00000002.df"]
        );
        for (item, location) in locations {
            assert_eq!(index.lookup(&item[..1]), Some(location));
            assert_eq!(store.read(location)?, item);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_background_compaction() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = StoreConfig::new(dir.path())
            .max_items_per_file(2)
            .compaction_interval(Duration::from_millis(10))
            .compaction(CompactionConfig::default().min_files_per_level(3));
        let store = Arc::new(DataFileStore::open(config)?);
        let index = Arc::new(InMemoryIndex::new());

        // Three full level-0 files; "a" and "b" rewritten in the last one.
        for item in [b"a1", b"b1", b"c1", b"d1", b"a2", b"b2"] {
            put(&store, &index, item);
        }
        assert_eq!(store.file_indices(), vec![0, 1, 2]);

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(CompactionTask::new(
            Arc::clone(&store),
            index.clone(),
            Arc::new(key_of),
        )));

        let mut compacted = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.file_indices().iter().all(|i| *i >= 3) {
                compacted = true;
                break;
            }
        }
        scheduler.shutdown().await?;
        assert!(compacted, "background compaction never completed");

        for (key, value) in [(b"a", b"a2"), (b"b", b"b2"), (b"c", b"c1"), (b"d", b"d1")] {
            let location = index.lookup(key).unwrap();
            assert!(location.file_index() >= 3);
            assert_eq!(store.read(location)?, value);
        }
        assert_eq!(store.stats().sealed_items, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_nothing_to_do() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(DataFileStore::open(StoreConfig::new(dir.path()))?);
        let index = Arc::new(InMemoryIndex::new());
        put(&store, &index, b"a1");
        store.roll_over()?;

        let task = CompactionTask::new(Arc::clone(&store), index, Arc::new(key_of));
        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        task.execute(Context {
            task_name: "compaction",
            run_id: 1,
            shutdown: rx,
        })
        .await?;
        assert_eq!(store.file_indices(), vec![0]);
        Ok(())
    }
}
