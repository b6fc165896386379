//! Sync engine and orchestration

pub mod diff;
pub mod execute;
pub mod multipart;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use crate::storage::{LocalStore, S3Store, Store};
use crate::types::SyncReport;
use crate::uri::Location;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The main sync engine
pub struct SyncEngine {
    /// Configuration
    config: Arc<Config>,
    /// Source store
    source: Arc<dyn Store>,
    /// Destination store
    dest: Arc<dyn Store>,
    /// Progress tracker
    progress: Arc<ProgressTracker>,
    /// Stops dispatch when cancelled
    cancel: CancellationToken,
}

impl SyncEngine {
    /// Create a new sync engine
    pub fn new(config: Config, source: Arc<dyn Store>, dest: Arc<dyn Store>) -> Self {
        let progress = Arc::new(ProgressTracker::new(config.progress));
        Self {
            config: Arc::new(config),
            source,
            dest,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle that interrupts a running [`SyncEngine::sync`].
    ///
    /// No new actions start once it is cancelled; running ones finish and
    /// open upload sessions are aborted before `sync` returns.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the sync operation.
    ///
    /// Never fails as a whole: run-level problems land in
    /// [`SyncReport::fatal`] and per-object problems in the outcomes.
    pub async fn sync(&self) -> SyncReport {
        let start = std::time::Instant::now();

        tracing::info!(
            source = %self.source.describe(),
            destination = %self.dest.describe(),
            dry_run = self.config.dry_run,
            delete = self.config.delete,
            jobs = self.config.effective_jobs(),
            "Starting sync"
        );

        let (tx, rx) = mpsc::channel(self.config.listing_buffer.max(1));
        let differ = tokio::spawn(diff::run(
            self.source.files(),
            self.dest.files(),
            self.config.delete,
            tx,
        ));

        let execution = execute::execute(
            rx,
            Arc::clone(&self.dest),
            Arc::clone(&self.config),
            Arc::clone(&self.progress),
            self.cancel.clone(),
        )
        .await;

        let mut fatal = Vec::new();
        match differ.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Comparison aborted");
                fatal.push(e);
            }
            Err(e) => fatal.push(Error::storage(format!("diff task failed: {}", e))),
        }
        fatal.extend(execution.crashed);

        self.progress.finish();

        let report = SyncReport {
            outcomes: execution.outcomes,
            fatal,
            halted_by: execution.halted_by,
            dry_run: self.config.dry_run,
            cancelled: execution.cancelled,
            duration: start.elapsed(),
        };

        tracing::info!(
            applied = report.applied(),
            skipped = report.skipped(),
            failed = report.failed(),
            bytes = report.bytes_transferred(),
            "Sync finished"
        );

        report
    }
}

/// Build a store for one location
pub async fn create_store(location: &Location, config: &Config) -> Result<Arc<dyn Store>> {
    Ok(match location {
        Location::Local(path) => {
            Arc::new(LocalStore::new(path.clone()).with_listing_buffer(config.listing_buffer))
        }
        Location::S3 { bucket, prefix } => {
            Arc::new(S3Store::connect(bucket.clone(), prefix.clone(), config).await?)
        }
    })
}

/// Build the source and destination stores.
///
/// A source directory given without a trailing `/` is synced into a
/// sub-directory of the destination named after it.
pub async fn create_stores(
    source: &Location,
    dest: &Location,
    config: &Config,
) -> Result<(Arc<dyn Store>, Arc<dyn Store>)> {
    let dest = match source.nested_name() {
        Some(name) if source_is_container(source, config).await? => dest.join(&name),
        _ => dest.clone(),
    };
    tracing::debug!(source = %source, destination = %dest, "Resolved locations");

    let source_store = create_store(source, config).await?;
    let dest_store = create_store(&dest, config).await?;
    Ok((source_store, dest_store))
}

async fn source_is_container(source: &Location, config: &Config) -> Result<bool> {
    match source {
        Location::Local(path) => Ok(tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)),
        Location::S3 { bucket, prefix } => {
            let store = S3Store::connect(bucket.clone(), prefix.clone(), config).await?;
            Ok(!store.prefix_is_object().await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::ActionKind;
    use tempfile::TempDir;

    fn engine(config: Config, src: &MemoryStore, dst: &MemoryStore) -> SyncEngine {
        SyncEngine::new(config, Arc::new(src.clone()), Arc::new(dst.clone()))
    }

    #[tokio::test]
    async fn test_sync_then_resync_is_all_skips() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.insert("a.txt", "alpha");
        src.insert("docs/", "");
        src.insert("docs/b.txt", "beta");

        let config = Config {
            delete: true,
            ..Config::default()
        };
        let first = engine(config.clone(), &src, &dst).sync().await;
        assert!(!first.has_failures());
        assert_eq!(first.applied_of(ActionKind::Copy), 3);

        let second = engine(config, &src, &dst).sync().await;
        assert!(!second.has_failures());
        assert_eq!(second.applied(), 0);
        assert_eq!(second.skipped(), 3);
    }

    #[tokio::test]
    async fn test_enumeration_failure_fails_run() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.insert("a.txt", "a");
        src.insert("b.txt", "b");
        dst.insert("keep.txt", "k");
        src.fail_listing_after(1);

        let config = Config {
            delete: true,
            ..Config::default()
        };
        let report = engine(config, &src, &dst).sync().await;

        assert!(report.has_failures());
        assert_eq!(report.fatal.len(), 1);
        assert!(dst.contains("keep.txt"));
    }

    #[tokio::test]
    async fn test_masked_failures_still_reported() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.insert("a.txt", "a");
        src.insert("b.txt", "b");
        dst.fail_create("a.txt");

        let config = Config {
            ignore_errors: true,
            ..Config::default()
        };
        let report = engine(config, &src, &dst).sync().await;

        assert!(report.has_failures());
        assert!(report.halted_by.is_none());
        assert_eq!(report.failed(), 1);
        assert!(dst.contains("b.txt"));
    }

    #[tokio::test]
    async fn test_cancelled_sync_leaves_no_open_sessions() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        for i in 0..8 {
            src.insert(&format!("big-{i}.bin"), vec![i as u8; 4_000]);
        }
        // every part is slow to succeed, so the run is mid-upload when cancelled
        for part in 1..=4 {
            dst.fail_part(part, 2);
        }

        let config = Config {
            jobs: 2,
            part_size: 1_000,
            part_retries: 5,
            retry_delay_ms: 20,
            max_retry_delay_ms: 20,
            ..Config::default()
        };
        let engine = engine(config, &src, &dst);
        let cancel = engine.cancellation();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let report = engine.sync().await;
        canceller.await.unwrap();

        assert!(report.cancelled);
        assert!(report.has_failures());
        assert!(report.outcomes.len() < 8);
        assert_eq!(dst.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_create_stores_nests_source_directory() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("photos")).unwrap();
        let source = Location::Local(tmp.path().join("photos"));
        let dest = Location::Local(tmp.path().join("backup"));

        let (_, dest_store) = create_stores(&source, &dest, &Config::default()).await.unwrap();
        assert_eq!(
            dest_store.describe(),
            tmp.path().join("backup").join("photos").display().to_string()
        );

        let source = Location::parse(&format!("{}/", tmp.path().join("photos").display())).unwrap();
        let (_, dest_store) = create_stores(&source, &dest, &Config::default()).await.unwrap();
        assert_eq!(dest_store.describe(), tmp.path().join("backup").display().to_string());
    }
}
