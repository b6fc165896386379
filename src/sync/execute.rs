//! Action execution with bounded concurrency

use super::diff::DiffItem;
use super::multipart::ChunkedUpload;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use crate::storage::{ObjectRef, Store};
use crate::types::{ActionKind, ActionOutcome, SyncAction};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// What the scheduler hands back once every dispatched action has settled
#[derive(Debug, Default)]
pub struct Execution {
    pub outcomes: Vec<ActionOutcome>,
    /// Path whose failure stopped dispatch
    pub halted_by: Option<String>,
    /// Workers that died without producing an outcome
    pub crashed: Vec<Error>,
    /// Dispatch stopped because the run was cancelled
    pub cancelled: bool,
}

impl Execution {
    fn settle(&mut self, outcome: ActionOutcome, ignore_errors: bool, progress: &ProgressTracker) {
        progress.record(&outcome);
        if let Some(err) = outcome.error() {
            tracing::error!(path = %outcome.path, action = %outcome.kind, error = %err, "Action failed");
            if !ignore_errors && self.halted_by.is_none() {
                self.halted_by = Some(outcome.path.clone());
            }
        }
        self.outcomes.push(outcome);
    }

    fn reap(
        &mut self,
        joined: std::result::Result<ActionOutcome, JoinError>,
        ignore_errors: bool,
        progress: &ProgressTracker,
    ) {
        match joined {
            Ok(outcome) => self.settle(outcome, ignore_errors, progress),
            Err(e) => {
                tracing::error!(error = %e, "Worker task failed");
                self.crashed.push(Error::storage(format!("worker task failed: {}", e)));
            }
        }
    }

    fn halted(&self) -> bool {
        self.halted_by.is_some() || !self.crashed.is_empty() || self.cancelled
    }

    async fn drain(
        &mut self,
        workers: &mut JoinSet<ActionOutcome>,
        ignore_errors: bool,
        progress: &ProgressTracker,
    ) {
        while let Some(joined) = workers.join_next().await {
            self.reap(joined, ignore_errors, progress);
        }
    }
}

/// Run every item from `items` against `dest` with at most `config.jobs`
/// actions in flight.
///
/// Items are dispatched in the order received. Unless errors are ignored the
/// first failure stops dispatch; actions already running are allowed to
/// finish. Cancelling `cancel` stops dispatch the same way, and running
/// chunked uploads abort at their next part. Dropping the receiver on return
/// tells the producer to stop.
pub async fn execute(
    mut items: mpsc::Receiver<DiffItem>,
    dest: Arc<dyn Store>,
    config: Arc<Config>,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
) -> Execution {
    let ignore_errors = config.ignore_errors;
    let semaphore = Arc::new(Semaphore::new(config.effective_jobs()));
    let mut workers: JoinSet<ActionOutcome> = JoinSet::new();
    let mut execution = Execution::default();

    loop {
        while let Some(joined) = workers.try_join_next() {
            execution.reap(joined, ignore_errors, &progress);
        }
        if execution.halted() {
            break;
        }

        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(running = workers.len(), "Cancelled, waiting for running actions");
                execution.cancelled = true;
                break;
            }
            item = items.recv() => item,
        };
        let Some(item) = item else {
            break;
        };

        let action = match item {
            DiffItem::Failed { path, error } => {
                let error = Error::transfer(path.clone(), error);
                execution.settle(
                    ActionOutcome::failed(path, ActionKind::Copy, error),
                    ignore_errors,
                    &progress,
                );
                continue;
            }
            DiffItem::Action(SyncAction::Skip { path, reason }) => {
                tracing::debug!(path = %path, reason = %reason, "Skipping");
                execution.settle(ActionOutcome::skipped(path), ignore_errors, &progress);
                continue;
            }
            DiffItem::Action(action) => action,
        };

        // deletes arrive children first; a directory goes once they are done
        if matches!(&action, SyncAction::Delete { path } if path.ends_with('/')) {
            execution.drain(&mut workers, ignore_errors, &progress).await;
            if execution.halted() {
                break;
            }
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                execution.cancelled = true;
                break;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // a slot only frees up when a worker finishes; look at it before going on
        while let Some(joined) = workers.try_join_next() {
            execution.reap(joined, ignore_errors, &progress);
        }
        if execution.halted() {
            break;
        }

        let dest = Arc::clone(&dest);
        let config = Arc::clone(&config);
        let progress = Arc::clone(&progress);
        let cancel = cancel.clone();
        workers.spawn(async move {
            let _permit = permit;
            progress.start(action.kind(), action.path());
            run_action(action, dest.as_ref(), &config, cancel).await
        });
    }

    drop(items);
    execution.drain(&mut workers, ignore_errors, &progress).await;

    execution
}

/// Apply a single copy or delete
async fn run_action(
    action: SyncAction,
    dest: &dyn Store,
    config: &Config,
    cancel: CancellationToken,
) -> ActionOutcome {
    let path = action.path().to_string();
    let kind = action.kind();

    if config.dry_run {
        match &action {
            SyncAction::Copy { source, .. } => {
                tracing::info!(path = %path, size = source.size(), "Would copy");
            }
            _ => tracing::info!(path = %path, "Would {}", kind),
        }
        return ActionOutcome::applied(path, kind, 0);
    }

    let result = match action {
        SyncAction::Copy { source, dest_path } => {
            copy(source, &dest_path, dest, config, cancel).await
        }
        SyncAction::Delete { path } => {
            tracing::info!(path = %path, "Deleting");
            dest.delete(&path).await.map(|()| 0)
        }
        SyncAction::Skip { path, .. } => return ActionOutcome::skipped(path),
    };

    match result {
        Ok(bytes) => ActionOutcome::applied(path, kind, bytes),
        Err(e) => {
            let error = Error::transfer(path.clone(), e);
            ActionOutcome::failed(path, kind, error)
        }
    }
}

/// Copy one object, choosing a single-shot write or a chunked upload
async fn copy(
    source: ObjectRef,
    dest_path: &str,
    dest: &dyn Store,
    config: &Config,
    cancel: CancellationToken,
) -> Result<u64> {
    if source.is_dir() {
        tracing::debug!(path = %dest_path, "Creating directory");
        dest.create(source.as_ref(), dest_path).await?;
        return Ok(0);
    }

    let size = source.size();

    if let Some(uploader) = dest.multipart() {
        let upload = ChunkedUpload::new(uploader, config).with_cancel(cancel);
        if size > upload.part_size() {
            tracing::info!(
                path = %dest_path,
                size,
                part_size = upload.part_size(),
                "Uploading in parts"
            );
            let metadata = dest.metadata_for(source.as_ref()).await?;
            return upload.run(source.as_ref(), dest_path, &metadata).await;
        }
    }

    tracing::info!(path = %dest_path, size, "Copying");
    dest.create(source.as_ref(), dest_path).await?;
    Ok(size)
}
