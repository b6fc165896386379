//! Diff computation between source and destination
//!
//! The destination is drained into an index first; source objects are then
//! compared one at a time as they arrive, so the source listing and the
//! scheduler downstream keep running while the diff is in progress.

use crate::error::{Error, Result};
use crate::storage::{normalize_path, Listing, ObjectRef, Store};
use crate::types::{SkipReason, SyncAction};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

/// One item produced by the diff
#[derive(Debug)]
pub enum DiffItem {
    Action(SyncAction),
    /// The source object could not be fingerprinted
    Failed { path: String, error: Error },
}

impl DiffItem {
    pub fn path(&self) -> &str {
        match self {
            DiffItem::Action(action) => action.path(),
            DiffItem::Failed { path, .. } => path,
        }
    }

    pub fn action(&self) -> Option<&SyncAction> {
        match self {
            DiffItem::Action(action) => Some(action),
            DiffItem::Failed { .. } => None,
        }
    }
}

/// Sending half of the action queue
pub type DiffSender = mpsc::Sender<DiffItem>;

/// Compare `source` against `dest`, sending one item per source path and,
/// when `delete_extraneous` is set, one delete per destination-only path.
///
/// An `Err` is a run-level failure. A destination listing failure is returned
/// before anything is sent; a source listing failure is returned after the
/// listed objects were handled and suppresses all deletes.
pub async fn run(
    source: Listing,
    dest: Listing,
    delete_extraneous: bool,
    tx: DiffSender,
) -> Result<()> {
    let mut remaining = index(dest).await?;
    tracing::debug!(count = remaining.len(), "Indexed destination");

    let mut source = source;
    let mut visited = HashSet::new();
    // directories that still hold at least one source object
    let mut occupied: HashSet<String> = HashSet::new();

    while let Some(obj) = source.next().await {
        let path = normalize_path(obj.relative_path());

        if !visited.insert(path.clone()) {
            tracing::warn!(path = %path, "Duplicate source path ignored");
            continue;
        }
        occupied.extend(parent_dirs(&path).map(str::to_string));

        let existing = remaining.remove(&path);
        let item = compare(obj, path, existing.as_ref()).await;
        if tx.send(item).await.is_err() {
            // scheduler stopped taking work
            return Ok(());
        }
    }

    source.finish().await?;

    if !delete_extraneous {
        return Ok(());
    }

    // children sort after their parent directory marker
    let mut extraneous: Vec<String> = remaining
        .into_keys()
        .filter(|path| {
            let keep = path.ends_with('/') && occupied.contains(path.as_str());
            if keep {
                tracing::debug!(path = %path, "Keeping directory with synced contents");
            }
            !keep
        })
        .collect();
    extraneous.sort_unstable_by(|a, b| b.cmp(a));

    for path in extraneous {
        tracing::debug!(path = %path, "Extraneous in destination");
        if tx
            .send(DiffItem::Action(SyncAction::Delete { path }))
            .await
            .is_err()
        {
            return Ok(());
        }
    }

    Ok(())
}

/// Every enclosing directory of `path`, as `a/`, `a/b/`, ...
fn parent_dirs(path: &str) -> impl Iterator<Item = &str> {
    path.trim_end_matches('/')
        .match_indices('/')
        .map(move |(i, _)| &path[..=i])
}

/// Drain a listing into a map keyed by normalised path
async fn index(mut listing: Listing) -> Result<HashMap<String, ObjectRef>> {
    let mut map = HashMap::new();
    while let Some(obj) = listing.next().await {
        map.insert(normalize_path(obj.relative_path()), obj);
    }
    listing.finish().await?;
    Ok(map)
}

/// Decide what happens to one source object
async fn compare(src: ObjectRef, path: String, dest: Option<&ObjectRef>) -> DiffItem {
    let copy = |src: ObjectRef, path: String| {
        DiffItem::Action(SyncAction::Copy {
            source: src,
            dest_path: path,
        })
    };

    let Some(dest) = dest else {
        return copy(src, path);
    };

    if src.is_dir() || dest.is_dir() {
        if src.is_dir() && dest.is_dir() {
            return DiffItem::Action(SyncAction::Skip {
                path,
                reason: SkipReason::DirectoryExists,
            });
        }
        return copy(src, path);
    }

    if src.size() != dest.size() {
        return copy(src, path);
    }

    let src_digest = match src.checksum().await {
        Ok(d) => d,
        Err(error) => {
            tracing::warn!(path = %path, error = %error, "Source checksum failed");
            return DiffItem::Failed { path, error };
        }
    };

    match dest.checksum().await {
        Ok(dest_digest) if dest_digest == src_digest => DiffItem::Action(SyncAction::Skip {
            path,
            reason: SkipReason::Identical,
        }),
        Ok(_) => copy(src, path),
        Err(e) => {
            tracing::debug!(path = %path, error = %e, "Destination checksum unusable");
            copy(src, path)
        }
    }
}

/// Run a complete diff and collect what it produced.
///
/// Returns the items in emission order together with the run-level failure,
/// if any.
pub async fn compute_diff(
    source: &dyn Store,
    dest: &dyn Store,
    delete_extraneous: bool,
) -> (Vec<DiffItem>, Option<Error>) {
    let (tx, mut rx) = mpsc::channel(64);
    let producer = run(source.files(), dest.files(), delete_extraneous, tx);

    let collector = async {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    };

    let (outcome, items) = tokio::join!(producer, collector);
    (items, outcome.err())
}
