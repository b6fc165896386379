//! Local filesystem storage backend

use crate::digest::{ContentDigest, DigestCell};
use crate::error::{Error, Result};
use crate::storage::{
    normalize_path, BackendKind, Listing, ListingSender, Object, ObjectReader, ObjectRef, Store,
};
use crate::config::DEFAULT_LISTING_BUFFER;
use async_trait::async_trait;
use std::any::Any;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Local filesystem storage backend
#[derive(Debug, Clone)]
pub struct LocalStore {
    /// Root path for this backend
    root: PathBuf,
    /// Capacity of the listing queue
    listing_buffer: usize,
}

impl LocalStore {
    /// Create a new local store with the given root path
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            listing_buffer: DEFAULT_LISTING_BUFFER,
        }
    }

    pub fn with_listing_buffer(mut self, capacity: usize) -> Self {
        self.listing_buffer = capacity;
        self
    }

    /// Resolve a relative path to an absolute path
    fn resolve(&self, path: &str) -> PathBuf {
        let path = path.trim_end_matches('/');
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

/// Walk `root`, sending one object per file and one marker per sub-directory
fn scan(root: PathBuf, tx: ListingSender) -> Result<()> {
    let meta = match std::fs::metadata(&root) {
        Ok(m) => m,
        // nothing there yet: an empty store
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(format!("reading {}", root.display()), e)),
    };

    if !meta.is_dir() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let obj = LocalObject::file(root.clone(), name, meta.len());
        let _ = tx.blocking_send(Arc::new(obj));
        return Ok(());
    }

    for entry in jwalk::WalkDir::new(&root)
        .skip_hidden(false)
        .follow_links(false)
        .parallelism(jwalk::Parallelism::RayonNewPool(num_cpus::get()))
    {
        let entry = entry.map_err(|e| {
            Error::io(
                format!("walking {}", root.display()),
                std::io::Error::other(e.to_string()),
            )
        })?;

        let path = entry.path();
        let relative = match path.strip_prefix(&root) {
            Ok(r) if !r.as_os_str().is_empty() => normalize_path(&r.to_string_lossy()),
            _ => continue, // Skip root itself
        };

        let obj = if entry.file_type().is_dir() {
            LocalObject::directory(path, format!("{}/", relative))
        } else if entry.file_type().is_file() {
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    // vanished between readdir and stat
                    tracing::warn!(path = %relative, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            LocalObject::file(path, relative, metadata.len())
        } else {
            tracing::debug!(path = %relative, "Skipping special file");
            continue;
        };

        if tx.blocking_send(Arc::new(obj)).is_err() {
            // consumer stopped listening
            return Ok(());
        }
    }

    Ok(())
}

#[async_trait]
impl Store for LocalStore {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn files(&self) -> Listing {
        let root = self.root.clone();
        Listing::spawn_blocking(self.describe(), self.listing_buffer, move |tx| scan(root, tx))
    }

    async fn create(&self, src: &dyn Object, path: &str) -> Result<()> {
        let full_path = self.resolve(path);

        if src.is_dir() {
            fs::create_dir_all(&full_path)
                .await
                .map_err(|e| Error::io("creating directory", e))?;
            return Ok(());
        }

        // Create parent directories if needed
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io("creating directories", e))?;
        }

        let mut reader = src.reader().await?;
        let mut file = fs::File::create(&full_path)
            .await
            .map_err(|e| Error::io("creating file", e))?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| Error::io("writing file", e))?;
        file.flush().await.map_err(|e| Error::io("flushing file", e))?;

        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve(path);

        let metadata = match fs::symlink_metadata(&full_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io("reading metadata", e)),
        };

        let removed = if metadata.is_dir() {
            fs::remove_dir(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };

        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            // a marker only stands for the directory itself, never its contents
            Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => {
                tracing::debug!(path = %path, "Directory not empty, leaving it");
                Ok(())
            }
            Err(e) => Err(Error::io("removing", e)),
        }
    }
}

/// File or directory found by a local scan
#[derive(Debug)]
pub struct LocalObject {
    full_path: PathBuf,
    relative: String,
    size: u64,
    is_dir: bool,
    digest: DigestCell,
}

impl LocalObject {
    fn file(full_path: PathBuf, relative: String, size: u64) -> Self {
        Self {
            full_path,
            relative,
            size,
            is_dir: false,
            digest: DigestCell::new(),
        }
    }

    fn directory(full_path: PathBuf, relative: String) -> Self {
        Self {
            full_path,
            relative,
            size: 0,
            is_dir: true,
            digest: DigestCell::with_value(ContentDigest::of(b"")),
        }
    }

    pub fn full_path(&self) -> &Path {
        &self.full_path
    }
}

#[async_trait]
impl Object for LocalObject {
    fn relative_path(&self) -> &str {
        &self.relative
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn reader(&self) -> Result<ObjectReader> {
        if self.is_dir {
            return Ok(Box::pin(tokio::io::empty()));
        }
        let file = fs::File::open(&self.full_path)
            .await
            .map_err(|e| Error::io(format!("opening {}", self.full_path.display()), e))?;
        Ok(Box::pin(file))
    }

    async fn checksum(&self) -> Result<ContentDigest> {
        self.digest
            .get_or_compute(&self.relative, || async {
                let reader = self.reader().await?;
                ContentDigest::from_reader(reader)
                    .await
                    .map_err(|e| Error::io("hashing file", e))
            })
            .await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Convenience for tests and callers holding a path rather than a listing
pub async fn open_object(root: &Path, relative: &str) -> Result<ObjectRef> {
    let full_path = root.join(relative);
    let meta = fs::metadata(&full_path)
        .await
        .map_err(|e| Error::io("reading metadata", e))?;
    let obj = if meta.is_dir() {
        LocalObject::directory(full_path, format!("{}/", normalize_path(relative).trim_end_matches('/')))
    } else {
        LocalObject::file(full_path, normalize_path(relative), meta.len())
    };
    Ok(Arc::new(obj))
}
