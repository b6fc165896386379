//! Storage backends for objsync
//!
//! The sync engine only ever sees the [`Store`] and [`Object`] traits; each
//! backend supplies its own implementations.

pub mod local;
pub mod memory;
pub mod s3;

use crate::digest::ContentDigest;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

/// Readable byte stream of an object's contents
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Shared handle to an enumerated object
pub type ObjectRef = Arc<dyn Object>;

/// Which kind of backend an object or store belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    S3,
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::S3 => f.write_str("s3"),
            BackendKind::Memory => f.write_str("memory"),
        }
    }
}

/// A named, sized, digestible unit of data held by a store
#[async_trait]
pub trait Object: Send + Sync + fmt::Debug {
    /// Slash-separated path relative to the store root; directories end in `/`
    fn relative_path(&self) -> &str;

    /// Size in bytes (0 for directory markers)
    fn size(&self) -> u64;

    fn is_dir(&self) -> bool;

    fn kind(&self) -> BackendKind;

    /// Open the object's contents for reading
    async fn reader(&self) -> Result<ObjectReader>;

    /// Content digest, computed on first call and cached afterwards
    async fn checksum(&self) -> Result<ContentDigest>;

    /// Lets a backend recognise its own objects
    fn as_any(&self) -> &dyn Any;
}

/// Headers carried over to an uploaded object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_type: Option<String>,
    pub storage_class: Option<String>,
    /// Hex digest of the source, stored as `md5_checksum` user metadata
    pub checksum: Option<String>,
}

/// Completed multipart upload part info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number (1-indexed)
    pub part_number: u32,
    /// ETag of the uploaded part
    pub etag: String,
}

/// State of one multipart upload
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: String,
    /// Destination path relative to the store root
    pub path: String,
    pub part_size: u64,
    /// Completed parts in ascending part-number order
    pub parts: Vec<CompletedPart>,
    /// Deadline after which the destination may discard the session
    pub expires_at: SystemTime,
}

impl UploadSession {
    pub fn new(upload_id: String, path: String, part_size: u64, expires_at: SystemTime) -> Self {
        Self {
            upload_id,
            path,
            part_size,
            parts: Vec::new(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Part number the next upload must use
    pub fn next_part_number(&self) -> u32 {
        self.parts.last().map(|p| p.part_number + 1).unwrap_or(1)
    }
}

/// Multipart calls a remote backend must support
#[async_trait]
pub trait MultipartUploader: Send + Sync {
    /// Smallest part size the backend accepts (except for the last part)
    fn min_part_size(&self) -> u64 {
        1
    }

    /// Most parts one session may have
    fn max_parts(&self) -> u32 {
        u32::MAX
    }

    /// Start a session, returning its upload ID
    async fn open_session(&self, path: &str, metadata: &ObjectMetadata) -> Result<String>;

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart>;

    async fn complete_session(&self, session: &UploadSession) -> Result<()>;

    async fn abort_session(&self, session: &UploadSession) -> Result<()>;
}

/// A backend exposing enumeration, create and delete over objects
#[async_trait]
pub trait Store: Send + Sync {
    /// Human-readable location, e.g. `s3://bucket/prefix`
    fn describe(&self) -> String;

    fn kind(&self) -> BackendKind;

    /// Start a lazy enumeration of every object under the root
    fn files(&self) -> Listing;

    /// Write `src`'s bytes at `path`, creating containers and overwriting
    async fn create(&self, src: &dyn Object, path: &str) -> Result<()>;

    /// Remove the object at `path`; a missing object is not an error
    async fn delete(&self, path: &str) -> Result<()>;

    /// Headers to apply when `src` is written into this store
    async fn metadata_for(&self, src: &dyn Object) -> Result<ObjectMetadata> {
        let _ = src;
        Ok(ObjectMetadata::default())
    }

    /// Multipart support, if the backend has it
    fn multipart(&self) -> Option<&dyn MultipartUploader> {
        None
    }
}

/// Sending half handed to a listing producer
pub type ListingSender = mpsc::Sender<ObjectRef>;

/// Single-pass enumeration of a store.
///
/// Objects arrive through a bounded queue while the producer keeps running.
/// The producer's failure, if any, is only available from [`Listing::finish`]
/// once every object has been received.
pub struct Listing {
    store: String,
    rx: mpsc::Receiver<ObjectRef>,
    producer: JoinHandle<Result<()>>,
}

impl Listing {
    /// Spawn `produce` as the producer feeding a queue of `capacity` objects
    pub fn spawn<F, Fut>(store: impl Into<String>, capacity: usize, produce: F) -> Self
    where
        F: FnOnce(ListingSender) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let producer = tokio::spawn(produce(tx));
        Self {
            store: store.into(),
            rx,
            producer,
        }
    }

    /// Same as [`Listing::spawn`] for producers that block on I/O
    pub fn spawn_blocking<F>(store: impl Into<String>, capacity: usize, produce: F) -> Self
    where
        F: FnOnce(ListingSender) -> Result<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let producer = tokio::task::spawn_blocking(move || produce(tx));
        Self {
            store: store.into(),
            rx,
            producer,
        }
    }

    /// Next object, or `None` once the producer has stopped
    pub async fn next(&mut self) -> Option<ObjectRef> {
        self.rx.recv().await
    }

    /// Drain any remaining objects and return the producer's result.
    ///
    /// Failures are wrapped as [`Error::Enumeration`].
    pub async fn finish(mut self) -> Result<()> {
        while self.rx.recv().await.is_some() {}
        let outcome = match self.producer.await {
            Ok(result) => result,
            Err(join) if join.is_cancelled() => Err(Error::Cancelled),
            Err(join) => Err(Error::storage(format!("listing task panicked: {}", join))),
        };
        outcome.map_err(|e| match e {
            Error::Enumeration { .. } => e,
            other => Error::enumeration(self.store.clone(), other),
        })
    }

    /// Collect every object, then surface the deferred error
    pub async fn collect(mut self) -> Result<Vec<ObjectRef>> {
        let mut out = Vec::new();
        while let Some(obj) = self.next().await {
            out.push(obj);
        }
        self.finish().await?;
        Ok(out)
    }
}

/// Send an object from a producer; `false` means the consumer went away
pub async fn emit(tx: &ListingSender, obj: ObjectRef) -> bool {
    tx.send(obj).await.is_ok()
}

/// Normalise a backend path to the neutral form: `/` separators, no leading
/// `./` or `/`, no repeated separators. A trailing `/` is kept.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let trailing = unified.ends_with('/');
    let parts: Vec<&str> = unified
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    let mut out = parts.join("/");
    if trailing && !out.is_empty() {
        out.push('/');
    }
    out
}
