//! In-memory storage backend
//!
//! Behaves like a remote object store (flat keys, multipart sessions) without
//! any network. Faults can be scripted so the retry and abort paths of the
//! sync engine can be exercised deterministically.

use crate::config::DEFAULT_LISTING_BUFFER;
use crate::digest::{ContentDigest, DigestCell};
use crate::error::{Error, Result};
use crate::storage::{
    emit, normalize_path, BackendKind, CompletedPart, Listing, MultipartUploader, Object,
    ObjectMetadata, ObjectReader, Store, UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncReadExt;

/// Something that happened to a memory store, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Created { path: String },
    Deleted { path: String },
    SessionOpened { upload_id: String, path: String },
    PartAttempt { upload_id: String, part_number: u32, len: usize, ok: bool },
    SessionCompleted { upload_id: String },
    SessionAborted { upload_id: String },
}

/// Scripted failures
#[derive(Debug, Default)]
struct Faults {
    /// part number -> remaining failing attempts
    part_failures: HashMap<u32, u32>,
    fail_abort: bool,
    fail_complete: bool,
    fail_listing_after: Option<usize>,
    fail_create: HashSet<String>,
    fail_delete: HashSet<String>,
    fail_reads: HashSet<String>,
}

#[derive(Debug, Clone)]
struct Stored {
    data: Bytes,
    metadata: ObjectMetadata,
}

#[derive(Debug)]
struct PendingUpload {
    path: String,
    metadata: ObjectMetadata,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug)]
struct Inner {
    name: String,
    min_part_size: u64,
    max_parts: u32,
    listing_buffer: usize,
    objects: Mutex<BTreeMap<String, Stored>>,
    sessions: Mutex<HashMap<String, PendingUpload>>,
    faults: Mutex<Faults>,
    events: Mutex<Vec<StoreEvent>>,
    next_upload: AtomicU64,
}

/// In-memory object store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking test thread must not wedge the others
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), 1, u32::MAX)
    }

    /// Require parts of at least `bytes` (except the last)
    pub fn with_min_part_size(name: impl Into<String>, bytes: u64) -> Self {
        Self::build(name.into(), bytes, u32::MAX)
    }

    /// Both part-size floor and part-count ceiling, like a real object store
    pub fn with_part_limits(name: impl Into<String>, min_part_size: u64, max_parts: u32) -> Self {
        Self::build(name.into(), min_part_size, max_parts)
    }

    fn build(name: String, min_part_size: u64, max_parts: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                min_part_size,
                max_parts,
                listing_buffer: DEFAULT_LISTING_BUFFER,
                objects: Mutex::new(BTreeMap::new()),
                sessions: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                events: Mutex::new(Vec::new()),
                next_upload: AtomicU64::new(1),
            }),
        }
    }

    /// Put an object directly, bypassing events
    pub fn insert(&self, path: &str, data: impl Into<Bytes>) {
        self.insert_with_metadata(path, data, ObjectMetadata::default());
    }

    pub fn insert_with_metadata(&self, path: &str, data: impl Into<Bytes>, metadata: ObjectMetadata) {
        lock(&self.inner.objects).insert(
            normalize_path(path),
            Stored {
                data: data.into(),
                metadata,
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        lock(&self.inner.objects).get(path).map(|s| s.data.clone())
    }

    pub fn metadata(&self, path: &str) -> Option<ObjectMetadata> {
        lock(&self.inner.objects).get(path).map(|s| s.metadata.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        lock(&self.inner.objects).contains_key(path)
    }

    /// All stored paths in sorted order
    pub fn paths(&self) -> Vec<String> {
        lock(&self.inner.objects).keys().cloned().collect()
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        lock(&self.inner.events).clone()
    }

    /// Multipart sessions neither completed nor aborted
    pub fn open_sessions(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    /// Make the next `times` attempts at uploading `part_number` fail
    pub fn fail_part(&self, part_number: u32, times: u32) {
        lock(&self.inner.faults).part_failures.insert(part_number, times);
    }

    pub fn fail_abort(&self) {
        lock(&self.inner.faults).fail_abort = true;
    }

    pub fn fail_complete(&self) {
        lock(&self.inner.faults).fail_complete = true;
    }

    /// Stop listings with an error after `count` objects
    pub fn fail_listing_after(&self, count: usize) {
        lock(&self.inner.faults).fail_listing_after = Some(count);
    }

    pub fn fail_create(&self, path: &str) {
        lock(&self.inner.faults).fail_create.insert(path.to_string());
    }

    pub fn fail_delete(&self, path: &str) {
        lock(&self.inner.faults).fail_delete.insert(path.to_string());
    }

    /// Make reads of `path` (digest and copy) fail on objects listed afterwards
    pub fn fail_reads(&self, path: &str) {
        lock(&self.inner.faults).fail_reads.insert(path.to_string());
    }

    fn record(&self, event: StoreEvent) {
        lock(&self.inner.events).push(event);
    }

    fn store(&self, path: &str, data: Bytes, metadata: ObjectMetadata) {
        lock(&self.inner.objects).insert(path.to_string(), Stored { data, metadata });
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn describe(&self) -> String {
        format!("memory://{}", self.inner.name)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn files(&self) -> Listing {
        let snapshot: Vec<(String, Stored)> = lock(&self.inner.objects)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let (fail_after, fail_reads) = {
            let faults = lock(&self.inner.faults);
            (faults.fail_listing_after, faults.fail_reads.clone())
        };
        let store = self.inner.name.clone();

        Listing::spawn(self.describe(), self.inner.listing_buffer, move |tx| async move {
            for (sent, (path, stored)) in snapshot.into_iter().enumerate() {
                if fail_after == Some(sent) {
                    return Err(Error::storage(format!("listing of {} interrupted", store)));
                }
                let obj = MemoryObject {
                    store: store.clone(),
                    fail_read: fail_reads.contains(&path),
                    is_dir: path.ends_with('/'),
                    relative: path,
                    data: stored.data,
                    metadata: stored.metadata,
                    digest: DigestCell::new(),
                };
                if !emit(&tx, Arc::new(obj)).await {
                    return Ok(());
                }
            }
            Ok(())
        })
    }

    async fn create(&self, src: &dyn Object, path: &str) -> Result<()> {
        if lock(&self.inner.faults).fail_create.contains(path) {
            return Err(Error::storage(format!("create of {} refused", path)));
        }

        let path = normalize_path(path);
        if src.is_dir() {
            let marker = if path.ends_with('/') { path } else { format!("{}/", path) };
            self.store(&marker, Bytes::new(), ObjectMetadata::default());
            self.record(StoreEvent::Created { path: marker });
            return Ok(());
        }

        let metadata = self.metadata_for(src).await?;
        let data = match src.as_any().downcast_ref::<MemoryObject>() {
            // same backend: copy without streaming
            Some(mem) if !mem.fail_read => mem.data.clone(),
            _ => {
                let mut reader = src.reader().await?;
                let mut buf = Vec::with_capacity(src.size() as usize);
                reader
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| Error::io("reading source", e))?;
                Bytes::from(buf)
            }
        };

        self.store(&path, data, metadata);
        self.record(StoreEvent::Created { path });
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if lock(&self.inner.faults).fail_delete.contains(path) {
            return Err(Error::storage(format!("delete of {} refused", path)));
        }
        lock(&self.inner.objects).remove(path);
        self.record(StoreEvent::Deleted {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn metadata_for(&self, src: &dyn Object) -> Result<ObjectMetadata> {
        let checksum = Some(src.checksum().await?.to_hex());
        match src.as_any().downcast_ref::<MemoryObject>() {
            Some(mem) => Ok(ObjectMetadata {
                content_type: mem.metadata.content_type.clone(),
                storage_class: mem.metadata.storage_class.clone(),
                checksum,
            }),
            None => Ok(ObjectMetadata {
                checksum,
                ..ObjectMetadata::default()
            }),
        }
    }

    fn multipart(&self) -> Option<&dyn MultipartUploader> {
        Some(self)
    }
}

#[async_trait]
impl MultipartUploader for MemoryStore {
    fn min_part_size(&self) -> u64 {
        self.inner.min_part_size
    }

    fn max_parts(&self) -> u32 {
        self.inner.max_parts
    }

    async fn open_session(&self, path: &str, metadata: &ObjectMetadata) -> Result<String> {
        let id = self.inner.next_upload.fetch_add(1, Ordering::SeqCst);
        let upload_id = format!("mem-upload-{}", id);
        lock(&self.inner.sessions).insert(
            upload_id.clone(),
            PendingUpload {
                path: path.to_string(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        self.record(StoreEvent::SessionOpened {
            upload_id: upload_id.clone(),
            path: path.to_string(),
        });
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let should_fail = {
            let mut faults = lock(&self.inner.faults);
            match faults.part_failures.get_mut(&part_number) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        self.record(StoreEvent::PartAttempt {
            upload_id: session.upload_id.clone(),
            part_number,
            len: data.len(),
            ok: !should_fail,
        });
        if part_number > self.inner.max_parts {
            return Err(Error::storage(format!(
                "part {} exceeds the limit of {}",
                part_number, self.inner.max_parts
            )));
        }
        if should_fail {
            return Err(Error::storage(format!(
                "connection reset uploading part {}",
                part_number
            )));
        }

        let etag = ContentDigest::of(&data).to_hex();
        let mut sessions = lock(&self.inner.sessions);
        let pending = sessions
            .get_mut(&session.upload_id)
            .ok_or_else(|| Error::storage(format!("no such upload: {}", session.upload_id)))?;
        pending.parts.insert(part_number, (etag.clone(), data));

        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_session(&self, session: &UploadSession) -> Result<()> {
        if lock(&self.inner.faults).fail_complete {
            return Err(Error::storage("complete rejected"));
        }

        let pending = {
            let mut sessions = lock(&self.inner.sessions);
            sessions
                .remove(&session.upload_id)
                .ok_or_else(|| Error::storage(format!("no such upload: {}", session.upload_id)))?
        };

        let mut assembled = Vec::new();
        let mut expected = 1;
        for part in &session.parts {
            if part.part_number != expected {
                return Err(Error::storage(format!(
                    "part {} out of order, expected {}",
                    part.part_number, expected
                )));
            }
            let (etag, data) = pending
                .parts
                .get(&part.part_number)
                .ok_or_else(|| Error::storage(format!("part {} never uploaded", part.part_number)))?;
            if *etag != part.etag {
                return Err(Error::storage(format!("etag mismatch on part {}", part.part_number)));
            }
            assembled.extend_from_slice(data);
            expected += 1;
        }

        self.store(&pending.path, Bytes::from(assembled), pending.metadata);
        self.record(StoreEvent::SessionCompleted {
            upload_id: session.upload_id.clone(),
        });
        Ok(())
    }

    async fn abort_session(&self, session: &UploadSession) -> Result<()> {
        if lock(&self.inner.faults).fail_abort {
            return Err(Error::storage(format!("abort of {} rejected", session.upload_id)));
        }
        lock(&self.inner.sessions).remove(&session.upload_id);
        self.record(StoreEvent::SessionAborted {
            upload_id: session.upload_id.clone(),
        });
        Ok(())
    }
}

/// Object listed from a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryObject {
    store: String,
    relative: String,
    data: Bytes,
    metadata: ObjectMetadata,
    is_dir: bool,
    fail_read: bool,
    digest: DigestCell,
}

impl MemoryObject {
    /// Standalone object, handy as a copy source in tests
    pub fn new(relative: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let relative = relative.into();
        Self {
            store: String::new(),
            is_dir: relative.ends_with('/'),
            relative,
            data: data.into(),
            metadata: ObjectMetadata::default(),
            fail_read: false,
            digest: DigestCell::new(),
        }
    }

    pub fn store_name(&self) -> &str {
        &self.store
    }
}

#[async_trait]
impl Object for MemoryObject {
    fn relative_path(&self) -> &str {
        &self.relative
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn reader(&self) -> Result<ObjectReader> {
        if self.fail_read {
            return Err(Error::storage(format!("read of {} failed", self.relative)));
        }
        Ok(Box::pin(std::io::Cursor::new(self.data.clone())))
    }

    async fn checksum(&self) -> Result<ContentDigest> {
        self.digest
            .get_or_compute(&self.relative, || async {
                let reader = self.reader().await?;
                ContentDigest::from_reader(reader)
                    .await
                    .map_err(|e| Error::io("hashing object", e))
            })
            .await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
