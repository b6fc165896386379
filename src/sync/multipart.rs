//! Chunked upload of large objects
//!
//! A session is opened on the destination, the source is read sequentially
//! in fixed-size parts, each part gets a bounded number of attempts, and the
//! session is completed with the parts in order. Any failure after the
//! session exists aborts it so no partial object is left behind.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::{MultipartUploader, Object, ObjectMetadata, ObjectReader, UploadSession};
use bytes::Bytes;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// How an object of `size` bytes splits into parts of `part_size`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    size: u64,
    part_size: u64,
}

impl ChunkPlan {
    pub fn new(size: u64, part_size: u64) -> Self {
        Self {
            size,
            part_size: part_size.max(1),
        }
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Number of parts; every part is full except possibly the last
    pub fn part_count(&self) -> u32 {
        self.size.div_ceil(self.part_size) as u32
    }

    /// Length of 1-based part `part_number`
    pub fn part_len(&self, part_number: u32) -> u64 {
        let offset = (part_number as u64 - 1) * self.part_size;
        self.part_size.min(self.size.saturating_sub(offset))
    }

    /// `(part_number, offset, len)` for every part in order
    pub fn parts(&self) -> impl Iterator<Item = (u32, u64, u64)> + '_ {
        (1..=self.part_count()).map(move |n| (n, (n as u64 - 1) * self.part_size, self.part_len(n)))
    }
}

/// Part size used for an object of `size` bytes against `uploader`.
///
/// Never below the configured size or the backend minimum, and grown when
/// the object would otherwise need more parts than the backend allows.
pub fn effective_part_size(configured: u64, size: u64, uploader: &dyn MultipartUploader) -> u64 {
    scaled_part_size(configured, uploader.min_part_size(), uploader.max_parts(), size)
}

fn scaled_part_size(configured: u64, min_part_size: u64, max_parts: u32, size: u64) -> u64 {
    let fitting = size.div_ceil(u64::from(max_parts.max(1)));
    configured.max(min_part_size).max(fitting).max(1)
}

/// Runs the chunked upload protocol against one destination
pub struct ChunkedUpload<'a> {
    uploader: &'a dyn MultipartUploader,
    part_size: u64,
    retry: RetryPolicy,
    session_ttl: Duration,
    cancel: CancellationToken,
}

impl<'a> ChunkedUpload<'a> {
    pub fn new(uploader: &'a dyn MultipartUploader, config: &Config) -> Self {
        Self {
            uploader,
            part_size: effective_part_size(config.part_size, 0, uploader),
            retry: RetryPolicy::from(config),
            session_ttl: Duration::from_secs(config.session_ttl_secs),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between parts once `cancel` fires, aborting the session
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Smallest part size this upload uses; objects at or below it go in one request
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Upload `src` to `path`, returning the number of bytes sent.
    ///
    /// On failure the session has been aborted; if the abort failed as well
    /// the returned error is [`Error::Abort`] carrying both errors.
    pub async fn run(&self, src: &dyn Object, path: &str, metadata: &ObjectMetadata) -> Result<u64> {
        let part_size = effective_part_size(self.part_size, src.size(), self.uploader);
        let upload_id = self.uploader.open_session(path, metadata).await?;
        let mut session = UploadSession::new(
            upload_id,
            path.to_string(),
            part_size,
            SystemTime::now() + self.session_ttl,
        );

        tracing::debug!(
            path = %path,
            upload_id = %session.upload_id,
            size = src.size(),
            part_size,
            "Opened upload session"
        );

        match self.send_parts(src, &mut session).await {
            Ok(bytes) => Ok(bytes),
            Err(cause) => Err(self.abandon(&session, cause).await),
        }
    }

    async fn send_parts(&self, src: &dyn Object, session: &mut UploadSession) -> Result<u64> {
        let plan = ChunkPlan::new(src.size(), session.part_size);
        let mut reader = src.reader().await?;
        let mut sent = 0u64;

        for (part_number, _offset, len) in plan.parts() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            check_deadline(session)?;

            let data = read_part(&mut reader, len)
                .await
                .map_err(|e| Error::io(format!("reading part {} of {}", part_number, session.path), e))?;

            let uploaded = {
                let session = &*session;
                with_retry(&self.retry, |attempt| {
                    tracing::trace!(part_number, attempt, "Uploading part");
                    self.uploader.upload_part(session, part_number, data.clone())
                })
                .await
            };

            let part = uploaded.map_err(|exhausted| Error::Session {
                upload_id: session.upload_id.clone(),
                part_number,
                attempts: exhausted.attempts,
                source: Box::new(exhausted.last),
            })?;

            sent += len;
            session.parts.push(part);
        }

        // no parts at all would be rejected by the backend
        if session.parts.is_empty() {
            let part = self
                .uploader
                .upload_part(session, session.next_part_number(), Bytes::new())
                .await?;
            session.parts.push(part);
        }

        check_deadline(session)?;
        self.uploader.complete_session(session).await?;

        tracing::debug!(
            path = %session.path,
            upload_id = %session.upload_id,
            parts = session.parts.len(),
            "Completed upload session"
        );
        Ok(sent)
    }

    /// Abort `session` after `cause`, folding an abort failure into the error
    async fn abandon(&self, session: &UploadSession, cause: Error) -> Error {
        match self.uploader.abort_session(session).await {
            Ok(()) => {
                tracing::warn!(
                    path = %session.path,
                    upload_id = %session.upload_id,
                    error = %cause,
                    "Aborted upload session"
                );
                cause
            }
            Err(abort) => {
                tracing::error!(
                    upload_id = %session.upload_id,
                    error = %abort,
                    "Failed to abort upload session"
                );
                Error::Abort {
                    upload_id: session.upload_id.clone(),
                    cause: Box::new(cause),
                    abort: Box::new(abort),
                }
            }
        }
    }
}

fn check_deadline(session: &UploadSession) -> Result<()> {
    if session.is_expired(SystemTime::now()) {
        return Err(Error::SessionExpired {
            upload_id: session.upload_id.clone(),
        });
    }
    Ok(())
}

/// Read exactly `len` bytes; a short source is an error
async fn read_part(reader: &mut ObjectReader, len: u64) -> std::io::Result<Bytes> {
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryObject, MemoryStore, StoreEvent};
    use proptest::prelude::*;

    fn config(part_size: u64, part_retries: u32) -> Config {
        Config {
            part_size,
            part_retries,
            retry_delay_ms: 0,
            max_retry_delay_ms: 0,
            ..Config::default()
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn part_attempts(store: &MemoryStore) -> Vec<(u32, usize, bool)> {
        store
            .events()
            .into_iter()
            .filter_map(|e| match e {
                StoreEvent::PartAttempt {
                    part_number, len, ok, ..
                } => Some((part_number, len, ok)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_chunk_plan_splits_with_short_tail() {
        let plan = ChunkPlan::new(13_000_000, 6_000_000);
        assert_eq!(plan.part_count(), 3);
        let parts: Vec<_> = plan.parts().collect();
        assert_eq!(
            parts,
            vec![
                (1, 0, 6_000_000),
                (2, 6_000_000, 6_000_000),
                (3, 12_000_000, 1_000_000)
            ]
        );
    }

    #[test]
    fn test_part_size_respects_backend_minimum() {
        let store = MemoryStore::with_min_part_size("dst", 5 * 1024 * 1024);
        assert_eq!(effective_part_size(1024, 0, &store), 5 * 1024 * 1024);
        assert_eq!(effective_part_size(6_000_000, 0, &store), 6_000_000);
    }

    #[test]
    fn test_part_size_grows_to_fit_part_limit() {
        // 10,000 parts of 6,000,000 bytes stop just short of this object
        let size = 60_000_000_001u64;
        let part_size = scaled_part_size(6_000_000, 5 * 1024 * 1024, 10_000, size);
        assert_eq!(part_size, 6_000_001);

        let plan = ChunkPlan::new(size, part_size);
        assert_eq!(plan.part_count(), 10_000);
        assert_eq!(plan.part_len(10_000), size - 9_999 * part_size);

        // exactly at the limit nothing changes
        assert_eq!(scaled_part_size(6_000_000, 5 * 1024 * 1024, 10_000, 60_000_000_000), 6_000_000);
    }

    #[tokio::test]
    async fn test_upload_stays_within_part_limit() {
        let store = MemoryStore::with_part_limits("dst", 1, 3);
        let data = payload(10);
        let src = MemoryObject::new("big.bin", data.clone());

        ChunkedUpload::new(&store, &config(2, 0))
            .run(&src, "big.bin", &ObjectMetadata::default())
            .await
            .unwrap();

        assert_eq!(
            part_attempts(&store),
            vec![(1, 4, true), (2, 4, true), (3, 2, true)]
        );
        assert_eq!(store.get("big.bin").unwrap().as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_empty_object_sends_one_empty_part() {
        let store = MemoryStore::new("dst");
        let src = MemoryObject::new("empty.bin", Vec::new());

        let sent = ChunkedUpload::new(&store, &config(600, 0))
            .run(&src, "empty.bin", &ObjectMetadata::default())
            .await
            .unwrap();

        assert_eq!(sent, 0);
        assert_eq!(part_attempts(&store), vec![(1, 0, true)]);
        assert_eq!(store.get("empty.bin").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_upload_aborts_session() {
        let store = MemoryStore::new("dst");
        let src = MemoryObject::new("big.bin", payload(1300));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ChunkedUpload::new(&store, &config(600, 2))
            .with_cancel(cancel)
            .run(&src, "big.bin", &ObjectMetadata::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(store
            .events()
            .iter()
            .any(|e| matches!(e, StoreEvent::SessionAborted { .. })));
        assert_eq!(store.open_sessions(), 0);
        assert!(!store.contains("big.bin"));
    }

    #[tokio::test]
    async fn test_parts_uploaded_in_order_and_assembled() {
        let store = MemoryStore::new("dst");
        let data = payload(1300);
        let src = MemoryObject::new("big.bin", data.clone());

        let upload = ChunkedUpload::new(&store, &config(600, 2));
        let sent = upload
            .run(&src, "big.bin", &ObjectMetadata::default())
            .await
            .unwrap();

        assert_eq!(sent, 1300);
        assert_eq!(
            part_attempts(&store),
            vec![(1, 600, true), (2, 600, true), (3, 100, true)]
        );
        assert_eq!(store.get("big.bin").unwrap().as_ref(), data.as_slice());
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_part_retried_then_succeeds() {
        let store = MemoryStore::new("dst");
        store.fail_part(2, 1);
        let src = MemoryObject::new("big.bin", payload(1300));

        let upload = ChunkedUpload::new(&store, &config(600, 2));
        upload
            .run(&src, "big.bin", &ObjectMetadata::default())
            .await
            .unwrap();

        let attempts = part_attempts(&store);
        assert_eq!(attempts.iter().filter(|a| a.0 == 2).count(), 2);
        assert!(store
            .events()
            .iter()
            .any(|e| matches!(e, StoreEvent::SessionCompleted { .. })));
    }

    #[tokio::test]
    async fn test_exhausted_part_aborts_session() {
        let store = MemoryStore::new("dst");
        store.fail_part(2, 10);
        let src = MemoryObject::new("big.bin", payload(1300));

        let upload = ChunkedUpload::new(&store, &config(600, 2));
        let err = upload
            .run(&src, "big.bin", &ObjectMetadata::default())
            .await
            .unwrap_err();

        match err {
            Error::Session {
                part_number,
                attempts,
                ..
            } => {
                assert_eq!(part_number, 2);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }

        // part 3 never attempted
        assert!(part_attempts(&store).iter().all(|a| a.0 != 3));
        assert!(store
            .events()
            .iter()
            .any(|e| matches!(e, StoreEvent::SessionAborted { .. })));
        assert_eq!(store.open_sessions(), 0);
        assert!(!store.contains("big.bin"));
    }

    #[tokio::test]
    async fn test_failed_abort_reports_both_errors() {
        let store = MemoryStore::new("dst");
        store.fail_part(1, 10);
        store.fail_abort();
        let src = MemoryObject::new("big.bin", payload(1300));

        let upload = ChunkedUpload::new(&store, &config(600, 0));
        let err = upload
            .run(&src, "big.bin", &ObjectMetadata::default())
            .await
            .unwrap_err();

        match &err {
            Error::Abort { cause, .. } => assert!(matches!(**cause, Error::Session { .. })),
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.is_session_failure());
    }

    #[tokio::test]
    async fn test_complete_failure_aborts() {
        let store = MemoryStore::new("dst");
        store.fail_complete();
        let src = MemoryObject::new("big.bin", payload(1300));

        let upload = ChunkedUpload::new(&store, &config(600, 2));
        assert!(upload
            .run(&src, "big.bin", &ObjectMetadata::default())
            .await
            .is_err());
        assert!(store
            .events()
            .iter()
            .any(|e| matches!(e, StoreEvent::SessionAborted { .. })));
    }

    #[tokio::test]
    async fn test_expired_session_is_aborted() {
        let store = MemoryStore::new("dst");
        let src = MemoryObject::new("big.bin", payload(1300));

        let mut cfg = config(600, 2);
        cfg.session_ttl_secs = 0;
        let err = ChunkedUpload::new(&store, &cfg)
            .run(&src, "big.bin", &ObjectMetadata::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SessionExpired { .. }));
        assert!(part_attempts(&store).is_empty());
        assert_eq!(store.open_sessions(), 0);
    }

    proptest! {
        #[test]
        fn prop_scaled_part_size_fits_limit(
            size in 0u64..u64::MAX / 2,
            configured in 1u64..100_000_000,
            max_parts in 1u32..20_000,
        ) {
            let part_size = scaled_part_size(configured, 5 * 1024 * 1024, max_parts, size);
            prop_assert!(part_size >= configured);
            prop_assert!(ChunkPlan::new(size, part_size).part_count() <= max_parts);
        }

        #[test]
        fn prop_chunk_plan_covers_object(size in 0u64..10_000_000, part_size in 1u64..3_000_000) {
            let plan = ChunkPlan::new(size, part_size);
            let parts: Vec<_> = plan.parts().collect();

            prop_assert_eq!(parts.len() as u32, plan.part_count());
            prop_assert_eq!(parts.iter().map(|p| p.2).sum::<u64>(), size);

            let mut expected_offset = 0;
            for (i, (number, offset, len)) in parts.iter().enumerate() {
                prop_assert_eq!(*number, i as u32 + 1);
                prop_assert_eq!(*offset, expected_offset);
                prop_assert!(*len > 0 && *len <= part_size);
                if i + 1 < parts.len() {
                    prop_assert_eq!(*len, part_size);
                }
                expected_offset += len;
            }
        }
    }
}
