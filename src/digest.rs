//! Content fingerprints
//!
//! Digests are MD5 so that a local file can be compared against the ETag S3
//! reports for single-part uploads without downloading the object.

use crate::error::{Error, Result};
use md5::{Digest, Md5};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::OnceCell;

/// Read buffer used while hashing
const HASH_BUF_SIZE: usize = 64 * 1024;

/// MD5 digest of an object's bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 16]);

impl ContentDigest {
    /// Digest of an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        Self::from_output(&Md5::digest(data))
    }

    fn from_output(output: &[u8]) -> Self {
        let mut out = [0u8; 16];
        out.copy_from_slice(output);
        Self(out)
    }

    /// Hash everything a reader yields
    pub async fn from_reader<R>(mut reader: R) -> std::io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::from_output(&hasher.finalize()))
    }

    /// Parse a lowercase or uppercase hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Self(out))
    }

    /// Interpret an S3 ETag as a digest.
    ///
    /// Only single-part ETags are plain MD5s; multipart ETags carry a `-N`
    /// suffix and are rejected.
    pub fn from_etag(etag: &str) -> Option<Self> {
        let trimmed = etag.trim_matches('"');
        if trimmed.contains('-') {
            return None;
        }
        Self::from_hex(trimmed)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

/// Per-object memo for a digest that is computed at most once
#[derive(Debug, Default)]
pub struct DigestCell(OnceCell<ContentDigest>);

impl DigestCell {
    pub fn new() -> Self {
        Self(OnceCell::new())
    }

    /// A cell that already knows its value
    pub fn with_value(digest: ContentDigest) -> Self {
        Self(OnceCell::new_with(Some(digest)))
    }

    /// Return the cached digest, running `compute` on first use only.
    ///
    /// Concurrent callers wait for the same computation; a failed computation
    /// leaves the cell empty.
    pub async fn get_or_compute<F, Fut>(&self, path: &str, compute: F) -> Result<ContentDigest>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ContentDigest>>,
    {
        self.0
            .get_or_try_init(compute)
            .await
            .copied()
            .map_err(|e| match e {
                Error::Checksum { .. } => e,
                other => Error::Checksum {
                    path: path.to_string(),
                    message: other.to_string(),
                },
            })
    }

    pub fn get(&self) -> Option<ContentDigest> {
        self.0.get().copied()
    }
}
