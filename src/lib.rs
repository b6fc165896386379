//! objsync - backend-agnostic object synchronization
//!
//! This library compares two object stores (local filesystem, S3, or an
//! in-memory store) by content digest and copies, skips or deletes objects so
//! the destination mirrors the source. Large objects are sent as chunked
//! uploads with per-part retries.

pub mod cli;
pub mod config;
pub mod digest;
pub mod error;
pub mod progress;
pub mod retry;
pub mod storage;
pub mod sync;
pub mod types;
pub mod uri;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
