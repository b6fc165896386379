//! Configuration management for objsync

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default number of parallel actions
pub const DEFAULT_JOBS: usize = 32;

/// Default multipart part size (6MB - above the S3 minimum)
pub const DEFAULT_PART_SIZE: u64 = 6_000_000;

/// Default retries per multipart part (3 attempts in total)
pub const DEFAULT_PART_RETRIES: u32 = 2;

/// Default lifetime of a multipart session (one day)
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Default capacity of the listing and action queues
pub const DEFAULT_LISTING_BUFFER: usize = 1000;

/// Canned ACLs accepted by S3
pub const VALID_ACLS: &[&str] = &[
    "private",
    "public-read",
    "public-read-write",
    "authenticated-read",
    "bucket-owner-read",
    "bucket-owner-full-control",
    "log-delivery-write",
];

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ==================== Scheduling ====================

    /// Number of concurrent actions (0 = auto-detect CPU count)
    pub jobs: usize,

    /// Perform a dry run (no actual changes)
    pub dry_run: bool,

    /// Keep going after a failed action
    pub ignore_errors: bool,

    /// Delete extraneous files from destination
    pub delete: bool,

    /// Show progress bars
    pub progress: bool,

    /// Capacity of the listing and action queues
    pub listing_buffer: usize,

    // ==================== Multipart ====================

    /// Part size for chunked uploads; also the single-shot threshold
    pub part_size: u64,

    /// Retries per part after the first attempt
    pub part_retries: u32,

    /// Backoff base between part attempts in milliseconds
    pub retry_delay_ms: u64,

    /// Backoff cap between part attempts in milliseconds
    pub max_retry_delay_ms: u64,

    /// Seconds after which an unfinished upload session is abandoned
    pub session_ttl_secs: u64,

    // ==================== Cloud Storage ====================

    /// Canned ACL applied to uploads
    pub acl: Option<String>,

    /// S3 storage class for uploads (STANDARD, STANDARD_IA, GLACIER, etc.)
    pub storage_class: Option<String>,

    /// Custom S3 endpoint for S3-compatible storage (MinIO, Ceph, etc.)
    pub s3_endpoint: Option<String>,

    /// Region override
    pub region: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs: DEFAULT_JOBS,
            dry_run: false,
            ignore_errors: false,
            delete: false,
            progress: false,
            listing_buffer: DEFAULT_LISTING_BUFFER,

            part_size: DEFAULT_PART_SIZE,
            part_retries: DEFAULT_PART_RETRIES,
            retry_delay_ms: 500,
            max_retry_delay_ms: 10_000,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,

            acl: None,
            storage_class: None,
            s3_endpoint: None,
            region: None,
        }
    }
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io("reading config", e))?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("creating config dir", e))?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("serializing config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| Error::io("writing config", e))?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("objsync").join("config.toml"))
            .ok_or_else(|| Error::config("could not determine config directory"))
    }

    /// Get the effective number of jobs (resolves 0 to CPU count)
    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            num_cpus::get()
        } else {
            self.jobs
        }
    }

    /// Check that option values are usable
    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            return Err(Error::config("part size must be greater than zero"));
        }
        if self.listing_buffer == 0 {
            return Err(Error::config("listing buffer must be greater than zero"));
        }
        if let Some(acl) = &self.acl {
            if !VALID_ACLS.contains(&acl.as_str()) {
                return Err(Error::config(format!(
                    "acl should be one of: {}",
                    VALID_ACLS.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Parse a size string like "100", "100K", "100M", "100G" into bytes
    pub fn parse_size(s: &str) -> Result<u64> {
        let s = s.trim().to_uppercase();
        if s.is_empty() {
            return Ok(0);
        }

        let (num_part, suffix) = if let Some(n) = s.strip_suffix("KB") {
            (n, 1024u64)
        } else if let Some(n) = s.strip_suffix("MB") {
            (n, 1024u64 * 1024)
        } else if let Some(n) = s.strip_suffix("GB") {
            (n, 1024u64 * 1024 * 1024)
        } else if let Some(n) = s.strip_suffix('K') {
            (n, 1024u64)
        } else if let Some(n) = s.strip_suffix('M') {
            (n, 1024u64 * 1024)
        } else if let Some(n) = s.strip_suffix('G') {
            (n, 1024u64 * 1024 * 1024)
        } else {
            (s.as_str(), 1u64)
        };

        let num: u64 = num_part
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("invalid size value: {}", s)))?;

        num.checked_mul(suffix)
            .ok_or_else(|| Error::config(format!("size out of range: {}", s)))
    }
}
