//! CLI argument parsing for objsync

use crate::config::Config;
use crate::error::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// objsync - synchronize object trees between local disk and S3
#[derive(Parser, Debug)]
#[command(name = "objsync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Synchronize objects from source to destination
    Sync(SyncArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Arguments for the sync command
#[derive(Parser, Debug)]
pub struct SyncArgs {
    /// Source path or URI (local path, s3://bucket/prefix)
    pub source: String,

    /// Destination path or URI (local path, s3://bucket/prefix)
    pub destination: String,

    /// Number of parallel transfers (0 = number of CPUs)
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Perform a trial run with no changes made
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Keep going when an individual transfer fails
    #[arg(long)]
    pub ignore_errors: bool,

    /// Delete extraneous objects from destination
    #[arg(long)]
    pub delete: bool,

    /// Part size for chunked uploads, e.g. 6M
    #[arg(long, value_parser = parse_size_arg)]
    pub part_size: Option<u64>,

    /// Retries per part before an upload is abandoned
    #[arg(long)]
    pub retries: Option<u32>,

    /// Canned ACL for uploaded objects
    #[arg(long, conflicts_with = "public")]
    pub acl: Option<String>,

    /// Shorthand for --acl public-read
    #[arg(long)]
    pub public: bool,

    /// S3 storage class for uploads (STANDARD, STANDARD_IA, GLACIER, ...)
    #[arg(long)]
    pub storage_class: Option<String>,

    /// Custom S3 endpoint for S3-compatible storage
    #[arg(long, env = "OBJSYNC_S3_ENDPOINT")]
    pub endpoint: Option<String>,

    /// AWS region override
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Show progress bars
    #[arg(short = 'P', long)]
    pub progress: bool,

    /// Configuration file path
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

fn parse_size_arg(s: &str) -> std::result::Result<u64, String> {
    Config::parse_size(s).map_err(|e| e.to_string())
}

impl SyncArgs {
    /// Convert CLI args to Config, merging with file config
    pub fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };

        // CLI args override config file
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        config.dry_run |= self.dry_run;
        config.ignore_errors |= self.ignore_errors;
        config.delete |= self.delete;
        config.progress |= self.progress;

        if let Some(part_size) = self.part_size {
            config.part_size = part_size;
        }
        if let Some(retries) = self.retries {
            config.part_retries = retries;
        }

        if self.public {
            config.acl = Some("public-read".to_string());
        } else if self.acl.is_some() {
            config.acl = self.acl.clone();
        }
        if self.storage_class.is_some() {
            config.storage_class = self.storage_class.clone();
        }
        if self.endpoint.is_some() {
            config.s3_endpoint = self.endpoint.clone();
        }
        if self.region.is_some() {
            config.region = self.region.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Show the configuration file path
    #[arg(long)]
    pub path: bool,

    /// Create default configuration file
    #[arg(long)]
    pub init: bool,
}
