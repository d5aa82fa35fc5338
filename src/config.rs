//! Configuration parsing for kismet-merge.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Defaults tuned for bulk-loading capture logs

use clap::builder::TypedValueParser;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::merge::{BatchConfig, MergeOptions, RetryPolicy, MAX_BATCH_SIZE};
use crate::storage::pragma::DEFAULT_JOURNAL_SIZE_LIMIT;

/// Directory name used for engine temp files when none is given.
pub const DEFAULT_TEMP_DIR_NAME: &str = ".sqlite_tmp";

/// How the final run report is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// kismet-merge: merge Kismet capture databases into one target.
#[derive(Parser, Debug, Clone)]
#[command(name = "kismet-merge")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Target database, created if it does not exist
    pub target: PathBuf,

    /// Source databases to merge into the target
    #[arg(required = true)]
    pub sources: Vec<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit log lines as JSON
    #[arg(long, env = "KISMET_MERGE_LOG_JSON")]
    pub log_json: bool,

    /// Sources attached to the target at once
    #[arg(
        long,
        env = "KISMET_MERGE_BATCH_SIZE",
        default_value_t = MAX_BATCH_SIZE,
        value_parser = clap::value_parser!(u64).range(1..=MAX_BATCH_SIZE as u64).map(|v| v as usize)
    )]
    pub batch_size: usize,

    /// Journal size cap in bytes while merging
    #[arg(long, env = "KISMET_MERGE_JOURNAL_SIZE_LIMIT", default_value_t = DEFAULT_JOURNAL_SIZE_LIMIT)]
    pub journal_size_limit: i64,

    /// Directory for engine temp files [default: <cwd>/.sqlite_tmp]
    #[arg(long, env = "KISMET_MERGE_TEMP_DIR", conflicts_with = "no_temp_dir")]
    pub temp_dir: Option<PathBuf>,

    /// Leave the engine's temp file location alone
    #[arg(long)]
    pub no_temp_dir: bool,

    /// Engine busy timeout on merge connections, in milliseconds
    #[arg(long, env = "KISMET_MERGE_BUSY_TIMEOUT_MS", default_value_t = 0)]
    pub busy_timeout_ms: u64,

    /// Busy-retry delay unit, in milliseconds
    #[arg(long, env = "KISMET_MERGE_RETRY_BASE_DELAY_MS", default_value_t = 100)]
    pub retry_base_delay_ms: u64,

    /// Attempts per statement before giving up on a busy target
    #[arg(long, env = "KISMET_MERGE_RETRY_MAX_ATTEMPTS", default_value_t = 500)]
    pub retry_max_attempts: u32,

    /// Time per statement before giving up on a busy target, in seconds
    #[arg(long, env = "KISMET_MERGE_RETRY_MAX_ELAPSED_SECS", default_value_t = 1800)]
    pub retry_max_elapsed_secs: u64,

    /// Ceiling on concurrently running copy statements
    #[arg(long, env = "KISMET_MERGE_MAX_WORKERS", default_value_t = 64)]
    pub max_workers: usize,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Library options for the merge itself.
    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            batch: BatchConfig::from_config(self.batch_size),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_attempts: self.retry_max_attempts.max(1),
                max_elapsed: Duration::from_secs(self.retry_max_elapsed_secs),
            },
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            max_workers: self.max_workers.max(1),
        }
    }

    /// Where engine temp files go, or `None` to leave the engine default.
    pub fn resolved_temp_dir(&self) -> Option<PathBuf> {
        if self.no_temp_dir {
            return None;
        }
        if let Some(dir) = &self.temp_dir {
            return Some(dir.clone());
        }
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Some(cwd.join(DEFAULT_TEMP_DIR_NAME))
    }

    /// Create a configuration for testing.
    #[cfg(test)]
    pub fn test_config(target: PathBuf, sources: Vec<PathBuf>) -> Self {
        Self {
            target,
            sources,
            log_level: "debug".into(),
            log_json: false,
            batch_size: MAX_BATCH_SIZE,
            journal_size_limit: DEFAULT_JOURNAL_SIZE_LIMIT,
            temp_dir: None,
            no_temp_dir: true,
            busy_timeout_ms: 0,
            retry_base_delay_ms: 5,
            retry_max_attempts: 1000,
            retry_max_elapsed_secs: 60,
            max_workers: 8,
            output: OutputFormat::Text,
            otel_endpoint: None,
        }
    }
}
