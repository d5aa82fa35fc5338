//! kismet-merge: consolidate Kismet capture databases into one SQLite target.
//!
//! Sources are merged in bounded groups. Each source of a group is attached
//! to its own connection on the target and copied table by table under
//! `INSERT OR IGNORE`, so constrained tables keep their first writer while
//! every other table accumulates rows. Lock contention is retried with a
//! backoff shared by the whole group.
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`error`]: Error taxonomy and aggregate collection
//! - [`merge`]: Batching, retry, orchestration and maintenance
//! - [`observability`]: Metrics and tracing setup
//! - [`storage`]: Database handles, pragmas, schema and attach pool

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // merge::MergeOptions is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::struct_excessive_bools,     // Config structs may have flags
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod config;
pub mod error;
pub mod merge;
pub mod observability;
pub mod storage;

pub use error::{AggregateError, ErrorCollector, MergeError, PragmaError, Result};
pub use merge::{MergeOptions, MergeOrchestrator, MergeReport};
pub use storage::DatabaseHandle;
