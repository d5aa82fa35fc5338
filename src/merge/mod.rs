//! Merge engine.
//!
//! Provides:
//! - Source batching into bounded groups
//! - Busy-retry with a shared contention gauge
//! - The group-by-group merge orchestrator
//! - Post-merge maintenance of the target

pub mod batch;
pub mod maintenance;
pub mod orchestrator;
pub mod retry;

pub use batch::{batch_sources, BatchConfig, MergeBatch, SourceEntry, MAX_BATCH_SIZE};
pub use maintenance::MaintenanceRunner;
pub use orchestrator::{MergeOptions, MergeOrchestrator, MergeReport};
pub use retry::{Backoff, ContentionGauge, RetryPolicy};

use crate::error::{MergeError, Result};

/// Run blocking engine work off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MergeError::Task(e.to_string()))?
}
