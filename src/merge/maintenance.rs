//! Post-merge maintenance of the target.

use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::merge::blocking;
use crate::storage::DatabaseHandle;

/// Reclaims free pages and refreshes planner statistics on the target.
#[derive(Debug, Clone)]
pub struct MaintenanceRunner {
    target: Arc<DatabaseHandle>,
}

impl MaintenanceRunner {
    pub fn new(target: Arc<DatabaseHandle>) -> Self {
        Self { target }
    }

    /// VACUUM, then ANALYZE. The first failure is returned and ends the run.
    ///
    /// No other connection to the target may hold a transaction while this
    /// runs.
    pub async fn run(&self) -> Result<()> {
        let target = Arc::clone(&self.target);
        blocking(move || {
            let started = Instant::now();
            target.vacuum()?;
            tracing::debug!(elapsed = ?started.elapsed(), "vacuum finished");

            let started = Instant::now();
            target.analyze()?;
            tracing::debug!(elapsed = ?started.elapsed(), "analyze finished");
            Ok(())
        })
        .await?;

        tracing::info!(path = %self.target.path().display(), "target maintenance complete");
        Ok(())
    }
}
