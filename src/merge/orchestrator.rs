//! Merge orchestrator.
//!
//! Groups run strictly one after another. Within a group every source is
//! validated, attached to its own target connection, and copied table by
//! table concurrently; each source commits in its own transaction once all of
//! its copies have joined. Failures are collected per group and end the run
//! after the group's survivors have committed.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{ErrorCollector, MergeError, Result};
use crate::merge::batch::{batch_sources, BatchConfig, MergeBatch, SourceEntry};
use crate::merge::blocking;
use crate::merge::maintenance::MaintenanceRunner;
use crate::merge::retry::{Backoff, ContentionGauge, RetryPolicy};
use crate::observability::metrics::{self, SourceOutcome};
use crate::storage::{AttachPool, AttachedSource, DatabaseHandle};

/// Tuning for a merge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub batch: BatchConfig,
    pub retry: RetryPolicy,
    /// Engine-level busy wait on each attach connection
    pub busy_timeout: Duration,
    /// Ceiling on concurrently running copy statements
    pub max_workers: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            retry: RetryPolicy::default(),
            busy_timeout: Duration::ZERO,
            max_workers: 64,
        }
    }
}

/// Totals for a merge run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub run_id: String,
    pub groups: usize,
    pub sources_merged: usize,
    pub sources_rejected: usize,
    pub tables_copied: usize,
    pub rows_inserted: u64,
    pub busy_retries: u64,
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run:            {}", self.run_id)?;
        writeln!(f, "groups:         {}", self.groups)?;
        writeln!(f, "sources merged: {}", self.sources_merged)?;
        writeln!(f, "rejected:       {}", self.sources_rejected)?;
        writeln!(f, "tables copied:  {}", self.tables_copied)?;
        writeln!(f, "rows inserted:  {}", self.rows_inserted)?;
        write!(f, "busy retries:   {}", self.busy_retries)
    }
}

/// Merges source databases into one target.
pub struct MergeOrchestrator {
    target: Arc<DatabaseHandle>,
    options: MergeOptions,
    cancel: CancellationToken,
    contention: Arc<ContentionGauge>,
    report: MergeReport,
}

impl MergeOrchestrator {
    pub fn new(target: Arc<DatabaseHandle>, options: MergeOptions, cancel: CancellationToken) -> Self {
        Self {
            target,
            options,
            cancel,
            contention: Arc::new(ContentionGauge::new()),
            report: MergeReport {
                run_id: Uuid::now_v7().to_string(),
                ..MergeReport::default()
            },
        }
    }

    /// Current busy-contention level, shared by every group of the run.
    pub fn contention_level(&self) -> u64 {
        self.contention.level()
    }

    /// Progress so far. After a failed run this shows how far it got.
    pub fn report(&self) -> &MergeReport {
        &self.report
    }

    /// Merge every source into the target.
    ///
    /// The target's table list is read once up front and is what every
    /// source is copied against. A group with any failure ends the run with
    /// an aggregate of everything observed in that group; groups before it
    /// stay committed.
    pub async fn run<P: AsRef<Path>>(&mut self, sources: &[P]) -> Result<MergeReport> {
        let span = tracing::info_span!("merge", run_id = %self.report.run_id);
        self.run_groups(sources).instrument(span).await?;
        Ok(self.report.clone())
    }

    async fn run_groups<P: AsRef<Path>>(&mut self, sources: &[P]) -> Result<()> {
        let started = Instant::now();
        let target = Arc::clone(&self.target);
        let tables = Arc::new(blocking(move || target.tables()).await?);
        let groups = batch_sources(sources, self.options.batch);

        tracing::info!(
            sources = sources.len(),
            groups = groups.len(),
            tables = tables.len(),
            "starting merge"
        );

        for (group, batch) in groups.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }

            let span = tracing::info_span!("group", group, sources = batch.len());
            self.merge_group(batch, Arc::clone(&tables))
                .instrument(span.clone())
                .await?;
            self.report.groups += 1;

            MaintenanceRunner::new(Arc::clone(&self.target))
                .run()
                .instrument(span)
                .await?;
        }

        tracing::info!(
            elapsed = ?started.elapsed(),
            sources_merged = self.report.sources_merged,
            rows_inserted = self.report.rows_inserted,
            busy_retries = self.report.busy_retries,
            "merge complete"
        );
        Ok(())
    }

    async fn merge_group(&mut self, batch: &MergeBatch, tables: Arc<Vec<String>>) -> Result<()> {
        let errors = ErrorCollector::new();

        let valid = self.validate(batch, &errors).await;
        self.report.sources_rejected += batch.len() - valid.len();

        if !valid.is_empty() {
            match self.attach_pool(valid.len()) {
                Ok(pool) => self.merge_sources(pool, valid, tables, &errors).await,
                Err(e) => {
                    tracing::error!(error = %e, "cannot open merge connections");
                    errors.push(e);
                }
            }
        }

        if self.cancel.is_cancelled() {
            let dropped = errors.drain();
            if !dropped.is_empty() {
                tracing::warn!(errors = dropped.len(), "group cancelled with failures");
            }
            return Err(MergeError::Cancelled);
        }

        errors.drain().into_result().map_err(MergeError::from)
    }

    fn attach_pool(&self, sources: usize) -> Result<AttachPool> {
        AttachPool::new(
            self.target.path(),
            u32::try_from(sources).unwrap_or(u32::MAX),
            self.options.busy_timeout,
            self.target.pragmas().connection_overrides(),
        )
    }

    /// Copy every validated source through `pool`, one job per source.
    async fn merge_sources(
        &mut self,
        pool: AttachPool,
        valid: Vec<SourceEntry>,
        tables: Arc<Vec<String>>,
        errors: &ErrorCollector,
    ) {
        let workers = (valid.len() * tables.len()).clamp(1, self.options.max_workers.max(1));
        let group = Arc::new(GroupContext {
            pool,
            backoff: Backoff::with_gauge(
                self.options.retry,
                Arc::clone(&self.contention),
                self.cancel.clone(),
            ),
            permits: Arc::new(Semaphore::new(workers)),
            tables,
            errors: errors.clone(),
        });

        let mut jobs = JoinSet::new();
        for entry in valid {
            let span = tracing::info_span!("source", alias = %entry.alias());
            jobs.spawn(merge_source(Arc::clone(&group), entry).instrument(span));
        }

        // Barrier: nothing below runs until every source has finished.
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(summary) => {
                    self.report.tables_copied += summary.tables_copied;
                    self.report.rows_inserted += summary.rows_inserted;
                    if summary.committed {
                        self.report.sources_merged += 1;
                    }
                }
                Err(e) => errors.push(MergeError::Task(e.to_string())),
            }
        }
        self.report.busy_retries += group.backoff.retries();

        let state = group.pool.state();
        tracing::debug!(
            connections = state.connections,
            idle = state.idle_connections,
            contention = group.backoff.contention_level(),
            "group joined"
        );
        // Pool connections close here, before maintenance needs the file alone.
    }

    /// Open and schema-check every source of `batch` concurrently.
    ///
    /// Returns the sources that passed, in input order.
    async fn validate(&self, batch: &MergeBatch, errors: &ErrorCollector) -> Vec<SourceEntry> {
        let mut checks = JoinSet::new();
        for entry in batch.entries().iter().cloned() {
            checks.spawn_blocking(move || {
                let checked = DatabaseHandle::open_source(&entry.path)
                    .and_then(|source| source.check_schema());
                (entry, checked)
            });
        }

        let mut valid = Vec::with_capacity(batch.len());
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((entry, Ok(()))) => valid.push(entry),
                Ok((entry, Err(e))) => {
                    tracing::warn!(path = %entry.path.display(), error = %e, "source rejected");
                    metrics::record_source(SourceOutcome::Failed);
                    errors.push(e);
                }
                Err(e) => errors.push(MergeError::Task(e.to_string())),
            }
        }
        valid.sort_by_key(|e| e.index);
        valid
    }
}

/// State shared by every task of one group.
struct GroupContext {
    pool: AttachPool,
    backoff: Backoff,
    permits: Arc<Semaphore>,
    tables: Arc<Vec<String>>,
    errors: ErrorCollector,
}

#[derive(Debug, Default)]
struct SourceSummary {
    committed: bool,
    tables_copied: usize,
    rows_inserted: u64,
}

/// Attach one source, copy all of its tables, then commit and detach.
async fn merge_source(group: Arc<GroupContext>, entry: SourceEntry) -> SourceSummary {
    let mut summary = SourceSummary::default();
    let alias = entry.alias();

    let pool = group.pool.clone();
    let attached = blocking(move || {
        let conn = pool.get()?;
        AttachedSource::attach(conn, entry.index, entry.alias(), &entry.path)
    })
    .await;
    let attached = match attached {
        Ok(a) => Arc::new(a),
        Err(e) => {
            group.errors.push(e);
            metrics::record_source(SourceOutcome::Failed);
            return summary;
        }
    };

    let index = attached.index();
    let path = attached.path().display().to_string();

    let mut copies = JoinSet::new();
    for table in group.tables.iter() {
        if !attached.has_table(table) {
            tracing::debug!(table = %table, "table absent from source, skipped");
            continue;
        }
        copies.spawn(copy_table(Arc::clone(&group), Arc::clone(&attached), table.clone()));
    }

    let mut failed = false;
    while let Some(joined) = copies.join_next().await {
        match joined {
            Ok(Some(rows)) => {
                summary.tables_copied += 1;
                summary.rows_inserted += rows;
            }
            Ok(None) => failed = true,
            Err(e) => {
                failed = true;
                group.errors.push(MergeError::Task(e.to_string()));
            }
        }
    }

    let outcome = if group.backoff.is_cancelled() {
        tracing::info!("cancelled, rolling back");
        if let Err(e) = blocking_on(&attached, AttachedSource::rollback).await {
            group.errors.push(e);
        }
        summary.tables_copied = 0;
        summary.rows_inserted = 0;
        SourceOutcome::Cancelled
    } else {
        let context = format!("commit {alias}");
        let committed = group
            .backoff
            .run(&context, || blocking_on(&attached, AttachedSource::commit))
            .await;
        match committed {
            Ok(()) => {
                summary.committed = true;
                if failed {
                    SourceOutcome::Failed
                } else {
                    SourceOutcome::Merged
                }
            }
            Err(e) => {
                group.errors.push(e);
                if let Err(e) = blocking_on(&attached, AttachedSource::rollback).await {
                    group.errors.push(e);
                }
                summary.tables_copied = 0;
                summary.rows_inserted = 0;
                SourceOutcome::Failed
            }
        }
    };

    match Arc::try_unwrap(attached) {
        Ok(attached) => {
            if let Err(e) = blocking(move || attached.detach()).await {
                group.errors.push(e);
            }
        }
        Err(_) => group
            .errors
            .push(MergeError::Task(format!("{alias} still in use at detach"))),
    }

    metrics::record_source(outcome);
    tracing::info!(
        index,
        path = %path,
        committed = summary.committed,
        tables = summary.tables_copied,
        rows = summary.rows_inserted,
        "source finished"
    );
    summary
}

/// Copy one table, retrying while the target is busy.
///
/// Returns the rows inserted, or `None` after recording the failure.
async fn copy_table(group: Arc<GroupContext>, attached: Arc<AttachedSource>, table: String) -> Option<u64> {
    let context = format!("copy {table} from {}", attached.alias());
    let started = Instant::now();

    // A permit is held per attempt, never across a backoff sleep, so waiting
    // tasks cannot starve the writer that holds the lock.
    let copied = group
        .backoff
        .run(&context, || {
            let permits = Arc::clone(&group.permits);
            let attached = Arc::clone(&attached);
            let table = table.clone();
            async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| MergeError::Task(e.to_string()))?;
                blocking(move || attached.copy_table(&table)).await
            }
        })
        .await;

    match copied {
        Ok(rows) => {
            let rows = rows as u64;
            metrics::record_table_copy(&table, rows, started.elapsed().as_secs_f64());
            tracing::debug!(table = %table, rows, "table copied");
            Some(rows)
        }
        Err(MergeError::Cancelled) => None,
        Err(e) => {
            group.errors.push(e);
            None
        }
    }
}

async fn blocking_on(
    attached: &Arc<AttachedSource>,
    op: fn(&AttachedSource) -> Result<()>,
) -> Result<()> {
    let attached = Arc::clone(attached);
    blocking(move || op(&attached)).await
}
