//! kismet-merge: merge Kismet capture databases into one target.
//!
//! # Usage
//!
//! ```bash
//! kismet-merge merged.kismet capture-1.kismet capture-2.kismet
//! ```
//!
//! The target is created if it does not exist. Every source must exist.
//! Environment variables can also be used:
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//! - `KISMET_MERGE_BATCH_SIZE`: Sources attached at once (1-10)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: Metrics collector

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use kismet_merge::config::{Config, OutputFormat};
use kismet_merge::merge::MergeOrchestrator;
use kismet_merge::observability::metrics::init_metrics_with_endpoint;
use kismet_merge::observability::tracing::init_tracing;
use kismet_merge::{DatabaseHandle, MergeReport};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    init_tracing("kismet-merge", &config.log_level, config.log_json);
    init_metrics_with_endpoint(config.otel_endpoint.as_deref());

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("kismet-merge: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    check_sources(&config.sources)?;

    let path = config.target.clone();
    let target = tokio::task::spawn_blocking(move || DatabaseHandle::open_target(path))
        .await?
        .with_context(|| format!("opening target {}", config.target.display()))?;
    let target = Arc::new(target);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let merged = merge(&config, &target, cancel).await;
    let finalized = finalize(target).await;

    let report = merged?;
    finalized?;
    print_report(&report, config.output)
}

/// Every source must already exist; all missing ones are reported together.
fn check_sources(sources: &[PathBuf]) -> anyhow::Result<()> {
    let missing: Vec<String> = sources
        .iter()
        .filter(|p| !p.is_file())
        .map(|p| p.display().to_string())
        .collect();
    if !missing.is_empty() {
        bail!("source database missing or not a regular file: {}", missing.join(", "));
    }
    Ok(())
}

/// Tune the target for bulk load, then run the merge.
async fn merge(
    config: &Config,
    target: &Arc<DatabaseHandle>,
    cancel: CancellationToken,
) -> anyhow::Result<MergeReport> {
    let handle = Arc::clone(target);
    let journal_size_limit = config.journal_size_limit;
    let temp_dir = config.resolved_temp_dir();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        handle.enable_wal(true).context("enabling WAL")?;
        handle.enable_async(true).context("disabling synchronous commits")?;
        handle
            .set_journal_size_limit(journal_size_limit)
            .context("setting journal size limit")?;
        if let Some(dir) = temp_dir {
            handle.set_temp_dir(dir);
        }
        Ok(())
    })
    .await??;

    let mut orchestrator =
        MergeOrchestrator::new(Arc::clone(target), config.merge_options(), cancel);
    match orchestrator.run(&config.sources).await {
        Ok(report) => Ok(report),
        Err(e) => {
            tracing::warn!(report = ?orchestrator.report(), "merge stopped early");
            Err(e).context("merge failed")
        }
    }
}

/// Restore every overridden pragma and close the target.
async fn finalize(target: Arc<DatabaseHandle>) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let restored = target.restore_all_pragmas();
        if let Err(e) = &restored {
            tracing::error!(error = %e, "failed to restore pragmas");
        }
        match Arc::try_unwrap(target) {
            Ok(handle) => handle.close(),
            Err(_) => tracing::warn!("target still shared at shutdown, not closed explicitly"),
        }
        restored.context("restoring pragmas")
    })
    .await?
}

fn print_report(report: &MergeReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => println!("{report}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

/// Cancel the run on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    if ctrl_c.await.is_ok() {
                        cancel.cancel();
                    }
                    return;
                }
            };

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("Received SIGINT (Ctrl+C), cancelling merge...");
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, cancelling merge...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = ctrl_c.await {
                tracing::warn!(error = %e, "failed to listen for ctrl+c");
                return;
            }
            tracing::info!("Received Ctrl+C, cancelling merge...");
        }

        cancel.cancel();
    });
}
