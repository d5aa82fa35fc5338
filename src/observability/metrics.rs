//! OTLP metrics implementation.
//!
//! Key metrics:
//! - kismet_merge_sources_total: Counter of sources by outcome
//! - kismet_merge_rows_inserted_total: Counter of rows copied into the target
//! - kismet_merge_busy_retries_total: Counter of statements retried on lock contention
//! - kismet_merge_table_copy_seconds: Histogram of per-table copy latency

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Outcome label for [`record_source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOutcome {
    Merged,
    Failed,
    Cancelled,
}

impl SourceOutcome {
    fn as_str(self) -> &'static str {
        match self {
            SourceOutcome::Merged => "merged",
            SourceOutcome::Failed => "failed",
            SourceOutcome::Cancelled => "cancelled",
        }
    }
}

/// Merge metrics registry.
#[derive(Debug)]
pub struct Metrics {
    /// Sources processed, labelled by outcome.
    pub sources_total: Counter<u64>,
    /// Rows inserted into the target.
    pub rows_inserted: Counter<u64>,
    /// Statements retried after a busy or locked response.
    pub busy_retries: Counter<u64>,
    /// Time spent copying one table from one source.
    pub table_copy_latency: Histogram<f64>,
}

impl Metrics {
    /// Create a new metrics registry from a meter.
    fn new(meter: &Meter) -> Self {
        Self {
            sources_total: meter
                .u64_counter("kismet_merge_sources_total")
                .with_description("Sources processed by outcome")
                .with_unit("1")
                .init(),
            rows_inserted: meter
                .u64_counter("kismet_merge_rows_inserted_total")
                .with_description("Rows inserted into the target")
                .with_unit("1")
                .init(),
            busy_retries: meter
                .u64_counter("kismet_merge_busy_retries_total")
                .with_description("Statements retried after lock contention")
                .with_unit("1")
                .init(),
            table_copy_latency: meter
                .f64_histogram("kismet_merge_table_copy_seconds")
                .with_description("Latency of copying one table from one source")
                .with_unit("s")
                .init(),
        }
    }
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
///
/// # Arguments
///
/// * `otel_endpoint` - Optional OTLP endpoint for metrics export
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create OTLP exporter, using no-op metrics");
                    set_manual_provider();
                }
            }
        } else {
            // Recorded but never exported.
            set_manual_provider();
        }

        let meter = global::meter("kismet_merge");
        Metrics::new(&meter)
    });
}

fn set_manual_provider() {
    let reader = ManualReader::builder().build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider);
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Get the global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record the outcome of one source.
pub fn record_source(outcome: SourceOutcome) {
    if let Some(m) = METRICS.get() {
        m.sources_total
            .add(1, &[KeyValue::new("outcome", outcome.as_str())]);
    }
}

/// Record a finished table copy.
pub fn record_table_copy(table: &str, rows: u64, latency_seconds: f64) {
    if let Some(m) = METRICS.get() {
        let attrs = [KeyValue::new("table", table.to_string())];
        m.rows_inserted.add(rows, &attrs);
        m.table_copy_latency.record(latency_seconds, &attrs);
    }
}

/// Record one busy retry.
pub fn record_busy_retry() {
    if let Some(m) = METRICS.get() {
        m.busy_retries.add(1, &[]);
    }
}
