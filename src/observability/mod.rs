//! OpenTelemetry observability infrastructure.
//!
//! Provides:
//! - Structured tracing to stderr, plain or JSON
//! - OTLP metrics for merge progress and lock contention

pub mod metrics;
pub mod tracing;
