//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability: tracing/logging plus metric
/// descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    tracing::init();
    metrics::describe();
}

/// Metric names and registration.
pub mod metrics;

/// Tracing configuration (filters, layers).
pub mod tracing;
