//! Tracing/logging initialization for the job subsystem.
//!
//! The worker and scheduler emit structured records: loops attach `worker`,
//! `queue`, and `schedule` fields, poll spans carry the queue name, and
//! unclassified poll failures carry a `correlation_id`. The subscriber
//! flattens those fields into top-level JSON keys and keeps the enclosing
//! span's fields, so log tooling can filter on them directly.

use tracing_subscriber::EnvFilter;

/// Fallback directives when `RUST_LOG` is unset: the job crates at debug so
/// claim and firing decisions are visible, everything else at info.
const DEFAULT_DIRECTIVES: &str =
    "info,drudge_worker=debug,drudge_scheduler=debug,drudge_store=debug";

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_directives(DEFAULT_DIRECTIVES);
}

/// Initialize with explicit fallback directives, for embedders that want a
/// different default verbosity. `RUST_LOG` still wins when it is set.
pub fn init_with_directives(directives: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .try_init();
}
