//! Metric names for the job subsystem.
//!
//! Instruments are recorded through the `metrics` facade; installing an
//! exporter is the embedding application's concern.

use ::metrics::{describe_counter, describe_histogram, Unit};

/// Counter: tasks submitted, labeled by task name.
pub const TASKS_SUBMIT_TOTAL: &str = "tasks_submit_total";

/// Histogram: seconds between a task becoming eligible and execution start.
pub const TASKS_CHECKOUT_TIMING: &str = "tasks_checkout_timing";

/// Histogram: handler wall-clock duration in seconds, labeled by task name.
pub const TASKS_TIMING: &str = "tasks_timing";

/// Register metric descriptions with the installed recorder.
pub fn describe() {
    describe_counter!(
        TASKS_SUBMIT_TOTAL,
        Unit::Count,
        "Tasks submitted, per task name"
    );
    describe_histogram!(
        TASKS_CHECKOUT_TIMING,
        Unit::Seconds,
        "Latency from task eligibility to execution start"
    );
    describe_histogram!(
        TASKS_TIMING,
        Unit::Seconds,
        "Handler wall-clock duration, per task name"
    );
}
