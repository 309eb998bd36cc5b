//! Schedule entries and firing-time arithmetic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use drudge_core::{Task, TaskId, TaskStatus};

/// One cron entry: a stable id, a cron expression, and the task handler it
/// fires.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    /// Stable key; doubles as the `scheduled_task` row id.
    pub id: String,
    /// Cron expression in the seconds-first syntax of the `cron` crate.
    pub cron: String,
    /// Handler name, resolved against the registry at startup.
    pub task: String,
    /// Metadata handed to the handler on each firing.
    pub props: serde_json::Value,
}

impl ScheduleEntry {
    pub fn new(
        id: impl Into<String>,
        cron: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            cron: cron.into(),
            task: task.into(),
            props: serde_json::json!({}),
        }
    }

    pub fn with_props(mut self, props: serde_json::Value) -> Self {
        self.props = props;
        self
    }

    /// Task metadata handed to the handler on each firing.
    ///
    /// Firings are not persisted task rows; retry bookkeeping does not
    /// apply to them.
    pub fn to_task(&self) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::new(),
            name: self.task.clone(),
            props: self.props.clone(),
            queue: "default".to_string(),
            priority: 100,
            max_retries: 0,
            retry_num: 0,
            status: TaskStatus::New,
            error: None,
            scheduled_at: now,
            modified_at: now,
            completed_at: None,
        }
    }
}

/// Time until the next valid firing of `schedule` strictly after `now`.
pub(crate) fn until_next(schedule: &Schedule, now: DateTime<Utc>) -> Option<Duration> {
    let next = schedule.after(&now).next()?;
    let millis = (next - now).num_milliseconds().max(0) as u64;
    Some(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn until_next_is_within_the_cron_period() {
        let schedule = Schedule::from_str("* * * * * *").unwrap();
        let delay = until_next(&schedule, Utc::now()).unwrap();
        assert!(delay <= Duration::from_secs(1));
    }

    #[test]
    fn until_next_for_hourly_crosses_the_boundary() {
        let schedule = Schedule::from_str("0 0 * * * *").unwrap();
        let now = Utc::now();
        let delay = until_next(&schedule, now).unwrap();
        assert!(delay <= Duration::from_secs(3600));
    }

    #[test]
    fn firing_metadata_carries_name_and_props() {
        let entry = ScheduleEntry::new("hk", "0 0 * * * *", "housekeeping")
            .with_props(serde_json::json!({"shard": 3}));
        let task = entry.to_task();
        assert_eq!(task.name, "housekeeping");
        assert_eq!(task.props, serde_json::json!({"shard": 3}));
        assert_eq!(task.retry_num, 0);
    }
}
