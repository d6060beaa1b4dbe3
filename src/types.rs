use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::BusError;

/// Lifecycle state of a task row.
///
/// States only progress monotonically, with the single exception of the
/// `Retry` ⇄ `Active` cycle. Everything at `Completed` and above is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i16)]
pub enum TaskState {
    Created = 0,
    Retry = 1,
    Active = 2,
    Completed = 3,
    Expired = 4,
    Cancelled = 5,
    Failed = 6,
}

impl TaskState {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Created),
            1 => Some(Self::Retry),
            2 => Some(Self::Active),
            3 => Some(Self::Completed),
            4 => Some(Self::Expired),
            5 => Some(Self::Cancelled),
            6 => Some(Self::Failed),
            _ => None,
        }
    }

    /// True once the row can no longer transition (purge-eligible).
    pub fn is_terminal(self) -> bool {
        self >= Self::Completed
    }
}

/// Fully resolved task configuration, after merging defaults, service-level
/// configuration, and per-task overrides. See [`crate::factory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Maximum number of retries after the first attempt (default: 3).
    pub retry_limit: i32,
    /// Seconds between retry attempts (default: 5).
    pub retry_delay: i32,
    /// Use full-jitter exponential backoff instead of a fixed delay
    /// (default: false).
    pub retry_backoff: bool,
    /// Seconds to delay the first attempt (default: 0).
    pub start_after_seconds: i32,
    /// Seconds an active attempt may run before it expires (default: 300).
    pub expire_in_seconds: i32,
    /// Seconds a terminal row is retained before purge (default: 604800).
    pub keep_in_seconds: i32,
    /// Uniqueness dimension within the queue for non-terminal tasks
    /// (default: none).
    pub singleton_key: Option<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay: 5,
            retry_backoff: false,
            start_after_seconds: 0,
            expire_in_seconds: 300,
            keep_in_seconds: 604_800,
            singleton_key: None,
        }
    }
}

/// Partial task configuration. Unset fields fall through to the next level
/// in the precedence chain: defaults ⊂ service config ⊂ per-task overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_after_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_in_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_in_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub singleton_key: Option<String>,
}

impl TaskOverrides {
    /// Apply these overrides on top of `base`, returning the merged config.
    pub fn apply(&self, base: &TaskConfig) -> TaskConfig {
        TaskConfig {
            retry_limit: self.retry_limit.unwrap_or(base.retry_limit),
            retry_delay: self.retry_delay.unwrap_or(base.retry_delay),
            retry_backoff: self.retry_backoff.unwrap_or(base.retry_backoff),
            start_after_seconds: self.start_after_seconds.unwrap_or(base.start_after_seconds),
            expire_in_seconds: self.expire_in_seconds.unwrap_or(base.expire_in_seconds),
            keep_in_seconds: self.keep_in_seconds.unwrap_or(base.keep_in_seconds),
            singleton_key: self.singleton_key.clone().or_else(|| base.singleton_key.clone()),
        }
    }
}

/// Provenance tag attached to every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trigger {
    /// Enqueued directly through `send`.
    Direct,
    /// Produced by fanout of an event.
    Event { e: EventTrigger },
}

/// The originating event of an event-triggered task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTrigger {
    pub id: Uuid,
    pub name: String,
    /// Position of the event in the log.
    pub p: i64,
}

/// The JSON payload stored in `tasks.data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDto {
    /// Task name.
    pub tn: String,
    /// Handler input.
    pub data: JsonValue,
    /// Trigger provenance.
    pub trace: Trigger,
}

/// An event ready to be appended to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_name: String,
    pub data: JsonValue,
}

/// A task ready to be sent, produced by
/// [`TaskDefinition::from`](crate::TaskDefinition::from).
#[derive(Debug, Clone)]
pub struct Task {
    pub task_name: String,
    pub queue: Option<String>,
    pub data: JsonValue,
    pub config: TaskOverrides,
}

/// Row-shaped record for bulk insertion through `json_to_recordset`.
/// Field names must match the recordset column list in the insert plan.
#[derive(Debug, Clone, Serialize)]
pub struct InsertTask {
    pub queue: String,
    pub data: TaskDto,
    pub retry_limit: i32,
    pub retry_delay: i32,
    pub retry_backoff: bool,
    pub start_after_seconds: i32,
    pub expire_in_seconds: i32,
    pub keep_in_seconds: i32,
    pub singleton_key: Option<String>,
}

/// Internal: row returned by the claim CTE.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ClaimedTaskRow {
    pub id: Uuid,
    pub retry_count: i32,
    pub state: i16,
    pub data: JsonValue,
    pub expire_in_seconds: i32,
}

/// A task atomically claimed by this worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub retry_count: i32,
    pub state: TaskState,
    pub data: TaskDto,
    pub expire_in_seconds: i32,
}

impl TryFrom<ClaimedTaskRow> for ClaimedTask {
    type Error = BusError;

    fn try_from(row: ClaimedTaskRow) -> Result<Self, Self::Error> {
        let state = TaskState::from_i16(row.state).ok_or_else(|| BusError::Validation {
            name: format!("task {}", row.id),
            reason: format!("unknown task state {}", row.state),
        })?;
        Ok(Self {
            id: row.id,
            retry_count: row.retry_count,
            state,
            data: serde_json::from_value(row.data)?,
            expire_in_seconds: row.expire_in_seconds,
        })
    }
}

/// Internal: row returned by the fanout event select.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct EventRow {
    pub id: Uuid,
    pub event_name: String,
    pub event_data: JsonValue,
    pub position: i64,
}

/// A task resolution heading for the batched resolve statement.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub task_id: Uuid,
    pub success: bool,
    pub payload: JsonValue,
}

/// Task worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrently executing tasks (default: 25).
    pub concurrency: usize,
    /// Interval of polling the database for new work in ms (default: 1500).
    pub interval_in_ms: u64,
    /// Refill threshold, 0–1 (default: 0.33). The fetch loop is woken early
    /// once `active / concurrency` drops below this while more work is known
    /// to be waiting.
    pub refill_pct: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 25,
            interval_in_ms: 1500,
            refill_pct: 0.33,
        }
    }
}

/// Maintenance worker configuration.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Event retention horizon in days (default: 30).
    pub retention_in_days: i32,
    /// Sweep interval in ms (default: 30000).
    pub interval_in_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention_in_days: 30,
            interval_in_ms: 30_000,
        }
    }
}

/// Registered event spec, as reported by [`Bus::get_state`](crate::Bus::get_state).
#[derive(Debug, Clone, Serialize)]
pub struct EventSpec {
    pub event_name: String,
    pub schema: JsonValue,
}

/// Registered task spec, as reported by [`Bus::get_state`](crate::Bus::get_state).
#[derive(Debug, Clone, Serialize)]
pub struct TaskSpec {
    pub task_name: String,
    /// Set when the task is created by fanout of this event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_event: Option<String>,
    pub schema: JsonValue,
    pub config: TaskOverrides,
}

/// Pure snapshot of everything registered on a bus instance.
#[derive(Debug, Clone, Serialize)]
pub struct BusState {
    pub queue: String,
    pub events: Vec<EventSpec>,
    pub tasks: Vec<TaskSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_state_round_trips() {
        for v in 0..=6 {
            let state = TaskState::from_i16(v).unwrap();
            assert_eq!(state.as_i16(), v);
        }
        assert!(TaskState::from_i16(7).is_none());
        assert!(TaskState::Completed.is_terminal());
        assert!(!TaskState::Active.is_terminal());
    }

    #[test]
    fn trigger_serializes_to_tagged_json() {
        let direct = serde_json::to_value(Trigger::Direct).unwrap();
        assert_eq!(direct, json!({"type": "direct"}));

        let id = Uuid::new_v4();
        let event = serde_json::to_value(Trigger::Event {
            e: EventTrigger {
                id,
                name: "user_created".into(),
                p: 12,
            },
        })
        .unwrap();
        assert_eq!(
            event,
            json!({"type": "event", "e": {"id": id, "name": "user_created", "p": 12}})
        );
    }

    #[test]
    fn overrides_fall_through_to_base() {
        let base = TaskConfig::default();
        let merged = TaskOverrides {
            retry_limit: Some(1),
            singleton_key: Some("only".into()),
            ..Default::default()
        }
        .apply(&base);

        assert_eq!(merged.retry_limit, 1);
        assert_eq!(merged.retry_delay, 5);
        assert_eq!(merged.expire_in_seconds, 300);
        assert_eq!(merged.singleton_key.as_deref(), Some("only"));
    }
}
