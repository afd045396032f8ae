//! Scheduler types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DeliveryFailure;

/// Store-assigned task identity.
pub type TaskId = i64;

/// A scheduled webhook task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Store-assigned identity.
    pub id: TaskId,
    /// Globally unique external identifier; immutable.
    pub uuid: String,
    /// Human-readable label, not unique.
    pub name: String,
    /// Webhook URL the message is delivered to.
    pub endpoint: String,
    /// Opaque payload descriptor (e.g. `text`, `markdown`).
    pub message_type: String,
    /// Opaque payload body.
    pub message_content: String,
    /// Canonical five-field cron expression.
    pub schedule: String,
    /// When this task next fires. `None` means not yet scheduled or the
    /// schedule could not be computed.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Disabled tasks stay in the store but never fire.
    pub enabled: bool,
    /// When this task was created.
    pub created_at: DateTime<Utc>,
    /// Version stamp, bumped on every mutation.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Check if this task is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at.is_some_and(|at| at <= now)
    }
}

/// A task definition submitted by a management surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Caller-chosen uuid for idempotent submission; generated when absent.
    #[serde(default)]
    pub uuid: Option<String>,
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    pub message_content: String,
    /// Cron expression or supported phrase; normalised on admission.
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_message_type() -> String {
    "text".to_string()
}

fn default_enabled() -> bool {
    true
}

/// A validated task ready to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub uuid: String,
    pub name: String,
    pub endpoint: String,
    pub message_type: String,
    pub message_content: String,
    pub schedule: String,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// One due occurrence handed from the scheduler loop to the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEvent {
    /// Snapshot of the task at dispatch time.
    pub task: Task,
    /// The scheduled instant this occurrence belongs to.
    pub occurrence: DateTime<Utc>,
    /// 1 for the scheduled attempt, incremented by each retry.
    pub attempt: u32,
}

/// Raw result of one delivery attempt, emitted by the worker pool.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub event: DispatchEvent,
    pub result: Result<(), DeliveryFailure>,
    pub finished_at: DateTime<Utc>,
}

/// Where an occurrence stands after a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// The webhook accepted the message.
    Delivered,
    /// The attempt failed and another attempt is scheduled.
    Retrying,
    /// The attempt failed and no retries remain.
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(DeliveryStatus::Delivered),
            "retrying" => Ok(DeliveryStatus::Retrying),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status '{}'", other)),
        }
    }
}

/// Delivery outcome event produced for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    pub task_id: TaskId,
    pub occurrence_time: DateTime<Utc>,
    pub attempt: u32,
    pub result: DeliveryStatus,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Raised when a task is disabled after too many failed occurrences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAlert {
    pub task_id: TaskId,
    pub task_name: String,
    pub consecutive_failures: u32,
    pub last_reason: String,
    pub raised_at: DateTime<Utc>,
}
