//! Error types for the scheduler.

use std::time::Duration;

use thiserror::Error;

use crate::TaskId;

/// A schedule that cannot be admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Wrong number of cron fields.
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), found {0}")]
    FieldCount(usize),

    /// A field failed to parse or is out of range.
    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    /// The expression parses but can never fire (e.g. `0 0 30 2 *`).
    #[error("schedule '{0}' never fires")]
    NoOccurrence(String),

    /// Neither a cron expression nor a recognised phrase.
    #[error("unrecognised schedule '{0}'")]
    Unrecognised(String),
}

/// Errors raised by a task store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or failed mid-operation.
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    /// A store call exceeded its deadline.
    #[error("task store timed out after {0:?}")]
    Timeout(Duration),

    /// A task with this uuid already exists.
    #[error("task already exists: {0}")]
    Duplicate(String),

    /// No task with this id.
    #[error("task not found: {0}")]
    NotFound(TaskId),
}

/// Why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// The webhook did not answer within the delivery deadline.
    #[error("timeout")]
    Timeout,

    /// The request never produced a response (DNS, TLS, refused, reset).
    #[error("connection failed: {0}")]
    Connection(String),

    /// The endpoint answered but did not accept the message.
    #[error("rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },
}

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed or never-firing schedule, rejected at admission.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    /// Task definition failed validation (e.g. malformed endpoint).
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),
}
