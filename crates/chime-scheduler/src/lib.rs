//! Cron-driven webhook dispatch engine for Chime.
//!
//! This crate provides:
//! - A five-field cron evaluator with standard day-of-month/day-of-week semantics
//! - A scheduler loop that fires each due occurrence exactly once
//! - A bounded delivery worker pool with a webhook deliverer
//! - A result handler with bounded retries and a failure threshold
//!
//! Persistence is behind the [`TaskStore`] trait.

mod admission;
pub mod config;
pub mod cron;
mod delivery;
mod error;
mod outcome;
mod schedule;
mod scheduler;
mod store;
mod types;

pub use admission::{admit_task, plan_schedule, prepare_task, validate_endpoint};
pub use config::{DeliveryConfig, RetryPolicy, SchedulerConfig};
pub use cron::{CronSchedule, next_occurrence};
pub use delivery::{
    Deliverer, DeliveryPool, WebhookDeliverer, deliver_with_deadline, webhook_payload,
};
pub use error::{DeliveryFailure, ScheduleError, SchedulerError, StoreError};
pub use outcome::ResultHandler;
pub use schedule::normalize_schedule;
pub use scheduler::Scheduler;
pub use store::{MemoryTaskStore, TaskStore, next_version};
pub use types::{
    DeliveryOutcome, DeliveryReport, DeliveryStatus, DispatchEvent, NewTask, Task, TaskAlert,
    TaskDefinition, TaskId,
};
