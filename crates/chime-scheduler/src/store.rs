//! Task store abstraction.
//!
//! The scheduler loop and the result handler only ever talk to a
//! [`TaskStore`]. Schedule advancement goes through
//! [`TaskStore::compare_and_set_schedule`], which only writes when the row
//! still carries the version the caller read, so a concurrent edit from a
//! management surface is never overwritten by a stale fire.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use tokio::sync::RwLock;

use crate::{DeliveryOutcome, NewTask, StoreError, Task, TaskAlert, TaskId};

/// Persistent storage for tasks, outcomes and alerts.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All tasks with `enabled = true`.
    async fn list_enabled_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Fetch a single task regardless of its enabled flag.
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Insert a new task. Fails with [`StoreError::Duplicate`] if the uuid
    /// is taken.
    async fn insert_task(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Set `next_fire_at` and `updated_at` only if the stored `updated_at`
    /// still equals `expected_updated_at`. Returns whether the write applied.
    async fn compare_and_set_schedule(
        &self,
        id: TaskId,
        expected_updated_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Enable or disable a task, bumping its version. Returns false if the
    /// task does not exist.
    async fn set_enabled(&self, id: TaskId, enabled: bool) -> Result<bool, StoreError>;

    /// Append a delivery outcome.
    async fn record_outcome(&self, outcome: &DeliveryOutcome) -> Result<(), StoreError>;

    /// Append an operator alert.
    async fn raise_alert(&self, alert: &TaskAlert) -> Result<(), StoreError>;
}

/// The version stamp to write after `previous`: wall-clock `now` at
/// microsecond precision, forced strictly past `previous`.
pub fn next_version(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    let floor = previous.trunc_subsecs(6) + Duration::microseconds(1);
    now.max(floor)
}

#[derive(Default)]
struct MemoryState {
    tasks: BTreeMap<TaskId, Task>,
    next_id: TaskId,
    outcomes: Vec<DeliveryOutcome>,
    alerts: Vec<TaskAlert>,
}

/// In-process [`TaskStore`] for embedding the engine without a database.
///
/// [`MemoryTaskStore::set_available`] simulates an outage: while the store
/// is unavailable every trait call fails with [`StoreError::Unavailable`].
#[derive(Default)]
pub struct MemoryTaskStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }

    /// Apply an external edit to a task, as a management surface would.
    /// The version is bumped and `next_fire_at` is cleared when the schedule
    /// changes so the scheduler recomputes it.
    pub async fn update_task<F>(&self, id: TaskId, edit: F) -> Result<Task, StoreError>
    where
        F: FnOnce(&mut Task),
    {
        let mut state = self.state.write().await;
        let task = state.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let previous_schedule = task.schedule.clone();
        edit(task);
        if task.schedule != previous_schedule {
            task.next_fire_at = None;
        }
        task.updated_at = next_version(task.updated_at, Utc::now());
        Ok(task.clone())
    }

    /// Remove a task. Returns whether it existed.
    pub async fn delete_task(&self, id: TaskId) -> bool {
        self.state.write().await.tasks.remove(&id).is_some()
    }

    /// Every task, enabled or not, ordered by id.
    pub async fn all_tasks(&self) -> Vec<Task> {
        self.state.read().await.tasks.values().cloned().collect()
    }

    /// Outcomes recorded so far, oldest first.
    pub async fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.state.read().await.outcomes.clone()
    }

    /// Alerts raised so far, oldest first.
    pub async fn alerts(&self) -> Vec<TaskAlert> {
        self.state.read().await.alerts.clone()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_enabled_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.enabled)
            .cloned()
            .collect())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn insert_task(&self, task: NewTask) -> Result<Task, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.tasks.values().any(|t| t.uuid == task.uuid) {
            return Err(StoreError::Duplicate(task.uuid));
        }

        state.next_id += 1;
        let created_at = task.created_at.trunc_subsecs(6);
        let stored = Task {
            id: state.next_id,
            uuid: task.uuid,
            name: task.name,
            endpoint: task.endpoint,
            message_type: task.message_type,
            message_content: task.message_content,
            schedule: task.schedule,
            next_fire_at: task.next_fire_at,
            enabled: task.enabled,
            created_at,
            updated_at: created_at,
        };
        state.tasks.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn compare_and_set_schedule(
        &self,
        id: TaskId,
        expected_updated_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        match state.tasks.get_mut(&id) {
            Some(task) if task.updated_at == expected_updated_at => {
                task.next_fire_at = next_fire_at;
                task.updated_at = updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_enabled(&self, id: TaskId, enabled: bool) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        match state.tasks.get_mut(&id) {
            Some(task) => {
                task.enabled = enabled;
                task.updated_at = next_version(task.updated_at, Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_outcome(&self, outcome: &DeliveryOutcome) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.write().await.outcomes.push(outcome.clone());
        Ok(())
    }

    async fn raise_alert(&self, alert: &TaskAlert) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.write().await.alerts.push(alert.clone());
        Ok(())
    }
}
