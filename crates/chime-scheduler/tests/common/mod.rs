//! Shared helpers for chime-scheduler integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chime_scheduler::{
    DeliveryOutcome, DispatchEvent, MemoryTaskStore, NewTask, Scheduler, SchedulerConfig,
    StoreError, Task, TaskAlert, TaskId, TaskStore,
};
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use mockable::Clock;
use tokio::sync::mpsc;

/// A clock tests move by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

pub fn new_task(uuid: &str, schedule: &str, next_fire_at: Option<DateTime<Utc>>) -> NewTask {
    NewTask {
        uuid: uuid.to_string(),
        name: format!("task {}", uuid),
        endpoint: "https://example.com/hook".to_string(),
        message_type: "text".to_string(),
        message_content: format!("hello from {}", uuid),
        schedule: schedule.to_string(),
        next_fire_at,
        enabled: true,
        created_at: at(2023, 12, 1, 0, 0, 0),
    }
}

/// A scheduler wired to `store` and `clock`, plus the receiving end of
/// its dispatch queue.
pub fn scheduler(
    store: Arc<dyn TaskStore>,
    clock: Arc<ManualClock>,
) -> (Scheduler, mpsc::UnboundedReceiver<DispatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(store, clock, SchedulerConfig::default(), tx);
    (scheduler, rx)
}

/// Everything currently waiting on the dispatch queue.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<DispatchEvent>) -> Vec<DispatchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Serves a frozen task list to `list_enabled_tasks` while forwarding every
/// other call, so a test can slip an edit between the loop's load and its
/// write.
pub struct FrozenListStore {
    pub inner: Arc<MemoryTaskStore>,
    frozen: Mutex<Option<Vec<Task>>>,
}

impl FrozenListStore {
    pub fn new(inner: Arc<MemoryTaskStore>) -> Self {
        Self {
            inner,
            frozen: Mutex::new(None),
        }
    }

    pub fn freeze(&self, tasks: Vec<Task>) {
        *self.frozen.lock().unwrap() = Some(tasks);
    }

    pub fn thaw(&self) {
        *self.frozen.lock().unwrap() = None;
    }
}

#[async_trait]
impl TaskStore for FrozenListStore {
    async fn list_enabled_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let frozen = self.frozen.lock().unwrap().clone();
        match frozen {
            Some(tasks) => Ok(tasks),
            None => self.inner.list_enabled_tasks().await,
        }
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.inner.get_task(id).await
    }

    async fn insert_task(&self, task: NewTask) -> Result<Task, StoreError> {
        self.inner.insert_task(task).await
    }

    async fn compare_and_set_schedule(
        &self,
        id: TaskId,
        expected_updated_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner
            .compare_and_set_schedule(id, expected_updated_at, next_fire_at, updated_at)
            .await
    }

    async fn set_enabled(&self, id: TaskId, enabled: bool) -> Result<bool, StoreError> {
        self.inner.set_enabled(id, enabled).await
    }

    async fn record_outcome(&self, outcome: &DeliveryOutcome) -> Result<(), StoreError> {
        self.inner.record_outcome(outcome).await
    }

    async fn raise_alert(&self, alert: &TaskAlert) -> Result<(), StoreError> {
        self.inner.raise_alert(alert).await
    }
}
