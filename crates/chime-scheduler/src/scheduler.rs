//! Scheduler loop.
//!
//! Each tick reloads enabled tasks from the store, reconciles them into an
//! in-memory fire queue ordered by `(next_fire_at, id)`, then fires every
//! due entry. Firing advances the schedule with a compare-and-set before
//! handing a [`DispatchEvent`] to the worker pool, so a task edited
//! concurrently is reloaded instead of fired with stale data.
//!
//! When the store is unreachable the loop keeps firing from memory and
//! writes the advanced schedules back once the store returns.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::Clock;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::cron::CronSchedule;
use crate::store::next_version;
use crate::{DispatchEvent, SchedulerConfig, StoreError, Task, TaskId, TaskStore};

/// Minimum sleep duration between scheduler checks.
const MIN_SLEEP_SECS: u64 = 1;

/// The scheduler loop.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock + Send + Sync>,
    config: SchedulerConfig,
    dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
    tasks: HashMap<TaskId, Task>,
    queue: BTreeSet<(DateTime<Utc>, TaskId)>,
    /// Tasks whose cached schedule is ahead of the store.
    unsynced: HashSet<TaskId>,
    /// Latest occurrence handed to the worker pool, per task.
    dispatched: HashMap<TaskId, DateTime<Utc>>,
}

impl Scheduler {
    /// Create a new scheduler that sends due occurrences to `dispatch_tx`.
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: SchedulerConfig,
        dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            dispatch_tx,
            tasks: HashMap::new(),
            queue: BTreeSet::new(),
            unsynced: HashSet::new(),
            dispatched: HashMap::new(),
        }
    }

    /// Run the scheduler loop until `shutdown_rx` flips to true.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "scheduler starting"
        );

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            self.tick().await;

            let sleep_duration = self.sleep_duration();
            debug!(sleep_ms = sleep_duration.as_millis() as u64, "scheduler sleeping");

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                    }
                }
                _ = sleep(sleep_duration) => {}
            }
        }

        info!("scheduler shut down gracefully");
    }

    /// One pass: reload, write back pending schedules, fire due tasks.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&mut self) {
        self.reload().await;
        self.flush_unsynced().await;
        self.fire_due().await;
    }

    /// How long to sleep before the next tick: until the earliest queued
    /// fire time, bounded by the poll interval.
    pub fn sleep_duration(&self) -> Duration {
        let max = self.config.poll_interval.max(Duration::from_secs(MIN_SLEEP_SECS));
        match self.next_wakeup() {
            Some(next) => {
                let until = (next - self.clock.utc()).to_std().unwrap_or(Duration::ZERO);
                until.clamp(Duration::from_secs(MIN_SLEEP_SECS), max)
            }
            None => max,
        }
    }

    /// Earliest queued fire time.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.queue.first().map(|(at, _)| *at)
    }

    /// The cached copy of a task, if the scheduler is tracking it.
    pub fn cached_task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Number of tasks waiting in the fire queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Number of tasks whose advanced schedule has not reached the store.
    pub fn unsynced(&self) -> usize {
        self.unsynced.len()
    }

    async fn with_deadline<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match timeout(self.config.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.store_timeout)),
        }
    }

    /// Replace the cached task set with the store's enabled tasks.
    async fn reload(&mut self) {
        let listed = self.with_deadline(self.store.list_enabled_tasks()).await;
        let tasks = match listed {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, cached = self.tasks.len(), "task reload failed, continuing from memory");
                return;
            }
        };

        let live: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        let gone: Vec<TaskId> = self
            .tasks
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in gone {
            debug!(task_id = id, "task removed or disabled");
            self.forget(id);
        }

        for task in tasks {
            let unchanged = self
                .tasks
                .get(&task.id)
                .is_some_and(|cached| cached.updated_at == task.updated_at);
            if !unchanged {
                self.admit(task).await;
            }
        }
    }

    /// Start tracking a task read from the store, computing its fire time
    /// if it has none or if the stored one was already dispatched.
    async fn admit(&mut self, mut task: Task) {
        self.forget(task.id);
        if !task.enabled {
            return;
        }

        // A row written before our advance reached the store (outage, or an
        // edit racing a fire) can carry an occurrence we already sent.
        let already_sent = match (task.next_fire_at, self.dispatched.get(&task.id)) {
            (Some(at), Some(last)) => at <= *last,
            _ => false,
        };
        if already_sent {
            debug!(task_id = task.id, next_fire_at = ?task.next_fire_at, "stored fire time already dispatched, rescheduling");
        }

        if task.next_fire_at.is_none() || already_sent {
            let now = self.clock.utc();
            let next = match CronSchedule::parse(&task.schedule)
                .and_then(|s| s.next_fire_at(now, self.config.utc_offset))
            {
                Ok(next) => next,
                Err(e) => {
                    warn!(task_id = task.id, schedule = %task.schedule, error = %e, "cannot schedule task");
                    // Cached without a fire time so the warning is not repeated every tick
                    self.tasks.insert(task.id, task);
                    return;
                }
            };

            let version = next_version(task.updated_at, now);
            let written = self
                .with_deadline(self.store.compare_and_set_schedule(
                    task.id,
                    task.updated_at,
                    Some(next),
                    version,
                ))
                .await;
            match written {
                Ok(true) => {
                    task.next_fire_at = Some(next);
                    task.updated_at = version;
                }
                Ok(false) => {
                    debug!(task_id = task.id, "task changed while scheduling, retrying next tick");
                    return;
                }
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "could not persist first fire time");
                    task.next_fire_at = Some(next);
                    self.unsynced.insert(task.id);
                }
            }
        }

        debug!(task_id = task.id, next_fire_at = ?task.next_fire_at, "tracking task");
        if let Some(at) = task.next_fire_at {
            self.queue.insert((at, task.id));
        }
        self.tasks.insert(task.id, task);
    }

    fn forget(&mut self, id: TaskId) {
        if let Some(at) = self.tasks.remove(&id).and_then(|old| old.next_fire_at) {
            self.queue.remove(&(at, id));
        }
        self.unsynced.remove(&id);
    }

    /// Retry schedule writes that failed while the store was unreachable.
    async fn flush_unsynced(&mut self) {
        let pending: Vec<TaskId> = self.unsynced.iter().copied().collect();
        for id in pending {
            let Some(task) = self.tasks.get(&id) else {
                self.unsynced.remove(&id);
                continue;
            };
            let expected = task.updated_at;
            let next = task.next_fire_at;
            let version = next_version(expected, self.clock.utc());

            let written = self
                .with_deadline(
                    self.store
                        .compare_and_set_schedule(id, expected, next, version),
                )
                .await;
            match written {
                Ok(true) => {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        task.updated_at = version;
                    }
                    self.unsynced.remove(&id);
                    debug!(task_id = id, "schedule written back");
                }
                Ok(false) => {
                    // Edited while we were disconnected: the edit wins.
                    info!(task_id = id, "task changed during outage, reloading");
                    self.forget(id);
                }
                Err(e) => {
                    debug!(task_id = id, error = %e, "store still unavailable");
                    break;
                }
            }
        }
    }

    async fn fire_due(&mut self) {
        let now = self.clock.utc();
        let mut due = Vec::new();
        while let Some(&(at, id)) = self.queue.first() {
            if at > now {
                break;
            }
            self.queue.pop_first();
            due.push((at, id));
        }

        for (at, id) in due {
            self.fire(id, at, now).await;
        }
    }

    /// Advance a due task's schedule and dispatch the occurrence at `at`.
    #[tracing::instrument(skip(self, now))]
    async fn fire(&mut self, id: TaskId, at: DateTime<Utc>, now: DateTime<Utc>) {
        let Some(task) = self.tasks.get(&id).cloned() else {
            return;
        };
        if task.next_fire_at != Some(at) {
            return;
        }

        // Missed occurrences collapse: the next fire is computed from now.
        let next = match CronSchedule::parse(&task.schedule)
            .and_then(|s| s.next_fire_at(now, self.config.utc_offset))
        {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(task_id = id, schedule = %task.schedule, error = %e, "task has no further occurrences");
                None
            }
        };

        let version = next_version(task.updated_at, now);
        let written = self
            .with_deadline(
                self.store
                    .compare_and_set_schedule(id, task.updated_at, next, version),
            )
            .await;

        let mut advanced = task;
        advanced.next_fire_at = next;
        match written {
            Ok(true) => {
                advanced.updated_at = version;
            }
            Ok(false) => {
                info!(task_id = id, "task changed concurrently, reloading instead of firing");
                self.tasks.remove(&id);
                self.reload_one(id).await;
                return;
            }
            Err(e) => {
                warn!(task_id = id, error = %e, "could not persist schedule, firing from memory");
                self.unsynced.insert(id);
            }
        }

        if let Some(next) = next {
            self.queue.insert((next, id));
        }
        self.tasks.insert(id, advanced.clone());

        self.dispatched.insert(id, at);
        info!(task_id = id, name = %advanced.name, occurrence = %at, next_fire_at = ?next, "dispatching task");
        let event = DispatchEvent {
            task: advanced,
            occurrence: at,
            attempt: 1,
        };
        if self.dispatch_tx.send(event).is_err() {
            error!(task_id = id, "delivery pool is gone, dropping occurrence");
        }
    }

    async fn reload_one(&mut self, id: TaskId) {
        match self.with_deadline(self.store.get_task(id)).await {
            Ok(Some(task)) => self.admit(task).await,
            Ok(None) => debug!(task_id = id, "task deleted"),
            Err(e) => warn!(task_id = id, error = %e, "task reload failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTaskStore;
    use chrono::{Local, TimeZone};

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn local(&self) -> DateTime<Local> {
            self.utc().with_timezone(&Local)
        }

        fn utc(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn scheduler(now: DateTime<Utc>) -> Scheduler {
        let (tx, _rx) = mpsc::unbounded_channel();
        Scheduler::new(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(FixedClock(now)),
            SchedulerConfig::default(),
            tx,
        )
    }

    #[test]
    fn test_sleep_without_tasks_is_poll_interval() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 8, 59, 30).unwrap();
        let scheduler = scheduler(now);

        assert_eq!(scheduler.sleep_duration(), Duration::from_secs(60));
        assert!(scheduler.next_wakeup().is_none());
    }

    #[test]
    fn test_sleep_until_next_fire() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 8, 59, 30).unwrap();
        let mut scheduler = scheduler(now);
        scheduler
            .queue
            .insert((Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(), 1));

        assert_eq!(scheduler.sleep_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_sleep_bounds() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let mut scheduler = scheduler(now);

        // Overdue entries still sleep the minimum
        scheduler.queue.insert((now - chrono::Duration::hours(1), 1));
        assert_eq!(scheduler.sleep_duration(), Duration::from_secs(MIN_SLEEP_SECS));

        // Far-future entries are capped at the poll interval
        scheduler.queue.clear();
        scheduler.queue.insert((now + chrono::Duration::days(3), 1));
        assert_eq!(scheduler.sleep_duration(), Duration::from_secs(60));
    }
}
