//! Delivery result handler.
//!
//! Consumes [`DeliveryReport`]s from the worker pool, records an outcome
//! for every attempt, schedules bounded retries, and disables a task once
//! too many consecutive occurrences have failed permanently. It never
//! touches `next_fire_at`: the schedule was advanced before delivery.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mockable::Clock;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::{
    DeliveryOutcome, DeliveryReport, DeliveryStatus, DispatchEvent, RetryPolicy, StoreError,
    Task, TaskAlert, TaskId, TaskStore,
};

/// The delivery result handler.
pub struct ResultHandler {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock + Send + Sync>,
    policy: RetryPolicy,
    store_timeout: Duration,
    retry_tx: mpsc::UnboundedSender<DispatchEvent>,
    consecutive_failures: HashMap<TaskId, u32>,
}

impl ResultHandler {
    /// Create a handler that re-queues retries on `retry_tx`, normally the
    /// worker pool's dispatch queue.
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock + Send + Sync>,
        policy: RetryPolicy,
        store_timeout: Duration,
        retry_tx: mpsc::UnboundedSender<DispatchEvent>,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            store_timeout,
            retry_tx,
            consecutive_failures: HashMap::new(),
        }
    }

    /// Handle reports until every worker has dropped its sender.
    pub async fn run(mut self, mut report_rx: mpsc::UnboundedReceiver<DeliveryReport>) {
        info!("result handler started");
        while let Some(report) = report_rx.recv().await {
            self.handle(report).await;
        }
        info!("result handler stopped");
    }

    /// Consecutive permanently-failed occurrences for a task.
    pub fn consecutive_failures(&self, id: TaskId) -> u32 {
        self.consecutive_failures.get(&id).copied().unwrap_or(0)
    }

    /// Record one attempt and act on it.
    #[tracing::instrument(skip_all, fields(task_id = report.event.task.id, attempt = report.event.attempt))]
    pub async fn handle(&mut self, report: DeliveryReport) -> DeliveryStatus {
        let DeliveryReport {
            event,
            result,
            finished_at,
        } = report;

        let (status, reason) = match result {
            Ok(()) => (DeliveryStatus::Delivered, None),
            Err(failure) if self.policy.should_retry(event.attempt) => {
                (DeliveryStatus::Retrying, Some(failure.to_string()))
            }
            Err(failure) => (DeliveryStatus::Failed, Some(failure.to_string())),
        };

        let outcome = DeliveryOutcome {
            task_id: event.task.id,
            occurrence_time: event.occurrence,
            attempt: event.attempt,
            result: status,
            reason: reason.clone(),
            timestamp: finished_at,
        };
        if let Err(e) = self
            .with_deadline(self.store.record_outcome(&outcome))
            .await
        {
            warn!(error = %e, "failed to record delivery outcome");
        }

        match status {
            DeliveryStatus::Delivered => {
                info!(occurrence = %event.occurrence, "delivered");
                self.consecutive_failures.remove(&event.task.id);
            }
            DeliveryStatus::Retrying => self.schedule_retry(event),
            DeliveryStatus::Failed => {
                let reason = reason.unwrap_or_default();
                let count = self.consecutive_failures.entry(event.task.id).or_insert(0);
                *count += 1;
                let count = *count;
                warn!(
                    occurrence = %event.occurrence,
                    consecutive_failures = count,
                    reason = %reason,
                    "occurrence failed permanently"
                );

                if self.policy.should_disable(count) {
                    self.disable(&event.task, count, reason).await;
                }
            }
        }

        status
    }

    fn schedule_retry(&self, event: DispatchEvent) {
        let delay = self.policy.retry_delay(event.attempt);
        let retry = DispatchEvent {
            attempt: event.attempt + 1,
            ..event
        };
        debug!(
            delay_secs = delay.as_secs(),
            next_attempt = retry.attempt,
            "scheduling retry"
        );

        let retry_tx = self.retry_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            if retry_tx.send(retry).is_err() {
                debug!("delivery pool closed, retry dropped");
            }
        });
    }

    /// Disable a failing task and raise an alert. On a store error the
    /// count is kept, so the next permanent failure tries again.
    async fn disable(&mut self, task: &Task, consecutive_failures: u32, last_reason: String) {
        match self
            .with_deadline(self.store.set_enabled(task.id, false))
            .await
        {
            Ok(true) => {
                self.consecutive_failures.remove(&task.id);
            }
            Ok(false) => {
                debug!(task_id = task.id, "task already deleted, nothing to disable");
                self.consecutive_failures.remove(&task.id);
                return;
            }
            Err(e) => {
                error!(
                    task_id = task.id,
                    consecutive_failures,
                    error = %e,
                    "failed to disable failing task, will retry on next failure"
                );
                return;
            }
        }

        error!(
            task_id = task.id,
            name = %task.name,
            consecutive_failures,
            reason = %last_reason,
            "task disabled after repeated delivery failures"
        );

        let alert = TaskAlert {
            task_id: task.id,
            task_name: task.name.clone(),
            consecutive_failures,
            last_reason,
            raised_at: self.clock.utc(),
        };
        if let Err(e) = self.with_deadline(self.store.raise_alert(&alert)).await {
            error!(task_id = task.id, error = %e, "failed to raise alert");
        }
    }

    async fn with_deadline<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }
}
