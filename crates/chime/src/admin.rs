//! Administrative commands backed by the SQLite store.

use std::time::Duration;

use chime_scheduler::{
    DeliveryOutcome, DeliveryStatus, Task, TaskDefinition, TaskId, TaskStore, WebhookDeliverer,
    admit_task, deliver_with_deadline, plan_schedule, validate_endpoint,
};
use chime_store::{SqliteTaskStore, TaskUpdate};
use chrono::{DateTime, FixedOffset, Utc};
use miette::{Result, miette};
use mockable::Clock;
use tracing::info;

/// Outcomes shown by `chime show`.
pub const RECENT_OUTCOMES: usize = 10;

/// Field changes requested by `chime edit`.
#[derive(Debug, Default)]
pub struct EditRequest {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub message_type: Option<String>,
    pub message_content: Option<String>,
    pub schedule: Option<String>,
}

/// Admit a new task.
pub async fn add(
    store: &SqliteTaskStore,
    clock: &dyn Clock,
    offset: FixedOffset,
    definition: TaskDefinition,
) -> Result<Task> {
    admit_task(store, clock, offset, definition)
        .await
        .map_err(|e| miette!("{}", e))
}

/// Look up a task or fail with a readable error.
pub fn find(store: &SqliteTaskStore, id: TaskId) -> Result<Task> {
    store
        .get(id)
        .map_err(|e| miette!("failed to read task {}: {}", id, e))?
        .ok_or_else(|| miette!("no task with id {}", id))
}

/// Apply an edit. A new schedule is validated and its next fire time
/// recomputed from `now`.
pub fn edit(
    store: &SqliteTaskStore,
    id: TaskId,
    request: EditRequest,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Result<Task> {
    if let Some(endpoint) = &request.endpoint {
        validate_endpoint(endpoint).map_err(|e| miette!("{}", e))?;
    }
    if request.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(miette!("name must not be empty"));
    }

    let schedule = match &request.schedule {
        Some(text) => Some(
            plan_schedule(text, now, offset).map_err(|e| miette!("invalid schedule: {}", e))?,
        ),
        None => None,
    };

    let update = TaskUpdate {
        name: request.name.map(|n| n.trim().to_string()),
        endpoint: request.endpoint.map(|e| e.trim().to_string()),
        message_type: request.message_type,
        message_content: request.message_content,
        schedule,
    };
    if update.is_empty() {
        return Err(miette!("nothing to change"));
    }

    let task = store
        .update(id, &update, now)
        .map_err(|e| miette!("failed to update task {}: {}", id, e))?;
    info!(task_id = id, "task edited");
    Ok(task)
}

/// Enable or disable a task.
pub fn set_enabled(
    store: &SqliteTaskStore,
    id: TaskId,
    enabled: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    let found = store
        .set_enabled_at(id, enabled, now)
        .map_err(|e| miette!("failed to update task {}: {}", id, e))?;
    if !found {
        return Err(miette!("no task with id {}", id));
    }
    info!(task_id = id, enabled, "task enabled flag changed");
    Ok(())
}

/// Delete a task.
pub fn delete(store: &SqliteTaskStore, id: TaskId) -> Result<()> {
    let found = store
        .delete(id)
        .map_err(|e| miette!("failed to delete task {}: {}", id, e))?;
    if !found {
        return Err(miette!("no task with id {}", id));
    }
    info!(task_id = id, "task deleted");
    Ok(())
}

/// Send a one-off message without any task.
pub async fn send(
    endpoint: &str,
    message_type: &str,
    content: &str,
    timeout: Duration,
) -> Result<()> {
    validate_endpoint(endpoint).map_err(|e| miette!("{}", e))?;
    let deliverer =
        WebhookDeliverer::new(timeout).map_err(|e| miette!("failed to build HTTP client: {}", e))?;
    deliverer
        .send_message(endpoint, message_type, content)
        .await
        .map_err(|e| miette!("delivery failed: {}", e))
}

/// Deliver a stored task now without touching its schedule. The attempt is
/// recorded in the outcome history.
pub async fn run_now(
    store: &SqliteTaskStore,
    id: TaskId,
    clock: &dyn Clock,
    timeout: Duration,
) -> Result<DeliveryOutcome> {
    let task = find(store, id)?;
    let deliverer =
        WebhookDeliverer::new(timeout).map_err(|e| miette!("failed to build HTTP client: {}", e))?;

    let occurrence = clock.utc();
    let result = deliver_with_deadline(&deliverer, &task, timeout).await;
    let outcome = DeliveryOutcome {
        task_id: task.id,
        occurrence_time: occurrence,
        attempt: 1,
        result: match result {
            Ok(()) => DeliveryStatus::Delivered,
            Err(_) => DeliveryStatus::Failed,
        },
        reason: result.err().map(|e| e.to_string()),
        timestamp: clock.utc(),
    };
    store
        .record_outcome(&outcome)
        .await
        .map_err(|e| miette!("failed to record outcome: {}", e))?;
    Ok(outcome)
}

/// One line per task for `chime list`.
pub fn format_task_line(task: &Task, offset: FixedOffset) -> String {
    format!(
        "{:>4}  {:<8}  {:<16}  {:<22}  {}",
        task.id,
        if task.enabled { "enabled" } else { "disabled" },
        task.schedule,
        format_time(task.next_fire_at, offset),
        task.name
    )
}

/// Multi-line detail view for `chime show`.
pub fn format_task_detail(
    task: &Task,
    outcomes: &[DeliveryOutcome],
    offset: FixedOffset,
) -> String {
    let mut out = format!(
        "id:        {}\nuuid:      {}\nname:      {}\nendpoint:  {}\ntype:      {}\nschedule:  {}\nnext fire: {}\nenabled:   {}\ncreated:   {}\nupdated:   {}\nmessage:\n  {}\n",
        task.id,
        task.uuid,
        task.name,
        task.endpoint,
        task.message_type,
        task.schedule,
        format_time(task.next_fire_at, offset),
        task.enabled,
        format_time(Some(task.created_at), offset),
        format_time(Some(task.updated_at), offset),
        task.message_content.replace('\n', "\n  "),
    );

    if !outcomes.is_empty() {
        out.push_str("recent deliveries:\n");
        for outcome in outcomes {
            out.push_str(&format!(
                "  {}  attempt {}  {}{}\n",
                format_time(Some(outcome.occurrence_time), offset),
                outcome.attempt,
                outcome.result.as_str(),
                outcome
                    .reason
                    .as_deref()
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            ));
        }
    }
    out
}

fn format_time(at: Option<DateTime<Utc>>, offset: FixedOffset) -> String {
    match at {
        Some(at) => at.with_timezone(&offset).format("%Y-%m-%d %H:%M %:z").to_string(),
        None => "-".to_string(),
    }
}
