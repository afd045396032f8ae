//! Task admission: validate a submitted definition, compute its first fire
//! time and insert it.

use chrono::{DateTime, FixedOffset, Utc};
use mockable::Clock;
use reqwest::Url;
use tracing::info;
use uuid::Uuid;

use crate::schedule::normalize_schedule;
use crate::{NewTask, ScheduleError, SchedulerError, Task, TaskDefinition, TaskStore};

/// Normalise `schedule` and compute its first fire time after `now`.
/// Returns the canonical expression alongside the fire time.
pub fn plan_schedule(
    schedule: &str,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Result<(String, DateTime<Utc>), ScheduleError> {
    let cron = normalize_schedule(schedule)?;
    let first = cron.next_fire_at(now, offset)?;
    Ok((cron.expression().to_string(), first))
}

/// Check that `endpoint` is an absolute http(s) URL.
pub fn validate_endpoint(endpoint: &str) -> Result<(), SchedulerError> {
    let url = Url::parse(endpoint.trim())
        .map_err(|e| SchedulerError::InvalidTask(format!("endpoint '{}': {}", endpoint, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(SchedulerError::InvalidTask(format!(
            "endpoint '{}': unsupported scheme '{}'",
            endpoint, other
        ))),
    }
}

/// Validate a definition and turn it into a [`NewTask`] as of `now`.
pub fn prepare_task(
    definition: TaskDefinition,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Result<NewTask, SchedulerError> {
    let (schedule, first) = plan_schedule(&definition.schedule, now, offset)?;
    validate_endpoint(&definition.endpoint)?;

    let name = definition.name.trim();
    if name.is_empty() {
        return Err(SchedulerError::InvalidTask("name is empty".to_string()));
    }

    let uuid = match definition.uuid {
        Some(uuid) if !uuid.trim().is_empty() => uuid.trim().to_string(),
        _ => Uuid::new_v4().to_string(),
    };

    Ok(NewTask {
        uuid,
        name: name.to_string(),
        endpoint: definition.endpoint.trim().to_string(),
        message_type: definition.message_type,
        message_content: definition.message_content,
        schedule,
        next_fire_at: Some(first),
        enabled: definition.enabled,
        created_at: now,
    })
}

/// Admit a task definition into `store`.
///
/// Fails with [`SchedulerError::InvalidSchedule`] for a malformed or
/// never-firing schedule and with a duplicate store error when the uuid is
/// already taken.
#[tracing::instrument(skip_all, fields(name = %definition.name))]
pub async fn admit_task(
    store: &dyn TaskStore,
    clock: &dyn Clock,
    offset: FixedOffset,
    definition: TaskDefinition,
) -> Result<Task, SchedulerError> {
    let new_task = prepare_task(definition, clock.utc(), offset)?;
    let task = store.insert_task(new_task).await?;

    info!(
        task_id = task.id,
        uuid = %task.uuid,
        schedule = %task.schedule,
        next_fire_at = ?task.next_fire_at,
        "admitted task"
    );
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryTaskStore, StoreError};
    use chrono::{Local, Offset, TimeZone};

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn local(&self) -> DateTime<Local> {
            self.0.with_timezone(&Local)
        }

        fn utc(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn definition(schedule: &str) -> TaskDefinition {
        TaskDefinition {
            uuid: None,
            name: "Standup".to_string(),
            endpoint: "https://example.com/hook?key=abc".to_string(),
            message_type: "text".to_string(),
            message_content: "stand up!".to_string(),
            schedule: schedule.to_string(),
            enabled: true,
        }
    }

    fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2024, 1, 1, 8, 59, 30).unwrap())
    }

    #[tokio::test]
    async fn test_admission_computes_first_fire() {
        let store = MemoryTaskStore::new();
        let task = admit_task(&store, &clock(), Utc.fix(), definition("0 9 * * *"))
            .await
            .unwrap();

        assert_eq!(
            task.next_fire_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap())
        );
        assert_eq!(task.schedule, "0 9 * * *");
        assert!(task.enabled);
        assert!(!task.uuid.is_empty());
    }

    #[tokio::test]
    async fn test_admission_normalises_schedule_text() {
        let store = MemoryTaskStore::new();
        let task = admit_task(&store, &clock(), Utc.fix(), definition("每天9:30点"))
            .await
            .unwrap();
        assert_eq!(task.schedule, "30 9 * * *");
    }

    #[tokio::test]
    async fn test_admission_rejects_invalid_schedule() {
        let store = MemoryTaskStore::new();
        let result = admit_task(&store, &clock(), Utc.fix(), definition("61 * * * *")).await;

        assert!(matches!(result, Err(SchedulerError::InvalidSchedule(_))));
        assert!(store.all_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_admission_rejects_never_firing_schedule() {
        let store = MemoryTaskStore::new();
        let result = admit_task(&store, &clock(), Utc.fix(), definition("0 0 30 2 *")).await;

        assert!(matches!(
            result,
            Err(SchedulerError::InvalidSchedule(ScheduleError::NoOccurrence(_)))
        ));
    }

    #[tokio::test]
    async fn test_admission_rejects_duplicate_uuid() {
        let store = MemoryTaskStore::new();
        let mut def = definition("0 9 * * *");
        def.uuid = Some("fixed-uuid".to_string());

        admit_task(&store, &clock(), Utc.fix(), def.clone())
            .await
            .unwrap();
        let result = admit_task(&store, &clock(), Utc.fix(), def).await;

        assert!(matches!(
            result,
            Err(SchedulerError::Store(StoreError::Duplicate(uuid))) if uuid == "fixed-uuid"
        ));
        assert_eq!(store.all_tasks().await.len(), 1);
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("https://qyapi.example.com/cgi-bin/webhook/send?key=1").is_ok());
        assert!(validate_endpoint("http://localhost:8080/hook").is_ok());
        assert!(matches!(
            validate_endpoint("not a url"),
            Err(SchedulerError::InvalidTask(_))
        ));
        assert!(matches!(
            validate_endpoint("ftp://example.com/hook"),
            Err(SchedulerError::InvalidTask(_))
        ));
    }

    #[test]
    fn test_prepare_task_rejects_empty_name() {
        let mut def = definition("0 9 * * *");
        def.name = "   ".to_string();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        assert!(matches!(
            prepare_task(def, now, Utc.fix()),
            Err(SchedulerError::InvalidTask(_))
        ));
    }

    #[test]
    fn test_plan_schedule_uses_offset() {
        // 09:00 at UTC+8 is 01:00 UTC
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let (expression, first) = plan_schedule("0 9 * * *", now, offset).unwrap();
        assert_eq!(expression, "0 9 * * *");
        assert_eq!(first, Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());
    }
}
