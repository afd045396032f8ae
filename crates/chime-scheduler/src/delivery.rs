//! Delivery worker pool and the webhook deliverer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockable::Clock;
use reqwest::Client;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{DeliveryConfig, DeliveryFailure, DeliveryReport, DispatchEvent, Task};

/// Longest response body kept in a rejection reason.
const MAX_DETAIL_LEN: usize = 256;

/// Sends a task's message to its endpoint.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, task: &Task) -> Result<(), DeliveryFailure>;
}

/// Run one delivery under `deadline`.
pub async fn deliver_with_deadline(
    deliverer: &dyn Deliverer,
    task: &Task,
    deadline: Duration,
) -> Result<(), DeliveryFailure> {
    match timeout(deadline, deliverer.deliver(task)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryFailure::Timeout),
    }
}

/// Fixed-size pool of delivery workers sharing one dispatch queue.
pub struct DeliveryPool {
    deliverer: Arc<dyn Deliverer>,
    clock: Arc<dyn Clock + Send + Sync>,
    config: DeliveryConfig,
}

impl DeliveryPool {
    pub fn new(
        deliverer: Arc<dyn Deliverer>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            deliverer,
            clock,
            config,
        }
    }

    /// Spawn the workers. Each takes events from `dispatch_rx`, delivers
    /// them and reports the result on `report_tx`. Workers stop when the
    /// queue closes or `shutdown_rx` flips; a delivery already in flight
    /// is finished first.
    pub fn spawn(
        self,
        dispatch_rx: mpsc::UnboundedReceiver<DispatchEvent>,
        report_tx: mpsc::UnboundedSender<DeliveryReport>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let worker_count = self.config.concurrency.max(1);
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let dispatch_rx = Arc::clone(&dispatch_rx);
            let report_tx = report_tx.clone();
            let deliverer = Arc::clone(&self.deliverer);
            let clock = Arc::clone(&self.clock);
            let deadline = self.config.timeout;
            let mut shutdown_rx = shutdown_rx.clone();

            let handle = tokio::spawn(async move {
                debug!(worker_id, "delivery worker started");

                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    let event = {
                        let mut rx = dispatch_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                                continue;
                            }
                            event = rx.recv() => event,
                        }
                    };

                    let Some(event) = event else {
                        // Channel closed
                        break;
                    };

                    debug!(
                        worker_id,
                        task_id = event.task.id,
                        attempt = event.attempt,
                        "delivering"
                    );
                    let result =
                        deliver_with_deadline(deliverer.as_ref(), &event.task, deadline).await;
                    if let Err(failure) = &result {
                        warn!(
                            task_id = event.task.id,
                            attempt = event.attempt,
                            error = %failure,
                            "delivery failed"
                        );
                    }

                    let report = DeliveryReport {
                        event,
                        result,
                        finished_at: clock.utc(),
                    };
                    if report_tx.send(report).is_err() {
                        warn!(worker_id, "result handler is gone, stopping worker");
                        break;
                    }
                }

                debug!(worker_id, "delivery worker stopped");
            });
            handles.push(handle);
        }

        info!(workers = worker_count, "delivery pool started");
        handles
    }
}

/// Build the JSON body for a webhook message:
/// `{"msgtype": <type>, <type>: {"content": <content>}}`.
pub fn webhook_payload(message_type: &str, content: &str) -> Value {
    let mut body = Map::new();
    body.insert("msgtype".to_string(), json!(message_type));
    body.insert(message_type.to_string(), json!({ "content": content }));
    Value::Object(body)
}

/// Delivers messages to chat-bot style webhooks over HTTP.
#[derive(Clone)]
pub struct WebhookDeliverer {
    http: Client,
}

impl WebhookDeliverer {
    /// Create a deliverer whose requests give up after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .connect_timeout(request_timeout.min(Duration::from_secs(10)))
            .timeout(request_timeout)
            .build()?;
        Ok(Self { http })
    }

    /// POST one message to `endpoint`.
    ///
    /// Succeeds on a 2xx response whose JSON body, if any, carries
    /// `errcode: 0` or no `errcode` at all.
    #[tracing::instrument(skip(self, content))]
    pub async fn send_message(
        &self,
        endpoint: &str,
        message_type: &str,
        content: &str,
    ) -> Result<(), DeliveryFailure> {
        let response = self
            .http
            .post(endpoint)
            .json(&webhook_payload(message_type, content))
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_error)?;

        if !status.is_success() {
            return Err(DeliveryFailure::Rejected {
                status: status.as_u16(),
                detail: truncate(&text),
            });
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::Null);
        let code = body.get("errcode").and_then(Value::as_i64).unwrap_or(0);
        if code != 0 {
            let message = body
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("no errmsg");
            return Err(DeliveryFailure::Rejected {
                status: status.as_u16(),
                detail: format!("errcode {}: {}", code, truncate(message)),
            });
        }

        debug!(status = status.as_u16(), "webhook accepted message");
        Ok(())
    }
}

#[async_trait]
impl Deliverer for WebhookDeliverer {
    async fn deliver(&self, task: &Task) -> Result<(), DeliveryFailure> {
        self.send_message(&task.endpoint, &task.message_type, &task.message_content)
            .await
    }
}

fn classify_error(error: reqwest::Error) -> DeliveryFailure {
    if error.is_timeout() {
        DeliveryFailure::Timeout
    } else {
        DeliveryFailure::Connection(error.to_string())
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_DETAIL_LEN) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task(endpoint: String) -> Task {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Task {
            id: 7,
            uuid: "u-7".to_string(),
            name: "Standup".to_string(),
            endpoint,
            message_type: "text".to_string(),
            message_content: "stand up!".to_string(),
            schedule: "0 9 * * *".to_string(),
            next_fire_at: None,
            enabled: true,
            created_at: created,
            updated_at: created,
        }
    }

    fn deliverer() -> WebhookDeliverer {
        WebhookDeliverer::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_webhook_payload_shape() {
        assert_eq!(
            webhook_payload("markdown", "**hi**"),
            json!({"msgtype": "markdown", "markdown": {"content": "**hi**"}})
        );
    }

    #[test]
    fn test_truncate_long_detail() {
        let long = "x".repeat(MAX_DETAIL_LEN + 10);
        let truncated = truncate(&long);
        assert_eq!(truncated.len(), MAX_DETAIL_LEN + 3);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn test_deliver_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({"msgtype": "text", "text": {"content": "stand up!"}})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"errcode": 0, "errmsg": "ok"})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = deliverer()
            .deliver(&task(format!("{}/hook", mock_server.uri())))
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_deliver_success_with_empty_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let result = deliverer().deliver(&task(mock_server.uri())).await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_deliver_nonzero_errcode_is_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 93000,
                "errmsg": "invalid webhook url"
            })))
            .mount(&mock_server)
            .await;

        let result = deliverer().deliver(&task(mock_server.uri())).await;
        assert_eq!(
            result,
            Err(DeliveryFailure::Rejected {
                status: 200,
                detail: "errcode 93000: invalid webhook url".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_deliver_server_error_is_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&mock_server)
            .await;

        let result = deliverer().deliver(&task(mock_server.uri())).await;
        assert!(matches!(
            result,
            Err(DeliveryFailure::Rejected { status: 503, ref detail }) if detail == "overloaded"
        ));
    }

    #[tokio::test]
    async fn test_deliver_slow_endpoint_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let deliverer = WebhookDeliverer::new(Duration::from_millis(200)).unwrap();
        let result = deliverer.deliver(&task(mock_server.uri())).await;
        assert_eq!(result, Err(DeliveryFailure::Timeout));
    }

    #[tokio::test]
    async fn test_deliver_unreachable_endpoint() {
        // Port 9 (discard) is almost never listening
        let result = deliverer()
            .deliver(&task("http://127.0.0.1:9/hook".to_string()))
            .await;
        assert!(matches!(result, Err(DeliveryFailure::Connection(_))));
    }

    struct Stalled;

    #[async_trait]
    impl Deliverer for Stalled {
        async fn deliver(&self, _task: &Task) -> Result<(), DeliveryFailure> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_applies_to_any_deliverer() {
        let result = deliver_with_deadline(
            &Stalled,
            &task("http://unused".to_string()),
            Duration::from_secs(20),
        )
        .await;
        assert_eq!(result, Err(DeliveryFailure::Timeout));
    }
}
