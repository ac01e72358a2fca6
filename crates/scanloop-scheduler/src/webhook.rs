//! Signed webhook fan-out.
//!
//! Events go to every active subscription whose event set matches (scoped to
//! the task's project or global) and to the task's direct webhook. Each send
//! is one-shot: the outcome is recorded as an append-only delivery row and
//! never retried. Delivery failures never propagate.

use chrono::Utc;
use hmac::{Hmac, Mac};
use scanloop_core::config::WebhookConfig;
use scanloop_core::error::{Result, ScanloopError};
use scanloop_core::model::{
    AutomationTask, DeliveryStatus, TaskRun, WebhookDelivery, WebhookSubscription, new_id,
};
use scanloop_store::StoreDb;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_RUN_COMPLETED: &str = "automation.run.completed";
pub const EVENT_RUN_FAILED: &str = "automation.run.failed";
pub const EVENT_TEST: &str = "webhook.test";

/// What happened across one event's fan-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
}

/// Outcome of a single HTTP send.
struct SendOutcome {
    status: DeliveryStatus,
    response_code: Option<i64>,
    error: Option<String>,
    duration_ms: i64,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    fallback_secret: String,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            fallback_secret: config.resolve_signing_secret(),
        }
    }

    /// Hex HMAC-SHA256 of the exact body bytes sent.
    pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ScanloopError::Delivery(format!("signing key: {e}")))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Canonical event envelope.
    pub fn build_envelope(event: &str, task: &AutomationTask, run: &TaskRun) -> serde_json::Value {
        serde_json::json!({
            "id": new_id(),
            "type": event,
            "projectId": task.project_id,
            "timestamp": Utc::now().to_rfc3339(),
            "data": {
                "task": {
                    "id": task.id,
                    "name": task.name,
                    "cadence": task.cadence,
                    "status": task.status,
                },
                "run": run,
            },
        })
    }

    /// Fan an event out to matching subscriptions and the task's direct
    /// webhook. Every send is recorded; nothing here throws.
    pub async fn emit_event(
        &self,
        store: &StoreDb,
        event: &str,
        task: &AutomationTask,
        run: &TaskRun,
    ) -> DeliveryReport {
        let envelope = Self::build_envelope(event, task, run);
        let body = match serde_json::to_string(&envelope) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("event envelope for {event} not serializable: {e}");
                return DeliveryReport::default();
            }
        };

        let mut report = DeliveryReport::default();

        let subscriptions = match store.subscriptions_for_event(task.project_id.as_deref(), event) {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!("subscription lookup failed for {event}: {e}");
                Vec::new()
            }
        };
        for sub in &subscriptions {
            report.attempted += 1;
            let outcome = self.send(&sub.url, &sub.secret, event, &body).await;
            if outcome.status == DeliveryStatus::Delivered {
                report.delivered += 1;
            }
            self.record(store, Some(sub), event, &body, outcome);
        }

        if let Some(hook) = task.direct_webhook() {
            report.attempted += 1;
            let secret = hook.secret.as_deref().unwrap_or(&self.fallback_secret);
            let outcome = self.send(&hook.url, secret, event, &body).await;
            if outcome.status == DeliveryStatus::Delivered {
                report.delivered += 1;
            }
            self.record(store, None, event, &body, outcome);
        }

        report
    }

    /// Test delivery for a persisted subscription.
    pub async fn send_test(
        &self,
        store: &StoreDb,
        subscription: &WebhookSubscription,
    ) -> WebhookDelivery {
        let body = Self::test_body();
        let outcome = self.send(&subscription.url, &subscription.secret, EVENT_TEST, &body).await;
        self.record(store, Some(subscription), EVENT_TEST, &body, outcome)
    }

    /// Ad-hoc test delivery against an arbitrary endpoint — recorded without
    /// a subscription.
    pub async fn send_adhoc(&self, store: &StoreDb, url: &str, secret: &str) -> WebhookDelivery {
        let body = Self::test_body();
        let secret = if secret.is_empty() { &self.fallback_secret } else { secret };
        let outcome = self.send(url, secret, EVENT_TEST, &body).await;
        self.record(store, None, EVENT_TEST, &body, outcome)
    }

    fn test_body() -> String {
        serde_json::json!({
            "id": new_id(),
            "type": EVENT_TEST,
            "timestamp": Utc::now().to_rfc3339(),
            "data": {},
        })
        .to_string()
    }

    /// POST the body, signed, and classify the result. Network problems and
    /// non-2xx responses both degrade to a failed outcome.
    async fn send(&self, url: &str, secret: &str, event: &str, body: &str) -> SendOutcome {
        let started = std::time::Instant::now();

        let signature = match Self::sign(secret, body.as_bytes()) {
            Ok(signature) => signature,
            Err(e) => {
                return SendOutcome {
                    status: DeliveryStatus::Failed,
                    response_code: None,
                    error: Some(e.to_string()),
                    duration_ms: 0,
                };
            }
        };

        let result = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Event", event)
            .header("X-Signature", signature)
            .body(body.to_string())
            .send()
            .await;

        let duration_ms = started.elapsed().as_millis() as i64;
        match result {
            Ok(resp) => {
                let code = resp.status().as_u16() as i64;
                if resp.status().is_success() {
                    SendOutcome {
                        status: DeliveryStatus::Delivered,
                        response_code: Some(code),
                        error: None,
                        duration_ms,
                    }
                } else {
                    let text = resp.text().await.unwrap_or_default();
                    SendOutcome {
                        status: DeliveryStatus::Failed,
                        response_code: Some(code),
                        error: Some(text),
                        duration_ms,
                    }
                }
            }
            Err(e) => SendOutcome {
                status: DeliveryStatus::Failed,
                response_code: None,
                error: Some(e.to_string()),
                duration_ms,
            },
        }
    }

    /// Persist the delivery row and bump the subscription's last-delivery
    /// marker. Store failures are logged, never raised.
    fn record(
        &self,
        store: &StoreDb,
        subscription: Option<&WebhookSubscription>,
        event: &str,
        body: &str,
        outcome: SendOutcome,
    ) -> WebhookDelivery {
        let delivered_at = Utc::now();
        let delivery = WebhookDelivery {
            id: new_id(),
            subscription_id: subscription.map(|s| s.id.clone()),
            event: event.to_string(),
            status: outcome.status,
            response_code: outcome.response_code,
            error: outcome.error,
            payload: body.to_string(),
            delivered_at,
            duration_ms: outcome.duration_ms,
        };

        if let Err(e) = store.record_delivery(&delivery) {
            tracing::error!("delivery row for {event} not recorded: {e}");
        }
        if let Some(sub) = subscription {
            if let Err(e) = store.touch_subscription_delivery(&sub.id, delivered_at) {
                tracing::warn!("subscription {} last-delivery not updated: {e}", sub.id);
            }
        }

        match delivery.status {
            DeliveryStatus::Delivered => {
                tracing::debug!("delivered {event} ({} ms)", delivery.duration_ms)
            }
            DeliveryStatus::Failed => tracing::warn!(
                "delivery of {event} failed: {}",
                delivery.error.as_deref().unwrap_or("unknown")
            ),
        }
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scanloop_core::model::{Cadence, ScheduleConfig, TaskStatus, TaskTarget};

    fn sample_task() -> AutomationTask {
        AutomationTask {
            id: "task-1".into(),
            name: "nightly scan".into(),
            project_id: Some("p1".into()),
            status: TaskStatus::Scheduled,
            cadence: Cadence::Daily,
            timezone: "UTC".into(),
            schedule: ScheduleConfig::default(),
            targets: vec![TaskTarget {
                kind: "scan".into(),
                label: "A".into(),
                batch_size: 50,
                profile_id: None,
                metadata: None,
            }],
            last_run_at: None,
            next_run_at: None,
            last_status: None,
            webhook_url: None,
            webhook_secret: None,
            retry_limit: 0,
            retry_attempts: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: serde_json::Value::Null,
            last_result: None,
        }
    }

    #[test]
    fn test_signature_matches_known_vector() {
        // RFC 4231-style reference: HMAC-SHA256("key", "The quick brown fox
        // jumps over the lazy dog")
        let signature = WebhookNotifier::sign(
            "key",
            b"The quick brown fox jumps over the lazy dog",
        )
        .unwrap();
        assert_eq!(
            signature,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_signature_covers_exact_bytes() {
        let a = WebhookNotifier::sign("s", b"{\"a\":1}").unwrap();
        let b = WebhookNotifier::sign("s", b"{\"a\": 1}").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_envelope_shape() {
        let task = sample_task();
        let run = TaskRun::queued(&task.id, Utc::now());
        let envelope = WebhookNotifier::build_envelope(EVENT_RUN_COMPLETED, &task, &run);

        assert_eq!(envelope["type"], EVENT_RUN_COMPLETED);
        assert_eq!(envelope["projectId"], "p1");
        assert_eq!(envelope["data"]["task"]["id"], "task-1");
        assert_eq!(envelope["data"]["task"]["cadence"], "daily");
        assert_eq!(envelope["data"]["task"]["status"], "scheduled");
        assert_eq!(envelope["data"]["run"]["taskId"], "task-1");
        assert!(envelope["timestamp"].is_string());
        assert!(envelope["id"].is_string());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_records_failure() {
        let db = StoreDb::open_in_memory().unwrap();
        let notifier = WebhookNotifier::new(&WebhookConfig {
            signing_secret: "fallback".into(),
            timeout_secs: 2,
        });

        // Port 9 (discard) is closed; the connection is refused locally.
        let delivery = notifier.send_adhoc(&db, "http://127.0.0.1:9/hook", "").await;
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert!(delivery.error.is_some());
        assert!(delivery.subscription_id.is_none());

        let rows = db.list_deliveries(None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event, EVENT_TEST);
    }
}
