//! Webhook subscriptions and the append-only delivery log.

use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use scanloop_core::error::{Result, ScanloopError};
use scanloop_core::model::{
    DeliveryStatus, SubscriptionStatus, WebhookDelivery, WebhookSubscription,
};

use crate::db::{StoreDb, opt_ts_from_string, opt_ts_to_string, ts_from_string, ts_to_string};

const SUB_COLS: &str =
    "id, project_id, name, url, secret, events, status, created_at, updated_at, last_delivery_at";

const DELIVERY_COLS: &str =
    "id, subscription_id, event, status, response_code, error, payload, delivered_at, duration_ms";

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookSubscription> {
    let events_str: String = row.get(5)?;
    Ok(WebhookSubscription {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        secret: row.get(4)?,
        events: serde_json::from_str(&events_str).unwrap_or_default(),
        status: SubscriptionStatus::parse(&row.get::<_, String>(6)?)
            .unwrap_or(SubscriptionStatus::Paused),
        created_at: ts_from_string(&row.get::<_, String>(7)?).unwrap_or_else(Utc::now),
        updated_at: ts_from_string(&row.get::<_, String>(8)?).unwrap_or_else(Utc::now),
        last_delivery_at: opt_ts_from_string(row.get(9)?),
    })
}

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookDelivery> {
    Ok(WebhookDelivery {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        event: row.get(2)?,
        status: DeliveryStatus::parse(&row.get::<_, String>(3)?).unwrap_or(DeliveryStatus::Failed),
        response_code: row.get(4)?,
        error: row.get(5)?,
        payload: row.get(6)?,
        delivered_at: ts_from_string(&row.get::<_, String>(7)?).unwrap_or_else(Utc::now),
        duration_ms: row.get(8)?,
    })
}

impl StoreDb {
    // ─── Subscriptions ────────────────────────────────────────────────────

    pub fn create_subscription(&self, sub: &WebhookSubscription) -> Result<()> {
        self.conn()?
            .execute(
                &format!("INSERT INTO webhook_subscriptions ({SUB_COLS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    sub.id,
                    sub.project_id,
                    sub.name,
                    sub.url,
                    sub.secret,
                    serde_json::to_string(&sub.events)?,
                    sub.status.as_str(),
                    ts_to_string(sub.created_at),
                    ts_to_string(sub.updated_at),
                    opt_ts_to_string(sub.last_delivery_at),
                ],
            )
            .map_err(|e| ScanloopError::Store(format!("Insert subscription: {e}")))?;
        Ok(())
    }

    pub fn get_subscription(&self, id: &str) -> Result<Option<WebhookSubscription>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SUB_COLS} FROM webhook_subscriptions WHERE id = ?1"
            ))
            .map_err(|e| ScanloopError::Store(format!("Get subscription: {e}")))?;
        let mut rows = stmt
            .query_map([id], subscription_from_row)
            .map_err(|e| ScanloopError::Store(format!("Get subscription: {e}")))?;
        Ok(rows.next().transpose().map_err(|e| ScanloopError::Store(e.to_string()))?)
    }

    pub fn list_subscriptions(&self) -> Result<Vec<WebhookSubscription>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SUB_COLS} FROM webhook_subscriptions ORDER BY created_at DESC"
            ))
            .map_err(|e| ScanloopError::Store(format!("List subscriptions: {e}")))?;
        let rows = stmt
            .query_map([], subscription_from_row)
            .map_err(|e| ScanloopError::Store(format!("List subscriptions: {e}")))?;
        Ok(rows.filter_map(|s| s.ok()).collect())
    }

    pub fn delete_subscription(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()?
            .execute("DELETE FROM webhook_subscriptions WHERE id = ?1", [id])
            .map_err(|e| ScanloopError::Store(format!("Delete subscription: {e}")))?;
        Ok(affected == 1)
    }

    /// Active subscriptions that would receive `event` for a task in
    /// `project_id` (global subscriptions always qualify).
    pub fn subscriptions_for_event(
        &self,
        project_id: Option<&str>,
        event: &str,
    ) -> Result<Vec<WebhookSubscription>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SUB_COLS} FROM webhook_subscriptions \
                 WHERE status = 'active' AND (project_id IS NULL OR project_id = ?1) \
                 ORDER BY created_at ASC"
            ))
            .map_err(|e| ScanloopError::Store(format!("Match subscriptions: {e}")))?;
        let rows = stmt
            .query_map([project_id], subscription_from_row)
            .map_err(|e| ScanloopError::Store(format!("Match subscriptions: {e}")))?;
        // Event-set membership is checked in Rust — events live in a JSON column
        Ok(rows
            .filter_map(|s| s.ok())
            .filter(|s| s.matches(project_id, event))
            .collect())
    }

    pub fn touch_subscription_delivery(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE webhook_subscriptions SET last_delivery_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![ts_to_string(at), id],
            )
            .map_err(|e| ScanloopError::Store(format!("Touch subscription: {e}")))?;
        Ok(())
    }

    // ─── Deliveries ───────────────────────────────────────────────────────

    /// Append a delivery record. Deliveries are never mutated after insert.
    pub fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        self.conn()?
            .execute(
                &format!("INSERT INTO webhook_deliveries ({DELIVERY_COLS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    delivery.id,
                    delivery.subscription_id,
                    delivery.event,
                    delivery.status.as_str(),
                    delivery.response_code,
                    delivery.error,
                    delivery.payload,
                    ts_to_string(delivery.delivered_at),
                    delivery.duration_ms,
                ],
            )
            .map_err(|e| ScanloopError::Store(format!("Insert delivery: {e}")))?;
        Ok(())
    }

    /// Recent deliveries, optionally scoped to one subscription.
    pub fn list_deliveries(
        &self,
        subscription_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>> {
        let conn = self.conn()?;
        let rows = match subscription_id {
            Some(sub_id) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {DELIVERY_COLS} FROM webhook_deliveries \
                         WHERE subscription_id = ?1 ORDER BY delivered_at DESC LIMIT ?2"
                    ))
                    .map_err(|e| ScanloopError::Store(format!("List deliveries: {e}")))?;
                let rows = stmt
                    .query_map(params![sub_id, limit as i64], delivery_from_row)
                    .map_err(|e| ScanloopError::Store(format!("List deliveries: {e}")))?;
                rows.filter_map(|d| d.ok()).collect()
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {DELIVERY_COLS} FROM webhook_deliveries \
                         ORDER BY delivered_at DESC LIMIT ?1"
                    ))
                    .map_err(|e| ScanloopError::Store(format!("List deliveries: {e}")))?;
                let rows = stmt
                    .query_map([limit as i64], delivery_from_row)
                    .map_err(|e| ScanloopError::Store(format!("List deliveries: {e}")))?;
                rows.filter_map(|d| d.ok()).collect()
            }
        };
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanloop_core::model::new_id;

    fn sample_subscription(project_id: Option<&str>, events: &[&str]) -> WebhookSubscription {
        WebhookSubscription {
            id: new_id(),
            project_id: project_id.map(String::from),
            name: "hooks".into(),
            url: "https://example.com/hook".into(),
            secret: "whsec".into(),
            events: events.iter().map(|e| e.to_string()).collect(),
            status: SubscriptionStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_delivery_at: None,
        }
    }

    #[test]
    fn test_subscription_round_trip() {
        let db = StoreDb::open_in_memory().unwrap();
        let sub = sample_subscription(Some("p1"), &["automation.run.completed"]);
        db.create_subscription(&sub).unwrap();

        let loaded = db.get_subscription(&sub.id).unwrap().unwrap();
        assert_eq!(loaded.url, sub.url);
        assert_eq!(loaded.events, sub.events);
        assert!(db.delete_subscription(&sub.id).unwrap());
        assert!(!db.delete_subscription(&sub.id).unwrap());
    }

    #[test]
    fn test_event_scoping() {
        let db = StoreDb::open_in_memory().unwrap();
        let global = sample_subscription(None, &["automation.run.completed"]);
        let scoped = sample_subscription(Some("p1"), &["automation.run.completed"]);
        let other_event = sample_subscription(None, &["automation.run.failed"]);
        let mut paused = sample_subscription(None, &["automation.run.completed"]);
        paused.status = SubscriptionStatus::Paused;

        for sub in [&global, &scoped, &other_event, &paused] {
            db.create_subscription(sub).unwrap();
        }

        let matched = db
            .subscriptions_for_event(Some("p1"), "automation.run.completed")
            .unwrap();
        let ids: Vec<&str> = matched.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(matched.len(), 2);
        assert!(ids.contains(&global.id.as_str()));
        assert!(ids.contains(&scoped.id.as_str()));

        // Task without a project only reaches global subscriptions
        let matched = db
            .subscriptions_for_event(None, "automation.run.completed")
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, global.id);
    }

    #[test]
    fn test_delivery_log_appends() {
        let db = StoreDb::open_in_memory().unwrap();
        let sub = sample_subscription(None, &["automation.run.completed"]);
        db.create_subscription(&sub).unwrap();

        let delivery = WebhookDelivery {
            id: new_id(),
            subscription_id: Some(sub.id.clone()),
            event: "automation.run.completed".into(),
            status: DeliveryStatus::Delivered,
            response_code: Some(200),
            error: None,
            payload: "{}".into(),
            delivered_at: Utc::now(),
            duration_ms: 42,
        };
        db.record_delivery(&delivery).unwrap();
        db.touch_subscription_delivery(&sub.id, delivery.delivered_at).unwrap();

        let listed = db.list_deliveries(Some(&sub.id), 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].response_code, Some(200));
        assert!(db.get_subscription(&sub.id).unwrap().unwrap().last_delivery_at.is_some());
    }
}
