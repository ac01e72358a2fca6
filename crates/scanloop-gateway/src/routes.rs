//! API route handlers for the gateway.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use scanloop_core::error::ScanloopError;
use scanloop_core::model::{
    Cadence, ScheduleConfig, SubscriptionStatus, TaskStatus, TaskTarget, WebhookSubscription,
    new_id,
};
use scanloop_scheduler::{TaskSpec, TaskUpdate};
use scanloop_store::StoreDb;

use super::server::AppState;

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn bad_request(message: impl Into<String>) -> ApiError {
    let message = message.into();
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"ok": false, "error": message})),
    )
}

fn error_response(err: ScanloopError) -> ApiError {
    let status = match &err {
        ScanloopError::TaskNotFound(_) | ScanloopError::RunNotFound(_) => StatusCode::NOT_FOUND,
        ScanloopError::InvalidTransition(_) => StatusCode::CONFLICT,
        ScanloopError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"ok": false, "error": err.to_string()})))
}

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "scanloop-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> ApiResult {
    let queue_depth = state
        .engine
        .store()
        .kv_count(scanloop_scheduler::QUEUE_PREFIX)
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "queueDepth": queue_depth,
        "scheduler": {
            "tickSecs": state.engine.scheduler_config().tick_secs,
            "dispatchLimit": state.engine.scheduler_config().dispatch_limit,
            "queueLimit": state.engine.scheduler_config().queue_limit,
        },
    })))
}

// ─── Tasks ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    name: String,
    #[serde(default)]
    project_id: Option<String>,
    cadence: String,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    schedule: ScheduleConfig,
    #[serde(default)]
    targets: Vec<TaskTarget>,
    #[serde(default)]
    webhook_url: Option<String>,
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    retry_limit: u32,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    activate: bool,
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskRequest>,
) -> ApiResult {
    if body.name.trim().is_empty() {
        return Err(bad_request("task name is required"));
    }
    let cadence = Cadence::parse(&body.cadence)
        .ok_or_else(|| bad_request(format!("unknown cadence '{}'", body.cadence)))?;

    let task = state
        .engine
        .create_task(
            TaskSpec {
                name: body.name,
                project_id: body.project_id,
                cadence,
                timezone: body.timezone,
                schedule: body.schedule,
                targets: body.targets,
                webhook_url: body.webhook_url,
                webhook_secret: body.webhook_secret,
                retry_limit: body.retry_limit,
                metadata: body.metadata,
                activate: body.activate,
            },
            Utc::now(),
        )
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"ok": true, "task": task})))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let tasks = state
        .engine
        .store()
        .list_recent_tasks(query.limit.unwrap_or(50))
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"ok": true, "tasks": tasks})))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let store = state.engine.store();
    let task = store
        .get_task(&id)
        .map_err(error_response)?
        .ok_or_else(|| error_response(ScanloopError::TaskNotFound(id.clone())))?;
    let runs = store.list_runs_for_task(&id, 50).map_err(error_response)?;
    Ok(Json(serde_json::json!({"ok": true, "task": task, "runs": runs})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchTaskRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    cadence: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    schedule: Option<ScheduleConfig>,
    #[serde(default)]
    targets: Option<Vec<TaskTarget>>,
    #[serde(default)]
    webhook_url: Option<String>,
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    retry_limit: Option<u32>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

pub async fn patch_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PatchTaskRequest>,
) -> ApiResult {
    let status = match body.status.as_deref() {
        Some(s) => Some(
            TaskStatus::parse(s).ok_or_else(|| bad_request(format!("unknown status '{s}'")))?,
        ),
        None => None,
    };
    let cadence = match body.cadence.as_deref() {
        Some(c) => {
            Some(Cadence::parse(c).ok_or_else(|| bad_request(format!("unknown cadence '{c}'")))?)
        }
        None => None,
    };

    let task = state
        .engine
        .patch_task(
            &id,
            TaskUpdate {
                name: body.name,
                status,
                cadence,
                timezone: body.timezone,
                schedule: body.schedule,
                targets: body.targets,
                webhook_url: body.webhook_url.map(Some),
                webhook_secret: body.webhook_secret.map(Some),
                retry_limit: body.retry_limit,
                metadata: body.metadata,
            },
            Utc::now(),
        )
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"ok": true, "task": task})))
}

pub async fn trigger_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let (task, run) = state
        .engine
        .trigger_task(&id, Utc::now())
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"ok": true, "task": task, "run": run})))
}

// ─── Scheduler ────────────────────────────────────────────────────────────

pub async fn dispatch_due(State(state): State<Arc<AppState>>) -> ApiResult {
    let limit = state.engine.scheduler_config().dispatch_limit;
    let dispatched = state
        .engine
        .dispatch_due(Utc::now(), limit)
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"ok": true, "dispatched": dispatched})))
}

pub async fn process_queue(State(state): State<Arc<AppState>>) -> ApiResult {
    let limit = state.engine.scheduler_config().queue_limit;
    let processed = state.engine.process_queue(limit).await;
    Ok(Json(serde_json::json!({"ok": true, "processed": processed})))
}

// ─── Webhooks ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    name: String,
    url: String,
    secret: String,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    events: Vec<String>,
}

pub async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSubscriptionRequest>,
) -> ApiResult {
    if body.url.trim().is_empty() {
        return Err(bad_request("subscription url is required"));
    }
    if body.events.is_empty() {
        return Err(bad_request("at least one event is required"));
    }

    let now = Utc::now();
    let subscription = WebhookSubscription {
        id: new_id(),
        project_id: body.project_id,
        name: body.name,
        url: body.url,
        secret: body.secret,
        events: body.events,
        status: SubscriptionStatus::Active,
        created_at: now,
        updated_at: now,
        last_delivery_at: None,
    };
    state
        .engine
        .store()
        .create_subscription(&subscription)
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"ok": true, "subscription": subscription})))
}

pub async fn list_subscriptions(State(state): State<Arc<AppState>>) -> ApiResult {
    let subscriptions = state
        .engine
        .store()
        .list_subscriptions()
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"ok": true, "subscriptions": subscriptions})))
}

pub async fn delete_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let deleted = state
        .engine
        .store()
        .delete_subscription(&id)
        .map_err(error_response)?;
    if !deleted {
        return Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"ok": false, "error": format!("subscription {id} not found")})),
        ));
    }
    Ok(Json(serde_json::json!({"ok": true})))
}

pub async fn list_subscription_deliveries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let deliveries = state
        .engine
        .store()
        .list_deliveries(Some(&id), query.limit.unwrap_or(50))
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"ok": true, "deliveries": deliveries})))
}

pub async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let deliveries = state
        .engine
        .store()
        .list_deliveries(None, query.limit.unwrap_or(50))
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"ok": true, "deliveries": deliveries})))
}

/// Test delivery for a persisted subscription.
pub async fn test_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let store: &StoreDb = state.engine.store();
    let subscription = store
        .get_subscription(&id)
        .map_err(error_response)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"ok": false, "error": format!("subscription {id} not found")})),
            )
        })?;

    let delivery = state
        .engine
        .notifier()
        .send_test(store, &subscription)
        .await;
    Ok(Json(serde_json::json!({"ok": true, "delivery": delivery})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdhocTestRequest {
    url: String,
    #[serde(default)]
    secret: String,
}

/// Ad-hoc test delivery against an arbitrary endpoint, no persisted
/// subscription involved.
pub async fn adhoc_test_delivery(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AdhocTestRequest>,
) -> ApiResult {
    if body.url.trim().is_empty() {
        return Err(bad_request("url is required"));
    }
    let delivery = state
        .engine
        .notifier()
        .send_adhoc(state.engine.store(), &body.url, &body.secret)
        .await;
    Ok(Json(serde_json::json!({"ok": true, "delivery": delivery})))
}
