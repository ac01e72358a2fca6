//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{delete, get, patch, post},
};
use scanloop_core::error::Result;
use scanloop_scheduler::AutomationEngine;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AutomationEngine>,
    pub start_time: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(super::routes::health_check))
        .route("/api/v1/info", get(super::routes::system_info))
        // Tasks
        .route("/api/v1/tasks", get(super::routes::list_tasks))
        .route("/api/v1/tasks", post(super::routes::create_task))
        .route("/api/v1/tasks/{id}", get(super::routes::get_task))
        .route("/api/v1/tasks/{id}", patch(super::routes::patch_task))
        .route("/api/v1/tasks/{id}/trigger", post(super::routes::trigger_task))
        // Scheduler heartbeat surface
        .route("/api/v1/scheduler/dispatch", post(super::routes::dispatch_due))
        .route("/api/v1/scheduler/process", post(super::routes::process_queue))
        // Webhooks
        .route("/api/v1/webhooks", get(super::routes::list_subscriptions))
        .route("/api/v1/webhooks", post(super::routes::create_subscription))
        .route("/api/v1/webhooks/test", post(super::routes::adhoc_test_delivery))
        .route("/api/v1/webhooks/{id}", delete(super::routes::delete_subscription))
        .route("/api/v1/webhooks/{id}/deliveries", get(super::routes::list_subscription_deliveries))
        .route("/api/v1/webhooks/{id}/test", post(super::routes::test_delivery))
        .route("/api/v1/deliveries", get(super::routes::list_deliveries))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared)
}

/// Bind and serve until the process exits.
pub async fn serve(engine: Arc<AutomationEngine>, host: &str, port: u16) -> Result<()> {
    let state = AppState { engine, start_time: std::time::Instant::now() };
    let router = build_router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("gateway listening on http://{addr}");
    axum::serve(listener, router).await?;
    Ok(())
}
