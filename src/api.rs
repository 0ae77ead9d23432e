//! Admin and health HTTP server
//!
//! Operator surface over the running bot: health summary, breaker and DLQ
//! inspection, corrective actions, and bot start/stop. Every corrective
//! endpoint is idempotent so supervision scripts can fire them blindly.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::error::GambitError;
use crate::events::EventBus;
use crate::health::HealthMonitor;
use crate::pipeline::PipelineOrchestrator;
use crate::resilience::{BreakerRegistry, DeadLetterQueue, DlqScheduler};

/// Shared handles behind the admin router
#[derive(Clone)]
pub struct AdminState {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub breakers: Arc<BreakerRegistry>,
    pub dlq: Arc<DeadLetterQueue>,
    pub dlq_scheduler: Arc<DlqScheduler>,
    pub health: Arc<HealthMonitor>,
    pub events: Arc<EventBus>,
}

pub fn create_router(state: AdminState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_summary))
        .route("/breakers", get(list_breakers))
        .route("/breakers/reset", post(reset_breakers))
        .route("/dlq", get(list_dlq))
        .route("/dlq/stats", get(dlq_stats))
        .route("/dlq/clear", post(clear_dlq))
        .route("/dlq/:id", delete(remove_dlq_item))
        .route("/dlq/:id/replay", post(replay_dlq_item))
        .route("/alerts", get(list_alerts))
        .route("/alerts/clear", post(clear_alerts))
        .route("/events", get(recent_events))
        .route("/bot/start", post(start_bot))
        .route("/bot/stop", post(stop_bot))
        .route("/bot/status", get(bot_status))
        .layer(cors)
        .with_state(state)
}

/// Serve the admin router until the process exits
pub async fn serve(state: AdminState, port: u16) -> crate::error::Result<()> {
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("admin server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| GambitError::Internal(format!("admin server error: {}", e)))?;
    Ok(())
}

async fn health_summary(State(state): State<AdminState>) -> impl IntoResponse {
    let system = state.health.system_health().await;
    let services = state.health.service_statuses().await;
    let breakers = state.breakers.system_health().await;

    Json(json!({
        "system": system,
        "services": services,
        "breakers": breakers,
    }))
}

async fn list_breakers(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.breakers.all_stats().await)
}

async fn reset_breakers(State(state): State<AdminState>) -> impl IntoResponse {
    state.breakers.reset_all().await;
    Json(json!({ "reset": true }))
}

async fn list_dlq(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.dlq.items().await)
}

async fn dlq_stats(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.dlq.stats().await)
}

async fn clear_dlq(State(state): State<AdminState>) -> impl IntoResponse {
    state.dlq.clear().await;
    Json(json!({ "cleared": true }))
}

async fn remove_dlq_item(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let removed = state.dlq.remove(id).await;
    Json(json!({ "removed": removed }))
}

async fn replay_dlq_item(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.dlq_scheduler.replay_now(id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "replayed": true }))),
        Err(GambitError::NotFound(msg)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": msg })))
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn list_alerts(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.health.alerts().recent().await)
}

async fn clear_alerts(State(state): State<AdminState>) -> impl IntoResponse {
    state.health.alerts().clear().await;
    Json(json!({ "cleared": true }))
}

async fn recent_events(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.events.recent().await)
}

async fn start_bot(State(state): State<AdminState>) -> impl IntoResponse {
    match state.orchestrator.start() {
        Ok(()) => (StatusCode::OK, Json(json!({ "running": true }))),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn stop_bot(State(state): State<AdminState>) -> impl IntoResponse {
    state.orchestrator.stop().await;
    Json(json!({ "running": false }))
}

async fn bot_status(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.orchestrator.status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{SimAdvisor, SimBrokerage};
    use crate::config::PipelineConfig;
    use crate::health::AlertHub;
    use crate::persistence::MemoryStore;
    use crate::resilience::{
        CircuitBreakerConfig, DeadLetterItem, DlqSchedulerConfig, ReplayHandler, Retrier,
    };
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    struct NoopReplay;

    #[async_trait::async_trait]
    impl ReplayHandler for NoopReplay {
        async fn replay(&self, _item: &DeadLetterItem) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct FailingReplay;

    #[async_trait::async_trait]
    impl ReplayHandler for FailingReplay {
        async fn replay(&self, _item: &DeadLetterItem) -> crate::error::Result<()> {
            Err(GambitError::Internal("no replay route".into()))
        }
    }

    fn admin_state() -> AdminState {
        admin_state_with(Arc::new(NoopReplay))
    }

    fn admin_state_with(handler: Arc<dyn ReplayHandler>) -> AdminState {
        let breakers = Arc::new(BreakerRegistry::uniform(CircuitBreakerConfig::default()));
        let dlq = Arc::new(DeadLetterQueue::new(100));
        let dlq_scheduler = Arc::new(DlqScheduler::new(
            dlq.clone(),
            handler,
            DlqSchedulerConfig::default(),
        ));
        let events = Arc::new(EventBus::with_defaults());
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            PipelineConfig::default(),
            Arc::new(SimBrokerage),
            Arc::new(SimAdvisor),
            Arc::new(MemoryStore::new()),
            breakers.clone(),
            Arc::new(Retrier::new()),
            events.clone(),
        ));

        AdminState {
            orchestrator,
            breakers,
            dlq,
            dlq_scheduler,
            health: Arc::new(HealthMonitor::new(Arc::new(AlertHub::new(100)))),
            events,
        }
    }

    async fn send(router: Router, method: &str, path: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(path)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_breakers() {
        let state = admin_state();
        state.breakers.breaker("brokerage");

        let (status, body) = send(create_router(state), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["breakers"]["total_breakers"], 1);
        assert_eq!(body["breakers"]["healthy"], true);
    }

    #[tokio::test]
    async fn test_bot_start_stop_lifecycle() {
        let state = admin_state();
        let router = create_router(state);

        let (status, body) = send(router.clone(), "POST", "/bot/start").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], true);

        // Second start conflicts
        let (status, _) = send(router.clone(), "POST", "/bot/start").await;
        assert_eq!(status, StatusCode::CONFLICT);

        // Stop is idempotent
        let (status, _) = send(router.clone(), "POST", "/bot/stop").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(router.clone(), "POST", "/bot/stop").await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(router, "GET", "/bot/status").await;
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn test_dlq_endpoints() {
        let state = admin_state();
        let item = DeadLetterItem::new("scan_markets", json!({}), "down", 5, None);
        let id = item.id;
        state.dlq.push(item).await;
        let router = create_router(state);

        let (status, body) = send(router.clone(), "GET", "/dlq").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = send(router.clone(), "GET", "/dlq/stats").await;
        assert_eq!(body["len"], 1);

        // Operator replay succeeds and drains the queue
        let (status, _) = send(router.clone(), "POST", &format!("/dlq/{}/replay", id)).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(router.clone(), "GET", "/dlq/stats").await;
        assert_eq!(body["len"], 0);

        // Replaying a missing item is a 404; delete stays idempotent
        let (status, _) = send(router.clone(), "POST", &format!("/dlq/{}/replay", id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = send(router, "DELETE", &format!("/dlq/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], false);
    }

    #[tokio::test]
    async fn test_failed_replay_is_bad_gateway_not_missing() {
        let state = admin_state_with(Arc::new(FailingReplay));
        let item = DeadLetterItem::new("place_order", json!({}), "down", 2, None);
        let id = item.id;
        state.dlq.push(item).await;
        let router = create_router(state);

        // The item exists, so a handler failure is upstream trouble
        let (status, _) = send(router.clone(), "POST", &format!("/dlq/{}/replay", id)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, _) = send(router, "POST", &format!("/dlq/{}/replay", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_breaker_reset_idempotent() {
        let state = admin_state();
        state.breakers.breaker("advisor");
        let router = create_router(state);

        let (status, _) = send(router.clone(), "POST", "/breakers/reset").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(router, "POST", "/breakers/reset").await;
        assert_eq!(status, StatusCode::OK);
    }
}
