//! Leader-gate middleware for the Meridian API facade.
//!
//! Wraps every write route: if this node does not hold the leader lease the
//! request is rejected with 503 and, when known, the current leader's
//! `api_url` in `X-Meridian-Leader` — the front proxy retries on 503 and
//! lands on the leader transparently. If no node currently holds a valid
//! lease the response carries the distinct `CLUSTER_NOT_READY` code instead.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

/// Reject non-leader requests before they reach a write handler.
pub async fn leader_gate(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if state.coordinator.is_leader().await {
        return next.run(req).await;
    }

    match state.coordinator.known_leader_api_url().await {
        Some(api_url) => ApiError::NotLeader { known_leader_api_url: Some(api_url) }.into_response(),
        None => ApiError::ClusterNotReady.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::middleware::from_fn_with_state;
    use axum::routing::post;
    use axum::Router;
    use meridian_core::runtime::MockRuntimeAdapter;
    use meridian_core::{Autoscaler, Coordinator, CoordinatorConfig, HealthSupervisor, MetricsAggregator, ProxyManager, Reconciler};
    use meridian_storage::{MemoryStore, StoreGateway};
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn test_state(coordinator_config: CoordinatorConfig) -> Arc<AppState> {
        let store: Arc<dyn StoreGateway> = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntimeAdapter::new());
        let metrics = Arc::new(MetricsAggregator::default());
        let (_tx, rx) = watch::channel(false);
        let proxy = Arc::new(ProxyManager::new("/tmp", "true"));
        Arc::new(AppState {
            coordinator: Coordinator::new("n1", "h1", "http://n1", store.clone(), coordinator_config),
            health: Arc::new(HealthSupervisor::new(store.clone(), 8, rx)),
            autoscaler: Arc::new(Autoscaler::new(metrics.clone())),
            metrics,
            reconciler: Arc::new(Reconciler::new(store.clone(), runtime.clone(), proxy.clone())),
            proxy,
            runtime,
            store,
        })
    }

    fn write_app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/write", post(|| async { StatusCode::OK }))
            .route_layer(from_fn_with_state(state.clone(), leader_gate))
            .with_state(state)
    }

    #[tokio::test]
    async fn non_leader_gets_503_with_cluster_not_ready() {
        let state = test_state(CoordinatorConfig::default());
        let app = write_app(state);

        let response = app
            .oneshot(axum::http::Request::builder().method("POST").uri("/write").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn leader_passes_through() {
        let config = CoordinatorConfig {
            election_tick: std::time::Duration::from_millis(5),
            ..CoordinatorConfig::default()
        };
        let state = test_state(config);
        let _handles = state.coordinator.spawn();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(state.coordinator.is_leader().await);

        let app = write_app(state);
        let response = app
            .oneshot(axum::http::Request::builder().method("POST").uri("/write").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
