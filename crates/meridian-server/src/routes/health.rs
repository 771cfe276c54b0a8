//! Node-level `GET /health`, outside the leader gate — every node answers
//! this for itself regardless of leadership, the way a load balancer health
//! check expects.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use meridian_storage::model::NodeState;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(node_health))
}

#[derive(Debug, Serialize)]
pub struct NodeHealthResponse {
    pub node_id: String,
    pub state: NodeState,
    pub term: i64,
}

async fn node_health(State(state): State<Arc<AppState>>) -> Json<NodeHealthResponse> {
    Json(NodeHealthResponse {
        node_id: state.coordinator.node_id().to_owned(),
        state: state.coordinator.state().await,
        term: state.coordinator.current_term(),
    })
}
