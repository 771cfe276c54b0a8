//! Cluster observation routes: `/api/v1/cluster/*`.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use meridian_storage::model::{ClusterNode, LeaderLease};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(cluster_status))
        .route("/leader", get(cluster_leader))
        .route("/health", get(cluster_health))
}

#[derive(Debug, Serialize)]
pub struct ClusterStatusResponse {
    pub nodes: Vec<ClusterNode>,
    pub lease: Option<LeaderLease>,
}

#[derive(Debug, Serialize)]
pub struct ClusterLeaderResponse {
    pub leader_id: Option<String>,
    pub api_url: Option<String>,
    pub term: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ClusterHealthResponse {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub has_leader: bool,
}

async fn cluster_status(State(state): State<Arc<AppState>>) -> Result<Json<ClusterStatusResponse>, ApiError> {
    let nodes = state.store.list_nodes().await?;
    let lease = state.store.read_lease().await?;
    Ok(Json(ClusterStatusResponse { nodes, lease }))
}

async fn cluster_leader(State(state): State<Arc<AppState>>) -> Result<Json<ClusterLeaderResponse>, ApiError> {
    let lease = state.store.read_lease().await?;
    let now = chrono::Utc::now();
    let valid = lease.as_ref().filter(|l| l.is_valid_at(now));
    Ok(Json(ClusterLeaderResponse {
        leader_id: valid.map(|l| l.leader_id.clone()),
        api_url: valid.map(|l| l.api_url.clone()),
        term: valid.map(|l| l.term),
    }))
}

async fn cluster_health(State(state): State<Arc<AppState>>) -> Result<Json<ClusterHealthResponse>, ApiError> {
    let nodes = state.store.list_nodes().await?;
    let lease = state.store.read_lease().await?;
    let now = chrono::Utc::now();
    Ok(Json(ClusterHealthResponse {
        total_nodes: nodes.len(),
        healthy_nodes: nodes.iter().filter(|n| n.is_healthy).count(),
        has_leader: lease.is_some_and(|l| l.is_valid_at(now)),
    }))
}
