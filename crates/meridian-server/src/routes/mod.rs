//! HTTP route assembly for the Meridian API facade.

pub mod apps;
pub mod cluster;
pub mod docs;
pub mod health;

use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::middleware::leader_gate;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct ApiIndex {
    name: &'static str,
    docs: &'static str,
}

async fn api_index() -> Json<ApiIndex> {
    Json(ApiIndex { name: "meridian", docs: "/docs" })
}

/// Assemble the full router: reads and `/health`/`/cluster`/`/docs` are open
/// to any node, writes under `/api/v1/apps/*` are wrapped in [`leader_gate`]
/// so a follower bounces the request back to the current leader.
pub fn build(state: Arc<AppState>) -> Router {
    let gated_apps = apps::write_router().route_layer(from_fn_with_state(state.clone(), leader_gate));
    let apps_router = apps::read_router().merge(gated_apps);

    Router::new()
        .route("/", get(api_index))
        .merge(health::router())
        .merge(docs::router())
        .nest("/cluster", cluster::router())
        .nest("/api/v1/apps", apps_router)
        .with_state(state)
}
