//! `GET /docs` — a single static page describing the HTTP API surface.
//!
//! The teacher's equivalent route renders a multi-page documentation site;
//! the control plane's surface is small enough that one page covers it.

use std::sync::Arc;

use axum::response::Html;
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/docs", get(docs_page))
}

async fn docs_page() -> Html<&'static str> {
    Html(PAGE)
}

const PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Meridian API</title>
<style>
body { font-family: system-ui, sans-serif; max-width: 60rem; margin: 2rem auto; padding: 0 1rem; color: #1a1a1a; }
code { background: #f2f2f2; padding: 0.1rem 0.3rem; border-radius: 3px; }
table { border-collapse: collapse; width: 100%; margin: 1rem 0; }
th, td { text-align: left; border-bottom: 1px solid #ddd; padding: 0.4rem 0.6rem; }
th { color: #555; }
</style>
</head>
<body>
<h1>Meridian API</h1>
<p>Write routes require this node to hold the leader lease; a non-leader
responds <code>503</code> with <code>X-Meridian-Leader</code> set to the
current leader's <code>api_url</code> when known, or <code>CLUSTER_NOT_READY</code>
when no node currently holds a valid lease.</p>
<table>
<tr><th>Route</th><th>Description</th><th>Leader only</th></tr>
<tr><td>POST /apps/register</td><td>Register a new application</td><td>yes</td></tr>
<tr><td>POST /apps/{name}/up</td><td>Start the application</td><td>yes</td></tr>
<tr><td>POST /apps/{name}/down</td><td>Stop the application</td><td>yes</td></tr>
<tr><td>POST /apps/{name}/scale</td><td>Set replica count</td><td>yes</td></tr>
<tr><td>PUT /apps/{name}/scaling</td><td>Update the scaling policy</td><td>yes</td></tr>
<tr><td>DELETE /apps/{name}</td><td>Remove the application</td><td>yes</td></tr>
<tr><td>GET /apps</td><td>List applications</td><td>no</td></tr>
<tr><td>GET /apps/{name}</td><td>Application detail</td><td>no</td></tr>
<tr><td>GET /apps/{name}/metrics</td><td>Recent metric aggregates</td><td>no</td></tr>
<tr><td>GET /apps/{name}/events</td><td>Event log</td><td>no</td></tr>
<tr><td>GET /apps/{name}/logs</td><td>Event log (log view)</td><td>no</td></tr>
<tr><td>GET /apps/{name}/health</td><td>Instance health summary</td><td>no</td></tr>
<tr><td>POST /apps/{name}/health/check</td><td>Trigger an immediate probe</td><td>yes</td></tr>
<tr><td>GET /cluster/status</td><td>Nodes and lease snapshot</td><td>no</td></tr>
<tr><td>GET /cluster/leader</td><td>Current leader, if any</td><td>no</td></tr>
<tr><td>GET /cluster/health</td><td>Cluster-wide health summary</td><td>no</td></tr>
<tr><td>GET /health</td><td>This node's health</td><td>no</td></tr>
</table>
</body>
</html>"#;
