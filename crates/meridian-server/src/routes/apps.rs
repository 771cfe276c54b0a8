//! Application lifecycle routes: `/api/v1/apps/*`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use meridian_core::runtime::ContainerSpec;
use meridian_storage::model::{
    Application, AppStatus, Event, HealthStatus, InstanceStatus, MetricType, ScalingMode, ScalingPolicy,
};
use meridian_storage::{EventFilter, InstanceFilter};

use crate::error::ApiError;
use crate::state::AppState;

/// Routes that mutate cluster state; mounted behind the leader gate.
pub fn write_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register_app))
        .route("/{name}", delete(delete_app))
        .route("/{name}/up", post(up_app))
        .route("/{name}/down", post(down_app))
        .route("/{name}/scale", post(scale_app))
        .route("/{name}/scaling", put(update_scaling))
        .route("/{name}/health/check", post(trigger_health_check))
}

/// Observation routes, answerable by any node regardless of leadership.
pub fn read_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_apps))
        .route("/{name}", get(get_app))
        .route("/{name}/metrics", get(app_metrics))
        .route("/{name}/events", get(app_events))
        .route("/{name}/logs", get(app_logs))
        .route("/{name}/health", get(app_health))
}

// ── Request / response types ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterAppRequest {
    pub name: String,
    pub image: String,
    pub port: u16,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub mode: Option<ScalingMode>,
    #[serde(default)]
    pub scaling: Option<ScalingPolicyRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ScalingPolicyRequest {
    pub min_replicas: Option<u32>,
    pub max_replicas: Option<u32>,
    pub target_rps_per_replica: Option<f64>,
    pub max_p95_latency_ms: Option<f64>,
    pub max_cpu_percent: Option<f64>,
    pub max_memory_percent: Option<f64>,
    pub max_conn_per_replica: Option<f64>,
    pub scale_out_threshold_pct: Option<u8>,
    pub scale_in_threshold_pct: Option<u8>,
    pub evaluation_window_seconds: Option<u32>,
    pub cooldown_seconds: Option<u32>,
    pub stabilization_window_seconds: Option<u32>,
    pub max_scale_out_step: Option<u32>,
    pub max_scale_in_step: Option<u32>,
}

impl ScalingPolicyRequest {
    fn apply_to(self, mut policy: ScalingPolicy) -> ScalingPolicy {
        if let Some(v) = self.min_replicas {
            policy.min_replicas = v;
        }
        if let Some(v) = self.max_replicas {
            policy.max_replicas = v;
        }
        if let Some(v) = self.target_rps_per_replica {
            policy.target_rps_per_replica = v;
        }
        if let Some(v) = self.max_p95_latency_ms {
            policy.max_p95_latency_ms = v;
        }
        if let Some(v) = self.max_cpu_percent {
            policy.max_cpu_percent = v;
        }
        if let Some(v) = self.max_memory_percent {
            policy.max_memory_percent = v;
        }
        if let Some(v) = self.max_conn_per_replica {
            policy.max_conn_per_replica = v;
        }
        if let Some(v) = self.scale_out_threshold_pct {
            policy.scale_out_threshold_pct = v;
        }
        if let Some(v) = self.scale_in_threshold_pct {
            policy.scale_in_threshold_pct = v;
        }
        if let Some(v) = self.evaluation_window_seconds {
            policy.evaluation_window_seconds = v;
        }
        if let Some(v) = self.cooldown_seconds {
            policy.cooldown_seconds = v;
        }
        if let Some(v) = self.stabilization_window_seconds {
            policy.stabilization_window_seconds = v;
        }
        if let Some(v) = self.max_scale_out_step {
            policy.max_scale_out_step = v;
        }
        if let Some(v) = self.max_scale_in_step {
            policy.max_scale_in_step = v;
        }
        policy
    }
}

#[derive(Debug, Deserialize)]
pub struct UpRequest {
    pub replicas: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DownRequest {
    #[serde(default)]
    pub force: bool,
    pub timeout: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replicas: u32,
}

#[derive(Debug, Serialize)]
pub struct AppListResponse {
    pub apps: Vec<Application>,
}

#[derive(Debug, Serialize)]
pub struct AppHealthResponse {
    pub app_name: String,
    pub healthy_replicas: u32,
    pub total_replicas: u32,
    pub instances: Vec<InstanceHealth>,
}

#[derive(Debug, Serialize)]
pub struct InstanceHealth {
    pub container_id: String,
    pub status: InstanceStatus,
    pub health_status: HealthStatus,
    pub consecutive_failures: u32,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub metric: Option<MetricType>,
    pub window_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct MetricPointResponse {
    pub metric_type: MetricType,
    pub value: Option<f64>,
}

fn container_spec(app: &Application) -> Result<ContainerSpec, ApiError> {
    serde_json::from_value(app.spec.clone())
        .map_err(|err| ApiError::Internal(format!("stored app spec no longer deserializes: {err}")))
}

async fn load_app(state: &AppState, name: &str) -> Result<Application, ApiError> {
    state
        .store
        .get_application(name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("application '{name}' not found")))
}

/// Validate an application name as a DNS label (`spec.md` §3):
/// lowercase alphanumerics and hyphens, 1-63 characters, must not start or
/// end with a hyphen. Enforced here because the name is interpolated
/// directly into proxy config filenames.
fn validate_app_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.len() > 63 {
        return Err(ApiError::BadRequest(
            "app name must be between 1 and 63 characters".to_owned(),
        ));
    }

    let chars_ok = name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let edges_ok = !name.starts_with('-') && !name.ends_with('-');

    if !chars_ok || !edges_ok {
        return Err(ApiError::BadRequest(
            "app name must match ^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$".to_owned(),
        ));
    }
    Ok(())
}

// ── Handlers ───────────────────────────────────────────────────────────

async fn register_app(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterAppRequest>,
) -> Result<(StatusCode, Json<Application>), ApiError> {
    validate_app_name(&body.name)?;
    if state.store.get_application(&body.name).await?.is_some() {
        return Err(ApiError::Conflict(format!("application '{}' already registered", body.name)));
    }

    let spec = ContainerSpec {
        app_name: body.name.clone(),
        image: body.image,
        port: body.port,
        env: body.env,
        cpu_limit: body.cpu_limit,
        memory_limit_mb: body.memory_limit_mb,
    };
    let spec_json = serde_json::to_value(&spec)
        .map_err(|err| ApiError::Internal(format!("failed to encode app spec: {err}")))?;

    let now = Utc::now();
    let app = Application {
        name: body.name.clone(),
        spec: spec_json,
        status: AppStatus::Registered,
        desired_replicas: body.replicas.unwrap_or(1),
        current_replicas: 0,
        mode: body.mode.unwrap_or(ScalingMode::Auto),
        created_at: now,
        updated_at: now,
        last_scaled_at: None,
    };
    state.store.upsert_application(&app).await?;

    let policy = body
        .scaling
        .map(|req| req.apply_to(ScalingPolicy::default_for(&app.name)))
        .unwrap_or_else(|| ScalingPolicy::default_for(&app.name));
    state.store.upsert_scaling_policy(&policy).await?;

    meridian_core::events::emit_simple(
        &state.store,
        Some(&app.name),
        "app_registered",
        meridian_storage::model::Severity::Info,
        format!("application '{}' registered", app.name),
    )
    .await;

    Ok((StatusCode::CREATED, Json(app)))
}

async fn list_apps(State(state): State<Arc<AppState>>) -> Result<Json<AppListResponse>, ApiError> {
    Ok(Json(AppListResponse { apps: state.store.list_applications().await? }))
}

async fn get_app(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Application>, ApiError> {
    Ok(Json(load_app(&state, &name).await?))
}

async fn delete_app(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    load_app(&state, &name).await?;
    state.reconciler.scale_in(&name, u32::MAX, 0).await.ok();
    state.store.delete_application(&name).await?;

    if let Ok(remaining) = state.store.list_applications().await {
        let known: std::collections::HashSet<String> = remaining.into_iter().map(|a| a.name).collect();
        if let Err(err) = state.proxy.remove_orphans(&known).await {
            tracing::warn!(error = %err, app = %name, "failed to remove proxy config for deleted app");
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

/// `up`: idempotent — a running app is left untouched, per the idempotent
/// up/down invariant.
async fn up_app(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<UpRequest>>,
) -> Result<Json<Application>, ApiError> {
    let mut app = load_app(&state, &name).await?;
    if app.status == AppStatus::Running {
        return Ok(Json(app));
    }

    let target = body.and_then(|b| b.replicas).unwrap_or(app.desired_replicas).max(1);
    let spec = container_spec(&app)?;

    app.status = AppStatus::Starting;
    app.desired_replicas = target;
    app.updated_at = Utc::now();
    state.store.upsert_application(&app).await?;

    state.reconciler.scale_out(&name, &spec, target).await?;

    app.status = AppStatus::Running;
    app.current_replicas = target;
    app.updated_at = Utc::now();
    state.store.upsert_application(&app).await?;

    meridian_core::events::emit_simple(
        &state.store,
        Some(&name),
        "app_started",
        meridian_storage::model::Severity::Info,
        format!("application '{name}' brought up with {target} replicas"),
    )
    .await;

    Ok(Json(app))
}

/// `down`: idempotent — a stopped app is a no-op.
async fn down_app(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<DownRequest>>,
) -> Result<Json<Application>, ApiError> {
    let mut app = load_app(&state, &name).await?;
    if app.status == AppStatus::Stopped {
        return Ok(Json(app));
    }

    let Json(DownRequest { force, timeout }) = body.unwrap_or(Json(DownRequest { force: false, timeout: None }));
    let drain_seconds = if force { 0 } else { timeout.unwrap_or(10) };

    app.status = AppStatus::Stopping;
    app.updated_at = Utc::now();
    state.store.upsert_application(&app).await?;

    state.reconciler.scale_in(&name, app.current_replicas, drain_seconds).await?;

    app.status = AppStatus::Stopped;
    app.current_replicas = 0;
    app.updated_at = Utc::now();
    state.store.upsert_application(&app).await?;

    meridian_core::events::emit_simple(
        &state.store,
        Some(&name),
        "app_stopped",
        meridian_storage::model::Severity::Info,
        format!("application '{name}' stopped"),
    )
    .await;

    Ok(Json(app))
}

async fn scale_app(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<ScaleRequest>,
) -> Result<Json<Application>, ApiError> {
    let mut app = load_app(&state, &name).await?;
    let spec = container_spec(&app)?;

    let current = app.current_replicas;
    if body.replicas > current {
        state.reconciler.scale_out(&name, &spec, body.replicas - current).await?;
    } else if body.replicas < current {
        state.reconciler.scale_in(&name, current - body.replicas, 10).await?;
    }

    app.desired_replicas = body.replicas;
    app.current_replicas = body.replicas;
    app.last_scaled_at = Some(Utc::now());
    app.updated_at = Utc::now();
    state.store.upsert_application(&app).await?;

    Ok(Json(app))
}

async fn update_scaling(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<ScalingPolicyRequest>,
) -> Result<Json<ScalingPolicy>, ApiError> {
    load_app(&state, &name).await?;
    let existing = state
        .store
        .get_scaling_policy(&name)
        .await?
        .unwrap_or_else(|| ScalingPolicy::default_for(&name));
    let updated = body.apply_to(existing);
    state.store.upsert_scaling_policy(&updated).await?;
    Ok(Json(updated))
}

async fn app_metrics(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Vec<MetricPointResponse>>, ApiError> {
    load_app(&state, &name).await?;
    let window = std::time::Duration::from_secs(query.window_seconds.unwrap_or(60));
    let now = Utc::now();

    let types = query.metric.map_or_else(
        || {
            vec![
                MetricType::CpuPercent,
                MetricType::MemoryPercent,
                MetricType::Rps,
                MetricType::P95LatencyMs,
                MetricType::Connections,
            ]
        },
        |m| vec![m],
    );

    let mut points = Vec::with_capacity(types.len());
    for metric_type in types {
        let value = state.metrics.aggregate(&name, metric_type, window, now, true).await;
        points.push(MetricPointResponse { metric_type, value });
    }
    Ok(Json(points))
}

async fn app_events(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Event>>, ApiError> {
    load_app(&state, &name).await?;
    let events = state
        .store
        .list_events(&EventFilter { app_name: Some(name), since: None, limit: Some(200) })
        .await?;
    Ok(Json(events))
}

/// Application logs are not a modeled entity of their own; the event log is
/// the closest available record of what happened to an app's instances.
async fn app_logs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Event>>, ApiError> {
    app_events(State(state), Path(name)).await
}

async fn app_health(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<AppHealthResponse>, ApiError> {
    load_app(&state, &name).await?;
    let instances = state
        .store
        .list_instances(&InstanceFilter { app_name: Some(name.clone()), status: None })
        .await?;

    let healthy_replicas = instances.iter().filter(|i| i.is_routable()).count() as u32;
    let total_replicas = instances.len() as u32;
    let instances = instances
        .into_iter()
        .map(|i| InstanceHealth {
            container_id: i.container_id,
            status: i.status,
            health_status: i.health_status,
            consecutive_failures: i.consecutive_failures,
        })
        .collect();

    Ok(Json(AppHealthResponse { app_name: name, healthy_replicas, total_replicas, instances }))
}

async fn trigger_health_check(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let instances = state
        .store
        .list_instances(&InstanceFilter { app_name: Some(name.clone()), status: Some(InstanceStatus::Running) })
        .await?;

    for instance in instances {
        let config = meridian_core::health::HealthCheckConfig::default();
        let outcome = meridian_core::health::probe_instance(&instance.ip, instance.port, &config).await;
        if !outcome.is_success() {
            meridian_core::events::emit_simple(
                &state.store,
                Some(&name),
                "manual_health_check_failed",
                meridian_storage::model::Severity::Warning,
                format!("manual probe failed for {}", instance.container_id),
            )
            .await;
        }
    }

    Ok(StatusCode::ACCEPTED)
}
