//! Meridian server entry point.
//!
//! Bootstraps the store gateway and core subsystems, starts the Axum HTTP
//! server with graceful shutdown, and runs the Cluster Coordinator's loops
//! alongside a reconcile loop, a retention cleanup worker, a health
//! supervisor, and a metrics collector.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use meridian_core::runtime::LocalRuntimeAdapter;
use meridian_core::{Autoscaler, Coordinator, CoordinatorConfig, HealthSupervisor, MetricsAggregator, ProxyManager, Reconciler};
use meridian_storage::{PostgresStore, StoreGateway};

use meridian_server::config::ServerConfig;
use meridian_server::routes;
use meridian_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(node_id = %config.node_id, "Meridian starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = build_app_state(&config, shutdown_rx.clone()).await?;

    let coordinator_handles = state.coordinator.spawn();

    let reconcile_handle = {
        let state = Arc::clone(&state);
        let interval = config.reconcile_interval;
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move { reconcile_loop(state, interval, &mut rx).await })
    };

    let retention_handle = {
        let store = Arc::clone(&state.store);
        let interval = config.retention_scan_interval;
        let event_days = config.event_retention_days;
        let metric_days = config.metric_retention_days;
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            retention_worker(store, interval, event_days, metric_days, &mut rx).await;
        })
    };

    let health_supervisor_handle = {
        let state = Arc::clone(&state);
        let interval = config.health_scan_interval;
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move { health_supervisor_loop(state, interval, &mut rx).await })
    };

    let metrics_collector_handle = {
        let state = Arc::clone(&state);
        let interval = config.metrics_scan_interval;
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move { metrics_collector_loop(state, interval, &mut rx).await })
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::PUT, axum::http::Method::DELETE])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let app = routes::build(Arc::clone(&state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "Meridian server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    state.coordinator.shutdown().await;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), reconcile_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), retention_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), health_supervisor_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), metrics_collector_handle).await;
    for handle in coordinator_handles {
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    info!("Meridian server stopped");
    Ok(())
}

async fn build_app_state(config: &ServerConfig, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Arc<AppState>> {
    let store: Arc<dyn StoreGateway> = Arc::new(
        PostgresStore::connect(&config.database_url, config.database_replica_url.as_deref())
            .await
            .context("failed to connect to the control-plane database")?,
    );

    let coordinator = Coordinator::new(
        config.node_id.clone(),
        config.hostname.clone(),
        config.api_url.clone(),
        Arc::clone(&store),
        CoordinatorConfig {
            lease_ttl: config.coordinator.lease_ttl,
            heartbeat_interval: config.coordinator.heartbeat_interval,
            election_tick: config.coordinator.election_tick,
            cluster_monitor_interval: config.coordinator.cluster_monitor_interval,
            stale_node_timeout: config.coordinator.stale_node_timeout,
        },
    );

    let runtime = Arc::new(LocalRuntimeAdapter::new(
        config.runtime_binary.clone(),
        config.runtime_network.clone(),
    ));
    let metrics = Arc::new(MetricsAggregator::default());
    let proxy = Arc::new(ProxyManager::new(config.proxy_config_dir.clone(), config.proxy_binary.clone()));
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&store), runtime.clone(), Arc::clone(&proxy)));

    Ok(Arc::new(AppState {
        health: Arc::new(HealthSupervisor::new(Arc::clone(&store), config.health_probe_concurrency, shutdown_rx)),
        autoscaler: Arc::new(Autoscaler::new(Arc::clone(&metrics))),
        proxy,
        metrics,
        reconciler,
        runtime,
        coordinator,
        store,
    }))
}

/// Evaluate every `auto`-mode application on a fixed tick, recording the
/// `scaling_decision` event and reconciling replica count toward the
/// decision's target. Only the leader acts; followers observe the same
/// metrics but must not mutate instance state out from under the leader.
async fn reconcile_loop(state: Arc<AppState>, interval: Duration, shutdown: &mut watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(interval);
    info!(interval_secs = interval.as_secs(), "reconcile loop started");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if !state.coordinator.is_leader().await {
                    continue;
                }
                if let Err(err) = reconcile_once(&state).await {
                    warn!(error = %err, "reconcile tick failed");
                }
            }
            _ = shutdown.changed() => {
                info!("reconcile loop shutting down");
                return;
            }
        }
    }
}

async fn reconcile_once(state: &Arc<AppState>) -> anyhow::Result<()> {
    use meridian_storage::model::{AppStatus, ScalingMode};

    let apps = state.store.list_applications().await?;
    let now = chrono::Utc::now();

    let known_apps: std::collections::HashSet<String> = apps.iter().map(|a| a.name.clone()).collect();
    if let Err(err) = state.proxy.remove_orphans(&known_apps).await {
        warn!(error = %err, "failed to sweep orphaned proxy configs");
    }

    for app in apps.into_iter().filter(|a| a.status == AppStatus::Running && a.mode == ScalingMode::Auto) {
        let Some(policy) = state.store.get_scaling_policy(&app.name).await? else {
            continue;
        };
        let instances = state
            .store
            .list_instances(&meridian_storage::InstanceFilter { app_name: Some(app.name.clone()), status: None })
            .await?;
        let healthy = instances.iter().filter(|i| i.is_routable()).count() as u32;

        let decision = state.autoscaler.evaluate(&app, &policy, healthy, now).await;
        state.autoscaler.emit_decision(&state.store, &app.name, &decision).await;

        if decision.to_replicas == decision.from_replicas {
            continue;
        }

        let spec: meridian_core::runtime::ContainerSpec = match serde_json::from_value(app.spec.clone()) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(app = %app.name, error = %err, "stored app spec no longer deserializes, skipping");
                continue;
            }
        };

        if decision.to_replicas > decision.from_replicas {
            let _ = state
                .reconciler
                .scale_out(&app.name, &spec, decision.to_replicas - decision.from_replicas)
                .await;
        } else {
            let _ = state
                .reconciler
                .scale_in(&app.name, decision.from_replicas - decision.to_replicas, policy.stabilization_window_seconds.min(30))
                .await;
        }

        let mut updated = app;
        updated.current_replicas = decision.to_replicas;
        updated.desired_replicas = decision.to_replicas;
        updated.last_scaled_at = Some(now);
        updated.updated_at = now;
        let _ = state.store.upsert_application(&updated).await;
    }

    Ok(())
}

/// Supervises one [`meridian_core::HealthSupervisor::run_instance_loop`] task
/// per currently running instance, per `spec.md` §5's "one logical task per
/// instance" requirement. Rescans on a fixed tick, spawning probe loops for
/// instances that appeared since the last scan and aborting the ones for
/// instances that disappeared; each spawned loop exits on its own once the
/// supervisor's shared shutdown signal fires.
async fn health_supervisor_loop(state: Arc<AppState>, interval: Duration, shutdown: &mut watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(interval);
    let mut tasks: std::collections::HashMap<String, tokio::task::JoinHandle<()>> = std::collections::HashMap::new();
    info!(interval_secs = interval.as_secs(), "health supervisor loop started");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(err) = scan_instances_for_health(&state, &mut tasks).await {
                    warn!(error = %err, "health supervisor scan failed");
                }
            }
            _ = shutdown.changed() => {
                info!("health supervisor loop shutting down");
                for (_, handle) in tasks.drain() {
                    handle.abort();
                }
                return;
            }
        }
    }
}

async fn scan_instances_for_health(
    state: &Arc<AppState>,
    tasks: &mut std::collections::HashMap<String, tokio::task::JoinHandle<()>>,
) -> anyhow::Result<()> {
    use meridian_storage::model::InstanceStatus;

    let instances = state.store.list_instances(&meridian_storage::InstanceFilter::default()).await?;
    let running: std::collections::HashSet<String> = instances
        .iter()
        .filter(|i| matches!(i.status, InstanceStatus::Starting | InstanceStatus::Running))
        .map(|i| i.container_id.clone())
        .collect();

    tasks.retain(|container_id, handle| {
        if running.contains(container_id) {
            true
        } else {
            handle.abort();
            false
        }
    });

    for instance in instances {
        if !running.contains(&instance.container_id) || tasks.contains_key(&instance.container_id) {
            continue;
        }
        let health = Arc::clone(&state.health);
        let container_id = instance.container_id.clone();
        let app_name = instance.app_name.clone();
        let ip = instance.ip.clone();
        let port = instance.port;
        let handle = tokio::spawn(async move {
            health
                .run_instance_loop(&container_id, &app_name, &ip, port, &meridian_core::health::HealthCheckConfig::default())
                .await;
        });
        tasks.insert(instance.container_id, handle);
    }
    Ok(())
}

/// Supervises one app-metrics-collector task per currently running
/// application, per `spec.md` §5's "one collector per app on a fixed tick"
/// requirement.
async fn metrics_collector_loop(state: Arc<AppState>, interval: Duration, shutdown: &mut watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(interval);
    let mut tasks: std::collections::HashMap<String, tokio::task::JoinHandle<()>> = std::collections::HashMap::new();
    info!(interval_secs = interval.as_secs(), "metrics collector loop started");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(err) = scan_apps_for_metrics(&state, interval, &mut tasks).await {
                    warn!(error = %err, "metrics collector scan failed");
                }
            }
            _ = shutdown.changed() => {
                info!("metrics collector loop shutting down");
                for (_, handle) in tasks.drain() {
                    handle.abort();
                }
                return;
            }
        }
    }
}

async fn scan_apps_for_metrics(
    state: &Arc<AppState>,
    interval: Duration,
    tasks: &mut std::collections::HashMap<String, tokio::task::JoinHandle<()>>,
) -> anyhow::Result<()> {
    use meridian_storage::model::AppStatus;

    let apps = state.store.list_applications().await?;
    let running: std::collections::HashSet<String> = apps
        .iter()
        .filter(|a| a.status == AppStatus::Running)
        .map(|a| a.name.clone())
        .collect();

    tasks.retain(|app_name, handle| {
        if running.contains(app_name) {
            true
        } else {
            handle.abort();
            false
        }
    });

    for app_name in running {
        if tasks.contains_key(&app_name) {
            continue;
        }
        let state = Arc::clone(state);
        let name = app_name.clone();
        let handle = tokio::spawn(async move { app_metrics_collector_loop(state, name, interval).await });
        tasks.insert(app_name, handle);
    }
    Ok(())
}

/// One app's metrics collector: pulls runtime stats for every running
/// instance on a fixed tick and feeds the averages into the Metrics
/// Aggregator. Aborted externally by `metrics_collector_loop` once the app
/// stops running, so it does not need its own shutdown handling.
async fn app_metrics_collector_loop(state: Arc<AppState>, app_name: String, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tick.tick().await;
        if let Err(err) = collect_app_metrics(&state, &app_name).await {
            warn!(app = %app_name, error = %err, "metrics collection tick failed");
        }
    }
}

/// Pulls `cpu_percent`/`memory_percent` from the Runtime Adapter for every
/// running instance of `app_name` and records their averages, plus the
/// count of routable (healthy) replicas. The Runtime Adapter contract
/// exposes no RPS/latency/connection data, so those signals are left
/// unrecorded rather than fabricated; the Autoscaler simply treats them as
/// undefined until a runtime adapter that reports them exists.
async fn collect_app_metrics(state: &Arc<AppState>, app_name: &str) -> anyhow::Result<()> {
    use meridian_storage::model::{InstanceStatus, MetricType};

    let instances = state
        .store
        .list_instances(&meridian_storage::InstanceFilter {
            app_name: Some(app_name.to_owned()),
            status: None,
        })
        .await?;

    let mut cpu_samples = Vec::new();
    let mut memory_samples = Vec::new();
    for instance in instances.iter().filter(|i| i.status == InstanceStatus::Running) {
        match state.runtime.stats(&instance.container_id).await {
            Ok(stats) => {
                cpu_samples.push(stats.cpu_percent);
                memory_samples.push(stats.memory_percent);
            }
            Err(err) => {
                warn!(app = %app_name, container_id = %instance.container_id, error = %err, "failed to collect container stats");
            }
        }
    }

    let now = chrono::Utc::now();
    if !cpu_samples.is_empty() {
        let avg = cpu_samples.iter().sum::<f64>() / cpu_samples.len() as f64;
        state.metrics.record(app_name, MetricType::CpuPercent, avg, now).await;
    }
    if !memory_samples.is_empty() {
        let avg = memory_samples.iter().sum::<f64>() / memory_samples.len() as f64;
        state.metrics.record(app_name, MetricType::MemoryPercent, avg, now).await;
    }

    let healthy = instances.iter().filter(|i| i.is_routable()).count() as f64;
    state.metrics.record(app_name, MetricType::HealthyReplicas, healthy, now).await;

    Ok(())
}

/// Maximum retries per tick when the store is unreachable.
const RETENTION_MAX_RETRIES: u32 = 3;

/// Prunes event and metric rows past their retention horizon on a fixed
/// tick, retrying transient store failures with exponential backoff (1s,
/// 2s, 4s) and escalating log severity past five consecutive failed ticks.
async fn retention_worker(
    store: Arc<dyn StoreGateway>,
    interval: Duration,
    event_retention_days: i64,
    metric_retention_days: i64,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    let mut consecutive_failures: u32 = 0;
    info!(interval_secs = interval.as_secs(), "retention worker started");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = chrono::Utc::now();
                let event_cutoff = now - chrono::Duration::days(event_retention_days);
                let metric_cutoff = now - chrono::Duration::days(metric_retention_days);

                match retry_prune(&store, event_cutoff, metric_cutoff, shutdown).await {
                    Ok(None) => {
                        info!("retention worker shutting down");
                        return;
                    }
                    Ok(Some((events, metrics))) => {
                        consecutive_failures = 0;
                        info!(events, metrics, "retention tick complete");
                    }
                    Err(last_err) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        if consecutive_failures >= 5 {
                            tracing::error!(
                                error = %last_err,
                                consecutive_failures,
                                "retention scan persistently failing — store may be down"
                            );
                        } else {
                            warn!(
                                error = %last_err,
                                consecutive_failures,
                                retries = RETENTION_MAX_RETRIES,
                                "retention scan failed after retries, will retry next tick"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("retention worker shutting down");
                return;
            }
        }
    }
}

async fn retry_prune(
    store: &Arc<dyn StoreGateway>,
    event_cutoff: chrono::DateTime<chrono::Utc>,
    metric_cutoff: chrono::DateTime<chrono::Utc>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<(u64, u64)>, String> {
    let mut last_err = String::new();

    for attempt in 0..=RETENTION_MAX_RETRIES {
        let result: Result<(u64, u64), String> = async {
            let events = store.prune_events_older_than(event_cutoff).await.map_err(|e| e.to_string())?;
            let metrics = store.prune_metrics_older_than(metric_cutoff).await.map_err(|e| e.to_string())?;
            Ok((events, metrics))
        }
        .await;

        match result {
            Ok(counts) => return Ok(Some(counts)),
            Err(err) => {
                last_err = err;
                if attempt == RETENTION_MAX_RETRIES {
                    break;
                }
                let backoff = Duration::from_secs(1u64 << attempt);
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return Ok(None),
                }
            }
        }
    }

    Err(last_err)
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
