//! Server configuration for Meridian.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `MERIDIAN_*` environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Identifier for this node in the cluster, stable across restarts.
    pub node_id: String,
    /// Hostname advertised in `cluster_nodes` and the leader lease.
    pub hostname: String,
    /// Base URL other nodes and the front proxy use to reach this node.
    pub api_url: String,
    /// Primary database connection string.
    pub database_url: String,
    /// Optional read-replica connection string.
    pub database_replica_url: Option<String>,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Container runtime CLI binary (docker/podman-compatible).
    pub runtime_binary: String,
    /// Docker network new containers are attached to.
    pub runtime_network: String,
    /// Front proxy CLI binary (nginx/haproxy-compatible, supports `-t`/`-s reload`).
    pub proxy_binary: String,
    /// Directory the Proxy Manager writes rendered configs into.
    pub proxy_config_dir: String,
    /// Cluster coordinator tunables.
    pub coordinator: CoordinatorTunables,
    /// How often the reconcile loop evaluates every registered app.
    pub reconcile_interval: Duration,
    /// How often the retention cleanup worker runs.
    pub retention_scan_interval: Duration,
    /// Event rows older than this are pruned by the retention worker.
    pub event_retention_days: i64,
    /// Metric rows older than this are pruned by the retention worker.
    pub metric_retention_days: i64,
    /// Maximum number of concurrent health probes across all apps.
    pub health_probe_concurrency: usize,
    /// How often the health supervisor rescans for newly running instances.
    pub health_scan_interval: Duration,
    /// How often the metrics collector rescans for newly running apps.
    pub metrics_scan_interval: Duration,
}

/// Timing tunables for the Cluster Coordinator, mirrored here so they can be
/// set via environment variables without reaching into `meridian-core`.
#[derive(Debug, Clone)]
pub struct CoordinatorTunables {
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub election_tick: Duration,
    pub cluster_monitor_interval: Duration,
    pub stale_node_timeout: Duration,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT` — port to bind on, binds to `0.0.0.0` (cloud-platform convention)
    /// - `MERIDIAN_BIND_ADDR` — full bind address (overrides `PORT`, default `127.0.0.1:7700`)
    /// - `MERIDIAN_NODE_ID` — stable node identifier (default: generated from hostname + pid)
    /// - `MERIDIAN_API_URL` — base URL this node is reachable at (default derived from bind addr)
    /// - `DATABASE_URL` — primary Postgres connection string (default: local dev database)
    /// - `DATABASE_REPLICA_URL` — optional read-replica connection string
    /// - `MERIDIAN_LOG_LEVEL` — log filter (default: `info`)
    /// - `MERIDIAN_RUNTIME_BIN` — container runtime CLI (default: `docker`)
    /// - `MERIDIAN_RUNTIME_NETWORK` — docker network for new containers (default: `meridian`)
    /// - `MERIDIAN_PROXY_BIN` — front proxy CLI (default: `nginx`)
    /// - `MERIDIAN_PROXY_CONFIG_DIR` — proxy config output directory (default: `./proxy-conf`)
    /// - `MERIDIAN_LEASE_TTL_SECS`, `MERIDIAN_HEARTBEAT_SECS`, `MERIDIAN_ELECTION_TICK_SECS`,
    ///   `MERIDIAN_CLUSTER_MONITOR_SECS`, `MERIDIAN_STALE_NODE_SECS` — coordinator timing
    /// - `MERIDIAN_RECONCILE_INTERVAL_SECS` — reconcile loop period (default: `5`)
    /// - `MERIDIAN_RETENTION_SCAN_SECS` — retention worker period (default: `3600`)
    /// - `MERIDIAN_EVENT_RETENTION_DAYS`, `MERIDIAN_METRIC_RETENTION_DAYS` — pruning horizons
    /// - `MERIDIAN_HEALTH_PROBE_CONCURRENCY` — max concurrent probes (default: `32`)
    /// - `MERIDIAN_HEALTH_SCAN_SECS` — health supervisor rescan period (default: `5`)
    /// - `MERIDIAN_METRICS_SCAN_SECS` — metrics collector rescan period (default: `15`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 7700)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(7700);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 7700))
        };

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());

        let node_id = std::env::var("MERIDIAN_NODE_ID")
            .unwrap_or_else(|_| format!("{hostname}-{}", std::process::id()));

        let api_url = std::env::var("MERIDIAN_API_URL")
            .unwrap_or_else(|_| format!("http://{bind_addr}"));

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/meridian".to_owned());
        let database_replica_url = std::env::var("DATABASE_REPLICA_URL").ok();

        let log_level = std::env::var("MERIDIAN_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let runtime_binary = std::env::var("MERIDIAN_RUNTIME_BIN").unwrap_or_else(|_| "docker".to_owned());
        let runtime_network =
            std::env::var("MERIDIAN_RUNTIME_NETWORK").unwrap_or_else(|_| "meridian".to_owned());

        let proxy_binary = std::env::var("MERIDIAN_PROXY_BIN").unwrap_or_else(|_| "nginx".to_owned());
        let proxy_config_dir =
            std::env::var("MERIDIAN_PROXY_CONFIG_DIR").unwrap_or_else(|_| "./proxy-conf".to_owned());

        let coordinator = CoordinatorTunables {
            lease_ttl: env_secs("MERIDIAN_LEASE_TTL_SECS", 30),
            heartbeat_interval: env_secs("MERIDIAN_HEARTBEAT_SECS", 10),
            election_tick: env_secs("MERIDIAN_ELECTION_TICK_SECS", 5),
            cluster_monitor_interval: env_secs("MERIDIAN_CLUSTER_MONITOR_SECS", 15),
            stale_node_timeout: env_secs("MERIDIAN_STALE_NODE_SECS", 20),
        };

        let reconcile_interval = env_secs("MERIDIAN_RECONCILE_INTERVAL_SECS", 5);
        let retention_scan_interval = env_secs("MERIDIAN_RETENTION_SCAN_SECS", 3600);

        let event_retention_days = std::env::var("MERIDIAN_EVENT_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let metric_retention_days = std::env::var("MERIDIAN_METRIC_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(7);

        let health_probe_concurrency = std::env::var("MERIDIAN_HEALTH_PROBE_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(32);

        let health_scan_interval = env_secs("MERIDIAN_HEALTH_SCAN_SECS", 5);
        let metrics_scan_interval = env_secs("MERIDIAN_METRICS_SCAN_SECS", 15);

        Self {
            bind_addr,
            node_id,
            hostname,
            api_url,
            database_url,
            database_replica_url,
            log_level,
            runtime_binary,
            runtime_network,
            proxy_binary,
            proxy_config_dir,
            coordinator,
            reconcile_interval,
            retention_scan_interval,
            event_retention_days,
            metric_retention_days,
            health_probe_concurrency,
            health_scan_interval,
            metrics_scan_interval,
        }
    }
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_secs),
    )
}
