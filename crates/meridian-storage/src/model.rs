//! Domain entities persisted through the store gateway.
//!
//! These mirror the tables in §3/§6 of the control-plane spec. Enums map to
//! `TEXT` columns (not native Postgres enums) so that adding a new variant is
//! a code change, not a schema migration — `sqlx::Postgres` has no stable way
//! to evolve a native enum type without downtime.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an [`Application`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Updating,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Registered => "registered",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Updating => "updating",
        })
    }
}

impl FromStr for AppStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Self::Registered),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            "updating" => Ok(Self::Updating),
            other => Err(format!("unknown app status '{other}'")),
        }
    }
}

/// Scaling control mode for an [`Application`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    Auto,
    Manual,
}

impl fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        })
    }
}

impl FromStr for ScalingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown scaling mode '{other}'")),
        }
    }
}

/// A declared application: the unit the API Façade and App Manager operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub spec: serde_json::Value,
    pub status: AppStatus,
    pub desired_replicas: u32,
    pub current_replicas: u32,
    pub mode: ScalingMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_scaled_at: Option<DateTime<Utc>>,
}

/// Runtime status of an [`Instance`] as tracked by the App Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Draining,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        })
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "draining" => Ok(Self::Draining),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown instance status '{other}'")),
        }
    }
}

/// Health status of an [`Instance`] as tracked by the Health Supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Starting,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        })
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "starting" => Ok(Self::Starting),
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            other => Err(format!("unknown health status '{other}'")),
        }
    }
}

/// A single container backing one replica of an [`Application`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub container_id: String,
    pub app_name: String,
    pub replica_index: u32,
    pub ip: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub health_status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub failure_count: u32,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Instance {
    /// Whether this instance should currently receive proxied traffic.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        self.status == InstanceStatus::Running && self.health_status == HealthStatus::Healthy
    }
}

/// Autoscaling policy, one per application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub app_name: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_rps_per_replica: f64,
    pub max_p95_latency_ms: f64,
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub max_conn_per_replica: f64,
    pub scale_out_threshold_pct: u8,
    pub scale_in_threshold_pct: u8,
    pub evaluation_window_seconds: u32,
    pub cooldown_seconds: u32,
    pub stabilization_window_seconds: u32,
    pub max_scale_out_step: u32,
    pub max_scale_in_step: u32,
}

impl ScalingPolicy {
    /// A permissive default policy for newly registered applications.
    #[must_use]
    pub fn default_for(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            min_replicas: 1,
            max_replicas: 10,
            target_rps_per_replica: 100.0,
            max_p95_latency_ms: 500.0,
            max_cpu_percent: 70.0,
            max_memory_percent: 80.0,
            max_conn_per_replica: 200.0,
            scale_out_threshold_pct: 80,
            scale_in_threshold_pct: 30,
            evaluation_window_seconds: 60,
            cooldown_seconds: 120,
            stabilization_window_seconds: 60,
            max_scale_out_step: 0,
            max_scale_in_step: 1,
        }
    }
}

/// Severity of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        })
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// An append-only entry in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub app_name: Option<String>,
    pub container_id: Option<String>,
    pub event_type: String,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// A new event to be appended; `id` and `timestamp` are assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub app_name: Option<String>,
    pub container_id: Option<String>,
    pub event_type: String,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
}

/// The kind of signal a [`MetricSample`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    CpuPercent,
    MemoryPercent,
    Rps,
    P95LatencyMs,
    Connections,
    HealthyReplicas,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CpuPercent => "cpu_percent",
            Self::MemoryPercent => "memory_percent",
            Self::Rps => "rps",
            Self::P95LatencyMs => "p95_latency_ms",
            Self::Connections => "connections",
            Self::HealthyReplicas => "healthy_replicas",
        })
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu_percent" => Ok(Self::CpuPercent),
            "memory_percent" => Ok(Self::MemoryPercent),
            "rps" => Ok(Self::Rps),
            "p95_latency_ms" => Ok(Self::P95LatencyMs),
            "connections" => Ok(Self::Connections),
            "healthy_replicas" => Ok(Self::HealthyReplicas),
            other => Err(format!("unknown metric type '{other}'")),
        }
    }
}

/// A single time-series sample for one app/signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub app_name: String,
    pub metric_type: MetricType,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub labels: serde_json::Value,
}

/// State of a cluster node as modeled by the Cluster Coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Follower => "follower",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
            Self::Stopped => "stopped",
        })
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "follower" => Ok(Self::Follower),
            "candidate" => Ok(Self::Candidate),
            "leader" => Ok(Self::Leader),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown node state '{other}'")),
        }
    }
}

/// A registered control-plane process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: String,
    pub hostname: String,
    pub api_url: String,
    pub state: NodeState,
    pub term: i64,
    pub last_heartbeat: DateTime<Utc>,
    pub is_healthy: bool,
}

/// The singleton leader-lease row. `None` means no row exists yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderLease {
    pub leader_id: String,
    pub term: i64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub hostname: String,
    pub api_url: String,
}

impl LeaderLease {
    /// Whether this lease is still valid at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
