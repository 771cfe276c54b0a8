//! Store gateway for Meridian.
//!
//! This crate defines the [`StoreGateway`] trait — typed CRUD over the
//! control plane's relational schema, plus the three leader-lease primitives
//! (`try_acquire_lease`, `renew_lease`, `read_lease`) that the Cluster
//! Coordinator builds its election protocol on. The barrier-like invariant
//! here is narrower than an encryption barrier: every mutation must go
//! through a single atomic statement so that two coordinators racing to
//! acquire the lease can never both win.
//!
//! Two implementations are provided:
//!
//! - [`PostgresStore`] — production default, backed by `PgPool` with an
//!   optional read replica (feature `postgres-backend`).
//! - [`MemoryStore`] — in-memory, for unit tests and local development
//!   without a database.

mod error;
pub mod model;
#[cfg(feature = "postgres-backend")]
mod postgres;

mod memory;

pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "postgres-backend")]
pub use postgres::PostgresStore;

use async_trait::async_trait;
use model::{
    Application, ClusterNode, Event, Instance, LeaderLease, MetricSample, NewEvent, ScalingPolicy,
};

/// Optional filter for [`StoreGateway::list_instances`].
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub app_name: Option<String>,
    pub status: Option<model::InstanceStatus>,
}

/// Optional filter for [`StoreGateway::list_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub app_name: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<i64>,
}

/// Optional filter for [`StoreGateway::list_metrics`].
#[derive(Debug, Clone)]
pub struct MetricFilter {
    pub app_name: String,
    pub metric_type: model::MetricType,
    pub since: chrono::DateTime<chrono::Utc>,
}

/// Typed access to the control plane's relational store.
///
/// Implementations must route reads to a replica when one is configured and
/// healthy, falling back to the primary transparently; writes always go to
/// the primary and fail with [`StoreError::Unavailable`] rather than
/// silently falling back to a replica (see `DESIGN.md` for why the emergency
/// write-to-replica path is intentionally absent).
#[async_trait]
pub trait StoreGateway: Send + Sync + 'static {
    // ── Applications ─────────────────────────────────────────────────

    async fn upsert_application(&self, app: &Application) -> Result<(), StoreError>;
    async fn get_application(&self, name: &str) -> Result<Option<Application>, StoreError>;
    async fn list_applications(&self) -> Result<Vec<Application>, StoreError>;
    async fn delete_application(&self, name: &str) -> Result<(), StoreError>;

    // ── Instances ────────────────────────────────────────────────────

    async fn upsert_instance(&self, instance: &Instance) -> Result<(), StoreError>;
    async fn get_instance(&self, container_id: &str) -> Result<Option<Instance>, StoreError>;
    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError>;
    async fn delete_instance(&self, container_id: &str) -> Result<(), StoreError>;

    // ── Scaling policies ─────────────────────────────────────────────

    async fn upsert_scaling_policy(&self, policy: &ScalingPolicy) -> Result<(), StoreError>;
    async fn get_scaling_policy(&self, app_name: &str) -> Result<Option<ScalingPolicy>, StoreError>;

    // ── Events ───────────────────────────────────────────────────────

    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError>;
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError>;
    async fn prune_events_older_than(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError>;

    // ── Metrics ──────────────────────────────────────────────────────

    async fn record_metric(&self, sample: MetricSample) -> Result<(), StoreError>;
    async fn list_metrics(&self, filter: &MetricFilter) -> Result<Vec<MetricSample>, StoreError>;
    async fn prune_metrics_older_than(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError>;

    // ── Cluster nodes ────────────────────────────────────────────────

    async fn upsert_node(&self, node: &ClusterNode) -> Result<(), StoreError>;
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, StoreError>;

    // ── Leader lease ─────────────────────────────────────────────────

    /// Atomically acquire (or renew into) the leader lease.
    ///
    /// Succeeds only if the existing lease row is expired or its term is
    /// less than `term`. Returns `true` iff the caller now holds the lease.
    async fn try_acquire_lease(
        &self,
        node_id: &str,
        term: i64,
        hostname: &str,
        api_url: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, StoreError>;

    /// Renew the lease. Succeeds only if `(leader_id, term)` match the
    /// current row exactly. Returns `true` iff the renewal applied.
    async fn renew_lease(
        &self,
        node_id: &str,
        term: i64,
        ttl: std::time::Duration,
    ) -> Result<bool, StoreError>;

    /// Snapshot of the current lease row, if one exists.
    async fn read_lease(&self) -> Result<Option<LeaderLease>, StoreError>;

    /// Best-effort voluntary release: expire the lease row for `(leader_id,
    /// term)` if it still matches. No-op (not an error) if it doesn't.
    async fn release_lease(&self, node_id: &str, term: i64) -> Result<(), StoreError>;
}
