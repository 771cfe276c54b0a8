//! App Manager (reconciler): drives observed instance state toward
//! `desired_replicas`, and holds the failure-kind → strategy-order table.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use meridian_storage::model::{Instance, InstanceStatus};
use meridian_storage::StoreGateway;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{FailureKind, ReconcileError};
use crate::events;
use crate::proxy::{Algorithm, ProxyManager};
use crate::runtime::{ContainerSpec, SharedRuntime};

/// A remediation action the App Manager can take in response to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    RemoveFromProxy,
    Restart,
    Recreate,
    ScaleOut,
    Replace,
}

/// Priority-ordered strategies for each failure kind, per `spec.md` §4.7.
#[must_use]
pub fn strategy_order(kind: FailureKind) -> &'static [Strategy] {
    use Strategy::{Recreate, RemoveFromProxy, Replace, Restart, ScaleOut};
    match kind {
        FailureKind::HealthCheckFailed => &[RemoveFromProxy, Restart, Recreate],
        FailureKind::HealthCheckTimeout => &[RemoveFromProxy, Restart],
        FailureKind::HighResponseLatency => &[RemoveFromProxy, ScaleOut, Restart],
        FailureKind::HighResourceUsage => &[ScaleOut, Restart, Replace],
        FailureKind::ContainerStopped => &[Recreate, Replace],
        FailureKind::OomKilled => &[Replace, ScaleOut],
        FailureKind::NetworkUnreachable => &[RemoveFromProxy, Recreate],
    }
}

/// Per-`(instance, strategy)` attempt budget over a trailing 5-minute window.
struct StrategyBudget {
    attempts: Mutex<HashMap<(String, Strategy), VecDeque<DateTime<Utc>>>>,
}

impl StrategyBudget {
    fn new() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn max_attempts(strategy: Strategy) -> usize {
        match strategy {
            Strategy::Restart => 3,
            Strategy::ScaleOut => 1,
            Strategy::RemoveFromProxy | Strategy::Recreate | Strategy::Replace => usize::MAX,
        }
    }

    async fn is_applicable(&self, container_id: &str, strategy: Strategy, now: DateTime<Utc>) -> bool {
        let mut attempts = self.attempts.lock().await;
        let entry = attempts
            .entry((container_id.to_owned(), strategy))
            .or_default();
        let window = ChronoDuration::minutes(5);
        entry.retain(|t| now - *t < window);
        entry.len() < Self::max_attempts(strategy)
    }

    async fn record(&self, container_id: &str, strategy: Strategy, now: DateTime<Utc>) {
        self.attempts
            .lock()
            .await
            .entry((container_id.to_owned(), strategy))
            .or_default()
            .push_back(now);
    }

    async fn has_attempted(&self, container_id: &str, strategy: Strategy) -> bool {
        self.attempts
            .lock()
            .await
            .get(&(container_id.to_owned(), strategy))
            .is_some_and(|attempts| !attempts.is_empty())
    }
}

/// The App Manager: drives `count(running ∧ healthy)` toward
/// `desired_replicas` for each application.
pub struct Reconciler {
    store: Arc<dyn StoreGateway>,
    runtime: SharedRuntime,
    proxy: Arc<ProxyManager>,
    budgets: StrategyBudget,
    last_index: Mutex<HashMap<(String, FailureKind), usize>>,
}

impl Reconciler {
    #[must_use]
    pub fn new(store: Arc<dyn StoreGateway>, runtime: SharedRuntime, proxy: Arc<ProxyManager>) -> Self {
        Self {
            store,
            runtime,
            proxy,
            budgets: StrategyBudget::new(),
            last_index: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild and reload the proxy upstream for `app_name` from current
    /// store state. A no-op if the app has since been deleted; callers that
    /// need orphaned config files removed should use `ProxyManager::remove_orphans`.
    async fn sync_proxy(&self, app_name: &str) -> Result<(), ReconcileError> {
        let Some(app) = self.store.get_application(app_name).await? else {
            return Ok(());
        };
        let spec: ContainerSpec = serde_json::from_value(app.spec.clone()).map_err(|err| {
            ReconcileError::Invalid(format!("stored spec for {app_name} no longer deserializes: {err}"))
        })?;
        let instances = self
            .store
            .list_instances(&meridian_storage::InstanceFilter {
                app_name: Some(app_name.to_owned()),
                status: None,
            })
            .await?;
        let servers = crate::proxy::routable_servers(&instances, &[]);
        self.proxy
            .reload_app(app_name, &Algorithm::RoundRobin, &servers, spec.port)
            .await?;
        Ok(())
    }

    fn next_replica_index(existing: &[Instance]) -> u32 {
        let mut index = 0;
        let used: std::collections::HashSet<u32> = existing.iter().map(|i| i.replica_index).collect();
        while used.contains(&index) {
            index += 1;
        }
        index
    }

    /// Scale out by `n`: create `n` instances at the next free replica
    /// indices. Idempotent in the sense that calling it twice with the same
    /// desired count converges rather than double-creating, because the
    /// caller is expected to only request the delta still missing.
    pub async fn scale_out(
        &self,
        app_name: &str,
        spec: &ContainerSpec,
        n: u32,
    ) -> Result<Vec<Instance>, ReconcileError> {
        let mut existing = self
            .store
            .list_instances(&meridian_storage::InstanceFilter {
                app_name: Some(app_name.to_owned()),
                status: None,
            })
            .await?;

        let mut created = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let replica_index = Self::next_replica_index(&existing);
            let container = self
                .runtime
                .create(spec, replica_index)
                .await
                .map_err(ReconcileError::from)?;

            let instance = Instance {
                container_id: container.container_id,
                app_name: app_name.to_owned(),
                replica_index,
                ip: container.ip,
                port: container.port,
                status: InstanceStatus::Starting,
                health_status: meridian_storage::model::HealthStatus::Unknown,
                consecutive_failures: 0,
                consecutive_successes: 0,
                failure_count: 0,
                last_health_check: None,
            };
            self.store.upsert_instance(&instance).await?;
            events::emit_simple(
                &self.store,
                Some(app_name),
                "instance_created",
                meridian_storage::model::Severity::Info,
                format!("created replica {replica_index} ({})", instance.container_id),
            )
            .await;

            existing.push(instance.clone());
            created.push(instance);
        }
        self.sync_proxy(app_name).await?;
        Ok(created)
    }

    /// Scale in by `n`: prefer instances with the highest
    /// `consecutive_failures`, then the highest `replica_index`.
    pub async fn scale_in(
        &self,
        app_name: &str,
        n: u32,
        drain_seconds: u32,
    ) -> Result<(), ReconcileError> {
        let mut instances = self
            .store
            .list_instances(&meridian_storage::InstanceFilter {
                app_name: Some(app_name.to_owned()),
                status: None,
            })
            .await?;

        instances.sort_by(|a, b| {
            b.consecutive_failures
                .cmp(&a.consecutive_failures)
                .then(b.replica_index.cmp(&a.replica_index))
        });

        for instance in instances.into_iter().take(n as usize) {
            self.drain_and_remove(&instance, drain_seconds).await?;
        }
        Ok(())
    }

    /// Mark `draining`, remove the instance from the proxy upstream, wait
    /// out the drain window, then stop and remove. The upstream rebuild
    /// happens before the sleep so the instance stops receiving traffic as
    /// soon as it starts draining, not only once it is gone.
    async fn drain_and_remove(
        &self,
        instance: &Instance,
        drain_seconds: u32,
    ) -> Result<(), ReconcileError> {
        let mut draining = instance.clone();
        draining.status = InstanceStatus::Draining;
        self.store.upsert_instance(&draining).await?;
        if let Err(err) = self.sync_proxy(&instance.app_name).await {
            warn!(app_name = %instance.app_name, %err, "failed to remove draining instance from proxy upstream");
        }

        tokio::time::sleep(std::time::Duration::from_secs(u64::from(drain_seconds))).await;

        self.runtime
            .stop(&instance.container_id, drain_seconds)
            .await
            .map_err(ReconcileError::from)?;
        self.runtime
            .remove(&instance.container_id)
            .await
            .map_err(ReconcileError::from)?;
        self.store.delete_instance(&instance.container_id).await?;

        events::emit_simple(
            &self.store,
            Some(&instance.app_name),
            "instance_removed",
            meridian_storage::model::Severity::Info,
            format!("removed replica {} ({})", instance.replica_index, instance.container_id),
        )
        .await;
        Ok(())
    }

    /// Replace one instance in place: drain, stop, remove, then recreate at
    /// the same `replica_index`.
    pub async fn replace_instance(
        &self,
        container_id: &str,
        spec: &ContainerSpec,
    ) -> Result<Instance, ReconcileError> {
        let instance = self
            .store
            .get_instance(container_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(container_id.to_owned()))?;

        self.drain_and_remove(&instance, 10).await?;

        let container = self
            .runtime
            .create(spec, instance.replica_index)
            .await
            .map_err(ReconcileError::from)?;

        let replacement = Instance {
            container_id: container.container_id,
            app_name: instance.app_name.clone(),
            replica_index: instance.replica_index,
            ip: container.ip,
            port: container.port,
            status: InstanceStatus::Starting,
            health_status: meridian_storage::model::HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            failure_count: 0,
            last_health_check: None,
        };
        self.store.upsert_instance(&replacement).await?;
        events::emit_simple(
            &self.store,
            Some(&instance.app_name),
            "instance_replaced",
            meridian_storage::model::Severity::Warning,
            format!("replaced replica {}", instance.replica_index),
        )
        .await;
        self.sync_proxy(&replacement.app_name).await?;
        Ok(replacement)
    }

    /// Roll instances over to a new spec, one at a time, never dropping
    /// below `min_replicas` running instances.
    pub async fn update_spec(
        &self,
        app_name: &str,
        new_spec: &ContainerSpec,
        min_replicas: u32,
    ) -> Result<(), ReconcileError> {
        let instances = self
            .store
            .list_instances(&meridian_storage::InstanceFilter {
                app_name: Some(app_name.to_owned()),
                status: Some(InstanceStatus::Running),
            })
            .await?;

        if instances.len() < min_replicas as usize {
            return Err(ReconcileError::Invalid(
                "not enough running instances to roll without breaching min_replicas".to_owned(),
            ));
        }

        for instance in instances {
            self.replace_instance(&instance.container_id, new_spec).await?;
        }
        Ok(())
    }

    /// Choose the next applicable strategy for a failure on `container_id`,
    /// escalating one step through the priority order each time the same
    /// `(container_id, kind)` recurs, and respecting per-kind budgets plus
    /// the "replace only after a restart" rule. Returns `None` once the
    /// order is exhausted — the caller should treat that as `Fatal` for the
    /// instance.
    pub async fn select_strategy(
        &self,
        container_id: &str,
        kind: FailureKind,
        container_already_gone: bool,
        now: DateTime<Utc>,
    ) -> Option<Strategy> {
        let order = strategy_order(kind);
        let start = {
            let last_index = self.last_index.lock().await;
            last_index
                .get(&(container_id.to_owned(), kind))
                .map_or(0, |i| i + 1)
        };

        for (idx, &strategy) in order.iter().enumerate().skip(start) {
            if strategy == Strategy::Replace
                && !container_already_gone
                && !self.budgets.has_attempted(container_id, Strategy::Restart).await
            {
                continue;
            }
            if self.budgets.is_applicable(container_id, strategy, now).await {
                self.budgets.record(container_id, strategy, now).await;
                self.last_index
                    .lock()
                    .await
                    .insert((container_id.to_owned(), kind), idx);
                info!(container_id, ?strategy, ?kind, "selected remediation strategy");
                return Some(strategy);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntimeAdapter;
    use meridian_storage::MemoryStore;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            app_name: "alpha".to_owned(),
            image: "alpha:latest".to_owned(),
            port: 8080,
            env: std::collections::HashMap::new(),
            cpu_limit: None,
            memory_limit_mb: None,
        }
    }

    #[tokio::test]
    async fn scale_out_creates_n_instances_at_free_indices() {
        let store: Arc<dyn StoreGateway> = Arc::new(MemoryStore::new());
        let runtime: SharedRuntime = Arc::new(MockRuntimeAdapter::new());
        let proxy = Arc::new(ProxyManager::new("/tmp", "true"));
        let reconciler = Reconciler::new(store.clone(), runtime, proxy);

        let created = reconciler.scale_out("alpha", &spec(), 3).await.expect("scale out");
        let mut indices: Vec<u32> = created.iter().map(|i| i.replica_index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn strategy_escalates_through_the_priority_order() {
        let store: Arc<dyn StoreGateway> = Arc::new(MemoryStore::new());
        let runtime: SharedRuntime = Arc::new(MockRuntimeAdapter::new());
        let proxy = Arc::new(ProxyManager::new("/tmp", "true"));
        let reconciler = Reconciler::new(store, runtime, proxy);
        let now = Utc::now();

        // health_check_timeout order is [RemoveFromProxy, Restart].
        let first = reconciler
            .select_strategy("c1", FailureKind::HealthCheckTimeout, false, now)
            .await;
        assert_eq!(first, Some(Strategy::RemoveFromProxy));

        let second = reconciler
            .select_strategy("c1", FailureKind::HealthCheckTimeout, false, now)
            .await;
        assert_eq!(second, Some(Strategy::Restart));

        let third = reconciler
            .select_strategy("c1", FailureKind::HealthCheckTimeout, false, now)
            .await;
        assert_eq!(third, None);
    }

    #[tokio::test]
    async fn replace_is_skipped_without_a_prior_restart() {
        let store: Arc<dyn StoreGateway> = Arc::new(MemoryStore::new());
        let runtime: SharedRuntime = Arc::new(MockRuntimeAdapter::new());
        let proxy = Arc::new(ProxyManager::new("/tmp", "true"));
        let reconciler = Reconciler::new(store, runtime, proxy);
        let now = Utc::now();

        // oom_killed order is [Replace, ScaleOut]; Replace requires a prior
        // Restart attempt (never made for this container), so it is
        // skipped in favor of ScaleOut.
        let first = reconciler
            .select_strategy("c1", FailureKind::OomKilled, false, now)
            .await;
        assert_eq!(first, Some(Strategy::ScaleOut));
    }
}
