//! In-memory [`StoreGateway`] implementation.
//!
//! Backs unit tests for the coordinator, reconciler, and autoscaler without
//! requiring a live Postgres instance. Not suitable for production: state is
//! lost on restart and there is no cross-process mutual exclusion, which
//! defeats the whole point of the leader lease.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::model::{
    Application, ClusterNode, Event, Instance, LeaderLease, MetricSample, NewEvent, ScalingPolicy,
};
use crate::{EventFilter, InstanceFilter, MetricFilter, StoreError, StoreGateway};

#[derive(Default)]
struct Tables {
    applications: HashMap<String, Application>,
    instances: HashMap<String, Instance>,
    scaling_policies: HashMap<String, ScalingPolicy>,
    events: Vec<Event>,
    metrics: Vec<MetricSample>,
    nodes: HashMap<String, ClusterNode>,
    lease: Option<LeaderLease>,
}

/// In-memory store gateway, useful for tests and single-node development.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    next_event_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_event_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    async fn upsert_application(&self, app: &Application) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .applications
            .insert(app.name.clone(), app.clone());
        Ok(())
    }

    async fn get_application(&self, name: &str) -> Result<Option<Application>, StoreError> {
        Ok(self.tables.read().await.applications.get(name).cloned())
    }

    async fn list_applications(&self) -> Result<Vec<Application>, StoreError> {
        Ok(self.tables.read().await.applications.values().cloned().collect())
    }

    async fn delete_application(&self, name: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.applications.remove(name);
        tables.instances.retain(|_, i| i.app_name != name);
        tables.scaling_policies.remove(name);
        Ok(())
    }

    async fn upsert_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .instances
            .insert(instance.container_id.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance(&self, container_id: &str) -> Result<Option<Instance>, StoreError> {
        Ok(self.tables.read().await.instances.get(container_id).cloned())
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .instances
            .values()
            .filter(|i| {
                filter
                    .app_name
                    .as_deref()
                    .is_none_or(|name| i.app_name == name)
            })
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .cloned()
            .collect())
    }

    async fn delete_instance(&self, container_id: &str) -> Result<(), StoreError> {
        self.tables.write().await.instances.remove(container_id);
        Ok(())
    }

    async fn upsert_scaling_policy(&self, policy: &ScalingPolicy) -> Result<(), StoreError> {
        if policy.min_replicas > policy.max_replicas {
            return Err(StoreError::invalid("min_replicas must be <= max_replicas"));
        }
        if policy.scale_in_threshold_pct >= policy.scale_out_threshold_pct {
            return Err(StoreError::invalid(
                "scale_in_threshold_pct must be < scale_out_threshold_pct",
            ));
        }
        self.tables
            .write()
            .await
            .scaling_policies
            .insert(policy.app_name.clone(), policy.clone());
        Ok(())
    }

    async fn get_scaling_policy(
        &self,
        app_name: &str,
    ) -> Result<Option<ScalingPolicy>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .scaling_policies
            .get(app_name)
            .cloned())
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let stored = Event {
            id,
            app_name: event.app_name,
            container_id: event.container_id,
            event_type: event.event_type,
            severity: event.severity,
            message: event.message,
            details: event.details,
            timestamp: Utc::now(),
        };
        self.tables.write().await.events.push(stored.clone());
        Ok(stored)
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError> {
        let tables = self.tables.read().await;
        let mut events: Vec<Event> = tables
            .events
            .iter()
            .filter(|e| {
                filter
                    .app_name
                    .as_deref()
                    .is_none_or(|name| e.app_name.as_deref() == Some(name))
            })
            .filter(|e| filter.since.is_none_or(|since| e.timestamp >= since))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit {
            events.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(events)
    }

    async fn prune_events_older_than(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.events.len();
        tables.events.retain(|e| e.timestamp >= cutoff);
        Ok((before - tables.events.len()) as u64)
    }

    async fn record_metric(&self, sample: MetricSample) -> Result<(), StoreError> {
        self.tables.write().await.metrics.push(sample);
        Ok(())
    }

    async fn list_metrics(&self, filter: &MetricFilter) -> Result<Vec<MetricSample>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .metrics
            .iter()
            .filter(|m| m.app_name == filter.app_name)
            .filter(|m| m.metric_type == filter.metric_type)
            .filter(|m| m.timestamp >= filter.since)
            .cloned()
            .collect())
    }

    async fn prune_metrics_older_than(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.metrics.len();
        tables.metrics.retain(|m| m.timestamp >= cutoff);
        Ok((before - tables.metrics.len()) as u64)
    }

    async fn upsert_node(&self, node: &ClusterNode) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .nodes
            .insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, StoreError> {
        Ok(self.tables.read().await.nodes.values().cloned().collect())
    }

    async fn try_acquire_lease(
        &self,
        node_id: &str,
        term: i64,
        hostname: &str,
        api_url: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;

        let can_acquire = match &tables.lease {
            None => true,
            Some(existing) => !existing.is_valid_at(now) || existing.term < term,
        };

        if !can_acquire {
            return Ok(false);
        }

        tables.lease = Some(LeaderLease {
            leader_id: node_id.to_owned(),
            term,
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
            renewed_at: now,
            hostname: hostname.to_owned(),
            api_url: api_url.to_owned(),
        });
        Ok(true)
    }

    async fn renew_lease(
        &self,
        node_id: &str,
        term: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;

        match &mut tables.lease {
            Some(lease) if lease.leader_id == node_id && lease.term == term => {
                lease.renewed_at = now;
                lease.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read_lease(&self) -> Result<Option<LeaderLease>, StoreError> {
        Ok(self.tables.read().await.lease.clone())
    }

    async fn release_lease(&self, node_id: &str, term: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        if let Some(lease) = &mut tables.lease {
            if lease.leader_id == node_id && lease.term == term {
                lease.expires_at = now;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_one_node_can_acquire_the_lease() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        let a = store
            .try_acquire_lease("node-a", 1, "host-a", "http://a", ttl)
            .await
            .expect("acquire should not error");
        let b = store
            .try_acquire_lease("node-b", 1, "host-b", "http://b", ttl)
            .await
            .expect("acquire should not error");

        assert!(a);
        assert!(!b);
    }

    #[tokio::test]
    async fn higher_term_preempts_a_stale_leader() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store
            .try_acquire_lease("node-a", 1, "host-a", "http://a", ttl)
            .await
            .expect("acquire"));

        // Same term from a different node must fail.
        assert!(!store
            .try_acquire_lease("node-b", 1, "host-b", "http://b", ttl)
            .await
            .expect("acquire"));

        // A higher term succeeds even though the existing lease is unexpired.
        assert!(store
            .try_acquire_lease("node-b", 2, "host-b", "http://b", ttl)
            .await
            .expect("acquire"));
    }

    #[tokio::test]
    async fn renew_fails_for_non_holder() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        store
            .try_acquire_lease("node-a", 1, "host-a", "http://a", ttl)
            .await
            .expect("acquire");

        let renewed = store.renew_lease("node-b", 1, ttl).await.expect("renew");
        assert!(!renewed);

        let renewed = store.renew_lease("node-a", 1, ttl).await.expect("renew");
        assert!(renewed);
    }

    #[tokio::test]
    async fn scaling_policy_rejects_inverted_bounds() {
        let store = MemoryStore::new();
        let mut policy = ScalingPolicy::default_for("alpha");
        policy.min_replicas = 5;
        policy.max_replicas = 2;

        let err = store
            .upsert_scaling_policy(&policy)
            .await
            .expect_err("inverted bounds must be rejected");
        assert!(matches!(err, StoreError::Invalid { .. }));
    }
}
