//! Cluster Coordinator: node state machine, leader election, and the three
//! concurrent loops (heartbeat, election, membership) that drive it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use meridian_storage::model::{ClusterNode, NodeState};
use meridian_storage::StoreGateway;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::CoordinatorError;

/// Tunables from `spec.md` §4.2, with the spec's stated defaults.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub election_tick: Duration,
    pub cluster_monitor_interval: Duration,
    pub stale_node_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            election_tick: Duration::from_secs(5),
            cluster_monitor_interval: Duration::from_secs(15),
            stale_node_timeout: Duration::from_secs(20),
        }
    }
}

/// A single control-plane process's view of the cluster's leadership state.
///
/// Split-brain is prevented by the store's atomicity, not by anything this
/// struct does — at most one `(leader_id, term)` pair ever holds a valid
/// lease row.
pub struct Coordinator {
    node_id: String,
    hostname: String,
    api_url: String,
    store: Arc<dyn StoreGateway>,
    config: CoordinatorConfig,
    state: RwLock<NodeState>,
    term: AtomicI64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        hostname: impl Into<String>,
        api_url: impl Into<String>,
        store: Arc<dyn StoreGateway>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            api_url: api_url.into(),
            store,
            config,
            state: RwLock::new(NodeState::Follower),
            term: AtomicI64::new(0),
            shutdown_tx,
            shutdown_rx,
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    pub async fn is_leader(&self) -> bool {
        *self.state.read().await == NodeState::Leader
    }

    #[must_use]
    pub fn current_term(&self) -> i64 {
        self.term.load(Ordering::SeqCst)
    }

    /// Snapshot the current leader's `api_url`, used by the API Façade's
    /// leader-gate 503 response.
    pub async fn known_leader_api_url(&self) -> Option<String> {
        match self.store.read_lease().await {
            Ok(Some(lease)) if lease.is_valid_at(Utc::now()) => Some(lease.api_url),
            _ => None,
        }
    }

    /// Spawn the three concurrent loops. The caller keeps the handles to
    /// await clean shutdown.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().heartbeat_loop()),
            tokio::spawn(self.clone().election_loop()),
            tokio::spawn(self.clone().membership_loop()),
        ]
    }

    /// Cooperative shutdown: best-effort lease release, then signal all
    /// loops to exit within one tick.
    pub async fn shutdown(&self) {
        if self.is_leader().await {
            if let Err(err) = self
                .store
                .release_lease(&self.node_id, self.current_term())
                .await
            {
                warn!(error = %err, "best-effort lease release failed during shutdown");
            }
        }
        self.set_state(NodeState::Stopped).await;
        let _ = self.shutdown_tx.send(true);
    }

    async fn set_state(&self, new_state: NodeState) {
        let mut state = self.state.write().await;
        if *state != new_state {
            info!(
                node_id = %self.node_id,
                term = self.current_term(),
                state = %new_state,
                "coordinator state transition"
            );
        }
        *state = new_state;
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut tick = tokio::time::interval(self.config.heartbeat_interval);
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.heartbeat_once(&mut consecutive_failures).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn heartbeat_once(&self, consecutive_failures: &mut u32) {
        let now = Utc::now();
        let node = ClusterNode {
            node_id: self.node_id.clone(),
            hostname: self.hostname.clone(),
            api_url: self.api_url.clone(),
            state: self.state().await,
            term: self.current_term(),
            last_heartbeat: now,
            is_healthy: true,
        };

        match self.store.upsert_node(&node).await {
            Ok(()) => *consecutive_failures = 0,
            Err(err) => {
                *consecutive_failures += 1;
                warn!(error = %err, consecutive_failures, "heartbeat write failed");
            }
        }

        if self.is_leader().await {
            match self
                .store
                .renew_lease(&self.node_id, self.current_term(), self.config.lease_ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(node_id = %self.node_id, "lease renewal rejected, stepping down");
                    self.set_state(NodeState::Follower).await;
                }
                Err(err) => {
                    *consecutive_failures += 1;
                    warn!(error = %err, consecutive_failures, "lease renewal failed");
                }
            }

            let grace_ticks = 2;
            if *consecutive_failures >= grace_ticks {
                warn!("store unreachable beyond grace window, stepping down");
                self.set_state(NodeState::Follower).await;
            }
        }
    }

    async fn election_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut tick = tokio::time::interval(self.config.election_tick);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = self.try_become_leader().await {
                        warn!(error = %err, "election attempt failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn try_become_leader(&self) -> Result<(), CoordinatorError> {
        if self.is_leader().await {
            return Ok(());
        }

        let now = Utc::now();
        let needs_election = match self.store.read_lease().await? {
            None => true,
            Some(lease) => !lease.is_valid_at(now) || lease.term < self.current_term(),
        };
        if !needs_election {
            return Ok(());
        }

        self.set_state(NodeState::Candidate).await;
        let proposed_term = self.term.fetch_add(1, Ordering::SeqCst) + 1;

        let acquired = self
            .store
            .try_acquire_lease(
                &self.node_id,
                proposed_term,
                &self.hostname,
                &self.api_url,
                self.config.lease_ttl,
            )
            .await?;

        if acquired {
            self.set_state(NodeState::Leader).await;
        } else {
            self.set_state(NodeState::Follower).await;
        }
        Ok(())
    }

    async fn membership_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut tick = tokio::time::interval(self.config.cluster_monitor_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.refresh_membership().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn refresh_membership(&self) {
        let nodes = match self.store.list_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(error = %err, "failed to list cluster nodes");
                return;
            }
        };

        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(self.config.stale_node_timeout).unwrap_or_default();

        for mut node in nodes {
            let stale = now - node.last_heartbeat > stale_after;
            if stale && node.is_healthy {
                node.is_healthy = false;
                if let Err(err) = self.store.upsert_node(&node).await {
                    warn!(error = %err, node_id = %node.node_id, "failed to mark node unhealthy");
                } else {
                    warn!(node_id = %node.node_id, "node marked unhealthy: stale heartbeat");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_storage::MemoryStore;

    #[tokio::test]
    async fn a_single_node_becomes_leader_when_no_lease_exists() {
        let store: Arc<dyn StoreGateway> = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new("node-a", "host-a", "http://a", store, CoordinatorConfig::default());

        coordinator.try_become_leader().await.expect("election");
        assert!(coordinator.is_leader().await);
    }

    #[tokio::test]
    async fn a_second_node_cannot_also_become_leader() {
        let store: Arc<dyn StoreGateway> = Arc::new(MemoryStore::new());
        let a = Coordinator::new("node-a", "host-a", "http://a", store.clone(), CoordinatorConfig::default());
        let b = Coordinator::new("node-b", "host-b", "http://b", store, CoordinatorConfig::default());

        a.try_become_leader().await.expect("election a");
        b.try_become_leader().await.expect("election b");

        assert!(a.is_leader().await);
        assert!(!b.is_leader().await);
    }

    #[tokio::test]
    async fn shutdown_releases_the_lease() {
        let store: Arc<dyn StoreGateway> = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new("node-a", "host-a", "http://a", store.clone(), CoordinatorConfig::default());
        coordinator.try_become_leader().await.expect("election");
        assert!(coordinator.is_leader().await);

        coordinator.shutdown().await;

        let lease = store.read_lease().await.expect("read lease").expect("lease row");
        assert!(!lease.is_valid_at(Utc::now()));
    }
}
