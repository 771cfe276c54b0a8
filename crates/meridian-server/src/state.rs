//! Shared application state for the Meridian API facade.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. It holds references to every core subsystem;
//! handlers borrow through it rather than owning anything themselves.

use std::sync::Arc;

use meridian_core::{Autoscaler, Coordinator, HealthSupervisor, MetricsAggregator, ProxyManager, Reconciler};
use meridian_core::runtime::SharedRuntime;
use meridian_storage::StoreGateway;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Typed access to the relational store.
    pub store: Arc<dyn StoreGateway>,
    /// Cluster coordination and leader election.
    pub coordinator: Arc<Coordinator>,
    /// Container lifecycle operations.
    pub runtime: SharedRuntime,
    /// Liveness/readiness probing.
    pub health: Arc<HealthSupervisor>,
    /// Rolling per-app, per-signal metric windows.
    pub metrics: Arc<MetricsAggregator>,
    /// Scaling decision engine.
    pub autoscaler: Arc<Autoscaler>,
    /// Failure recovery and replica reconciliation.
    pub reconciler: Arc<Reconciler>,
    /// Front-proxy config rendering and reload.
    pub proxy: Arc<ProxyManager>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
