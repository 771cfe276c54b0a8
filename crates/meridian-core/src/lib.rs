//! Core control-plane logic for Meridian.
//!
//! This crate holds every stateful component the API Façade drives:
//! cluster coordination and leader election ([`coordinator`]), container
//! lifecycle ([`runtime`]), liveness probing ([`health`]), rolling metric
//! windows ([`metrics`]), scaling decisions ([`autoscaler`]), failure
//! recovery ([`reconciler`]), and front-proxy configuration
//! ([`proxy`]). [`events`] is the shared best-effort audit-log sink all of
//! them write through.

pub mod autoscaler;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod reconciler;
pub mod runtime;

pub use autoscaler::Autoscaler;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use health::HealthSupervisor;
pub use metrics::MetricsAggregator;
pub use proxy::ProxyManager;
pub use reconciler::Reconciler;
pub use runtime::{LocalRuntimeAdapter, RuntimeAdapter, SharedRuntime};
