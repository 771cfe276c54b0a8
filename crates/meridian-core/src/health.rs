//! Health Supervisor: per-instance probe loops that drive health-status
//! transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use meridian_storage::model::{HealthStatus, Severity};
use meridian_storage::StoreGateway;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::events;

/// Probe transport, per `spec.md` §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeProtocol {
    Http,
    Tcp,
}

/// Health-check configuration carried in an application's spec document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub protocol: ProbeProtocol,
    pub path: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub allowed_status: Vec<u16>,
    pub probe_data: Option<String>,
    pub expected_response: Option<String>,
    pub initial_delay_seconds: u32,
    pub period_seconds: u32,
    pub timeout_seconds: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            protocol: ProbeProtocol::Http,
            path: "/healthz".to_owned(),
            method: "GET".to_owned(),
            headers: HashMap::new(),
            allowed_status: vec![200],
            probe_data: None,
            expected_response: None,
            initial_delay_seconds: 5,
            period_seconds: 10,
            timeout_seconds: 3,
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

/// The outcome classification of a single probe attempt, used for the event
/// log and metrics (the "classify failures by cause" requirement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Timeout,
    ConnectionRefused,
    Dns,
    StatusMismatch,
    ContentMismatch,
}

impl ProbeOutcome {
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    fn as_event_type(self) -> &'static str {
        match self {
            Self::Success => "probe_succeeded",
            Self::Timeout => "probe_timeout",
            Self::ConnectionRefused => "probe_connection_refused",
            Self::Dns => "probe_dns_failure",
            Self::StatusMismatch => "probe_status_mismatch",
            Self::ContentMismatch => "probe_content_mismatch",
        }
    }
}

/// Per-instance tracking state for the probe state machine.
#[derive(Debug, Clone, Default)]
struct ProbeState {
    status: Option<HealthStatus>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

/// Runs probe loops for instances and reports transitions through the event
/// log. Probe concurrency across all instances is bounded by a semaphore —
/// the same bounded-pool idiom the spec calls for at the HTTP layer.
pub struct HealthSupervisor {
    store: Arc<dyn StoreGateway>,
    client: Client,
    semaphore: Arc<Semaphore>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthSupervisor {
    #[must_use]
    pub fn new(
        store: Arc<dyn StoreGateway>,
        max_concurrent_probes: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            client: Client::builder()
                .build()
                .unwrap_or_else(|_| Client::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent_probes.max(1))),
            shutdown_rx,
        }
    }

    /// Runs a single instance's probe loop until shutdown is signalled.
    ///
    /// Spawned once per instance by the caller; exits within one tick of
    /// shutdown and never leaves an in-flight request beyond its own
    /// timeout.
    pub async fn run_instance_loop(
        &self,
        container_id: &str,
        app_name: &str,
        ip: &str,
        port: u16,
        config: &HealthCheckConfig,
    ) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::time::sleep(Duration::from_secs(u64::from(config.initial_delay_seconds))).await;

        let mut state = ProbeState::default();
        let mut tick = tokio::time::interval(Duration::from_secs(u64::from(
            config.period_seconds.max(1),
        )));

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.probe_once(container_id, app_name, ip, port, config, &mut state).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn probe_once(
        &self,
        container_id: &str,
        app_name: &str,
        ip: &str,
        port: u16,
        config: &HealthCheckConfig,
        state: &mut ProbeState,
    ) {
        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let outcome = run_probe(&self.client, ip, port, config).await;

        events::emit(
            &self.store,
            Some(app_name),
            Some(container_id),
            outcome.as_event_type(),
            if outcome.is_success() {
                Severity::Info
            } else {
                Severity::Warning
            },
            format!("probe {:?} for {container_id}", outcome),
            serde_json::json!({}),
        )
        .await;

        let previous = state.status.unwrap_or(HealthStatus::Unknown);
        let next = self.advance(state, outcome, config);

        if Some(next) != state.status {
            state.status = Some(next);
            info!(
                container_id,
                app_name,
                from = %previous,
                to = %next,
                "health status transition"
            );
            events::emit_simple(
                &self.store,
                Some(app_name),
                "health_status_changed",
                Severity::Info,
                format!("{container_id}: {previous} -> {next}"),
            )
            .await;

            if let Ok(Some(mut instance)) = self.store.get_instance(container_id).await {
                instance.health_status = next;
                instance.last_health_check = Some(Utc::now());
                instance.consecutive_failures = state.consecutive_failures;
                instance.consecutive_successes = state.consecutive_successes;
                if let Err(err) = self.store.upsert_instance(&instance).await {
                    warn!(error = %err, container_id, "failed to persist health transition");
                }
            }
        }
    }

    fn advance(
        &self,
        state: &mut ProbeState,
        outcome: ProbeOutcome,
        config: &HealthCheckConfig,
    ) -> HealthStatus {
        if outcome.is_success() {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
        }

        let current = state.status.unwrap_or(HealthStatus::Unknown);
        match current {
            HealthStatus::Unknown | HealthStatus::Starting => {
                if state.consecutive_successes >= config.success_threshold {
                    HealthStatus::Healthy
                } else if state.consecutive_failures >= config.failure_threshold {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Starting
                }
            }
            HealthStatus::Healthy => {
                if state.consecutive_failures >= config.failure_threshold {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Healthy
                }
            }
            HealthStatus::Unhealthy => {
                if state.consecutive_successes >= config.success_threshold {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                }
            }
        }
    }
}

/// Run a single, one-off probe against an instance outside of any
/// [`HealthSupervisor`] loop — the immediate-check path for a manually
/// triggered probe.
pub async fn probe_instance(ip: &str, port: u16, config: &HealthCheckConfig) -> ProbeOutcome {
    let client = Client::builder().build().unwrap_or_else(|_| Client::new());
    run_probe(&client, ip, port, config).await
}

async fn run_probe(client: &Client, ip: &str, port: u16, config: &HealthCheckConfig) -> ProbeOutcome {
    let deadline = Duration::from_secs(u64::from(config.timeout_seconds.max(1)));
    match config.protocol {
        ProbeProtocol::Http => run_http_probe(client, ip, port, config, deadline).await,
        ProbeProtocol::Tcp => run_tcp_probe(ip, port, config, deadline).await,
    }
}

async fn run_http_probe(
    client: &Client,
    ip: &str,
    port: u16,
    config: &HealthCheckConfig,
    deadline: Duration,
) -> ProbeOutcome {
    let url = format!("http://{ip}:{port}{}", config.path);
    let mut builder = client
        .request(
            config.method.parse().unwrap_or(reqwest::Method::GET),
            &url,
        )
        .timeout(deadline);
    for (key, value) in &config.headers {
        builder = builder.header(key, value);
    }

    match timeout(deadline, builder.send()).await {
        Err(_) => ProbeOutcome::Timeout,
        Ok(Err(err)) => {
            if err.is_connect() {
                ProbeOutcome::ConnectionRefused
            } else if err.is_timeout() {
                ProbeOutcome::Timeout
            } else {
                ProbeOutcome::Dns
            }
        }
        Ok(Ok(response)) => {
            if config.allowed_status.contains(&response.status().as_u16()) {
                ProbeOutcome::Success
            } else {
                ProbeOutcome::StatusMismatch
            }
        }
    }
}

async fn run_tcp_probe(ip: &str, port: u16, config: &HealthCheckConfig, deadline: Duration) -> ProbeOutcome {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let connect = timeout(deadline, TcpStream::connect((ip, port))).await;
    let mut stream = match connect {
        Err(_) => return ProbeOutcome::Timeout,
        Ok(Err(_)) => return ProbeOutcome::ConnectionRefused,
        Ok(Ok(stream)) => stream,
    };

    let Some(data) = &config.probe_data else {
        return ProbeOutcome::Success;
    };

    if timeout(deadline, stream.write_all(data.as_bytes())).await.is_err() {
        return ProbeOutcome::Timeout;
    }

    let Some(expected) = &config.expected_response else {
        return ProbeOutcome::Success;
    };

    let mut buf = vec![0_u8; expected.len().max(256)];
    match timeout(deadline, stream.read(&mut buf)).await {
        Err(_) => ProbeOutcome::Timeout,
        Ok(Err(_)) => ProbeOutcome::ConnectionRefused,
        Ok(Ok(n)) => {
            if String::from_utf8_lossy(&buf[..n]).contains(expected.as_str()) {
                ProbeOutcome::Success
            } else {
                ProbeOutcome::ContentMismatch
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            failure_threshold: 3,
            success_threshold: 2,
            ..HealthCheckConfig::default()
        }
    }

    #[tokio::test]
    async fn three_consecutive_failures_marks_unhealthy() {
        let store: Arc<dyn StoreGateway> = Arc::new(meridian_storage::MemoryStore::new());
        let (_tx, rx) = watch::channel(false);
        let supervisor = HealthSupervisor::new(store, 10, rx);
        let mut state = ProbeState::default();
        let cfg = config();

        let mut last = HealthStatus::Unknown;
        for _ in 0..3 {
            last = supervisor.advance(&mut state, ProbeOutcome::Timeout, &cfg);
        }
        assert_eq!(last, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn recovers_after_success_threshold() {
        let store: Arc<dyn StoreGateway> = Arc::new(meridian_storage::MemoryStore::new());
        let (_tx, rx) = watch::channel(false);
        let supervisor = HealthSupervisor::new(store, 10, rx);
        let mut state = ProbeState::default();
        let cfg = config();

        for _ in 0..3 {
            supervisor.advance(&mut state, ProbeOutcome::Timeout, &cfg);
        }
        let mut last = HealthStatus::Unknown;
        for _ in 0..2 {
            last = supervisor.advance(&mut state, ProbeOutcome::Success, &cfg);
        }
        assert_eq!(last, HealthStatus::Healthy);
    }
}
