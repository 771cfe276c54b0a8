//! Autoscaler: per-signal pressure factors, cooldown, hysteresis, and
//! stabilization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use meridian_storage::model::{Application, MetricType, NewEvent, ScalingPolicy, Severity};
use meridian_storage::StoreGateway;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use crate::metrics::MetricsAggregator;

/// Direction of a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// Pressure factor per signal, `None` when the underlying metric has no
/// samples in the evaluation window.
#[derive(Debug, Clone, Copy, Default)]
pub struct Factors {
    pub cpu: Option<f64>,
    pub mem: Option<f64>,
    pub rps: Option<f64>,
    pub latency: Option<f64>,
    pub conn: Option<f64>,
}

impl Factors {
    fn as_json(self) -> serde_json::Value {
        json!({
            "cpu": self.cpu,
            "mem": self.mem,
            "rps": self.rps,
            "latency": self.latency,
            "conn": self.conn,
        })
    }
}

/// The outcome of one autoscaler evaluation tick for one application.
#[derive(Debug, Clone)]
pub struct ScalingDecision {
    pub direction: Option<Direction>,
    pub from_replicas: u32,
    pub to_replicas: u32,
    pub dominant_signal: Option<&'static str>,
    pub factors: Factors,
    pub reason: String,
}

impl ScalingDecision {
    fn no_op(current: u32, reason: &str, factors: Factors) -> Self {
        Self {
            direction: None,
            from_replicas: current,
            to_replicas: current,
            dominant_signal: None,
            factors,
            reason: reason.to_owned(),
        }
    }

    /// Builds the `scaling_decision` event detail blob per the resolved
    /// minimum shape: `{direction, from_replicas, to_replicas,
    /// dominant_signal, factors: {cpu, mem, rps, latency, conn}}`.
    fn as_event_details(&self) -> serde_json::Value {
        json!({
            "direction": self.direction.map(|d| match d {
                Direction::Out => "out",
                Direction::In => "in",
            }),
            "from_replicas": self.from_replicas,
            "to_replicas": self.to_replicas,
            "dominant_signal": self.dominant_signal,
            "factors": self.factors.as_json(),
        })
    }
}

/// Evaluates scaling policies against aggregated metrics and emits
/// `scaling_decision` events.
pub struct Autoscaler {
    metrics: Arc<MetricsAggregator>,
    last_direction: RwLock<HashMap<String, (Direction, DateTime<Utc>)>>,
}

impl Autoscaler {
    #[must_use]
    pub fn new(metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            metrics,
            last_direction: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate one application for one tick. `healthy_replicas` is the
    /// current count of `running ∧ healthy` instances, used as the
    /// denominator for per-replica signals.
    pub async fn evaluate(
        &self,
        app: &Application,
        policy: &ScalingPolicy,
        healthy_replicas: u32,
        now: DateTime<Utc>,
    ) -> ScalingDecision {
        let current = app.current_replicas;
        let window = Duration::from_secs(u64::from(policy.evaluation_window_seconds.max(1)));

        let cpu = self
            .metrics
            .aggregate(&app.name, MetricType::CpuPercent, window, now, true)
            .await;
        let mem = self
            .metrics
            .aggregate(&app.name, MetricType::MemoryPercent, window, now, true)
            .await;
        let rps = self
            .metrics
            .aggregate(&app.name, MetricType::Rps, window, now, true)
            .await;
        let latency = self
            .metrics
            .aggregate(&app.name, MetricType::P95LatencyMs, window, now, true)
            .await;
        let conn = self
            .metrics
            .aggregate(&app.name, MetricType::Connections, window, now, false)
            .await;

        let f_cpu = cpu.map(|v| v / policy.max_cpu_percent);
        let f_mem = mem.map(|v| v / policy.max_memory_percent);
        let f_rps = (healthy_replicas > 0)
            .then_some(())
            .and_then(|()| rps.map(|v| (v / f64::from(healthy_replicas)) / policy.target_rps_per_replica));
        let f_lat = latency.map(|v| v / policy.max_p95_latency_ms);
        let f_conn = (healthy_replicas > 0).then_some(()).and_then(|()| {
            conn.map(|v| (v / f64::from(healthy_replicas)) / policy.max_conn_per_replica)
        });

        let factors = Factors {
            cpu: f_cpu,
            mem: f_mem,
            rps: f_rps,
            latency: f_lat,
            conn: f_conn,
        };

        if let Some(last) = app.last_scaled_at {
            if now - last < ChronoDuration::seconds(i64::from(policy.cooldown_seconds)) {
                return ScalingDecision::no_op(current, "in cooldown", factors);
            }
        }

        let defined: Vec<(&'static str, f64)> = [
            ("cpu", f_cpu),
            ("mem", f_mem),
            ("rps", f_rps),
            ("latency", f_lat),
            ("conn", f_conn),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect();

        if defined.is_empty() {
            return ScalingDecision::no_op(current, "no signals available", factors);
        }

        let scale_out_threshold = f64::from(policy.scale_out_threshold_pct) / 100.0;
        let scale_in_threshold = f64::from(policy.scale_in_threshold_pct) / 100.0;

        let (dominant_signal, max_factor) = defined
            .iter()
            .copied()
            .fold(("cpu", f64::MIN), |(dn, dv), (n, v)| if v > dv { (n, v) } else { (dn, dv) });

        let direction = if max_factor > scale_out_threshold {
            Some(Direction::Out)
        } else if defined.iter().all(|(_, v)| *v < scale_in_threshold) && current > policy.min_replicas {
            Some(Direction::In)
        } else {
            None
        };

        let Some(direction) = direction else {
            return ScalingDecision::no_op(current, "metrics within band", factors);
        };

        if self.blocked_by_stabilization(&app.name, direction, now, policy).await {
            return ScalingDecision::no_op(current, "stabilization window active", factors);
        }
        self.record_direction(&app.name, direction, now).await;

        match direction {
            Direction::Out => {
                let mut target = current
                    .saturating_add(1)
                    .max(((f64::from(current) * max_factor).ceil()) as u32);
                target = target.min(policy.max_replicas);
                if policy.max_scale_out_step > 0 {
                    target = target.min(current.saturating_add(policy.max_scale_out_step));
                }
                let double_cap = if current == 0 { 1 } else { current.saturating_mul(2) };
                target = target.min(double_cap).max(current);

                info!(app = %app.name, from = current, to = target, dominant_signal, "scale out decision");
                ScalingDecision {
                    direction: Some(Direction::Out),
                    from_replicas: current,
                    to_replicas: target,
                    dominant_signal: Some(dominant_signal),
                    factors,
                    reason: format!("pressure on {dominant_signal} exceeded scale-out threshold"),
                }
            }
            Direction::In => {
                let max_drop = policy.max_scale_in_step.max(1);
                let aggressive = defined.iter().all(|(_, v)| *v < 0.1);
                let drop = if aggressive { max_drop } else { 1 };
                let target = current
                    .saturating_sub(drop)
                    .max(policy.min_replicas)
                    .max(current.saturating_sub(max_drop));

                info!(app = %app.name, from = current, to = target, dominant_signal, "scale in decision");
                ScalingDecision {
                    direction: Some(Direction::In),
                    from_replicas: current,
                    to_replicas: target,
                    dominant_signal: Some(dominant_signal),
                    factors,
                    reason: "all signals below scale-in threshold".to_owned(),
                }
            }
        }
    }

    async fn blocked_by_stabilization(
        &self,
        app_name: &str,
        direction: Direction,
        now: DateTime<Utc>,
        policy: &ScalingPolicy,
    ) -> bool {
        let last = self.last_direction.read().await;
        match last.get(app_name) {
            Some(&(prev_direction, prev_at)) if prev_direction != direction => {
                now - prev_at < ChronoDuration::seconds(i64::from(policy.stabilization_window_seconds))
            }
            _ => false,
        }
    }

    async fn record_direction(&self, app_name: &str, direction: Direction, now: DateTime<Utc>) {
        self.last_direction
            .write()
            .await
            .insert(app_name.to_owned(), (direction, now));
    }

    /// Append the `scaling_decision` event for an evaluation, whatever the
    /// outcome (including no-ops, which are useful for observability).
    pub async fn emit_decision(
        &self,
        store: &Arc<dyn StoreGateway>,
        app_name: &str,
        decision: &ScalingDecision,
    ) {
        let event = NewEvent {
            app_name: Some(app_name.to_owned()),
            container_id: None,
            event_type: "scaling_decision".to_owned(),
            severity: Severity::Info,
            message: decision.reason.clone(),
            details: decision.as_event_details(),
        };
        if let Err(err) = store.append_event(event).await {
            tracing::warn!(error = %err, app_name, "failed to append scaling_decision event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDur;

    fn app(current: u32, last_scaled_at: Option<DateTime<Utc>>) -> Application {
        Application {
            name: "alpha".to_owned(),
            spec: json!({}),
            status: meridian_storage::model::AppStatus::Running,
            desired_replicas: current,
            current_replicas: current,
            mode: meridian_storage::model::ScalingMode::Auto,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_scaled_at,
        }
    }

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            max_cpu_percent: 70.0,
            scale_out_threshold_pct: 80,
            scale_in_threshold_pct: 30,
            cooldown_seconds: 30,
            ..ScalingPolicy::default_for("alpha")
        }
    }

    #[tokio::test]
    async fn scales_out_when_cpu_exceeds_threshold() {
        let metrics = Arc::new(MetricsAggregator::new(100, 0.3));
        let now = Utc::now();
        for i in 0..5 {
            metrics
                .record("alpha", MetricType::CpuPercent, 85.0, now - ChronoDur::seconds(i))
                .await;
        }
        let autoscaler = Autoscaler::new(metrics);
        let decision = autoscaler.evaluate(&app(3, None), &policy(), 3, now).await;

        assert_eq!(decision.direction, Some(Direction::Out));
        // min(max_replicas, max(current+1, ceil(current * 0.85/0.7)))
        let expected = ((3.0_f64 * (85.0 / 70.0)).ceil() as u32).max(4).min(10);
        assert_eq!(decision.to_replicas, expected);
    }

    #[tokio::test]
    async fn does_not_scale_in_unless_every_signal_is_low() {
        let metrics = Arc::new(MetricsAggregator::new(100, 0.3));
        let now = Utc::now();
        metrics.record("alpha", MetricType::CpuPercent, 10.0, now).await;
        metrics.record("alpha", MetricType::P95LatencyMs, 400.0, now).await;
        let autoscaler = Autoscaler::new(metrics);
        let decision = autoscaler.evaluate(&app(4, None), &policy(), 4, now).await;

        assert_eq!(decision.direction, None);
    }

    #[tokio::test]
    async fn respects_cooldown() {
        let metrics = Arc::new(MetricsAggregator::new(100, 0.3));
        let now = Utc::now();
        metrics.record("alpha", MetricType::CpuPercent, 95.0, now).await;
        let autoscaler = Autoscaler::new(metrics);
        let recently_scaled = Some(now - ChronoDur::seconds(5));
        let decision = autoscaler
            .evaluate(&app(3, recently_scaled), &policy(), 3, now)
            .await;

        assert_eq!(decision.direction, None);
        assert_eq!(decision.reason, "in cooldown");
    }
}
