//! Metrics Aggregator: bounded rolling windows per `(app, signal)`.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use meridian_storage::model::MetricType;
use tokio::sync::RwLock;

/// Default ring capacity per `(app_name, metric_type)`, in samples.
pub const DEFAULT_RING_CAPACITY: usize = 4096;

/// Default EWMA smoothing factor.
pub const DEFAULT_EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: DateTime<Utc>,
    value: f64,
}

/// A fixed-capacity ring buffer of timestamped samples for one signal.
struct Ring {
    capacity: usize,
    samples: VecDeque<Sample>,
    smoothed: Option<f64>,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            smoothed: None,
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn window(&self, since: DateTime<Utc>) -> impl Iterator<Item = &Sample> {
        self.samples.iter().filter(move |s| s.timestamp >= since)
    }
}

/// Whether a metric's in-window aggregate is a mean, a rate, a quantile, or
/// a latest-value snapshot, per `spec.md` §4.5.
fn aggregate_kind(metric_type: MetricType) -> AggregateKind {
    match metric_type {
        MetricType::CpuPercent | MetricType::MemoryPercent => AggregateKind::Mean,
        MetricType::Rps => AggregateKind::Rate,
        MetricType::P95LatencyMs => AggregateKind::P95,
        MetricType::Connections | MetricType::HealthyReplicas => AggregateKind::Latest,
    }
}

enum AggregateKind {
    Mean,
    Rate,
    P95,
    Latest,
}

/// Rolling per-app, per-signal metrics store feeding the Autoscaler.
pub struct MetricsAggregator {
    rings: RwLock<HashMap<(String, MetricTypeKey), Ring>>,
    ring_capacity: usize,
    ewma_alpha: f64,
}

/// `MetricType` does not implement `Hash`; key it by its `Display` string
/// instead of adding a derive the enum doesn't otherwise need.
type MetricTypeKey = String;

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY, DEFAULT_EWMA_ALPHA)
    }
}

impl MetricsAggregator {
    #[must_use]
    pub fn new(ring_capacity: usize, ewma_alpha: f64) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            ring_capacity,
            ewma_alpha,
        }
    }

    /// Record one sample for `(app_name, metric_type)`.
    pub async fn record(&self, app_name: &str, metric_type: MetricType, value: f64, at: DateTime<Utc>) {
        let mut rings = self.rings.write().await;
        let ring = rings
            .entry((app_name.to_owned(), metric_type.to_string()))
            .or_insert_with(|| Ring::new(self.ring_capacity));
        ring.push(Sample { timestamp: at, value });
    }

    /// Aggregate `(app_name, metric_type)` over the trailing `window`,
    /// applying EWMA smoothing for continuous signals when `smooth` is set.
    /// Returns `None` if there are no samples in the window (an "undefined
    /// signal", per the autoscaler's skip rule).
    pub async fn aggregate(
        &self,
        app_name: &str,
        metric_type: MetricType,
        window: std::time::Duration,
        now: DateTime<Utc>,
        smooth: bool,
    ) -> Option<f64> {
        let since = now - ChronoDuration::from_std(window).unwrap_or_default();
        let mut rings = self.rings.write().await;
        let ring = rings.get_mut(&(app_name.to_owned(), metric_type.to_string()))?;

        let raw = match aggregate_kind(metric_type) {
            AggregateKind::Mean => mean(ring.window(since)),
            AggregateKind::Rate => rate(ring.window(since), window),
            AggregateKind::P95 => p95(ring.window(since)),
            AggregateKind::Latest => ring.samples.back().map(|s| s.value),
        }?;

        if smooth && matches!(aggregate_kind(metric_type), AggregateKind::Mean | AggregateKind::Rate | AggregateKind::P95) {
            let smoothed = match ring.smoothed {
                Some(prev) => self.ewma_alpha * raw + (1.0 - self.ewma_alpha) * prev,
                None => raw,
            };
            ring.smoothed = Some(smoothed);
            Some(smoothed)
        } else {
            Some(raw)
        }
    }
}

fn mean<'a>(samples: impl Iterator<Item = &'a Sample>) -> Option<f64> {
    let (sum, count) = samples.fold((0.0, 0_usize), |(sum, count), s| (sum + s.value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Rate of a monotonically increasing counter across the window, in units
/// per second.
fn rate<'a>(samples: impl Iterator<Item = &'a Sample>, window: std::time::Duration) -> Option<f64> {
    let collected: Vec<&Sample> = samples.collect();
    if collected.len() < 2 {
        return None;
    }
    let first = collected.first()?;
    let last = collected.last()?;
    let delta = last.value - first.value;
    let seconds = window.as_secs_f64().max(1.0);
    Some((delta / seconds).max(0.0))
}

fn p95<'a>(samples: impl Iterator<Item = &'a Sample>) -> Option<f64> {
    let mut values: Vec<f64> = samples.map(|s| s.value).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = ((values.len() as f64) * 0.95).ceil() as usize;
    let index = rank.saturating_sub(1).min(values.len() - 1);
    Some(values[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mean_aggregates_cpu_samples_in_window() {
        let aggregator = MetricsAggregator::new(100, DEFAULT_EWMA_ALPHA);
        let now = Utc::now();
        for (i, value) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            aggregator
                .record("alpha", MetricType::CpuPercent, value, now - ChronoDuration::seconds(i as i64))
                .await;
        }
        let result = aggregator
            .aggregate("alpha", MetricType::CpuPercent, std::time::Duration::from_secs(60), now, false)
            .await;
        assert_eq!(result, Some(20.0));
    }

    #[tokio::test]
    async fn missing_signal_returns_none() {
        let aggregator = MetricsAggregator::new(100, DEFAULT_EWMA_ALPHA);
        let now = Utc::now();
        let result = aggregator
            .aggregate("alpha", MetricType::Rps, std::time::Duration::from_secs(60), now, false)
            .await;
        assert!(result.is_none());
    }

    #[test]
    fn p95_picks_the_right_rank() {
        let samples: Vec<Sample> = (1..=100)
            .map(|v| Sample {
                timestamp: Utc::now(),
                value: f64::from(v),
            })
            .collect();
        assert_eq!(p95(samples.iter()), Some(95.0));
    }
}
