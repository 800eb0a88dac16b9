use anyhow::{Context, Result};
use bytes::Bytes;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::cache::{keys, CacheValue, MetricsCache};

const NAMESPACE: &str = "cost_exporter";

/// Billing calls take seconds, a full conversion a few milliseconds.
const CALL_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];
const CONVERSION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Counters about the exporter itself, held in a registry owned by the daemon.
#[derive(Clone)]
pub struct SelfMetrics {
    registry: Registry,
    calls: IntCounterVec,
    call_duration: Histogram,
    cost_metrics: IntGauge,
    conversion_duration: Histogram,
}

impl SelfMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let calls = IntCounterVec::new(
            Opts::new("aws_calls_total", "Cost Explorer calls by outcome").namespace(NAMESPACE),
            &["result"],
        )?;
        let call_duration = Histogram::with_opts(
            HistogramOpts::new(
                "aws_get_metrics_duration_seconds",
                "Duration of a full GetCostAndUsage poll, pagination included",
            )
            .namespace(NAMESPACE)
            .buckets(CALL_BUCKETS.to_vec()),
        )?;
        let cost_metrics = IntGauge::with_opts(
            Opts::new("cost_metrics", "Series produced by the last conversion").namespace(NAMESPACE),
        )?;
        let conversion_duration = Histogram::with_opts(
            HistogramOpts::new(
                "conversion_duration_seconds",
                "Duration of one raw to exposition conversion",
            )
            .namespace(NAMESPACE)
            .buckets(CONVERSION_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(calls.clone()))?;
        registry.register(Box::new(call_duration.clone()))?;
        registry.register(Box::new(cost_metrics.clone()))?;
        registry.register(Box::new(conversion_duration.clone()))?;

        // Both outcomes show up as 0 before the first poll.
        calls.with_label_values(&["success"]);
        calls.with_label_values(&["failure"]);

        Ok(Self {
            registry,
            calls,
            call_duration,
            cost_metrics,
            conversion_duration,
        })
    }

    pub fn record_call(&self, success: bool, elapsed: Duration) {
        let result = if success { "success" } else { "failure" };
        self.calls.with_label_values(&[result]).inc();
        self.call_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_conversion(&self, series: usize, elapsed: Duration) {
        self.cost_metrics.set(series as i64);
        self.conversion_duration.observe(elapsed.as_secs_f64());
    }

    pub fn calls(&self, result: &str) -> u64 {
        self.calls.with_label_values(&[result]).get()
    }

    pub fn render(&self) -> Result<Bytes> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode self metrics")?;
        Ok(Bytes::from(buffer))
    }

    pub fn publish(&self, cache: &MetricsCache) -> Result<()> {
        cache.put(keys::SELF_METRICS, CacheValue::Exposition(self.render()?));
        Ok(())
    }
}

/// Writes the self metrics into the cache on a fixed interval, starting
/// immediately.
pub async fn run_publisher(
    metrics: SelfMetrics,
    cache: MetricsCache,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = metrics.publish(&cache) {
                    tracing::warn!(error = %e, "Failed to publish self metrics");
                }
            }
        }
    }

    tracing::debug!("Self metrics publisher stopped");
}
