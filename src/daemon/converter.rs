use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::cache::{keys, CacheValue, MetricsCache};
use crate::core::error::ConvertError;
use crate::core::models::RawResultSet;
use crate::core::settings::ConverterSettings;
use crate::cost;
use crate::daemon::self_metrics::SelfMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOutcome {
    NoRawResults,
    Written { series: usize },
}

/// Turns every raw entry in the cache into one exposition payload.
pub struct Converter {
    cache: MetricsCache,
    metrics: SelfMetrics,
    prefix: String,
    job: String,
    cooldown: Duration,
}

impl Converter {
    pub fn new(cache: MetricsCache, metrics: SelfMetrics, settings: &ConverterSettings) -> Self {
        Self {
            cache,
            metrics,
            prefix: settings.metric_prefix.clone(),
            job: settings.job.clone(),
            cooldown: settings.cooldown(),
        }
    }

    /// Raw sets in slot order, so later queries in the config win ties.
    fn raw_sets(&self) -> Vec<Arc<RawResultSet>> {
        let mut sets: Vec<Arc<RawResultSet>> = self
            .cache
            .snapshot_prefix(keys::RAW_PREFIX)
            .into_iter()
            .filter_map(|(key, entry)| match entry.as_raw(&key) {
                Ok(set) => Some(Arc::clone(set)),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping cache entry");
                    None
                }
            })
            .collect();
        sets.sort_by(|a, b| a.slot.cmp(&b.slot));
        sets
    }

    /// Converts the current raw entries, returning the rendered payload
    /// without storing it.
    pub fn render_once(&self) -> Result<Option<(Bytes, usize)>, ConvertError> {
        let sets = self.raw_sets();
        if sets.is_empty() {
            return Ok(None);
        }

        let series = cost::flatten(sets.iter().map(|set| &**set))?;
        let count = cost::series_count(&series);
        let payload = cost::render(&series, &self.prefix, &self.job)?;
        Ok(Some((Bytes::from(payload), count)))
    }

    /// One conversion pass. A parse failure leaves the previous payload in
    /// place.
    pub fn convert_once(&self) -> Result<ConvertOutcome, ConvertError> {
        let started = Instant::now();

        let Some((payload, series)) = self.render_once()? else {
            return Ok(ConvertOutcome::NoRawResults);
        };

        self.cache
            .put(keys::PROMETHEUS_OUTPUT, CacheValue::Exposition(payload));
        self.metrics.record_conversion(series, started.elapsed());

        Ok(ConvertOutcome::Written { series })
    }

    /// Converts, then sleeps for the cooldown. While no raw results exist it
    /// waits for the next cache write instead.
    pub async fn run(self, cancel: CancellationToken) {
        let mut writes = self.cache.subscribe();

        loop {
            writes.borrow_and_update();

            match self.convert_once() {
                Ok(ConvertOutcome::NoRawResults) => {
                    tracing::debug!("No raw results yet, waiting for the next cache write");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = writes.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
                Ok(ConvertOutcome::Written { series }) => {
                    tracing::info!(series, "Converted billing data");
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        retry_in_secs = self.cooldown.as_secs(),
                        "Conversion failed, keeping previous output"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.cooldown) => {}
            }
        }

        tracing::debug!("Converter stopped");
    }
}
