use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

use crate::core::cache::MetricsCache;
use crate::core::settings::Settings;
use crate::daemon::{build_jobs, Converter, SelfMetrics};
use crate::sources::SourceRegistry;

/// Polls every configured query once and prints the exposition payload.
pub async fn run(config: Option<&Path>) -> Result<()> {
    let settings = Settings::load(config)?;
    let sources = SourceRegistry::builtin().resolve(&settings)?;

    let cache = MetricsCache::new();
    let metrics = SelfMetrics::new()?;
    let jobs = build_jobs(&sources, &cache, &metrics);

    let mut failed = 0;
    for job in &jobs {
        tracing::info!(slot = %job.id, "Querying");
        if let Err(e) = job.poller.poll(&job.id, &job.descriptor).await {
            tracing::warn!(slot = %job.id, error = %e, "Query failed");
            failed += 1;
        }
    }

    if failed == jobs.len() {
        anyhow::bail!("All {failed} queries failed");
    }

    let converter = Converter::new(cache, metrics, &settings.converter);
    let (payload, series) = converter
        .render_once()
        .context("Failed to convert billing data")?
        .context("No billing data fetched")?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&payload)?;
    stdout.flush()?;

    tracing::info!(series, failed, "Query finished");
    Ok(())
}
