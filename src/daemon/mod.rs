mod converter;
mod poller;
mod probes;
mod scheduler;
mod self_metrics;
mod server;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::cache::MetricsCache;
use crate::core::credentials::CredentialsWatcher;
use crate::core::settings::Settings;
use crate::sources::{Source, SourceRegistry};

pub use converter::Converter;
pub use poller::Poller;
pub use scheduler::{Job, Scheduler};
pub use self_metrics::SelfMetrics;

/// One job per configured query, each with a poller bound to its client.
pub fn build_jobs(sources: &[Source], cache: &MetricsCache, metrics: &SelfMetrics) -> Vec<Job> {
    sources
        .iter()
        .flat_map(|source| {
            let poller = Poller::new(
                Arc::clone(&source.client),
                cache.clone(),
                metrics.clone(),
                source.max_pages,
            );
            source.queries.iter().map(move |(id, descriptor)| Job {
                id: id.clone(),
                descriptor: Arc::clone(descriptor),
                poller: poller.clone(),
            })
        })
        .collect()
}

fn credentials_paths(sources: &[Source]) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = sources
        .iter()
        .flat_map(|source| source.client.credential_files())
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

pub async fn run(settings: Settings) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting cost-meter daemon");

    let cache = MetricsCache::new();
    let metrics = SelfMetrics::new().context("Failed to register self metrics")?;
    let sources = SourceRegistry::builtin().resolve(&settings)?;
    let jobs = build_jobs(&sources, &cache, &metrics);

    let (_credentials_watcher, credentials_rx) =
        CredentialsWatcher::start(credentials_paths(&sources))?;

    let output_listener = server::bind(&settings.output.host, settings.output.port).await?;
    let probe_listener = server::bind(&settings.probes.host, settings.probes.port).await?;

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    tasks.spawn(server::serve(
        "output",
        output_listener,
        server::router(cache.clone(), &settings.output.path),
        cancel.clone(),
    ));
    tasks.spawn(server::serve(
        "probes",
        probe_listener,
        probes::router(cache.clone(), &settings.probes),
        cancel.clone(),
    ));

    let publisher = self_metrics::run_publisher(
        metrics.clone(),
        cache.clone(),
        settings.self_metrics.interval(),
        cancel.clone(),
    );
    tasks.spawn(async move {
        publisher.await;
        Ok(())
    });

    let converter = Converter::new(cache.clone(), metrics.clone(), &settings.converter);
    let converter_cancel = cancel.clone();
    tasks.spawn(async move {
        converter.run(converter_cancel).await;
        Ok(())
    });

    let scheduler = Scheduler::new(
        jobs,
        settings.scheduler.retry_policy(),
        settings.scheduler.failure_policy,
    );
    let scheduler_cancel = cancel.clone();
    tasks.spawn(async move {
        scheduler
            .run(credentials_rx, scheduler_cancel)
            .await
            .context("Scheduler aborted")
    });

    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.context("Daemon task panicked").and_then(|r| r);
        if let Err(e) = outcome {
            tracing::error!(error = %format!("{e:#}"), "Daemon task failed, shutting down");
            cancel.cancel();
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    tracing::info!("Daemon stopped");
    result
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
                return;
            }
        }
        _ = terminate => {}
    }

    tracing::info!("Shutdown requested");
    cancel.cancel();
}
