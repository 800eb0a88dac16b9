use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::{BufMut, BytesMut};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::core::cache::{keys, MetricsCache};
use crate::core::error::CacheError;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
struct OutputState {
    cache: MetricsCache,
    path: String,
}

pub fn router(cache: MetricsCache, path: &str) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route(path, get(metrics))
        .with_state(OutputState {
            cache,
            path: path.to_string(),
        })
}

async fn welcome(State(state): State<OutputState>) -> String {
    format!("Welcome to Costs Exporter! Check out the {} endpoint", state.path)
}

/// Cost payload followed by the exporter's own metrics.
fn assemble(cache: &MetricsCache) -> Result<BytesMut, CacheError> {
    let mut body = BytesMut::new();

    for key in [keys::PROMETHEUS_OUTPUT, keys::SELF_METRICS] {
        let payload = match cache.get_exposition(key) {
            Ok(payload) => payload,
            // Self metrics are optional, the cost payload is not.
            Err(CacheError::Missing(_)) if key == keys::SELF_METRICS => continue,
            Err(e) => return Err(e),
        };

        body.put_slice(format!("# Metrics from {key}\n").as_bytes());
        body.put_slice(&payload);
        if !payload.ends_with(b"\n") {
            body.put_u8(b'\n');
        }
    }

    Ok(body)
}

async fn metrics(State(state): State<OutputState>) -> Response {
    tracing::debug!("Got request for metrics");

    match assemble(&state.cache) {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body.freeze()).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Cannot serve metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to bind {host}:{port}"))
}

/// Serves `router` until `cancel` fires.
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().ok();
    tracing::info!(server = name, ?addr, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .with_context(|| format!("{name} server failed"))?;

    tracing::info!(server = name, "Server stopped");
    Ok(())
}
