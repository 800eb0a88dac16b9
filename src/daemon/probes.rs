use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use crate::core::cache::MetricsCache;
use crate::core::settings::ProbeSettings;

const EMPTY_CACHE: &str = "503 - Metrics cache is empty";

/// Liveness, readiness and startup share one rule: the process is healthy
/// once anything has been written to the cache.
pub fn router(cache: MetricsCache, settings: &ProbeSettings) -> Router {
    let mut router = Router::new();
    let mut seen: Vec<&str> = Vec::new();

    for path in [&settings.liveness, &settings.readiness, &settings.startup] {
        if seen.contains(&path.as_str()) {
            continue;
        }
        seen.push(path);
        router = router.route(path, get(probe));
    }

    router.with_state(cache)
}

async fn probe(State(cache): State<MetricsCache>) -> (StatusCode, &'static str) {
    if cache.is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, EMPTY_CACHE)
    } else {
        (StatusCode::OK, "OK")
    }
}
