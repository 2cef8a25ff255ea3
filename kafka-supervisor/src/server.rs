//! Health and metrics endpoints of the mirror service.

use std::future::ready;
use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use health::HealthRegistry;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::metrics_consts::{ENDPOINT_REQUESTS, ENDPOINT_REQUEST_DURATION};

// Probes and scrapes answer from memory, nothing should take long
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

pub async fn index() -> &'static str {
    "kafka mirror"
}

/// Installs the global prometheus recorder, once per process.
pub fn install_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(ENDPOINT_REQUEST_DURATION.to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()
}

/// Routes served next to the consumer: `/_liveness` reports the registry
/// verdict, `/_readiness` only says the process is up.
pub fn router(liveness: HealthRegistry, metrics: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/metrics", get(move || ready(metrics.render())))
        .layer(axum::middleware::from_fn(track_requests))
}

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

async fn track_requests(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };

    let response = next.run(req).await;

    let labels = [
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    counter!(ENDPOINT_REQUESTS, &labels).increment(1);
    histogram!(ENDPOINT_REQUEST_DURATION, &labels).record(start.elapsed().as_secs_f64());
    response
}
