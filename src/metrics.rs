//! Liveness, readiness and metrics endpoints.  These run on their own
//! plaintext listener so scrapes and probes never touch the TLS webhook
//! listener.

use std::fmt::Write as _;
use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::AppState;

pub fn metrics_app(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/isAlive", get(health_handler))
        .route("/isReady", get(health_handler))
        .with_state(state)
}

/// Serves both probes; the webhook has no warm-up phase, so alive and ready
/// coincide.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Prometheus-style metrics exposition.  Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let requests = state.metric_requests_total.load(Ordering::Relaxed);
    let mutations = state.metric_mutations_total.load(Ordering::Relaxed);
    let errors = state.metric_admission_errors_total.load(Ordering::Relaxed);
    let uptime_secs = state.process_start_instant.elapsed().as_secs_f64();

    let mut buf = String::new();
    writeln!(
        &mut buf,
        "# HELP injector_requests_total Admission requests processed"
    )
    .ok();
    writeln!(&mut buf, "# TYPE injector_requests_total counter").ok();
    writeln!(&mut buf, "injector_requests_total {}", requests).ok();
    writeln!(
        &mut buf,
        "# HELP injector_mutations_total Sidecar patches issued"
    )
    .ok();
    writeln!(&mut buf, "# TYPE injector_mutations_total counter").ok();
    writeln!(&mut buf, "injector_mutations_total {}", mutations).ok();
    writeln!(
        &mut buf,
        "# HELP injector_admission_errors_total Admission requests answered with an error message"
    )
    .ok();
    writeln!(&mut buf, "# TYPE injector_admission_errors_total counter").ok();
    writeln!(&mut buf, "injector_admission_errors_total {}", errors).ok();
    writeln!(
        &mut buf,
        "# HELP injector_build_info Build information\n# TYPE injector_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "injector_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP injector_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE injector_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "injector_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP injector_process_uptime_seconds Process uptime seconds\n# TYPE injector_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(&mut buf, "injector_process_uptime_seconds {}", uptime_secs).ok();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
}
