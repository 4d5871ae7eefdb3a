//! Core library for the sidecar injector.  This module wires together the
//! admission-review envelope structures, the mutation policy, the patch
//! builder and the HTTP handler Kubernetes calls when a Pod is admitted.

mod config;
pub mod metrics;
pub mod patch;
pub mod policy;

pub use config::{AppConfig, LogFormat};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marks a Pod that has already been through injection.  A value of
/// `injected` (any case) suppresses further mutation.
pub const STATUS_ANNOTATION: &str = "redis-exporter-sidecar.nais.io/status";
/// Opt-in trigger.  Truthy values are `y`, `yes`, `true` and `on`, matched
/// case-insensitively.
pub const INJECT_ANNOTATION: &str = "redis-exporter-sidecar.nais.io/inject";
pub const PROMETHEUS_SCRAPE_ANNOTATION: &str = "prometheus.io/scrape";
pub const PROMETHEUS_PORT_ANNOTATION: &str = "prometheus.io/port";
pub const PROMETHEUS_PATH_ANNOTATION: &str = "prometheus.io/path";

const JSON_MEDIA_TYPE: &str = "application/json";

/// Envelope structures for the admission API.  Only the fields this webhook
/// reads or writes are declared; unknown fields are ignored on input and
/// `None` fields are omitted on output.

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    pub namespace: String,
    pub name: String,
    pub operation: String,
    pub user_info: UserInfo,
    /// The serialized Pod under review.
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(default)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct UserInfo {
    pub username: String,
    pub uid: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default)]
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Status>,
    /// Base64-encoded JSON Patch, present only when a mutation was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<PatchType>,
}

/// Patch encodings the admission API understands.  Only JSONPatch is
/// ever produced here.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    #[serde(rename = "JSONPatch")]
    JsonPatch,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Status {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Failures in the request framing itself.  These are the only errors that
/// surface as non-200 responses; everything past body validation reports
/// through the admission-review payload instead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("empty body")]
    EmptyBody,
    #[error("invalid Content-Type {0:?}, expected `application/json`")]
    UnsupportedMediaType(String),
    #[error("could not encode response: {0}")]
    EncodeResponse(#[from] serde_json::Error),
}

impl TransportError {
    fn status(&self) -> StatusCode {
        match self {
            TransportError::EmptyBody => StatusCode::BAD_REQUEST,
            TransportError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            TransportError::EncodeResponse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Internal application state shared across handlers.  The configuration is
/// immutable after startup; the counters feed the metrics listener.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metric_requests_total: Arc<AtomicU64>,
    pub metric_mutations_total: Arc<AtomicU64>,
    pub metric_admission_errors_total: Arc<AtomicU64>,
    // Process start time (epoch secs) and instant for uptime computation
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

pub fn build_state(config: AppConfig) -> AppState {
    let start_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    AppState {
        config: Arc::new(config),
        metric_requests_total: Arc::new(AtomicU64::new(0)),
        metric_mutations_total: Arc::new(AtomicU64::new(0)),
        metric_admission_errors_total: Arc::new(AtomicU64::new(0)),
        process_start_epoch: start_time.as_secs_f64(),
        process_start_instant: Instant::now(),
    }
}

/// Build state from environment variables.  See [`AppConfig::from_env`] for
/// the variables consumed.
pub fn build_state_from_env() -> anyhow::Result<AppState> {
    Ok(build_state(AppConfig::from_env()?))
}

/// Build the Axum router for the webhook listener.  The router holds a copy
/// of the `AppState` for each invocation.
pub fn app(state: AppState) -> Router {
    let router = Router::new().route("/mutate", post(mutate_handler));

    let router = match state.config.max_request_bytes {
        Some(limit) => router.layer(DefaultBodyLimit::max(limit)),
        None => router.layer(DefaultBodyLimit::disable()),
    };

    router.with_state(state)
}

/// Handler for `POST /mutate`.  One request produces exactly one response:
/// framing errors short-circuit with a plain-text status before any domain
/// logic runs, everything else is answered with an admission-review envelope
/// at HTTP 200.
async fn mutate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = validate_body(&headers, &body) {
        tracing::error!(error = %err, "rejecting request before admission processing");
        return err.into_response();
    }
    state.metric_requests_total.fetch_add(1, Ordering::Relaxed);

    let review = process_review(&state, &body);
    match serde_json::to_vec(&review) {
        Ok(buf) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, JSON_MEDIA_TYPE)],
            buf,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "could not encode admission response");
            TransportError::EncodeResponse(err).into_response()
        }
    }
}

fn validate_body(headers: &HeaderMap, body: &Bytes) -> Result<(), TransportError> {
    if body.is_empty() {
        return Err(TransportError::EmptyBody);
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type != JSON_MEDIA_TYPE {
        return Err(TransportError::UnsupportedMediaType(content_type.to_owned()));
    }
    Ok(())
}

/// Decode the inbound envelope and run the mutation pipeline.  Decode
/// failures do not abort the request; they come back inside the response
/// envelope with `result.message` set.  The response uid always mirrors the
/// request uid when a request decoded at all.
fn process_review(state: &AppState, body: &[u8]) -> AdmissionReview {
    let (mut response, request_uid) = match serde_json::from_slice::<AdmissionReview>(body) {
        Ok(AdmissionReview {
            request: Some(request),
            ..
        }) => {
            let response = mutate(state, &request);
            (response, Some(request.uid))
        }
        Ok(_) => {
            tracing::error!("admission review contained no request");
            state
                .metric_admission_errors_total
                .fetch_add(1, Ordering::Relaxed);
            (
                error_response("admission review contained no request".to_owned()),
                None,
            )
        }
        Err(err) => {
            tracing::error!(error = %err, "could not decode admission review");
            state
                .metric_admission_errors_total
                .fetch_add(1, Ordering::Relaxed);
            (error_response(err.to_string()), None)
        }
    };

    if let Some(uid) = request_uid {
        response.uid = uid;
    }
    AdmissionReview {
        response: Some(response),
        ..Default::default()
    }
}

fn error_response(message: String) -> AdmissionResponse {
    AdmissionResponse {
        result: Some(Status { message }),
        ..Default::default()
    }
}

/// Evaluate the mutation policy against the embedded Pod and, when required,
/// attach the patch.  Pod decode and patch serialization failures use the
/// same in-envelope reporting as an envelope decode failure.
fn mutate(state: &AppState, request: &AdmissionRequest) -> AdmissionResponse {
    let pod: Pod = match serde_json::from_value(request.object.clone()) {
        Ok(pod) => pod,
        Err(err) => {
            tracing::error!(error = %err, "could not unmarshal raw pod object");
            state
                .metric_admission_errors_total
                .fetch_add(1, Ordering::Relaxed);
            return error_response(err.to_string());
        }
    };

    tracing::info!(
        kind = ?request.kind,
        namespace = %request.namespace,
        name = %request.name,
        pod = pod.metadata.name.as_deref().unwrap_or_default(),
        uid = %request.uid,
        operation = %request.operation,
        username = %request.user_info.username,
        "admission review received"
    );

    if !policy::mutation_required(&pod.metadata) {
        tracing::info!(
            namespace = %request.namespace,
            name = %request.name,
            "skipping mutation due to policy check"
        );
        return AdmissionResponse {
            allowed: true,
            ..Default::default()
        };
    }

    let patch = match patch::create_patch(&pod) {
        Ok(patch) => patch,
        Err(err) => {
            tracing::error!(error = %err, "could not serialize patch");
            state
                .metric_admission_errors_total
                .fetch_add(1, Ordering::Relaxed);
            return error_response(err.to_string());
        }
    };
    tracing::debug!(patch = %String::from_utf8_lossy(&patch), "patch generated");
    state
        .metric_mutations_total
        .fetch_add(1, Ordering::Relaxed);

    AdmissionResponse {
        allowed: true,
        patch: Some(BASE64.encode(&patch)),
        patch_type: Some(PatchType::JsonPatch),
        ..Default::default()
    }
}
