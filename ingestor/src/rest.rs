use crate::admission::{Admission, AdmissionController};
use crate::audit::{AuditLog, InvalidRequest};
use crate::metrics::{INVALID_REPORTS_TOTAL, RATE_LIMITED_TOTAL, REPORTS_TOTAL};
use crate::model::{FieldViolation, TelemetryReport};
use crate::pipeline::{IngestError, Pipeline};
use crate::store::{with_deadline, Cache, Repository};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub admission: Arc<AdmissionController>,
    pub audit: Arc<AuditLog>,
    pub repo: Arc<dyn Repository>,
    pub cache: Arc<dyn Cache>,
    pub io_timeout: Duration,
    pub trust_proxy_headers: bool,
}

/// Identity the request was admitted under.
#[derive(Debug, Clone)]
struct ClientIdentity(String);

pub fn create_router(state: AppState) -> Router {
    let telemetry = Router::new()
        .route("/telemetry", post(post_telemetry))
        .route_layer(middleware::from_fn_with_state(state.clone(), admission_layer));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .merge(telemetry)
        .with_state(state)
}

/// Socket peer address, or the proxy-reported client when
/// `trust_proxy_headers` is set and a forwarding header is present.
fn client_identity(request: &Request, trust_proxy_headers: bool) -> String {
    let peer = || {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    };
    if !trust_proxy_headers {
        return peer();
    }

    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    if let Some(first) = header("x-forwarded-for").and_then(|v| v.split(',').next()) {
        return first.trim().to_string();
    }
    if let Some(real_ip) = header("x-real-ip") {
        return real_ip.to_string();
    }
    peer()
}

async fn admission_layer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let client = client_identity(&request, state.trust_proxy_headers);

    match state.admission.admit(&client).await {
        Admission::Allowed => {
            request.extensions_mut().insert(ClientIdentity(client));
            next.run(request).await
        }
        Admission::Denied { retry_after } => {
            RATE_LIMITED_TOTAL.inc();
            warn!("Rate limit exceeded for {}", client);
            rate_limited(retry_after)
        }
    }
}

fn rate_limited(retry_after: Duration) -> Response {
    let secs = retry_after.as_secs().max(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "rate limit exceeded" })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    response
}

async fn post_telemetry(
    State(state): State<AppState>,
    Extension(ClientIdentity(client)): Extension<ClientIdentity>,
    body: Bytes,
) -> Result<Response, AppError> {
    REPORTS_TOTAL.with_label_values(&["http"]).inc();

    let report: TelemetryReport = match serde_json::from_slice(&body) {
        Ok(report) => report,
        Err(e) => {
            INVALID_REPORTS_TOTAL.inc();
            warn!("Malformed telemetry JSON from {}: {}", client, e);
            log_invalid(&state.audit, &client, None, &[malformed_json()]);
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid JSON payload" })),
            )
                .into_response());
        }
    };

    // Detached so a dropped connection cannot cancel an in-flight insert.
    let pipeline = state.pipeline.clone();
    let (report, outcome) = tokio::spawn(async move {
        let outcome = pipeline.ingest(&report).await;
        (report, outcome)
    })
    .await?;

    match outcome {
        Ok(ingested) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": "telemetry processed",
                "measurement_id": ingested.measurement_id,
            })),
        )
            .into_response()),
        Err(IngestError::Validation(violations)) => {
            log_invalid(&state.audit, &client, Some(&report), &violations);
            Ok(IngestError::Validation(violations).into_response())
        }
        Err(e) => Ok(e.into_response()),
    }
}

pub fn malformed_json() -> FieldViolation {
    FieldViolation {
        field: "json",
        message: "malformed JSON payload",
    }
}

/// Appends to the invalid-request audit file; failures are only logged.
pub fn log_invalid(
    audit: &AuditLog,
    client: &str,
    report: Option<&TelemetryReport>,
    violations: &[FieldViolation],
) {
    let entry = InvalidRequest {
        at: Utc::now(),
        client,
        identifier: report.map(|r| r.identifier.as_str()),
        latitude: report.and_then(|r| r.latitude),
        longitude: report.and_then(|r| r.longitude),
        violations,
    };
    if let Err(e) = audit.log_invalid_request(&entry) {
        warn!("Failed to write invalid-request log: {}", e);
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

async fn ready(State(state): State<AppState>) -> Response {
    let (db, cache) = tokio::join!(
        with_deadline(state.io_timeout, "database ping", state.repo.ping()),
        with_deadline(state.io_timeout, "cache ping", state.cache.ping()),
    );

    let describe = |r: &crate::errors::Result<()>| match r {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    };
    let status = if db.is_ok() && cache.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ready" } else { "unavailable" },
            "database": describe(&db),
            "cache": describe(&cache),
        })),
    )
        .into_response()
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::Validation(fields) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "validation failed", "fields": fields })),
            )
                .into_response(),
            IngestError::DeviceNotFound(identifier) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "device not found", "identifier": identifier })),
            )
                .into_response(),
            IngestError::Internal(e) => AppError(e.into()).into_response(),
        }
    }
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to process telemetry" })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
