//! HTTP request handlers for the engine API.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use lookout_alerts::{to_datetime, AlertError, Notification, Silence};
use lookout_metrics::prometheus::EngineMetrics;
use lookout_metrics::LabelMatcher;
use lookout_rules::{AlertInstance, Element, RuleStatus};
use lookout_scrape::TargetStatus;
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::{ApiError, ApiResult};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status message.
    pub status: String,
    /// Active configuration generation.
    pub generation: u64,
    /// Seconds since the engine was created.
    pub uptime_secs: u64,
}

/// Handle GET /-/healthy.
pub async fn health_check(State(engine): State<Arc<Engine>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        generation: engine.config().generation(),
        uptime_secs: engine.uptime_secs(),
    })
}

/// Reload response.
#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    /// Status message.
    pub status: String,
    /// The configuration generation now active.
    pub generation: u64,
}

/// Handle POST /-/reload - re-read the configuration file.
pub async fn reload(State(engine): State<Arc<Engine>>) -> ApiResult<Json<ReloadResponse>> {
    let generation = engine.reload().await?;
    Ok(Json(ReloadResponse {
        status: "ok".to_string(),
        generation,
    }))
}

/// Handle GET /metrics - engine self-telemetry in exposition format.
pub async fn metrics(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, EngineMetrics::content_type())],
        engine.metrics().encode(),
    )
}

/// An alert with its silencing state.
#[derive(Debug, Serialize)]
pub struct AlertView {
    /// The alert instance.
    #[serde(flatten)]
    pub alert: AlertInstance,
    /// Id of the silence suppressing the alert's notifications.
    pub silenced_by: Option<String>,
}

/// Handle GET /api/v1/alerts - pending and firing alerts.
pub async fn list_alerts(State(engine): State<Arc<Engine>>) -> Json<Vec<AlertView>> {
    let now = to_datetime(engine.clock().now_millis());
    let silences = engine.router().silences();
    let alerts = engine
        .evaluator()
        .alerts()
        .into_iter()
        .map(|alert| AlertView {
            silenced_by: silences.silenced_by(&alert.labels, now),
            alert,
        })
        .collect();
    Json(alerts)
}

/// Handle GET /api/v1/rules.
pub async fn list_rules(State(engine): State<Arc<Engine>>) -> Json<Vec<RuleStatus>> {
    Json(engine.evaluator().rules())
}

/// Handle GET /api/v1/targets.
pub async fn list_targets(State(engine): State<Arc<Engine>>) -> Json<Vec<TargetStatus>> {
    Json(engine.scraper().targets())
}

/// Handle GET /api/v1/notifications/failed - notifications that ran out of attempts.
pub async fn list_failed_notifications(
    State(engine): State<Arc<Engine>>,
) -> Json<Vec<Notification>> {
    Json(engine.router().failed())
}

/// Handle GET /api/v1/silences.
pub async fn list_silences(State(engine): State<Arc<Engine>>) -> Json<Vec<Silence>> {
    Json(engine.router().silences().list())
}

/// Body of POST /api/v1/silences.
#[derive(Debug, Deserialize)]
pub struct CreateSilenceRequest {
    /// Matchers in text form, e.g. `job="batch"`.
    pub matchers: Vec<String>,
    /// Start of the silence; defaults to now.
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    /// End of the silence.
    pub ends_at: DateTime<Utc>,
    /// Who created the silence.
    #[serde(default = "default_created_by")]
    pub created_by: String,
    /// Free-form comment.
    #[serde(default)]
    pub comment: String,
}

fn default_created_by() -> String {
    "api".to_string()
}

/// Response of POST /api/v1/silences.
#[derive(Debug, Serialize)]
pub struct CreateSilenceResponse {
    /// Id of the new silence.
    pub id: String,
}

/// Handle POST /api/v1/silences.
pub async fn create_silence(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<CreateSilenceRequest>,
) -> ApiResult<(StatusCode, Json<CreateSilenceResponse>)> {
    let matchers = request
        .matchers
        .iter()
        .map(|m| {
            LabelMatcher::parse(m)
                .map_err(|e| ApiError::InvalidRequest(format!("matcher '{m}': {e}")))
        })
        .collect::<ApiResult<Vec<_>>>()?;

    let now = to_datetime(engine.clock().now_millis());
    let silence = Silence::new(
        matchers,
        request.starts_at.unwrap_or(now),
        request.ends_at,
        request.created_by,
        request.comment,
    )
    .map_err(alert_error)?;

    let id = engine.router().silences().add(silence);
    Ok((StatusCode::CREATED, Json(CreateSilenceResponse { id })))
}

/// Handle DELETE /api/v1/silences/{id} - expire a silence now.
pub async fn expire_silence(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Silence>> {
    let now = to_datetime(engine.clock().now_millis());
    engine
        .router()
        .silences()
        .expire(&id, now)
        .map(Json)
        .map_err(alert_error)
}

/// Query parameters of GET /api/v1/query.
#[derive(Debug, Deserialize)]
pub struct QueryParams {
    /// Expression to evaluate.
    pub expr: String,
}

/// Response of GET /api/v1/query.
#[derive(Debug, Serialize)]
pub struct QueryResponse {
    /// The evaluated expression.
    pub expr: String,
    /// Evaluation timestamp in Unix milliseconds.
    pub timestamp: i64,
    /// One element per label combination.
    pub result: Vec<Element>,
}

/// Handle GET /api/v1/query?expr=... - evaluate an expression now.
pub async fn query(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<QueryParams>,
) -> ApiResult<Json<QueryResponse>> {
    let timestamp = engine.clock().now_millis();
    let result = engine
        .query(&params.expr)
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    Ok(Json(QueryResponse {
        expr: params.expr,
        timestamp,
        result,
    }))
}

fn alert_error(err: AlertError) -> ApiError {
    match err {
        AlertError::SilenceNotFound { id } => ApiError::NotFound("silence".to_string(), id),
        AlertError::InvalidSilence { .. } | AlertError::Metrics(_) => {
            ApiError::InvalidRequest(err.to_string())
        }
        AlertError::InvalidReceiver { .. } | AlertError::InvalidRetryPolicy { .. } => {
            ApiError::Internal(err.to_string())
        }
    }
}
