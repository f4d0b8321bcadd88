//! Error types for the lookout daemon.

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors raised while starting, reloading or stopping the engine.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The configuration could not be loaded or was rejected.
    #[error("configuration error: {0}")]
    Config(#[from] lookout_config::ConfigError),

    /// A rule in the configuration is invalid.
    #[error("rule error: {0}")]
    Rule(#[from] lookout_rules::RuleError),

    /// A target in the configuration is invalid.
    #[error("scrape error: {0}")]
    Scrape(#[from] lookout_scrape::ScrapeError),

    /// A receiver, silence or route in the configuration is invalid.
    #[error("alert error: {0}")]
    Alert(#[from] lookout_alerts::AlertError),

    /// The notification spool could not be read or written.
    #[error("spool error at {path}: {reason}")]
    Spool {
        /// The spool file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The HTTP listener could not be bound.
    #[error("failed to bind to {addr}: {reason}")]
    Bind {
        /// The listen address.
        addr: String,
        /// The I/O error.
        reason: String,
    },

    /// The sample store lost its ordering invariant.
    #[error("sample store corrupted: {reason}")]
    Corrupted {
        /// The detected violation.
        reason: String,
    },
}

impl DaemonError {
    pub(crate) fn spool(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Spool {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Errors returned by the HTTP API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("{0} not found: {1}")]
    NotFound(String, String),

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A reload was rejected; the previous configuration stays active.
    #[error("reload rejected: {0}")]
    ReloadRejected(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Self::NotFound(_, _) => (StatusCode::NOT_FOUND, "not_found"),
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::ReloadRejected(_) => (StatusCode::UNPROCESSABLE_ENTITY, "reload_rejected"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":"internal_error","message":"failed to serialize error"}"#.to_string()
        });

        (status, [("content-type", "application/json")], json).into_response()
    }
}

impl From<DaemonError> for ApiError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::Config(_)
            | DaemonError::Rule(_)
            | DaemonError::Scrape(_)
            | DaemonError::Alert(_) => Self::ReloadRejected(err.to_string()),
            DaemonError::Spool { .. }
            | DaemonError::Bind { .. }
            | DaemonError::Corrupted { .. } => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use test_case::test_case;

    mod daemon_error {
        use super::*;

        #[test]
        fn display() {
            let err = DaemonError::spool("/var/lib/lookout/spool.json", "disk full");
            assert_eq!(
                err.to_string(),
                "spool error at /var/lib/lookout/spool.json: disk full"
            );

            let err = DaemonError::Corrupted {
                reason: "series up out of order".to_string(),
            };
            assert_eq!(err.to_string(), "sample store corrupted: series up out of order");
        }

        #[test]
        fn config_error_converts() {
            let err: DaemonError = lookout_config::ConfigError::invalid("route", "bad").into();
            assert!(matches!(err, DaemonError::Config(_)));
        }
    }

    mod api_error {
        use super::*;
        use test_case::test_case;

        async fn body_json(response: Response) -> serde_json::Value {
            let body = response.into_body().collect().await.unwrap().to_bytes();
            serde_json::from_slice(&body).unwrap()
        }

        #[tokio::test]
        async fn not_found_response() {
            let response =
                ApiError::NotFound("silence".to_string(), "abc".to_string()).into_response();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);

            let json = body_json(response).await;
            assert_eq!(json["error"], "not_found");
            assert_eq!(json["message"], "silence not found: abc");
        }

        #[tokio::test]
        async fn rejected_reload_response() {
            let err: ApiError =
                DaemonError::from(lookout_config::ConfigError::invalid("targets", "empty job"))
                    .into();
            let response = err.into_response();
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
            assert_eq!(body_json(response).await["error"], "reload_rejected");
        }

        #[test_case(
            ApiError::NotFound("rule".into(), "x".into()),
            StatusCode::NOT_FOUND ;
            "not found"
        )]
        #[test_case(
            ApiError::InvalidRequest("x".into()),
            StatusCode::BAD_REQUEST ;
            "invalid request"
        )]
        #[test_case(
            ApiError::ReloadRejected("x".into()),
            StatusCode::UNPROCESSABLE_ENTITY ;
            "reload rejected"
        )]
        #[test_case(ApiError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR ; "internal")]
        fn status_codes(err: ApiError, expected: StatusCode) {
            assert_eq!(err.into_response().status(), expected);
        }

        #[tokio::test]
        async fn internal_response() {
            let err: ApiError = DaemonError::Corrupted {
                reason: "x".to_string(),
            }
            .into();
            let response = err.into_response();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }
}
