//! Error types for the lookout-alerts crate.

use thiserror::Error;

/// Errors that can occur in the alert router.
#[derive(Debug, Error)]
pub enum AlertError {
    /// A silence definition is invalid.
    #[error("invalid silence: {reason}")]
    InvalidSilence {
        /// The reason the silence is invalid.
        reason: String,
    },

    /// Silence with the given ID was not found.
    #[error("silence not found: {id}")]
    SilenceNotFound {
        /// The silence ID that was not found.
        id: String,
    },

    /// A receiver definition is invalid.
    #[error("invalid receiver '{name}': {reason}")]
    InvalidReceiver {
        /// The receiver name.
        name: String,
        /// The reason the receiver is invalid.
        reason: String,
    },

    /// The retry policy is invalid.
    #[error("invalid retry policy: {reason}")]
    InvalidRetryPolicy {
        /// The reason the policy is invalid.
        reason: String,
    },

    /// A label matcher could not be parsed.
    #[error("metrics error: {0}")]
    Metrics(#[from] lookout_metrics::MetricsError),
}

/// Errors a receiver reports for one delivery attempt.
///
/// Every variant is retried by the router until the retry policy gives up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The receiver did not answer within its timeout.
    #[error("receiver '{receiver}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The receiver name.
        receiver: String,
        /// The timeout that elapsed.
        timeout_ms: u128,
    },

    /// The request could not be sent or the response not read.
    #[error("request to receiver '{receiver}' failed: {reason}")]
    Request {
        /// The receiver name.
        receiver: String,
        /// The transport error.
        reason: String,
    },

    /// The receiver answered with a non-success status.
    #[error("receiver '{receiver}' returned HTTP {status}")]
    Status {
        /// The receiver name.
        receiver: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The notification references a receiver that no longer exists.
    #[error("receiver '{receiver}' is not configured")]
    UnknownReceiver {
        /// The receiver name.
        receiver: String,
    },
}

/// Result type for alert router operations.
pub type Result<T> = std::result::Result<T, AlertError>;
