//! Error types for the lookout-metrics crate.

use thiserror::Error;

/// Errors that can occur in the sample store.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The metric name is invalid (empty or contains invalid characters).
    #[error("invalid metric name: {reason}")]
    InvalidMetricName {
        /// The reason the name is invalid.
        reason: String,
    },

    /// A label name is invalid.
    #[error("invalid label name '{name}': {reason}")]
    InvalidLabelName {
        /// The offending label name.
        name: String,
        /// The reason the label name is invalid.
        reason: String,
    },

    /// A label matcher could not be built (for example a bad regex).
    #[error("invalid matcher: {reason}")]
    InvalidMatcher {
        /// The reason the matcher is invalid.
        reason: String,
    },

    /// The time range is invalid (start > end).
    #[error("invalid time range: start={start}, end={end}")]
    InvalidTimeRange {
        /// Start timestamp.
        start: i64,
        /// End timestamp.
        end: i64,
    },

    /// The sample is older than the series head minus the tolerance.
    #[error(
        "out of order sample for {series}: timestamp {timestamp} is older than {latest} \
         (tolerance {tolerance_ms}ms)"
    )]
    OutOfOrder {
        /// Rendered series identity.
        series: String,
        /// Rejected timestamp.
        timestamp: i64,
        /// Latest timestamp already stored in the series.
        latest: i64,
        /// Configured tolerance in milliseconds.
        tolerance_ms: i64,
    },

    /// A sample already exists at this timestamp with a different value.
    #[error("duplicate sample for {series} at timestamp {timestamp}")]
    DuplicateSample {
        /// Rendered series identity.
        series: String,
        /// Conflicting timestamp.
        timestamp: i64,
    },

    /// The store detected a broken invariant and refuses further ingestion.
    #[error("storage corrupted: {reason}")]
    Corrupted {
        /// What was found to be inconsistent.
        reason: String,
    },

    /// Insufficient data for the requested operation.
    #[error("insufficient data: {reason}")]
    InsufficientData {
        /// The reason there is insufficient data.
        reason: String,
    },
}

impl MetricsError {
    /// Returns true for errors that reject a single sample without affecting
    /// the rest of the batch.
    #[must_use]
    pub const fn is_sample_rejection(&self) -> bool {
        matches!(self, Self::OutOfOrder { .. } | Self::DuplicateSample { .. })
    }
}

/// Result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;
