//! Error types for the lookout-rules crate.

use lookout_metrics::MetricsError;
use thiserror::Error;

/// Errors produced while compiling or evaluating alerting rules.
#[derive(Debug, Error)]
pub enum RuleError {
    /// The expression text could not be parsed.
    #[error("parse error at position {position}: {reason}")]
    Parse {
        /// Byte offset in the expression where parsing failed.
        position: usize,
        /// What was expected or found.
        reason: String,
    },

    /// A rule definition is invalid.
    #[error("invalid rule: {reason}")]
    InvalidRule {
        /// The reason the rule is invalid.
        reason: String,
    },

    /// Evaluating a rule failed; the rule's alerts are left as they were.
    #[error("evaluation of rule '{rule}' failed: {reason}")]
    Evaluation {
        /// The rule name.
        rule: String,
        /// The reason evaluation failed.
        reason: String,
    },

    /// A selector or matcher was rejected by the store layer.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

impl RuleError {
    pub(crate) fn parse(position: usize, reason: impl Into<String>) -> Self {
        Self::Parse {
            position,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            reason: reason.into(),
        }
    }
}

/// Result type for rule operations.
pub type Result<T> = std::result::Result<T, RuleError>;
