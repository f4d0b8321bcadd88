//! Error types for lookout-scrape.

use thiserror::Error;

/// Errors that can occur while scraping a target.
///
/// Every variant is scoped to one target and one scrape; none of them stop
/// the scrape loop.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// The scrape did not finish within the target's timeout.
    #[error("scrape of {target} timed out after {timeout_ms}ms")]
    Timeout {
        /// The scraped URL.
        target: String,
        /// The timeout that elapsed.
        timeout_ms: u128,
    },

    /// The request could not be sent or the body could not be read.
    #[error("request to {target} failed: {reason}")]
    Request {
        /// The scraped URL.
        target: String,
        /// Transport error message.
        reason: String,
    },

    /// The target answered with a non-2xx status.
    #[error("{target} returned HTTP {status}")]
    Status {
        /// The scraped URL.
        target: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The response body is not valid exposition text.
    #[error("malformed exposition at line {line}: {reason}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What is wrong with the line.
        reason: String,
    },

    /// The target definition is unusable.
    #[error("invalid target: {reason}")]
    InvalidTarget {
        /// What is wrong with the target.
        reason: String,
    },

    /// The sample store refused the batch.
    #[error("store error: {0}")]
    Store(#[from] lookout_metrics::MetricsError),
}

/// Result type for scrape operations.
pub type Result<T> = std::result::Result<T, ScrapeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_timeout() {
        let err = ScrapeError::Timeout {
            target: "http://app:8080/metrics".to_string(),
            timeout_ms: 2000,
        };
        assert_eq!(
            err.to_string(),
            "scrape of http://app:8080/metrics timed out after 2000ms"
        );
    }

    #[test]
    fn error_display_status() {
        let err = ScrapeError::Status {
            target: "http://app:8080/metrics".to_string(),
            status: 503,
        };
        assert_eq!(err.to_string(), "http://app:8080/metrics returned HTTP 503");
    }

    #[test]
    fn error_display_parse() {
        let err = ScrapeError::Parse {
            line: 3,
            reason: "missing value".to_string(),
        };
        assert_eq!(err.to_string(), "malformed exposition at line 3: missing value");
    }

    #[test]
    fn store_errors_convert() {
        let err: ScrapeError = lookout_metrics::MetricsError::Corrupted {
            reason: "bad".to_string(),
        }
        .into();
        assert!(matches!(err, ScrapeError::Store(_)));
    }
}
