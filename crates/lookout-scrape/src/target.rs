//! Scrape targets.

use std::fmt;
use std::time::Duration;

use lookout_metrics::Labels;
use serde::Serialize;

use crate::error::{Result, ScrapeError};

/// Identifies a target across reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetKey {
    /// The job name.
    pub job: String,
    /// The `host:port` address.
    pub instance: String,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job, self.instance)
    }
}

/// A scrape endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    /// Job name, attached as the `job` label.
    pub job: String,
    /// `host:port`, attached as the `instance` label.
    pub address: String,
    /// `http` or `https`.
    pub scheme: String,
    /// Path of the metrics endpoint.
    pub path: String,
    /// Time between scrapes.
    pub interval: Duration,
    /// Request timeout; strictly shorter than `interval`.
    pub timeout: Duration,
    /// Static labels attached to every sample.
    pub labels: Labels,
}

impl Target {
    /// Creates an `http` target on `/metrics` with a 15s interval and 10s timeout.
    #[must_use]
    pub fn new(job: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            address: address.into(),
            scheme: "http".to_string(),
            path: "/metrics".to_string(),
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(10),
            labels: Labels::new(),
        }
    }

    /// Sets the scrape interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the scrape timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the URL path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the URL scheme.
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Adds a static label.
    #[must_use]
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name, value);
        self
    }

    /// Checks that the target can be scraped.
    ///
    /// # Errors
    ///
    /// Returns `ScrapeError::InvalidTarget` if the timeout is not strictly
    /// shorter than the interval, or if a field is empty or malformed.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ScrapeError::InvalidTarget { reason };

        if self.job.is_empty() {
            return Err(invalid("job cannot be empty".to_string()));
        }
        if self.address.is_empty() {
            return Err(invalid("address cannot be empty".to_string()));
        }
        if self.interval.is_zero() {
            return Err(invalid(format!("{}: interval must be greater than 0", self.key())));
        }
        if self.timeout.is_zero() || self.timeout >= self.interval {
            return Err(invalid(format!(
                "{}: timeout {:?} must be greater than 0 and less than interval {:?}",
                self.key(),
                self.timeout,
                self.interval
            )));
        }
        self.labels
            .validate()
            .map_err(|e| invalid(format!("{}: {e}", self.key())))?;
        Ok(())
    }

    /// The identity of this target.
    #[must_use]
    pub fn key(&self) -> TargetKey {
        TargetKey {
            job: self.job.clone(),
            instance: self.address.clone(),
        }
    }

    /// The URL that is scraped.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.address, self.path)
    }

    /// The labels attached to every sample from this target: the static
    /// labels plus `job` and `instance`.
    #[must_use]
    pub fn target_labels(&self) -> Labels {
        let mut labels = self.labels.clone();
        labels.insert("job", self.job.clone());
        labels.insert("instance", self.address.clone());
        labels
    }
}

/// Merges target labels into a scraped label set.
///
/// Target labels win. When the scraped set already carries one of them, its
/// value is kept under `exported_<name>`.
#[must_use]
pub fn apply_target_labels(mut scraped: Labels, target_labels: &Labels) -> Labels {
    for (name, value) in target_labels.iter() {
        if let Some(exposed) = scraped.insert(name, value) {
            scraped.insert(format!("exported_{name}"), exposed);
        }
    }
    scraped
}
