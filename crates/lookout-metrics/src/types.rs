//! Core types for the sample store.
//!
//! This module provides the fundamental types used throughout lookout:
//! - [`MetricName`]: A validated metric name
//! - [`Labels`]: A sorted, deduplicated label set
//! - [`MetricIdentity`]: The key of a series (name plus labels)
//! - [`Sample`]: A single timestamped value
//! - [`TimeRange`]: An inclusive time range for queries
//! - [`Aggregation`]: Aggregation functions across series

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};

/// Returns the current wall-clock time in Unix milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A validated metric name.
///
/// Metric names must:
/// - Be non-empty
/// - Contain only alphanumeric characters, underscores, and colons
/// - Start with a letter, underscore or colon
/// - Be at most 256 characters long
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetricName(String);

impl MetricName {
    /// Maximum allowed length for a metric name.
    pub const MAX_LENGTH: usize = 256;

    /// Creates a new validated metric name.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidMetricName` if the name is invalid.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(MetricsError::InvalidMetricName {
                reason: "metric name cannot be empty".to_string(),
            });
        }

        if name.len() > Self::MAX_LENGTH {
            return Err(MetricsError::InvalidMetricName {
                reason: format!(
                    "metric name exceeds maximum length of {} characters",
                    Self::MAX_LENGTH
                ),
            });
        }

        if let Some(c) = name.chars().next() {
            if !c.is_ascii_alphabetic() && c != '_' && c != ':' {
                return Err(MetricsError::InvalidMetricName {
                    reason: "metric name must start with a letter, underscore or colon"
                        .to_string(),
                });
            }
        }

        for c in name.chars() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != ':' {
                return Err(MetricsError::InvalidMetricName {
                    reason: format!("invalid character '{c}' in metric name"),
                });
            }
        }

        Ok(Self(name))
    }

    /// Returns the metric name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the `MetricName` and returns the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MetricName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MetricName {
    type Error = MetricsError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MetricName> for String {
    fn from(name: MetricName) -> Self {
        name.0
    }
}

/// Validates a label name (`[a-zA-Z_][a-zA-Z0-9_]*`).
///
/// # Errors
///
/// Returns `MetricsError::InvalidLabelName` if the name is invalid.
pub fn validate_label_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(MetricsError::InvalidLabelName {
            name: name.to_string(),
            reason: "label name cannot be empty".to_string(),
        });
    };

    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(MetricsError::InvalidLabelName {
            name: name.to_string(),
            reason: "label name must start with a letter or underscore".to_string(),
        });
    }

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(MetricsError::InvalidLabelName {
            name: name.to_string(),
            reason: format!("invalid character '{c}'"),
        });
    }

    Ok(())
}

/// A set of label name/value pairs.
///
/// Keys are unique and kept sorted, so two label sets with the same pairs are
/// equal and hash identically regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Creates an empty label set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds a label and returns self for chaining.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Inserts a label, returning the previous value if any.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    /// Removes a label, returning its value if it was present.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    /// Returns the value of a label.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Returns true if the label is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Returns the number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a new label set keeping only the given names.
    #[must_use]
    pub fn keep_only(&self, names: &[String]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| names.iter().any(|n| n == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Returns a new label set without the given names.
    #[must_use]
    pub fn without(&self, names: &[&str]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| !names.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Merges `other` into this set; labels in `other` win.
    pub fn extend(&mut self, other: &Self) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Validates every label name in the set.
    ///
    /// # Errors
    ///
    /// Returns the first `MetricsError::InvalidLabelName` found.
    pub fn validate(&self) -> Result<()> {
        self.0.keys().try_for_each(|k| validate_label_name(k))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}=\"")?;
            for c in v.chars() {
                match c {
                    '\\' => f.write_str("\\\\")?,
                    '"' => f.write_str("\\\"")?,
                    '\n' => f.write_str("\\n")?,
                    c => write!(f, "{c}")?,
                }
            }
            f.write_str("\"")?;
        }
        f.write_str("}")
    }
}

/// The identity of a series: a metric name and its full label set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricIdentity {
    /// The metric name.
    pub name: MetricName,
    /// The label set (never includes the metric name).
    pub labels: Labels,
}

impl MetricIdentity {
    /// Creates a new identity.
    #[must_use]
    pub const fn new(name: MetricName, labels: Labels) -> Self {
        Self { name, labels }
    }

    /// Parses the name and builds an identity in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if the metric name or any label name is invalid.
    pub fn parse(name: &str, labels: Labels) -> Result<Self> {
        labels.validate()?;
        Ok(Self::new(MetricName::new(name)?, labels))
    }
}

impl fmt::Display for MetricIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}{}", self.name, self.labels)
        }
    }
}

/// A single stored measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// The measured value.
    pub value: f64,
}

impl Sample {
    /// Creates a new sample.
    #[must_use]
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Returns true if both samples carry the same value, treating NaN as
    /// equal to NaN.
    #[must_use]
    pub fn same_value(&self, other: f64) -> bool {
        self.value.to_bits() == other.to_bits() || self.value == other
    }
}

/// A time range for queries.
///
/// Both start and end are inclusive Unix timestamps in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds.
    pub start: i64,
    /// End timestamp (inclusive), in milliseconds.
    pub end: i64,
}

impl TimeRange {
    /// Creates a new time range.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidTimeRange` if start > end.
    pub const fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(MetricsError::InvalidTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// A range covering every timestamp.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    /// The window of `millis` ending at `end` (inclusive on both sides).
    #[must_use]
    pub const fn ending_at(end: i64, millis: i64) -> Self {
        Self {
            start: end.saturating_sub(millis),
            end,
        }
    }

    /// Creates a time range for the last N milliseconds from now.
    #[must_use]
    pub fn last_millis(millis: i64) -> Self {
        Self::ending_at(now_millis(), millis)
    }

    /// Creates a time range for the last N minutes from now.
    #[must_use]
    pub fn last_minutes(minutes: i64) -> Self {
        Self::last_millis(minutes * 60 * 1000)
    }

    /// Returns the duration of this time range in milliseconds.
    #[must_use]
    pub const fn duration_millis(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// Checks if a timestamp falls within this range (inclusive).
    #[must_use]
    pub const fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

/// Aggregation functions applied across series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Sum of all values.
    Sum,
    /// Average (mean) of all values.
    Avg,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
    /// Count of values.
    Count,
}

impl Aggregation {
    /// Parses an aggregation keyword.
    #[must_use]
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "sum" => Some(Self::Sum),
            "avg" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "count" => Some(Self::Count),
            _ => None,
        }
    }

    /// Applies this aggregation to a slice of values.
    ///
    /// Returns `None` if the slice is empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Intentional: vectors won't have billions of entries
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }

        match self {
            Self::Sum => Some(values.iter().sum()),
            Self::Avg => Some(values.iter().sum::<f64>() / values.len() as f64),
            Self::Min => values.iter().copied().reduce(f64::min),
            Self::Max => values.iter().copied().reduce(f64::max),
            Self::Count => Some(values.len() as f64),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
        };
        f.write_str(s)
    }
}
