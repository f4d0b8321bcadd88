//! Alerts and notifications as the router sees them.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use lookout_metrics::Labels;
use lookout_rules::{AlertEvent, AlertState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::RetryState;

/// Converts Unix milliseconds to a UTC timestamp.
#[must_use]
pub fn to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Computes the deduplication fingerprint of a label set.
///
/// Labels are kept sorted, so equal label sets always hash equally.
#[must_use]
pub fn fingerprint(labels: &Labels) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for (name, value) in labels.iter() {
        name.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// Whether an alert is firing or resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// The alert is firing.
    Firing,
    /// The alert has resolved.
    Resolved,
}

impl AlertStatus {
    /// Returns the status as a lowercase string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert being routed.
///
/// Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Alert labels, including `alertname`.
    pub labels: Labels,
    /// Expanded annotations.
    pub annotations: std::collections::BTreeMap<String, String>,
    /// Firing or resolved.
    pub status: AlertStatus,
    /// When the alert became active.
    pub starts_at: i64,
    /// When the alert resolved.
    pub ends_at: Option<i64>,
    /// The latest value of the rule expression.
    pub value: f64,
    /// Hash of the label set.
    pub fingerprint: String,
}

impl Alert {
    /// Builds an alert from an evaluator transition.
    ///
    /// Returns `None` for transitions the router does not handle.
    #[must_use]
    pub fn from_event(event: &AlertEvent) -> Option<Self> {
        let status = match event.state {
            AlertState::Firing => AlertStatus::Firing,
            AlertState::Resolved => AlertStatus::Resolved,
            AlertState::Inactive | AlertState::Pending => return None,
        };
        Some(Self {
            fingerprint: fingerprint(&event.labels),
            labels: event.labels.clone(),
            annotations: event.annotations.clone(),
            status,
            starts_at: event.active_since,
            ends_at: event.resolved_at,
            value: event.value,
        })
    }

    /// The `alertname` label.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get("alertname").unwrap_or_default()
    }
}

/// Overall status of a notification batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// At least one alert is firing.
    Firing,
    /// All alerts are resolved.
    Resolved,
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firing => write!(f, "firing"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// Delivery progress of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting for its first or next attempt.
    Pending,
    /// Accepted by the receiver.
    Delivered,
    /// Every attempt failed.
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A batch of alerts of one group addressed to one receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique identifier.
    pub id: String,
    /// Name of the receiver.
    pub receiver: String,
    /// Key of the alert group.
    pub group_key: String,
    /// The grouping labels and their values.
    pub group_labels: Labels,
    /// Firing if any alert fires.
    pub status: NotificationStatus,
    /// The alerts in this batch.
    pub alerts: Vec<Alert>,
    /// External URL linking back to the engine.
    pub external_url: String,
    /// Creation time in Unix milliseconds.
    pub created_at: i64,
    /// Delivery progress.
    pub delivery: DeliveryStatus,
    /// Attempts made and when the next is allowed.
    pub retry: RetryState,
    /// Error of the latest failed attempt.
    pub last_error: Option<String>,
    /// When the receiver accepted the batch.
    pub delivered_at: Option<i64>,
}

impl Notification {
    /// Creates a pending notification.
    #[must_use]
    pub fn new(
        receiver: impl Into<String>,
        group_key: impl Into<String>,
        group_labels: Labels,
        alerts: Vec<Alert>,
        created_at: i64,
    ) -> Self {
        let status = if alerts.iter().any(|a| a.status == AlertStatus::Firing) {
            NotificationStatus::Firing
        } else {
            NotificationStatus::Resolved
        };

        Self {
            id: Uuid::new_v4().to_string(),
            receiver: receiver.into(),
            group_key: group_key.into(),
            group_labels,
            status,
            alerts,
            external_url: String::new(),
            created_at,
            delivery: DeliveryStatus::Pending,
            retry: RetryState::default(),
            last_error: None,
            delivered_at: None,
        }
    }

    /// Sets the external URL.
    #[must_use]
    pub fn with_external_url(mut self, url: impl Into<String>) -> Self {
        self.external_url = url.into();
        self
    }
}
