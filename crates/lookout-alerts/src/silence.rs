//! Time-bounded silences.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lookout_metrics::{all_match, LabelMatcher, Labels};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AlertError, Result};

/// How long an expired silence stays listed before it is dropped.
const EXPIRED_RETENTION_HOURS: i64 = 24;

/// Where a silence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SilenceSource {
    /// The configuration file. Replaced on every reload.
    Config,
    /// The HTTP API. Kept across reloads.
    Api,
}

/// Suppresses notifications for alerts whose labels match every matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Silence {
    /// Unique identifier.
    pub id: String,
    /// Matchers that must all match the alert labels.
    pub matchers: Vec<LabelMatcher>,
    /// When the silence starts.
    pub starts_at: DateTime<Utc>,
    /// When the silence ends.
    pub ends_at: DateTime<Utc>,
    /// Who created the silence.
    pub created_by: String,
    /// Why the silence exists.
    pub comment: String,
    /// Where the silence came from.
    pub source: SilenceSource,
}

impl Silence {
    /// Creates a new silence.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidSilence` if there are no matchers or
    /// `ends_at` is not after `starts_at`.
    pub fn new(
        matchers: Vec<LabelMatcher>,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        created_by: impl Into<String>,
        comment: impl Into<String>,
    ) -> Result<Self> {
        if matchers.is_empty() {
            return Err(AlertError::InvalidSilence {
                reason: "at least one matcher is required".to_string(),
            });
        }
        if ends_at <= starts_at {
            return Err(AlertError::InvalidSilence {
                reason: "silence end time must be after start time".to_string(),
            });
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            matchers,
            starts_at,
            ends_at,
            created_by: created_by.into(),
            comment: comment.into(),
            source: SilenceSource::Api,
        })
    }

    /// Marks the silence as coming from configuration.
    #[must_use]
    pub const fn from_config(mut self) -> Self {
        self.source = SilenceSource::Config;
        self
    }

    /// Checks if the silence is in effect at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now >= self.starts_at && now < self.ends_at
    }

    /// Checks if the silence is in effect at `now` and matches `labels`.
    #[must_use]
    pub fn matches(&self, labels: &Labels, now: DateTime<Utc>) -> bool {
        self.is_active(now) && all_match(&self.matchers, labels)
    }
}

/// Thread-safe set of silences.
#[derive(Debug, Default)]
pub struct SilenceStore {
    silences: RwLock<HashMap<String, Silence>>,
}

impl SilenceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a silence and returns its id.
    pub fn add(&self, silence: Silence) -> String {
        let id = silence.id.clone();
        info!(
            silence_id = %id,
            created_by = %silence.created_by,
            ends_at = %silence.ends_at,
            "silence added"
        );
        self.silences.write().insert(id.clone(), silence);
        id
    }

    /// Ends a silence at `now`. An already expired silence is left as is.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::SilenceNotFound` if no silence has the id.
    pub fn expire(&self, id: &str, now: DateTime<Utc>) -> Result<Silence> {
        let mut silences = self.silences.write();
        let silence = silences.get_mut(id).ok_or_else(|| AlertError::SilenceNotFound {
            id: id.to_string(),
        })?;

        if silence.ends_at > now {
            silence.ends_at = now.max(silence.starts_at);
            info!(silence_id = %id, "silence expired");
        }
        Ok(silence.clone())
    }

    /// Returns a silence by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Silence> {
        self.silences.read().get(id).cloned()
    }

    /// Lists every silence, ordered by start time.
    #[must_use]
    pub fn list(&self) -> Vec<Silence> {
        let mut silences: Vec<Silence> = self.silences.read().values().cloned().collect();
        silences.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then_with(|| a.id.cmp(&b.id)));
        silences
    }

    /// Lists the silences in effect at `now`.
    #[must_use]
    pub fn active(&self, now: DateTime<Utc>) -> Vec<Silence> {
        self.list().into_iter().filter(|s| s.is_active(now)).collect()
    }

    /// Returns the id of the first silence that suppresses `labels` at `now`.
    #[must_use]
    pub fn silenced_by(&self, labels: &Labels, now: DateTime<Utc>) -> Option<String> {
        self.silences
            .read()
            .values()
            .find(|s| s.matches(labels, now))
            .map(|s| s.id.clone())
    }

    /// Returns true if an active silence matches `labels`.
    #[must_use]
    pub fn is_silenced(&self, labels: &Labels, now: DateTime<Utc>) -> bool {
        self.silenced_by(labels, now).is_some()
    }

    /// Replaces every configuration-supplied silence, keeping API silences.
    pub fn replace_configured(&self, configured: Vec<Silence>) {
        let mut silences = self.silences.write();
        silences.retain(|_, s| s.source != SilenceSource::Config);
        let count = configured.len();
        for silence in configured {
            silences.insert(silence.id.clone(), silence.from_config());
        }
        debug!(count, "configured silences replaced");
    }

    /// Drops silences that ended long enough ago. Returns how many were dropped.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::hours(EXPIRED_RETENTION_HOURS);
        let mut silences = self.silences.write();
        let before = silences.len();
        silences.retain(|_, s| s.ends_at >= cutoff);
        before - silences.len()
    }

    /// Number of silences, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.silences.read().len()
    }

    /// Returns true if the store holds no silences.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.silences.read().is_empty()
    }
}
