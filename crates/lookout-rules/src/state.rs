//! Alert instances and the arena that stores them.

use std::collections::{BTreeMap, HashMap};

use lookout_metrics::Labels;
use serde::{Deserialize, Serialize};

/// The lifecycle state of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// The expression is false; no instance exists.
    Inactive,
    /// The expression is true but has not held for the rule's hold duration.
    Pending,
    /// The expression has held for at least the hold duration.
    Firing,
    /// The expression became false while firing.
    Resolved,
}

impl AlertState {
    /// Returns the state as a lowercase string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Pending => "pending",
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }

    /// Returns true if the alert is pending or firing.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Firing)
    }
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifies an alert instance: the rule plus the full alert label set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    /// Rule name.
    pub rule: String,
    /// Alert labels.
    pub labels: Labels,
}

/// One (rule, label set) alert.
///
/// Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertInstance {
    /// Name of the rule that owns the instance.
    pub rule: String,
    /// Alert labels, including `alertname`.
    pub labels: Labels,
    /// Expanded annotations from the latest evaluation.
    pub annotations: BTreeMap<String, String>,
    /// Current state.
    pub state: AlertState,
    /// When the expression first became true.
    pub active_since: i64,
    /// When the instance started firing.
    pub fired_at: Option<i64>,
    /// When the instance resolved.
    pub resolved_at: Option<i64>,
    /// The value from the latest evaluation where the expression held.
    pub last_value: f64,
    /// When the instance was last evaluated.
    pub last_evaluated: i64,
}

impl AlertInstance {
    /// Creates a pending instance.
    #[must_use]
    pub fn pending(
        rule: impl Into<String>,
        labels: Labels,
        annotations: BTreeMap<String, String>,
        value: f64,
        now: i64,
    ) -> Self {
        Self {
            rule: rule.into(),
            labels,
            annotations,
            state: AlertState::Pending,
            active_since: now,
            fired_at: None,
            resolved_at: None,
            last_value: value,
            last_evaluated: now,
        }
    }

    /// The arena key of this instance.
    #[must_use]
    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            rule: self.rule.clone(),
            labels: self.labels.clone(),
        }
    }

    /// Transitions Pending to Firing. Returns false in any other state.
    pub fn fire(&mut self, now: i64) -> bool {
        if self.state == AlertState::Pending {
            self.state = AlertState::Firing;
            self.fired_at = Some(now);
            true
        } else {
            false
        }
    }

    /// Transitions Firing to Resolved. Returns false in any other state.
    pub fn resolve(&mut self, now: i64) -> bool {
        if self.state == AlertState::Firing {
            self.state = AlertState::Resolved;
            self.resolved_at = Some(now);
            true
        } else {
            false
        }
    }
}

/// Slot storage for alert instances with an index by key.
///
/// Removed slots go on a free list and are reused by later inserts, so
/// instance churn does not grow the slot vector.
#[derive(Debug, Default)]
pub struct InstanceArena {
    slots: Vec<Option<AlertInstance>>,
    free: Vec<usize>,
    index: HashMap<InstanceKey, usize>,
}

impl InstanceArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an instance, replacing any instance with the same key.
    ///
    /// Returns the slot id.
    pub fn insert(&mut self, instance: AlertInstance) -> usize {
        let key = instance.key();
        if let Some(&id) = self.index.get(&key) {
            self.slots[id] = Some(instance);
            return id;
        }

        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(instance);
                id
            }
            None => {
                self.slots.push(Some(instance));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, id);
        id
    }

    /// Looks up the slot id of a key.
    #[must_use]
    pub fn find(&self, key: &InstanceKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Returns the instance in a slot.
    #[must_use]
    pub fn get(&self, id: usize) -> Option<&AlertInstance> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    /// Returns the instance in a slot for mutation.
    ///
    /// The instance's rule and labels must not be changed.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut AlertInstance> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    /// Removes and returns the instance in a slot.
    pub fn remove(&mut self, id: usize) -> Option<AlertInstance> {
        let instance = self.slots.get_mut(id).and_then(Option::take)?;
        self.index.remove(&instance.key());
        self.free.push(id);
        Some(instance)
    }

    /// Slot ids of every instance owned by `rule`.
    #[must_use]
    pub fn ids_for_rule(&self, rule: &str) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().filter(|i| i.rule == rule).map(|_| id))
            .collect()
    }

    /// Iterates all live instances.
    pub fn iter(&self) -> impl Iterator<Item = &AlertInstance> {
        self.slots.iter().flatten()
    }

    /// Number of live instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if the arena holds no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of live instances in `state`.
    #[must_use]
    pub fn count_in(&self, state: AlertState) -> usize {
        self.iter().filter(|i| i.state == state).count()
    }
}
