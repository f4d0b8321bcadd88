//! Scheduled rule evaluation and alert state tracking.
//!
//! The [`Evaluator`] owns the rule set and every alert instance. Each tick it
//! takes one store snapshot, evaluates the rules whose interval has elapsed,
//! advances the state machine of their instances and sends every transition
//! to Firing or Resolved as an [`AlertEvent`] on an mpsc channel.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use lookout_metrics::prometheus::EngineMetrics;
use lookout_metrics::{Clock, Labels, SampleStore, Snapshot};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::error::{Result, RuleError};
use crate::rule::{Rule, RuleSummary};
use crate::state::{AlertInstance, AlertState, InstanceArena, InstanceKey};
use crate::template;

/// How long the loop sleeps when there are no rules.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// A transition to Firing or Resolved, sent to the router.
///
/// Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    /// Name of the rule that produced the alert.
    pub rule: String,
    /// `Firing` or `Resolved`.
    pub state: AlertState,
    /// Alert labels, including `alertname`.
    pub labels: Labels,
    /// Expanded annotations.
    pub annotations: BTreeMap<String, String>,
    /// The latest value that made the expression true.
    pub value: f64,
    /// When the expression first became true.
    pub active_since: i64,
    /// When the alert started firing.
    pub fired_at: Option<i64>,
    /// When the alert resolved.
    pub resolved_at: Option<i64>,
}

impl From<&AlertInstance> for AlertEvent {
    fn from(instance: &AlertInstance) -> Self {
        Self {
            rule: instance.rule.clone(),
            state: instance.state,
            labels: instance.labels.clone(),
            annotations: instance.annotations.clone(),
            value: instance.last_value,
            active_since: instance.active_since,
            fired_at: instance.fired_at,
            resolved_at: instance.resolved_at,
        }
    }
}

/// Evaluation health of one rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleHealth {
    /// Timestamp of the latest evaluation.
    pub last_evaluation: Option<i64>,
    /// Wall time the latest evaluation took, in milliseconds.
    pub last_duration_ms: f64,
    /// Error of the latest evaluation, if it failed.
    pub last_error: Option<String>,
    /// Number of evaluations.
    pub evaluations: u64,
    /// Number of failed evaluations.
    pub failures: u64,
}

/// A rule with its health and alert counts.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    /// The rule definition.
    #[serde(flatten)]
    pub rule: RuleSummary,
    /// Evaluation health.
    pub health: RuleHealth,
    /// Pending instances.
    pub pending: usize,
    /// Firing instances.
    pub firing: usize,
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct EvaluationResult {
    /// Number of rules evaluated.
    pub rules_evaluated: usize,
    /// Number of rules that errored.
    pub rules_errored: usize,
    /// Transitions produced, in rule order.
    pub events: Vec<AlertEvent>,
}

/// What [`Evaluator::replace_rules`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceReport {
    /// Rules whose name and expression were unchanged; their alerts carry over.
    pub kept: usize,
    /// Rules whose expression changed; their alerts were reset.
    pub changed: usize,
    /// New rules.
    pub added: usize,
    /// Rules no longer present.
    pub removed: usize,
}

struct RuleEntry {
    rule: Arc<Rule>,
    health: RuleHealth,
}

impl RuleEntry {
    fn new(rule: Rule) -> Self {
        Self {
            rule: Arc::new(rule),
            health: RuleHealth::default(),
        }
    }

    fn next_due(&self) -> i64 {
        self.health
            .last_evaluation
            .map_or(i64::MIN, |last| last.saturating_add(millis(self.rule.interval())))
    }
}

#[derive(Default)]
struct EvalState {
    rules: Vec<RuleEntry>,
    arena: InstanceArena,
}

/// Evaluates alerting rules against the sample store.
pub struct Evaluator {
    store: SampleStore,
    clock: Clock,
    events: mpsc::Sender<AlertEvent>,
    state: Mutex<EvalState>,
    rules_changed: Notify,
    metrics: Option<EngineMetrics>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Evaluator")
            .field("rules", &state.rules.len())
            .field("alerts", &state.arena.len())
            .finish_non_exhaustive()
    }
}

impl Evaluator {
    /// Creates an evaluator with no rules that sends transitions to `events`.
    #[must_use]
    pub fn new(store: SampleStore, events: mpsc::Sender<AlertEvent>) -> Self {
        Self {
            store,
            clock: Clock::new(),
            events,
            state: Mutex::new(EvalState::default()),
            rules_changed: Notify::new(),
            metrics: None,
        }
    }

    /// Uses `clock` for evaluation timestamps.
    #[must_use]
    pub const fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Reports evaluations into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // ============ Rules ============

    /// Replaces the rule set.
    ///
    /// Alerts of rules whose name and expression are unchanged carry over.
    /// Alerts of removed or changed rules are dropped; firing ones are
    /// resolved first and the resolution is sent to the router.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidRule` if two rules share a name; in that
    /// case nothing is changed.
    pub async fn replace_rules(&self, rules: Vec<Rule>) -> Result<ReplaceReport> {
        let (report, events) = self.swap_rules(rules, self.clock.now_millis())?;
        self.publish(events).await;
        self.rules_changed.notify_one();
        info!(
            kept = report.kept,
            changed = report.changed,
            added = report.added,
            removed = report.removed,
            "replaced alerting rules"
        );
        Ok(report)
    }

    fn swap_rules(&self, rules: Vec<Rule>, now: i64) -> Result<(ReplaceReport, Vec<AlertEvent>)> {
        let mut names = HashSet::new();
        for rule in &rules {
            if !names.insert(rule.name()) {
                return Err(RuleError::invalid(format!(
                    "duplicate rule name '{}'",
                    rule.name()
                )));
            }
        }

        let mut state = self.state.lock();
        let EvalState {
            rules: current,
            arena,
        } = &mut *state;

        let mut previous: HashMap<String, RuleEntry> = current
            .drain(..)
            .map(|entry| (entry.rule.name().to_string(), entry))
            .collect();
        let mut report = ReplaceReport::default();
        let mut events = Vec::new();

        for rule in rules {
            match previous.remove(rule.name()) {
                Some(entry) if entry.rule.same_definition(&rule) => {
                    report.kept += 1;
                    current.push(RuleEntry {
                        rule: Arc::new(rule),
                        health: entry.health,
                    });
                }
                Some(_) => {
                    report.changed += 1;
                    events.extend(retire_instances(arena, rule.name(), now));
                    current.push(RuleEntry::new(rule));
                }
                None => {
                    report.added += 1;
                    current.push(RuleEntry::new(rule));
                }
            }
        }

        for name in previous.keys() {
            report.removed += 1;
            events.extend(retire_instances(arena, name, now));
        }

        Ok((report, events))
    }

    /// Number of rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.state.lock().rules.len()
    }

    /// Every rule with its health, in configuration order.
    #[must_use]
    pub fn rules(&self) -> Vec<RuleStatus> {
        let state = self.state.lock();
        state
            .rules
            .iter()
            .map(|entry| {
                let (mut pending, mut firing) = (0, 0);
                for instance in state.arena.iter().filter(|i| i.rule == entry.rule.name()) {
                    match instance.state {
                        AlertState::Pending => pending += 1,
                        AlertState::Firing => firing += 1,
                        AlertState::Inactive | AlertState::Resolved => {}
                    }
                }
                RuleStatus {
                    rule: RuleSummary::from(entry.rule.as_ref()),
                    health: entry.health.clone(),
                    pending,
                    firing,
                }
            })
            .collect()
    }

    // ============ Alerts ============

    /// Every alert instance, ordered by rule and labels.
    #[must_use]
    pub fn alerts(&self) -> Vec<AlertInstance> {
        let state = self.state.lock();
        let mut alerts: Vec<AlertInstance> = state.arena.iter().cloned().collect();
        alerts.sort_by(|a, b| a.key().cmp(&b.key()));
        alerts
    }

    // ============ Evaluation ============

    /// Evaluates every rule that is due at `now` and returns the transitions.
    ///
    /// The transitions are not sent; [`Evaluator::run`] does that.
    pub fn evaluate_due(&self, now: i64) -> EvaluationResult {
        let snapshot = self.store.snapshot();
        let corruption = self.store.corruption();
        let mut result = EvaluationResult::default();

        let mut state = self.state.lock();
        let EvalState { rules, arena } = &mut *state;

        for entry in rules.iter_mut().filter(|e| e.next_due() <= now) {
            let rule = Arc::clone(&entry.rule);
            let started = std::time::Instant::now();
            let outcome = match &corruption {
                Some(reason) => Err(RuleError::Evaluation {
                    rule: rule.name().to_string(),
                    reason: format!("sample store is corrupted: {reason}"),
                }),
                None => evaluate_rule(&rule, &snapshot, arena, now),
            };
            let elapsed = started.elapsed();

            result.rules_evaluated += 1;
            entry.health.last_evaluation = Some(now);
            entry.health.last_duration_ms = elapsed.as_secs_f64() * 1000.0;
            entry.health.evaluations += 1;

            match outcome {
                Ok(events) => {
                    entry.health.last_error = None;
                    result.events.extend(events);
                }
                Err(e) => {
                    result.rules_errored += 1;
                    entry.health.failures += 1;
                    entry.health.last_error = Some(e.to_string());
                    warn!(rule = %rule.name(), error = %e, "failed to evaluate rule");
                }
            }

            if let Some(metrics) = &self.metrics {
                metrics.record_rule_evaluation(
                    rule.name(),
                    entry.health.last_error.is_none(),
                    elapsed,
                );
            }
        }

        if let Some(metrics) = &self.metrics {
            for alert_state in [AlertState::Pending, AlertState::Firing] {
                metrics.set_alerts(alert_state.as_str(), arena.count_in(alert_state));
            }
        }

        if result.rules_evaluated > 0 {
            debug!(
                rules_evaluated = result.rules_evaluated,
                rules_errored = result.rules_errored,
                transitions = result.events.len(),
                "evaluation complete"
            );
        }
        result
    }

    /// How long until the next rule is due.
    #[must_use]
    pub fn next_wait(&self, now: i64) -> Duration {
        self.state
            .lock()
            .rules
            .iter()
            .map(RuleEntry::next_due)
            .min()
            .map_or(IDLE_WAIT, |due| {
                Duration::from_millis(u64::try_from(due.saturating_sub(now)).unwrap_or(0))
            })
    }

    async fn publish(&self, events: Vec<AlertEvent>) {
        for event in events {
            if self.events.send(event).await.is_err() {
                warn!("alert event receiver closed, dropping transitions");
                return;
            }
        }
    }

    /// Runs the evaluation loop until `shutdown` turns true or its sender is
    /// dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(rules = self.rule_count(), "rule evaluator started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = self.evaluate_due(self.clock.now_millis());
            self.publish(result.events).await;

            let wait = self.next_wait(self.clock.now_millis());
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = self.rules_changed.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("rule evaluator stopped");
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Evaluates one rule and advances its instances.
///
/// On error the arena is left untouched.
fn evaluate_rule(
    rule: &Rule,
    snapshot: &Snapshot,
    arena: &mut InstanceArena,
    now: i64,
) -> Result<Vec<AlertEvent>> {
    let mut active: BTreeMap<Labels, f64> = BTreeMap::new();
    for element in rule.expr().evaluate(snapshot, now) {
        let labels = rule.alert_labels(&element.labels);
        if active.contains_key(&labels) {
            return Err(RuleError::Evaluation {
                rule: rule.name().to_string(),
                reason: format!("several series produce the alert labels {labels}"),
            });
        }
        active.insert(labels, element.value);
    }

    let mut events = Vec::new();

    for id in arena.ids_for_rule(rule.name()) {
        let Some(instance) = arena.get_mut(id) else {
            continue;
        };
        let still_true = active.contains_key(&instance.labels);
        match instance.state {
            AlertState::Firing if !still_true => {
                instance.resolve(now);
                instance.last_evaluated = now;
                info!(rule = %rule.name(), labels = %instance.labels, "alert resolved");
                events.push(AlertEvent::from(&*instance));
            }
            AlertState::Pending if !still_true => {
                debug!(rule = %rule.name(), labels = %instance.labels, "pending alert cleared");
                arena.remove(id);
            }
            AlertState::Resolved | AlertState::Inactive => {
                arena.remove(id);
            }
            AlertState::Pending | AlertState::Firing => {}
        }
    }

    let hold = millis(rule.for_duration());
    for (labels, value) in active {
        let annotations = template::expand_all(rule.annotations(), &labels, value);
        let key = InstanceKey {
            rule: rule.name().to_string(),
            labels,
        };

        let id = match arena.find(&key) {
            Some(id) => id,
            None => {
                debug!(rule = %rule.name(), labels = %key.labels, value, "alert pending");
                arena.insert(AlertInstance::pending(
                    key.rule,
                    key.labels,
                    annotations.clone(),
                    value,
                    now,
                ))
            }
        };
        let Some(instance) = arena.get_mut(id) else {
            continue;
        };

        instance.last_value = value;
        instance.last_evaluated = now;
        instance.annotations = annotations;

        if instance.state == AlertState::Pending
            && now.saturating_sub(instance.active_since) >= hold
            && instance.fire(now)
        {
            info!(
                rule = %rule.name(),
                labels = %instance.labels,
                value,
                "alert fired"
            );
            events.push(AlertEvent::from(&*instance));
        }
    }

    Ok(events)
}

/// Drops every instance of `rule`, resolving firing ones.
fn retire_instances(arena: &mut InstanceArena, rule: &str, now: i64) -> Vec<AlertEvent> {
    let mut events = Vec::new();
    for id in arena.ids_for_rule(rule) {
        if let Some(mut instance) = arena.remove(id) {
            if instance.resolve(now) {
                info!(rule = %rule, labels = %instance.labels, "alert resolved by rule removal");
                events.push(AlertEvent::from(&instance));
            }
        }
    }
    events
}
