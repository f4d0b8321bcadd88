//! The alert router.
//!
//! The [`Router`] receives [`AlertEvent`]s from the rule evaluator, groups
//! them by a configured label subset, deduplicates already-notified alerts
//! and turns each group flush into one [`Notification`] per receiver.
//! Notifications stay queued until a receiver accepts them or the retry
//! policy gives up, in which case they move to the failed list.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lookout_metrics::prometheus::EngineMetrics;
use lookout_metrics::{Clock, Labels};
use lookout_rules::AlertEvent;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{DeliveryError, Result};
use crate::receiver::Receiver;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::silence::SilenceStore;
use crate::types::{to_datetime, Alert, AlertStatus, DeliveryStatus, Notification};

/// How often the run loop checks for due flushes and retries.
pub const DISPATCH_TICK: Duration = Duration::from_millis(500);

/// Grouping, deduplication and delivery settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterSettings {
    /// Labels that form the grouping key.
    pub group_by: Vec<String>,
    /// How often groups are flushed into notifications.
    pub group_interval: Duration,
    /// How long before a still-firing alert is notified again.
    pub repeat_interval: Duration,
    /// Whether resolved alerts are notified.
    pub notify_on_resolve: bool,
    /// Receivers that notifications go to; empty means every receiver.
    pub receivers: Vec<String>,
    /// Delivery retry policy.
    pub retry: RetryPolicy,
    /// Link back to the engine, included in payloads.
    pub external_url: String,
    /// How many delivered and failed notifications are kept.
    pub history_limit: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            group_by: vec!["alertname".to_string()],
            group_interval: Duration::from_secs(10),
            repeat_interval: Duration::from_secs(4 * 3600),
            notify_on_resolve: true,
            receivers: Vec::new(),
            retry: RetryPolicy::default(),
            external_url: String::new(),
            history_limit: 1000,
        }
    }
}

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Delivery attempts made.
    pub attempted: usize,
    /// Notifications accepted by their receiver.
    pub delivered: usize,
    /// Failed attempts scheduled for a retry.
    pub retried: usize,
    /// Notifications that ran out of attempts.
    pub failed: usize,
}

/// Alerts sharing one grouping key.
#[derive(Debug)]
struct AlertGroup {
    labels: Labels,
    alerts: BTreeMap<String, Alert>,
    /// Fingerprint to the time its firing notification was last queued.
    notified: HashMap<String, i64>,
    last_flush: Option<i64>,
}

impl AlertGroup {
    fn new(labels: Labels) -> Self {
        Self {
            labels,
            alerts: BTreeMap::new(),
            notified: HashMap::new(),
            last_flush: None,
        }
    }

    fn is_due(&self, now: i64, interval: i64) -> bool {
        self.last_flush.is_none_or(|last| now - last >= interval)
    }
}

#[derive(Debug, Default)]
struct RouterState {
    groups: BTreeMap<String, AlertGroup>,
    queue: Vec<Notification>,
    /// Notifications handed to a receiver and not yet settled, by id.
    in_flight: BTreeMap<String, Notification>,
    history: VecDeque<Notification>,
    failed: VecDeque<Notification>,
}

/// Routes alert transitions to receivers.
#[derive(Debug)]
pub struct Router {
    settings: RwLock<RouterSettings>,
    receivers: RwLock<BTreeMap<String, Arc<dyn Receiver>>>,
    silences: Arc<SilenceStore>,
    state: Mutex<RouterState>,
    clock: Clock,
    metrics: Option<EngineMetrics>,
}

impl Router {
    /// Creates a router.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRetryPolicy` if the retry policy is invalid.
    pub fn new(settings: RouterSettings) -> Result<Self> {
        settings.retry.validate()?;
        Ok(Self {
            settings: RwLock::new(settings),
            receivers: RwLock::new(BTreeMap::new()),
            silences: Arc::new(SilenceStore::new()),
            state: Mutex::new(RouterState::default()),
            clock: Clock::new(),
            metrics: None,
        })
    }

    /// Uses `clock` for flush and retry timestamps.
    #[must_use]
    pub const fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Reports deliveries into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Adds a receiver, replacing any receiver with the same name.
    #[must_use]
    pub fn with_receiver(self, receiver: Arc<dyn Receiver>) -> Self {
        self.receivers
            .write()
            .insert(receiver.name().to_string(), receiver);
        self
    }

    // ============ Configuration ============

    /// Returns a copy of the current settings.
    #[must_use]
    pub fn settings(&self) -> RouterSettings {
        self.settings.read().clone()
    }

    /// Replaces the settings. Existing groups and queued notifications are kept.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRetryPolicy` if the retry policy is invalid;
    /// the previous settings stay in effect.
    pub fn update_settings(&self, settings: RouterSettings) -> Result<()> {
        settings.retry.validate()?;
        *self.settings.write() = settings;
        Ok(())
    }

    /// Replaces every receiver.
    ///
    /// Queued notifications addressed to a removed receiver fail with
    /// `UnknownReceiver` on their next attempt.
    pub fn set_receivers(&self, receivers: Vec<Arc<dyn Receiver>>) {
        let map = receivers
            .into_iter()
            .map(|r| (r.name().to_string(), r))
            .collect();
        *self.receivers.write() = map;
    }

    /// Names of the configured receivers.
    #[must_use]
    pub fn receiver_names(&self) -> Vec<String> {
        self.receivers.read().keys().cloned().collect()
    }

    /// The silence store consulted on every flush.
    #[must_use]
    pub const fn silences(&self) -> &Arc<SilenceStore> {
        &self.silences
    }

    // ============ Alert Intake ============

    /// Records an alert transition. Pending and inactive transitions are ignored.
    pub fn handle_event(&self, event: &AlertEvent) {
        let Some(alert) = Alert::from_event(event) else {
            return;
        };
        let group_by = self.settings.read().group_by.clone();
        let group_labels = alert.labels.keep_only(&group_by);
        let key = group_labels.to_string();

        let mut state = self.state.lock();
        let group = state
            .groups
            .entry(key.clone())
            .or_insert_with(|| AlertGroup::new(group_labels));

        match alert.status {
            AlertStatus::Firing => {
                let new_episode = group.alerts.get(&alert.fingerprint).is_some_and(|prev| {
                    prev.status == AlertStatus::Resolved || prev.starts_at != alert.starts_at
                });
                if new_episode {
                    // Resolved and fired again since the last flush.
                    debug!(group = %key, alert = %alert.name(), "alert firing again");
                    group.notified.remove(&alert.fingerprint);
                } else {
                    debug!(group = %key, alert = %alert.name(), "alert firing");
                }
                group.alerts.insert(alert.fingerprint.clone(), alert);
            }
            AlertStatus::Resolved if group.notified.contains_key(&alert.fingerprint) => {
                debug!(group = %key, alert = %alert.name(), "alert resolved");
                group.alerts.insert(alert.fingerprint.clone(), alert);
            }
            AlertStatus::Resolved => {
                // Never notified as firing, so there is nothing to resolve.
                group.alerts.remove(&alert.fingerprint);
                if group.alerts.is_empty() {
                    state.groups.remove(&key);
                }
            }
        }
    }

    /// Number of alerts held in groups.
    #[must_use]
    pub fn grouped_alerts(&self) -> usize {
        self.state.lock().groups.values().map(|g| g.alerts.len()).sum()
    }

    // ============ Flushing ============

    /// Flushes the groups that are new or whose group interval has elapsed
    /// since their last flush. Returns the number of notifications queued.
    pub fn flush_if_due(&self, now: i64) -> usize {
        self.flush_groups(now, false)
    }

    /// Flushes every group regardless of its group interval.
    ///
    /// Firing alerts are included if they were never notified or the repeat
    /// interval has elapsed. Resolved alerts are included once if their
    /// firing notification went out and `notify_on_resolve` is set. Alerts
    /// matched by an active silence are left out; silenced firing alerts stay
    /// in their group and are notified once the silence ends.
    ///
    /// Returns the number of notifications queued.
    pub fn flush(&self, now: i64) -> usize {
        self.flush_groups(now, true)
    }

    fn flush_groups(&self, now: i64, force: bool) -> usize {
        let settings = self.settings.read().clone();
        let receivers = self.route_receivers(&settings);
        let interval = millis(settings.group_interval);
        let repeat = millis(settings.repeat_interval);
        let wall = to_datetime(now);

        let mut state = self.state.lock();
        let mut queued = Vec::new();
        let mut silenced = 0;

        for (key, group) in &mut state.groups {
            if !force && !group.is_due(now, interval) {
                continue;
            }
            group.last_flush = Some(now);
            let mut to_send = Vec::new();

            for (fingerprint, alert) in &group.alerts {
                if self.silences.is_silenced(&alert.labels, wall) {
                    silenced += 1;
                    continue;
                }
                let send = match alert.status {
                    AlertStatus::Firing => group
                        .notified
                        .get(fingerprint)
                        .is_none_or(|&at| now - at >= repeat),
                    AlertStatus::Resolved => settings.notify_on_resolve,
                };
                if send {
                    to_send.push(alert.clone());
                }
            }

            for alert in &to_send {
                if alert.status == AlertStatus::Firing {
                    group.notified.insert(alert.fingerprint.clone(), now);
                }
            }

            let resolved: Vec<String> = group
                .alerts
                .iter()
                .filter(|(_, a)| a.status == AlertStatus::Resolved)
                .map(|(fp, _)| fp.clone())
                .collect();
            for fingerprint in resolved {
                group.alerts.remove(&fingerprint);
                group.notified.remove(&fingerprint);
            }

            if to_send.is_empty() {
                continue;
            }
            if receivers.is_empty() {
                warn!(
                    group = %key,
                    alerts = to_send.len(),
                    "no receivers configured, alerts not sent"
                );
                continue;
            }

            for receiver in &receivers {
                let notification = Notification::new(
                    receiver.clone(),
                    key.clone(),
                    group.labels.clone(),
                    to_send.clone(),
                    now,
                )
                .with_external_url(settings.external_url.clone());
                debug!(
                    notification_id = %notification.id,
                    receiver = %receiver,
                    group = %key,
                    alerts = notification.alerts.len(),
                    status = %notification.status,
                    "notification queued"
                );
                queued.push(notification);
            }
        }

        state.groups.retain(|_, g| !g.alerts.is_empty());
        let count = queued.len();
        state.queue.extend(queued);
        drop(state);

        if silenced > 0 {
            debug!(silenced, "alerts suppressed by silences");
            if let Some(metrics) = &self.metrics {
                metrics.record_silenced(silenced);
            }
        }
        self.silences.gc(wall);
        count
    }

    fn route_receivers(&self, settings: &RouterSettings) -> Vec<String> {
        if settings.receivers.is_empty() {
            self.receiver_names()
        } else {
            settings.receivers.clone()
        }
    }

    // ============ Dispatch ============

    /// Makes one delivery attempt for every queued notification whose retry
    /// time has come.
    ///
    /// Attempts run concurrently and without holding the router lock. While
    /// an attempt is outstanding its notification stays in router state, so
    /// a dispatch that is dropped before it settles loses nothing:
    /// [`Router::drain_pending`] still returns it.
    pub async fn dispatch_due(&self, now: i64) -> DispatchReport {
        let batch: Vec<Notification> = {
            let mut state = self.state.lock();
            let (mut due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.queue)
                .into_iter()
                .partition(|n| n.retry.is_eligible(now));
            state.queue = waiting;
            for notification in &mut due {
                notification.retry.begin_attempt();
                state
                    .in_flight
                    .insert(notification.id.clone(), notification.clone());
            }
            due
        };
        if batch.is_empty() {
            return DispatchReport::default();
        }

        let receivers = self.receivers.read().clone();
        let attempts = batch.into_iter().map(|notification| {
            let receiver = receivers.get(&notification.receiver).cloned();
            async move {
                let outcome = match receiver {
                    Some(receiver) => receiver.send(&notification).await,
                    None => Err(DeliveryError::UnknownReceiver {
                        receiver: notification.receiver.clone(),
                    }),
                };
                (notification, outcome)
            }
        });
        let results = join_all(attempts).await;

        let settings = self.settings.read().clone();
        let mut report = DispatchReport {
            attempted: results.len(),
            ..DispatchReport::default()
        };

        let mut state = self.state.lock();
        for (mut notification, outcome) in results {
            if state.in_flight.remove(&notification.id).is_none() {
                // Drained while the attempt was outstanding; the drained copy wins.
                debug!(notification_id = %notification.id, "attempt settled after drain, ignored");
                continue;
            }
            match outcome {
                Ok(()) => {
                    notification.delivery = DeliveryStatus::Delivered;
                    notification.delivered_at = Some(now);
                    info!(
                        notification_id = %notification.id,
                        receiver = %notification.receiver,
                        group = %notification.group_key,
                        alerts = notification.alerts.len(),
                        retries = notification.retry.retries(),
                        "notification delivered"
                    );
                    self.record(&notification.receiver, "delivered");
                    push_bounded(&mut state.history, notification, settings.history_limit);
                    report.delivered += 1;
                }
                Err(err) => {
                    notification.last_error = Some(err.to_string());
                    match notification.retry.record_failure(&settings.retry, now) {
                        RetryDecision::RetryAt(at) => {
                            warn!(
                                notification_id = %notification.id,
                                receiver = %notification.receiver,
                                attempt = notification.retry.attempts,
                                retry_in_ms = at - now,
                                error = %err,
                                "delivery failed, will retry"
                            );
                            self.record(&notification.receiver, "retried");
                            state.queue.push(notification);
                            report.retried += 1;
                        }
                        RetryDecision::GiveUp => {
                            notification.delivery = DeliveryStatus::Failed;
                            error!(
                                notification_id = %notification.id,
                                receiver = %notification.receiver,
                                group = %notification.group_key,
                                attempts = notification.retry.attempts,
                                error = %err,
                                "delivery failed permanently"
                            );
                            self.record(&notification.receiver, "failed");
                            let limit = settings.history_limit;
                            if state.failed.len() >= limit.max(1) {
                                warn!(limit, "failed notification list full, dropping oldest");
                            }
                            push_bounded(&mut state.failed, notification, limit);
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        report
    }

    fn record(&self, receiver: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_notification(receiver, outcome);
        }
    }

    // ============ Inspection ============

    /// Notifications waiting for delivery.
    #[must_use]
    pub fn pending(&self) -> Vec<Notification> {
        self.state.lock().queue.clone()
    }

    /// Delivered notifications, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Notification> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Notifications that ran out of attempts, oldest first.
    #[must_use]
    pub fn failed(&self) -> Vec<Notification> {
        self.state.lock().failed.iter().cloned().collect()
    }

    // ============ Shutdown ============

    /// Removes and returns every undelivered notification, including those
    /// whose delivery attempt has not settled yet.
    ///
    /// An attempt that settles after the drain is ignored.
    pub fn drain_pending(&self) -> Vec<Notification> {
        let mut state = self.state.lock();
        let mut drained = std::mem::take(&mut state.queue);
        drained.extend(std::mem::take(&mut state.in_flight).into_values());
        drained
    }

    /// Requeues notifications saved by [`Router::drain_pending`], making
    /// them eligible immediately. Returns the number requeued.
    pub fn restore(&self, notifications: Vec<Notification>) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        for mut notification in notifications {
            if notification.delivery != DeliveryStatus::Pending {
                continue;
            }
            notification.retry.next_eligible_at = None;
            state.queue.push(notification);
            count += 1;
        }
        count
    }

    /// Runs the router until `shutdown` turns true or its sender is dropped.
    ///
    /// Events are grouped as they arrive; every [`DISPATCH_TICK`] due groups
    /// are flushed and due notifications dispatched. On exit the groups are
    /// flushed once more so nothing is lost when the queue is drained.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<AlertEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(receivers = self.receivers.read().len(), "alert router started");
        let mut ticker = tokio::time::interval(DISPATCH_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(&event),
                    None => {
                        debug!("alert event channel closed");
                        events_open = false;
                    }
                },
                _ = ticker.tick() => {
                    let now = self.clock.now_millis();
                    self.flush_if_due(now);
                    self.dispatch_due(now).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        while let Ok(event) = events.try_recv() {
            self.handle_event(&event);
        }
        self.flush(self.clock.now_millis());
        info!(pending = self.state.lock().queue.len(), "alert router stopped");
    }
}

fn push_bounded(list: &mut VecDeque<Notification>, notification: Notification, limit: usize) {
    while list.len() >= limit.max(1) {
        list.pop_front();
    }
    list.push_back(notification);
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::DateTime;
    use lookout_metrics::LabelMatcher;
    use lookout_rules::AlertState;

    use crate::receiver::SendFuture;
    use crate::silence::Silence;
    use crate::types::NotificationStatus;

    /// Fails the first `failures` attempts, then accepts everything.
    #[derive(Debug)]
    struct ScriptedReceiver {
        name: String,
        failures: usize,
        calls: AtomicUsize,
        accepted: parking_lot::Mutex<Vec<Notification>>,
    }

    impl ScriptedReceiver {
        fn new(name: &str, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                failures,
                calls: AtomicUsize::new(0),
                accepted: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn accepted(&self) -> Vec<Notification> {
            self.accepted.lock().clone()
        }
    }

    impl Receiver for ScriptedReceiver {
        fn name(&self) -> &str {
            &self.name
        }

        fn send<'a>(&'a self, notification: &'a Notification) -> SendFuture<'a> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures {
                    return Err(DeliveryError::Status {
                        receiver: self.name.clone(),
                        status: 503,
                    });
                }
                self.accepted.lock().push(notification.clone());
                Ok(())
            })
        }
    }

    fn settings() -> RouterSettings {
        RouterSettings {
            group_by: vec!["alertname".to_string()],
            group_interval: Duration::from_secs(10),
            repeat_interval: Duration::from_secs(3600),
            notify_on_resolve: true,
            receivers: Vec::new(),
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(100),
                multiplier: 2.0,
                max_backoff: Duration::from_secs(10),
                max_attempts: 3,
                jitter: 0.0,
            },
            external_url: "http://lookout:9090".to_string(),
            history_limit: 10,
        }
    }

    fn router(receiver: &Arc<ScriptedReceiver>) -> Router {
        Router::new(settings())
            .unwrap()
            .with_receiver(Arc::clone(receiver) as Arc<dyn Receiver>)
    }

    fn event(name: &str, instance: &str, state: AlertState, at: i64) -> AlertEvent {
        AlertEvent {
            rule: name.to_string(),
            state,
            labels: Labels::new()
                .with("alertname", name)
                .with("instance", instance),
            annotations: BTreeMap::new(),
            value: 1.0,
            active_since: 0,
            fired_at: Some(at),
            resolved_at: (state == AlertState::Resolved).then_some(at),
        }
    }

    mod grouping {
        use super::*;

        #[test]
        fn alerts_with_same_group_labels_share_a_notification() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.handle_event(&event("Down", "b", AlertState::Firing, 0));
            router.handle_event(&event("HighErrors", "a", AlertState::Firing, 0));

            assert_eq!(router.flush(0), 2);
            let pending = router.pending();
            let down = pending
                .iter()
                .find(|n| n.group_key == "{alertname=\"Down\"}")
                .unwrap();
            assert_eq!(down.alerts.len(), 2);
            assert_eq!(down.group_labels.get("alertname"), Some("Down"));
            assert_eq!(down.external_url, "http://lookout:9090");
        }

        #[test]
        fn one_notification_per_receiver() {
            let ops = ScriptedReceiver::new("ops", 0);
            let pager = ScriptedReceiver::new("pager", 0);
            let router = router(&ops).with_receiver(Arc::clone(&pager) as Arc<dyn Receiver>);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            assert_eq!(router.flush(0), 2);

            let mut names: Vec<_> = router.pending().into_iter().map(|n| n.receiver).collect();
            names.sort();
            assert_eq!(names, ["ops", "pager"]);
        }

        #[test]
        fn route_receivers_limit_targets() {
            let ops = ScriptedReceiver::new("ops", 0);
            let pager = ScriptedReceiver::new("pager", 0);
            let router = router(&ops).with_receiver(Arc::clone(&pager) as Arc<dyn Receiver>);
            router
                .update_settings(RouterSettings {
                    receivers: vec!["pager".to_string()],
                    ..settings()
                })
                .unwrap();

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);
            let pending = router.pending();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].receiver, "pager");
        }

        #[test]
        fn pending_events_are_ignored() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);

            router.handle_event(&event("Down", "a", AlertState::Pending, 0));
            assert_eq!(router.grouped_alerts(), 0);
            assert_eq!(router.flush(0), 0);
        }

        #[test]
        fn flush_waits_for_group_interval() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            assert_eq!(router.flush_if_due(0), 1);

            router.handle_event(&event("Down", "b", AlertState::Firing, 5_000));
            assert_eq!(router.flush_if_due(5_000), 0);
            assert_eq!(router.flush_if_due(10_000), 1);
        }
    }

    mod dedup {
        use super::*;

        #[test]
        fn notified_alert_is_not_resent_before_repeat_interval() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            assert_eq!(router.flush(0), 1);
            assert_eq!(router.flush(10_000), 0);

            router.handle_event(&event("Down", "b", AlertState::Firing, 20_000));
            assert_eq!(router.flush(20_000), 1);
            let latest = router.pending().pop().unwrap();
            assert_eq!(latest.alerts.len(), 1);
            assert_eq!(latest.alerts[0].labels.get("instance"), Some("b"));
        }

        #[test]
        fn repeat_interval_resends() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);
            assert_eq!(router.flush(3_599_999), 0);
            assert_eq!(router.flush(3_600_000), 1);
        }

        #[test]
        fn resolved_is_sent_once_after_firing() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);
            router.handle_event(&event("Down", "a", AlertState::Resolved, 30_000));
            assert_eq!(router.flush(30_000), 1);

            let resolved = router.pending().pop().unwrap();
            assert_eq!(resolved.status, NotificationStatus::Resolved);
            assert_eq!(resolved.alerts[0].ends_at, Some(30_000));

            assert_eq!(router.flush(40_000), 0);
            assert_eq!(router.grouped_alerts(), 0);
        }

        #[test]
        fn resolved_before_any_notification_is_dropped() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.handle_event(&event("Down", "a", AlertState::Resolved, 5_000));
            assert_eq!(router.flush(10_000), 0);
            assert_eq!(router.grouped_alerts(), 0);
        }

        #[tokio::test]
        async fn refiring_within_group_interval_is_a_new_episode() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);
            router.dispatch_due(0).await;

            router.handle_event(&event("Down", "a", AlertState::Resolved, 2_000));
            let mut refire = event("Down", "a", AlertState::Firing, 4_000);
            refire.active_since = 4_000;
            router.handle_event(&refire);

            assert_eq!(router.flush_if_due(10_000), 1);
            router.dispatch_due(10_000).await;
            assert_eq!(router.flush_if_due(20_000), 0);

            let sent: Vec<(NotificationStatus, i64)> = receiver
                .accepted()
                .iter()
                .map(|n| (n.status, n.alerts[0].starts_at))
                .collect();
            assert_eq!(
                sent,
                vec![
                    (NotificationStatus::Firing, 0),
                    (NotificationStatus::Firing, 4_000)
                ]
            );
        }

        #[test]
        fn firing_with_new_start_resets_dedup() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);

            let mut refire = event("Down", "a", AlertState::Firing, 5_000);
            refire.active_since = 5_000;
            router.handle_event(&refire);
            assert_eq!(router.flush(10_000), 1);
            assert_eq!(router.flush(20_000), 0);
        }

        #[test]
        fn notify_on_resolve_disabled() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);
            router
                .update_settings(RouterSettings {
                    notify_on_resolve: false,
                    ..settings()
                })
                .unwrap();

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);
            router.handle_event(&event("Down", "a", AlertState::Resolved, 30_000));
            assert_eq!(router.flush(30_000), 0);
            assert_eq!(router.grouped_alerts(), 0);
        }
    }

    mod silences {
        use super::*;

        fn silence_instance(router: &Router, instance: &str, until_secs: i64) -> String {
            router.silences().add(
                Silence::new(
                    vec![LabelMatcher::equal("instance", instance).unwrap()],
                    DateTime::from_timestamp(0, 0).unwrap(),
                    DateTime::from_timestamp(until_secs, 0).unwrap(),
                    "admin",
                    "maintenance",
                )
                .unwrap(),
            )
        }

        #[test]
        fn silenced_alerts_are_not_dispatched() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let metrics = EngineMetrics::new();
            let router = router(&receiver).with_metrics(metrics.clone());
            silence_instance(&router, "a", 100);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.handle_event(&event("Down", "b", AlertState::Firing, 0));
            assert_eq!(router.flush(1_000), 1);

            let pending = router.pending();
            assert_eq!(pending[0].alerts.len(), 1);
            assert_eq!(pending[0].alerts[0].labels.get("instance"), Some("b"));
            assert!(metrics.encode().contains("lookout_alerts_silenced_total 1"));
        }

        #[test]
        fn alert_is_sent_once_silence_ends() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);
            silence_instance(&router, "a", 100);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            assert_eq!(router.flush(1_000), 0);
            assert_eq!(router.grouped_alerts(), 1);
            assert_eq!(router.flush(100_000), 1);
        }

        #[test]
        fn expired_silence_stops_suppressing() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);
            let id = silence_instance(&router, "a", 100);
            router
                .silences()
                .expire(&id, DateTime::from_timestamp(5, 0).unwrap())
                .unwrap();

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            assert_eq!(router.flush(6_000), 1);
        }
    }

    mod delivery {
        use super::*;

        #[tokio::test]
        async fn delivered_notifications_move_to_history() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let metrics = EngineMetrics::new();
            let router = router(&receiver).with_metrics(metrics.clone());

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);
            let report = router.dispatch_due(0).await;

            assert_eq!(report.delivered, 1);
            assert!(router.pending().is_empty());
            let history = router.history();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].delivery, DeliveryStatus::Delivered);
            assert_eq!(history[0].delivered_at, Some(0));
            assert_eq!(metrics.notifications("ops", "delivered"), 1);
        }

        #[tokio::test]
        async fn two_failures_then_success_is_one_delivery_with_two_retries() {
            let receiver = ScriptedReceiver::new("ops", 2);
            let router = router(&receiver);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);

            let first = router.dispatch_due(0).await;
            assert_eq!(first.retried, 1);
            assert_eq!(router.pending()[0].retry.next_eligible_at, Some(100));

            assert_eq!(router.dispatch_due(50).await.attempted, 0);

            let second = router.dispatch_due(100).await;
            assert_eq!(second.retried, 1);
            assert_eq!(router.pending()[0].retry.next_eligible_at, Some(300));

            let third = router.dispatch_due(300).await;
            assert_eq!(third.delivered, 1);

            assert_eq!(receiver.calls(), 3);
            assert_eq!(receiver.accepted().len(), 1);
            let history = router.history();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].retry.retries(), 2);
            assert!(router.failed().is_empty());
        }

        #[tokio::test]
        async fn exhausted_retries_mark_failed() {
            let receiver = ScriptedReceiver::new("ops", usize::MAX);
            let metrics = EngineMetrics::new();
            let router = router(&receiver).with_metrics(metrics.clone());

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);
            router.dispatch_due(0).await;
            router.dispatch_due(100).await;
            let last = router.dispatch_due(300).await;

            assert_eq!(last.failed, 1);
            assert!(router.pending().is_empty());
            let failed = router.failed();
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].delivery, DeliveryStatus::Failed);
            assert_eq!(failed[0].retry.attempts, 3);
            assert!(failed[0].last_error.as_deref().unwrap().contains("503"));
            assert_eq!(metrics.notifications("ops", "failed"), 1);
            assert_eq!(metrics.notifications("ops", "retried"), 2);
        }

        #[tokio::test]
        async fn removed_receiver_fails_notification() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);
            router
                .update_settings(RouterSettings {
                    retry: RetryPolicy::no_retry(),
                    ..settings()
                })
                .unwrap();

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);
            router.set_receivers(Vec::new());
            router.dispatch_due(0).await;

            let failed = router.failed();
            assert_eq!(failed.len(), 1);
            assert!(failed[0].last_error.as_deref().unwrap().contains("not configured"));
        }

        #[tokio::test]
        async fn history_is_bounded() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);
            router
                .update_settings(RouterSettings {
                    history_limit: 2,
                    ..settings()
                })
                .unwrap();

            for i in 0..3 {
                router.handle_event(&event(&format!("Alert{i}"), "a", AlertState::Firing, 0));
            }
            router.flush(0);
            router.dispatch_due(0).await;
            assert_eq!(router.history().len(), 2);
        }

        #[test]
        fn invalid_retry_policy_is_rejected() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = router(&receiver);
            let result = router.update_settings(RouterSettings {
                retry: RetryPolicy {
                    max_attempts: 0,
                    ..RetryPolicy::default()
                },
                ..settings()
            });
            assert!(result.is_err());
            assert_eq!(router.settings().retry.max_attempts, 3);
        }
    }

    mod shutdown {
        use super::*;

        #[tokio::test]
        async fn drain_and_restore_requeue_undelivered() {
            let receiver = ScriptedReceiver::new("ops", 1);
            let router = router(&receiver);

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);
            router.dispatch_due(0).await;

            let drained = router.drain_pending();
            assert_eq!(drained.len(), 1);
            assert!(router.pending().is_empty());

            let restarted = ScriptedReceiver::new("ops", 0);
            let fresh = Router::new(settings())
                .unwrap()
                .with_receiver(Arc::clone(&restarted) as Arc<dyn Receiver>);
            assert_eq!(fresh.restore(drained), 1);

            let report = fresh.dispatch_due(1).await;
            assert_eq!(report.delivered, 1);
            assert_eq!(fresh.history()[0].retry.retries(), 1);
        }

        /// Never answers.
        #[derive(Debug)]
        struct HangingReceiver;

        impl Receiver for HangingReceiver {
            fn name(&self) -> &str {
                "ops"
            }

            fn send<'a>(&'a self, _notification: &'a Notification) -> SendFuture<'a> {
                Box::pin(async {
                    std::future::pending::<()>().await;
                    Ok(())
                })
            }
        }

        /// Answers after `delay`.
        #[derive(Debug)]
        struct SlowReceiver {
            delay: Duration,
        }

        impl Receiver for SlowReceiver {
            fn name(&self) -> &str {
                "ops"
            }

            fn send<'a>(&'a self, _notification: &'a Notification) -> SendFuture<'a> {
                Box::pin(async move {
                    tokio::time::sleep(self.delay).await;
                    Ok(())
                })
            }
        }

        #[tokio::test(start_paused = true)]
        async fn abandoned_dispatch_is_drained() {
            let router = Router::new(settings())
                .unwrap()
                .with_receiver(Arc::new(HangingReceiver));

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);
            let dispatch = tokio::time::timeout(Duration::from_secs(5), router.dispatch_due(0));
            assert!(dispatch.await.is_err());
            assert!(router.pending().is_empty());

            let drained = router.drain_pending();
            assert_eq!(drained.len(), 1);
            assert_eq!(drained[0].retry.attempts, 1);
            assert_eq!(drained[0].delivery, DeliveryStatus::Pending);
            assert!(router.drain_pending().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn attempt_settling_after_drain_is_ignored() {
            let router = Arc::new(Router::new(settings()).unwrap().with_receiver(Arc::new(
                SlowReceiver {
                    delay: Duration::from_secs(10),
                },
            )));

            router.handle_event(&event("Down", "a", AlertState::Firing, 0));
            router.flush(0);
            let dispatch = tokio::spawn({
                let router = Arc::clone(&router);
                async move { router.dispatch_due(0).await }
            });
            tokio::time::sleep(Duration::from_secs(1)).await;

            assert_eq!(router.drain_pending().len(), 1);
            let report = dispatch.await.unwrap();
            assert_eq!(report.attempted, 1);
            assert_eq!(report.delivered, 0);
            assert!(router.history().is_empty());
            assert!(router.pending().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn run_loop_delivers_and_flushes_on_exit() {
            let receiver = ScriptedReceiver::new("ops", 0);
            let router = Arc::new(router(&receiver).with_clock(Clock::starting_at(0)));
            let (tx, rx) = mpsc::channel(8);
            let (stop, stop_rx) = watch::channel(false);
            let handle = tokio::spawn(Arc::clone(&router).run(rx, stop_rx));

            tx.send(event("Down", "a", AlertState::Firing, 0)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1_200)).await;
            assert_eq!(receiver.accepted().len(), 1);

            tx.send(event("Other", "a", AlertState::Firing, 0)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            stop.send(true).unwrap();
            handle.await.unwrap();

            assert_eq!(receiver.accepted().len(), 1);
            let pending = router.drain_pending();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].alerts[0].name(), "Other");
        }
    }
}
