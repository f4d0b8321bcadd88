//! Self-telemetry for the engine in Prometheus exposition format.
//!
//! [`EngineMetrics`] owns a `prometheus-client` registry with the counters,
//! gauges and histograms each component reports into. The daemon serves
//! [`EngineMetrics::encode`] from `GET /metrics`.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use lookout_metrics::prometheus::EngineMetrics;
//!
//! let metrics = EngineMetrics::new();
//! metrics.record_scrape("node", true, Duration::from_millis(12), 42);
//! metrics.set_store_stats(10, 420);
//!
//! let output = metrics.encode();
//! assert!(output.contains("lookout_scrapes_total"));
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for scrape outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ScrapeLabels {
    /// The scrape job.
    pub job: String,
    /// `success` or `failure`.
    pub result: String,
}

/// Labels for sample rejections.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectLabels {
    /// `out_of_order` or `duplicate`.
    pub reason: String,
}

/// Labels for per-rule metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RuleLabels {
    /// The rule name.
    pub rule: String,
}

/// Labels for alert state gauges.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AlertStateLabels {
    /// `pending` or `firing`.
    pub state: String,
}

/// Labels for notification outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NotificationLabels {
    /// The receiver name.
    pub receiver: String,
    /// `delivered`, `retried` or `failed`.
    pub outcome: String,
}

/// Labels for config reload outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReloadLabels {
    /// `success` or `failure`.
    pub result: String,
}

/// All engine self-telemetry.
///
/// Cloning is cheap; every clone reports into the same registry.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Arc<RwLock<Registry>>,
    scrapes_total: Family<ScrapeLabels, Counter>,
    scrape_duration_seconds: Histogram,
    samples_appended_total: Counter,
    samples_rejected_total: Family<RejectLabels, Counter>,
    store_series: Gauge,
    store_samples: Gauge,
    evicted_samples_total: Counter,
    rule_evaluations_total: Family<RuleLabels, Counter>,
    rule_evaluation_failures_total: Family<RuleLabels, Counter>,
    rule_evaluation_duration_seconds: Histogram,
    alerts: Family<AlertStateLabels, Gauge>,
    notifications_total: Family<NotificationLabels, Counter>,
    alerts_silenced_total: Counter,
    config_reloads_total: Family<ReloadLabels, Counter>,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("store_series", &self.store_series.get())
            .field("store_samples", &self.store_samples.get())
            .finish_non_exhaustive()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    /// Creates the registry with every engine metric registered.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("lookout");

        let scrapes_total = Family::<ScrapeLabels, Counter>::default();
        registry.register("scrapes", "Scrapes by job and result", scrapes_total.clone());

        // 1ms to ~16s
        let scrape_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 15));
        registry.register(
            "scrape_duration_seconds",
            "Time taken to fetch and ingest one target",
            scrape_duration_seconds.clone(),
        );

        let samples_appended_total = Counter::default();
        registry.register(
            "samples_appended",
            "Samples accepted by the store",
            samples_appended_total.clone(),
        );

        let samples_rejected_total = Family::<RejectLabels, Counter>::default();
        registry.register(
            "samples_rejected",
            "Samples rejected by the store",
            samples_rejected_total.clone(),
        );

        let store_series = Gauge::default();
        registry.register("store_series", "Series held in memory", store_series.clone());

        let store_samples = Gauge::default();
        registry.register("store_samples", "Samples held in memory", store_samples.clone());

        let evicted_samples_total = Counter::default();
        registry.register(
            "evicted_samples",
            "Samples removed by retention",
            evicted_samples_total.clone(),
        );

        let rule_evaluations_total = Family::<RuleLabels, Counter>::default();
        registry.register(
            "rule_evaluations",
            "Rule evaluations",
            rule_evaluations_total.clone(),
        );

        let rule_evaluation_failures_total = Family::<RuleLabels, Counter>::default();
        registry.register(
            "rule_evaluation_failures",
            "Rule evaluations that returned an error",
            rule_evaluation_failures_total.clone(),
        );

        let rule_evaluation_duration_seconds = Histogram::new(exponential_buckets(0.0001, 2.0, 15));
        registry.register(
            "rule_evaluation_duration_seconds",
            "Time taken to evaluate one rule",
            rule_evaluation_duration_seconds.clone(),
        );

        let alerts = Family::<AlertStateLabels, Gauge>::default();
        registry.register("alerts", "Active alert instances by state", alerts.clone());

        let notifications_total = Family::<NotificationLabels, Counter>::default();
        registry.register(
            "notifications",
            "Notification delivery attempts by receiver and outcome",
            notifications_total.clone(),
        );

        let alerts_silenced_total = Counter::default();
        registry.register(
            "alerts_silenced",
            "Alerts suppressed by a silence",
            alerts_silenced_total.clone(),
        );

        let config_reloads_total = Family::<ReloadLabels, Counter>::default();
        registry.register(
            "config_reloads",
            "Configuration reloads by result",
            config_reloads_total.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            scrapes_total,
            scrape_duration_seconds,
            samples_appended_total,
            samples_rejected_total,
            store_series,
            store_samples,
            evicted_samples_total,
            rule_evaluations_total,
            rule_evaluation_failures_total,
            rule_evaluation_duration_seconds,
            alerts,
            notifications_total,
            alerts_silenced_total,
            config_reloads_total,
        }
    }

    /// Records the outcome of one scrape.
    pub fn record_scrape(&self, job: &str, success: bool, duration: Duration, appended: usize) {
        let labels = ScrapeLabels {
            job: job.to_string(),
            result: outcome(success).to_string(),
        };
        self.scrapes_total.get_or_create(&labels).inc();
        self.scrape_duration_seconds.observe(duration.as_secs_f64());
        self.samples_appended_total.inc_by(appended as u64);
    }

    /// Counts samples rejected by the store.
    pub fn record_rejected(&self, reason: &str, count: usize) {
        if count == 0 {
            return;
        }
        let labels = RejectLabels {
            reason: reason.to_string(),
        };
        self.samples_rejected_total
            .get_or_create(&labels)
            .inc_by(count as u64);
    }

    /// Publishes the store's current size.
    #[allow(clippy::cast_possible_wrap)] // Store sizes won't exceed i64::MAX
    pub fn set_store_stats(&self, series: usize, samples: usize) {
        self.store_series.set(series as i64);
        self.store_samples.set(samples as i64);
    }

    /// Counts samples removed by an eviction pass.
    pub fn record_eviction(&self, samples_removed: usize) {
        self.evicted_samples_total.inc_by(samples_removed as u64);
    }

    /// Records one rule evaluation.
    pub fn record_rule_evaluation(&self, rule: &str, success: bool, duration: Duration) {
        let labels = RuleLabels {
            rule: rule.to_string(),
        };
        self.rule_evaluations_total.get_or_create(&labels).inc();
        if !success {
            self.rule_evaluation_failures_total.get_or_create(&labels).inc();
        }
        self.rule_evaluation_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Publishes the number of alert instances in a state.
    #[allow(clippy::cast_possible_wrap)] // Alert counts won't exceed i64::MAX
    pub fn set_alerts(&self, state: &str, count: usize) {
        let labels = AlertStateLabels {
            state: state.to_string(),
        };
        self.alerts.get_or_create(&labels).set(count as i64);
    }

    /// Counts a notification delivery outcome.
    pub fn record_notification(&self, receiver: &str, outcome: &str) {
        let labels = NotificationLabels {
            receiver: receiver.to_string(),
            outcome: outcome.to_string(),
        };
        self.notifications_total.get_or_create(&labels).inc();
    }

    /// Counts alerts suppressed by silences.
    pub fn record_silenced(&self, count: usize) {
        self.alerts_silenced_total.inc_by(count as u64);
    }

    /// Counts a configuration reload.
    pub fn record_reload(&self, success: bool) {
        let labels = ReloadLabels {
            result: outcome(success).to_string(),
        };
        self.config_reloads_total.get_or_create(&labels).inc();
    }

    /// Returns the count of scrapes for a job and result.
    #[must_use]
    pub fn scrapes(&self, job: &str, success: bool) -> u64 {
        let labels = ScrapeLabels {
            job: job.to_string(),
            result: outcome(success).to_string(),
        };
        self.scrapes_total.get_or_create(&labels).get()
    }

    /// Returns the count of notifications for a receiver and outcome.
    #[must_use]
    pub fn notifications(&self, receiver: &str, outcome: &str) -> u64 {
        let labels = NotificationLabels {
            receiver: receiver.to_string(),
            outcome: outcome.to_string(),
        };
        self.notifications_total.get_or_create(&labels).get()
    }

    /// Returns the count of failed evaluations for a rule.
    #[must_use]
    pub fn rule_failures(&self, rule: &str) -> u64 {
        let labels = RuleLabels {
            rule: rule.to_string(),
        };
        self.rule_evaluation_failures_total.get_or_create(&labels).get()
    }

    /// Encodes all metrics in Prometheus text format.
    #[must_use]
    pub fn encode(&self) -> String {
        let registry = self.registry.read();
        let mut buffer = String::new();
        if encode(&mut buffer, &registry).is_err() {
            tracing::error!("failed to encode engine metrics");
            return String::new();
        }
        buffer
    }

    /// Returns the Content-Type header value for the encoded output.
    #[must_use]
    pub const fn content_type() -> &'static str {
        "text/plain; version=0.0.4; charset=utf-8"
    }
}

const fn outcome(success: bool) -> &'static str {
    if success { "success" } else { "failure" }
}
