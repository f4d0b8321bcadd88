//! A single scrape and the per-target loop.
//!
//! Each scrape fetches the target, parses the body and writes every sample
//! through one store appender, followed by the synthetic `up`,
//! `scrape_duration_seconds` and `scrape_samples_scraped` series. A failed
//! scrape still writes the synthetic series, with `up` set to 0.

use std::sync::Arc;
use std::time::Duration;

use lookout_metrics::prometheus::EngineMetrics;
use lookout_metrics::{Clock, Labels, MetricIdentity, MetricsError, SampleStore};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::error::{Result, ScrapeError};
use crate::exposition::{self, ParsedSample};
use crate::fetch::Fetcher;
use crate::target::{apply_target_labels, Target, TargetKey};

/// Outcome of one scrape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapeReport {
    /// The scraped target.
    pub target: TargetKey,
    /// Scrape timestamp in Unix milliseconds.
    pub timestamp: i64,
    /// Wall time spent on fetch, parse and ingest.
    pub duration: Duration,
    /// Whether the fetch and parse succeeded.
    pub up: bool,
    /// Number of samples in the body.
    pub samples_scraped: usize,
    /// Number of scraped samples the store accepted.
    pub appended: usize,
    /// Samples rejected as out of order.
    pub out_of_order: usize,
    /// Samples rejected as duplicates with a different value.
    pub duplicates: usize,
    /// The failure, if any.
    pub error: Option<String>,
}

/// Scrapes a target once and writes the result into the store.
///
/// The fetch is bounded by the target's timeout. Individual sample
/// rejections are counted, not treated as scrape failures.
///
/// # Errors
///
/// Returns `ScrapeError::Store` only if the store is corrupted; every other
/// failure is reported through `ScrapeReport::up` and `ScrapeReport::error`.
pub async fn scrape_once(
    target: &Target,
    fetcher: &dyn Fetcher,
    store: &SampleStore,
    timestamp: i64,
) -> Result<ScrapeReport> {
    let started = Instant::now();

    let fetched = match tokio::time::timeout(target.timeout, fetcher.fetch(target)).await {
        Ok(result) => result,
        Err(_) => Err(ScrapeError::Timeout {
            target: target.url(),
            timeout_ms: target.timeout.as_millis(),
        }),
    };
    let parsed = fetched.and_then(|body| exposition::parse(&body));

    let mut report = ScrapeReport {
        target: target.key(),
        timestamp,
        duration: Duration::ZERO,
        up: parsed.is_ok(),
        samples_scraped: 0,
        appended: 0,
        out_of_order: 0,
        duplicates: 0,
        error: None,
    };

    let target_labels = target.target_labels();
    let mut appender = store.appender();

    match parsed {
        Ok(samples) => {
            report.samples_scraped = samples.len();
            for sample in samples {
                append_scraped(&mut appender, &target_labels, sample, timestamp, &mut report)?;
            }
        }
        Err(e) => {
            warn!(target = %report.target, error = %e, "scrape failed");
            report.error = Some(e.to_string());
        }
    }

    report.duration = started.elapsed();

    #[allow(clippy::cast_precision_loss)] // Sample counts fit easily in f64
    let synthetic = [
        ("up", if report.up { 1.0 } else { 0.0 }),
        ("scrape_duration_seconds", report.duration.as_secs_f64()),
        ("scrape_samples_scraped", report.samples_scraped as f64),
    ];
    for (name, value) in synthetic {
        let identity = MetricIdentity::parse(name, target_labels.clone())?;
        match appender.append(&identity, timestamp, value) {
            Ok(()) => {}
            // The target exposed a series with the same identity.
            Err(e) if e.is_sample_rejection() => {
                debug!(series = %identity, error = %e, "synthetic sample rejected");
            }
            Err(e) => return Err(e.into()),
        }
    }
    appender.commit();

    debug!(
        target = %report.target,
        up = report.up,
        samples = report.samples_scraped,
        appended = report.appended,
        duration_ms = report.duration.as_millis(),
        "scrape complete"
    );

    Ok(report)
}

fn append_scraped(
    appender: &mut lookout_metrics::Appender,
    target_labels: &Labels,
    sample: ParsedSample,
    scrape_timestamp: i64,
    report: &mut ScrapeReport,
) -> Result<()> {
    let labels = apply_target_labels(sample.labels, target_labels);
    let identity = MetricIdentity::new(sample.name, labels);
    let timestamp = sample.timestamp.unwrap_or(scrape_timestamp);

    match appender.append(&identity, timestamp, sample.value) {
        Ok(()) => report.appended += 1,
        Err(MetricsError::OutOfOrder { .. }) => {
            report.out_of_order += 1;
            debug!(series = %identity, timestamp, "dropped out-of-order sample");
        }
        Err(MetricsError::DuplicateSample { .. }) => {
            report.duplicates += 1;
            debug!(series = %identity, timestamp, "dropped duplicate sample");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Health of a target as seen by its scrape loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TargetHealth {
    /// Outcome of the most recent scrape, if any.
    pub last_report: Option<ScrapeReport>,
    /// Total scrapes performed.
    pub scrapes: u64,
    /// Total failed scrapes.
    pub failures: u64,
}

impl TargetHealth {
    fn record(&mut self, report: ScrapeReport) {
        self.scrapes += 1;
        if !report.up {
            self.failures += 1;
        }
        self.last_report = Some(report);
    }
}

/// Everything a scrape loop needs besides its target.
#[derive(Clone)]
pub(crate) struct LoopContext {
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) store: SampleStore,
    pub(crate) clock: Clock,
    pub(crate) metrics: Option<EngineMetrics>,
}

/// Scrapes `target` on every tick until `stop` flips to true.
///
/// An in-flight scrape always runs to completion; it is bounded by the
/// target's timeout.
pub(crate) async fn run_scrape_loop(
    target: Arc<Target>,
    ctx: LoopContext,
    health: Arc<parking_lot::RwLock<TargetHealth>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(target.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                // A dropped sender also means stop.
                if changed.is_err() {
                    break;
                }
            }
        }
        if *stop.borrow() {
            break;
        }

        let timestamp = ctx.clock.now_millis();
        match scrape_once(&target, ctx.fetcher.as_ref(), &ctx.store, timestamp).await {
            Ok(report) => {
                if let Some(metrics) = &ctx.metrics {
                    metrics.record_scrape(&target.job, report.up, report.duration, report.appended);
                    metrics.record_rejected("out_of_order", report.out_of_order);
                    metrics.record_rejected("duplicate", report.duplicates);
                }
                health.write().record(report);
            }
            Err(e) => {
                error!(target = %target.key(), error = %e, "store rejected scrape, stopping loop");
                break;
            }
        }
    }

    debug!(target = %target.key(), "scrape loop stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;

    use lookout_metrics::{MetricName, Selector, TimeRange};
    use parking_lot::Mutex;

    /// A scripted response for [`ScriptedFetcher`].
    #[derive(Debug, Clone)]
    pub(crate) enum Scripted {
        Body(&'static str),
        Hang,
        Fail,
    }

    /// Replays scripted responses, then repeats the last one.
    #[derive(Debug)]
    pub(crate) struct ScriptedFetcher {
        script: Mutex<VecDeque<Scripted>>,
        last: Mutex<Scripted>,
    }

    impl ScriptedFetcher {
        pub(crate) fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(Scripted::Fail),
            }
        }
    }

    impl Fetcher for ScriptedFetcher {
        fn fetch<'a>(
            &'a self,
            target: &'a Target,
        ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
            let next = self.script.lock().pop_front();
            let step = match next {
                Some(step) => {
                    *self.last.lock() = step.clone();
                    step
                }
                None => self.last.lock().clone(),
            };
            Box::pin(async move {
                match step {
                    Scripted::Body(body) => Ok(body.to_string()),
                    Scripted::Hang => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(String::new())
                    }
                    Scripted::Fail => Err(ScrapeError::Request {
                        target: target.url(),
                        reason: "connection refused".to_string(),
                    }),
                }
            })
        }
    }

    fn test_target() -> Target {
        Target::new("app", "app:8080")
            .with_interval(Duration::from_secs(15))
            .with_timeout(Duration::from_secs(5))
            .with_label("env", "test")
    }

    fn values(store: &SampleStore, name: &str) -> Vec<f64> {
        let selector = Selector::metric(MetricName::new(name).unwrap());
        store
            .query(&selector, TimeRange::all())
            .samples()
            .map(|(_, s)| s.value)
            .collect()
    }

    #[tokio::test]
    async fn successful_scrape_writes_samples_and_synthetics() {
        let store = SampleStore::default();
        let fetcher = ScriptedFetcher::new(vec![Scripted::Body(
            "# TYPE http_requests_total counter\nhttp_requests_total{status=\"500\"} 7\n",
        )]);

        let report = scrape_once(&test_target(), &fetcher, &store, 1_000).await.unwrap();

        assert!(report.up);
        assert_eq!(report.samples_scraped, 1);
        assert_eq!(report.appended, 1);
        assert_eq!(values(&store, "up"), vec![1.0]);
        assert_eq!(values(&store, "scrape_samples_scraped"), vec![1.0]);
        assert_eq!(values(&store, "scrape_duration_seconds").len(), 1);

        let selector = Selector::metric(MetricName::new("http_requests_total").unwrap());
        let (identity, sample) = store
            .query(&selector, TimeRange::all())
            .samples()
            .next()
            .unwrap();
        assert_eq!(identity.labels.get("job"), Some("app"));
        assert_eq!(identity.labels.get("instance"), Some("app:8080"));
        assert_eq!(identity.labels.get("env"), Some("test"));
        assert_eq!(identity.labels.get("status"), Some("500"));
        assert_eq!(sample.timestamp, 1_000);
    }

    #[tokio::test]
    async fn explicit_timestamps_are_kept() {
        let store = SampleStore::default();
        let fetcher = ScriptedFetcher::new(vec![Scripted::Body("jobs_done 3 500\n")]);

        scrape_once(&test_target(), &fetcher, &store, 1_000).await.unwrap();

        let selector = Selector::metric(MetricName::new("jobs_done").unwrap());
        let ts: Vec<i64> = store
            .query(&selector, TimeRange::all())
            .samples()
            .map(|(_, s)| s.timestamp)
            .collect();
        assert_eq!(ts, vec![500]);
    }

    #[tokio::test]
    async fn failed_fetch_records_up_zero() {
        let store = SampleStore::default();
        let fetcher = ScriptedFetcher::new(vec![Scripted::Fail]);

        let report = scrape_once(&test_target(), &fetcher, &store, 1_000).await.unwrap();

        assert!(!report.up);
        assert!(report.error.is_some());
        assert_eq!(values(&store, "up"), vec![0.0]);
        assert_eq!(values(&store, "scrape_samples_scraped"), vec![0.0]);
    }

    #[tokio::test]
    async fn malformed_body_records_up_zero_and_no_samples() {
        let store = SampleStore::default();
        let fetcher = ScriptedFetcher::new(vec![Scripted::Body("good 1\nbad{ 2\n")]);

        let report = scrape_once(&test_target(), &fetcher, &store, 1_000).await.unwrap();

        assert!(!report.up);
        assert!(values(&store, "good").is_empty());
        assert_eq!(values(&store, "up"), vec![0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_fetch_times_out() {
        let store = SampleStore::default();
        let fetcher = ScriptedFetcher::new(vec![Scripted::Hang]);

        let report = scrape_once(&test_target(), &fetcher, &store, 1_000).await.unwrap();

        assert!(!report.up);
        assert!(report.error.unwrap().contains("timed out"));
        assert_eq!(values(&store, "up"), vec![0.0]);
    }

    #[tokio::test]
    async fn exposed_up_series_does_not_fail_scrape() {
        let store = SampleStore::default();
        let fetcher = ScriptedFetcher::new(vec![Scripted::Body("up 0\n")]);

        let report = scrape_once(&test_target(), &fetcher, &store, 1_000).await.unwrap();

        assert!(report.up);
        assert_eq!(values(&store, "up"), vec![0.0]);
    }

    #[tokio::test]
    async fn stale_explicit_timestamps_are_counted_not_fatal() {
        let store = SampleStore::default();
        let fetcher = ScriptedFetcher::new(vec![
            Scripted::Body("jobs_done 3 5000\n"),
            Scripted::Body("jobs_done 4 1000\n"),
        ]);
        let target = test_target();

        scrape_once(&target, &fetcher, &store, 10_000).await.unwrap();
        let report = scrape_once(&target, &fetcher, &store, 25_000).await.unwrap();

        assert!(report.up);
        assert_eq!(report.out_of_order, 1);
        assert_eq!(report.appended, 0);
        assert_eq!(values(&store, "up"), vec![1.0, 1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_scrapes_each_interval_until_stopped() {
        let store = SampleStore::default();
        let ctx = LoopContext {
            fetcher: Arc::new(ScriptedFetcher::new(vec![Scripted::Body("requests_total 1\n")])),
            store: store.clone(),
            clock: Clock::starting_at(0),
            metrics: None,
        };
        let health = Arc::new(parking_lot::RwLock::new(TargetHealth::default()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_scrape_loop(
            Arc::new(test_target()),
            ctx,
            Arc::clone(&health),
            stop_rx,
        ));

        // Ticks at 0s, 15s and 30s.
        tokio::time::sleep(Duration::from_secs(31)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(health.read().scrapes, 3);
        let selector = Selector::metric(MetricName::new("up").unwrap());
        let ts: Vec<i64> = store
            .query(&selector, TimeRange::all())
            .samples()
            .map(|(_, s)| s.timestamp)
            .collect();
        assert_eq!(ts, vec![0, 15_000, 30_000]);
    }
}
