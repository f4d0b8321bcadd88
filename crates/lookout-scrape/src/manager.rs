//! Running one scrape loop per target.
//!
//! The [`ScrapeManager`] owns a tokio task per target. Applying a new target
//! list keeps the loops of unchanged targets, stops loops whose target was
//! removed or changed, and starts loops for new targets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lookout_metrics::prometheus::EngineMetrics;
use lookout_metrics::{Clock, SampleStore};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::fetch::Fetcher;
use crate::scrape::{run_scrape_loop, LoopContext, TargetHealth};
use crate::target::{Target, TargetKey};

struct RunningLoop {
    target: Arc<Target>,
    health: Arc<RwLock<TargetHealth>>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Loops {
    running: HashMap<TargetKey, RunningLoop>,
    /// Stopped loops that may still be finishing a scrape.
    retiring: Vec<JoinHandle<()>>,
}

/// Counts of what [`ScrapeManager::apply`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Loops started for new or changed targets.
    pub started: usize,
    /// Loops stopped for removed or changed targets.
    pub stopped: usize,
    /// Loops left running.
    pub unchanged: usize,
}

/// A target and its scrape health.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    /// The target definition.
    pub target: Target,
    /// The scrape URL.
    pub url: String,
    /// Scrape health.
    pub health: TargetHealth,
}

/// Owns the scrape loops.
pub struct ScrapeManager {
    ctx: LoopContext,
    loops: Mutex<Loops>,
}

impl std::fmt::Debug for ScrapeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeManager")
            .field("targets", &self.loops.lock().running.len())
            .finish_non_exhaustive()
    }
}

impl ScrapeManager {
    /// Creates a manager with no targets.
    #[must_use]
    pub fn new(store: SampleStore, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            ctx: LoopContext {
                fetcher,
                store,
                clock: Clock::new(),
                metrics: None,
            },
            loops: Mutex::new(Loops::default()),
        }
    }

    /// Uses `clock` for sample timestamps.
    #[must_use]
    pub const fn with_clock(mut self, clock: Clock) -> Self {
        self.ctx.clock = clock;
        self
    }

    /// Reports scrape outcomes into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.ctx.metrics = Some(metrics);
        self
    }

    /// Replaces the target list.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the first invalid target; in that case nothing is changed.
    pub fn apply(&self, targets: Vec<Target>) -> Result<ApplyReport> {
        for target in &targets {
            target.validate()?;
        }

        let mut desired: HashMap<TargetKey, Target> =
            targets.into_iter().map(|t| (t.key(), t)).collect();
        let mut report = ApplyReport::default();
        let mut loops = self.loops.lock();

        let keys: Vec<TargetKey> = loops.running.keys().cloned().collect();
        for key in keys {
            let keep = desired
                .get(&key)
                .is_some_and(|t| loops.running.get(&key).is_some_and(|l| *l.target == *t));

            if keep {
                desired.remove(&key);
                report.unchanged += 1;
            } else if let Some(old) = loops.running.remove(&key) {
                let _ = old.stop.send(true);
                loops.retiring.push(old.handle);
                report.stopped += 1;
                info!(target = %key, "stopped scrape loop");
            }
        }

        for (key, target) in desired {
            let target = Arc::new(target);
            let health = Arc::new(RwLock::new(TargetHealth::default()));
            let (stop, stop_rx) = watch::channel(false);
            let handle = tokio::spawn(run_scrape_loop(
                Arc::clone(&target),
                self.ctx.clone(),
                Arc::clone(&health),
                stop_rx,
            ));
            info!(
                target = %key,
                interval_ms = target.interval.as_millis(),
                "started scrape loop"
            );
            loops.running.insert(
                key,
                RunningLoop {
                    target,
                    health,
                    stop,
                    handle,
                },
            );
            report.started += 1;
        }

        loops.retiring.retain(|h| !h.is_finished());
        Ok(report)
    }

    /// Returns every target with its health, ordered by job and instance.
    #[must_use]
    pub fn targets(&self) -> Vec<TargetStatus> {
        let loops = self.loops.lock();
        let mut statuses: Vec<TargetStatus> = loops
            .running
            .values()
            .map(|l| TargetStatus {
                target: (*l.target).clone(),
                url: l.target.url(),
                health: l.health.read().clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.target.key().cmp(&b.target.key()));
        statuses
    }

    /// Number of running loops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.loops.lock().running.len()
    }

    /// Returns true if no loops are running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every loop and waits up to `grace` for in-flight scrapes.
    ///
    /// Loops still running after the grace period are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut loops = self.loops.lock();
            let mut handles: Vec<JoinHandle<()>> = loops.retiring.drain(..).collect();
            for (_, running) in loops.running.drain() {
                let _ = running.stop.send(true);
                handles.push(running.handle);
            }
            handles
        };

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            warn!(
                grace_ms = grace.as_millis(),
                "scrape loops did not stop within grace period, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
        info!("scrape manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrape::tests::{Scripted, ScriptedFetcher};
    use lookout_metrics::{MetricName, Selector, TimeRange};

    fn target(job: &str, address: &str) -> Target {
        Target::new(job, address)
            .with_interval(Duration::from_secs(10))
            .with_timeout(Duration::from_secs(2))
    }

    fn manager(store: &SampleStore) -> ScrapeManager {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Scripted::Body("requests_total 1\n")]));
        ScrapeManager::new(store.clone(), fetcher).with_clock(Clock::starting_at(0))
    }

    #[tokio::test(start_paused = true)]
    async fn apply_starts_loops() {
        let store = SampleStore::default();
        let manager = manager(&store);

        let report = manager
            .apply(vec![target("a", "h1:1"), target("b", "h2:1")])
            .unwrap();

        assert_eq!(report.started, 2);
        assert_eq!(manager.len(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let targets = manager.targets();
        assert_eq!(targets[0].target.job, "a");
        assert_eq!(targets[0].health.scrapes, 1);
        assert_eq!(targets[1].url, "http://h2:1/metrics");

        manager.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn apply_diffs_targets() {
        let store = SampleStore::default();
        let manager = manager(&store);
        manager
            .apply(vec![target("a", "h1:1"), target("b", "h2:1"), target("c", "h3:1")])
            .unwrap();

        let changed_b = target("b", "h2:1").with_path("/other");
        let report = manager
            .apply(vec![target("a", "h1:1"), changed_b, target("d", "h4:1")])
            .unwrap();

        assert_eq!(
            report,
            ApplyReport {
                started: 2,
                stopped: 2,
                unchanged: 1
            }
        );
        let jobs: Vec<String> = manager.targets().into_iter().map(|t| t.target.job).collect();
        assert_eq!(jobs, vec!["a", "b", "d"]);

        manager.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_target_rejects_whole_apply() {
        let store = SampleStore::default();
        let manager = manager(&store);
        manager.apply(vec![target("a", "h1:1")]).unwrap();

        let bad = target("b", "h2:1").with_timeout(Duration::from_secs(10));
        assert!(manager.apply(vec![target("c", "h3:1"), bad]).is_err());

        let jobs: Vec<String> = manager.targets().into_iter().map(|t| t.target.job).collect();
        assert_eq!(jobs, vec!["a"]);

        manager.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_scraping() {
        let store = SampleStore::default();
        let manager = manager(&store);
        manager.apply(vec![target("a", "h1:1")]).unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        manager.shutdown(Duration::from_secs(1)).await;
        assert!(manager.is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;

        let selector = Selector::metric(MetricName::new("up").unwrap());
        let count = store.query(&selector, TimeRange::all()).samples().count();
        // Scrapes at 0s, 10s and 20s only.
        assert_eq!(count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_hung_scrapes_after_grace() {
        let store = SampleStore::default();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Scripted::Hang]));
        let manager = ScrapeManager::new(store.clone(), fetcher);
        // Timeout far above the grace period.
        manager
            .apply(vec![Target::new("slow", "h:1")
                .with_interval(Duration::from_secs(120))
                .with_timeout(Duration::from_secs(60))])
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let started = tokio::time::Instant::now();
        manager.shutdown(Duration::from_secs(1)).await;

        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
