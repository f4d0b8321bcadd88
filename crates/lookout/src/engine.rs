//! The running engine: one store, one scrape manager, one evaluator, one router.
//!
//! Every component runs as its own tokio task. They share nothing but the
//! [`SampleStore`] and the alert event channel between the evaluator and the
//! router. A single `watch` channel stops them all.

use std::sync::Arc;

use futures::future::join_all;
use lookout_alerts::{to_datetime, Router};
use lookout_config::{ConfigError, ConfigHandle, EngineConfig};
use lookout_metrics::prometheus::EngineMetrics;
use lookout_metrics::{Clock, EvictionReport, SampleStore, StoreConfig};
use lookout_rules::{AlertEvent, Element, Evaluator, Expr, RuleError};
use lookout_scrape::{Fetcher, ScrapeManager};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use crate::error::{DaemonError, Result};
use crate::persist::Spool;
use crate::reload::{router_settings, Plan};

/// Capacity of the evaluator to router channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The scrape-and-alert engine.
pub struct Engine {
    config: ConfigHandle,
    store: SampleStore,
    metrics: EngineMetrics,
    clock: Clock,
    scraper: ScrapeManager,
    evaluator: Arc<Evaluator>,
    router: Arc<Router>,
    spool: Option<Spool>,
    events: Mutex<Option<mpsc::Receiver<AlertEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    fatal: watch::Sender<Option<String>>,
    reload_lock: tokio::sync::Mutex<()>,
    started_at: Instant,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("generation", &self.config.generation())
            .field("scraper", &self.scraper)
            .field("evaluator", &self.evaluator)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine for the configuration in `config`.
    ///
    /// Nothing runs until [`Engine::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the route settings are rejected by the router.
    pub fn new(config: ConfigHandle, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        Self::with_clock(config, fetcher, Clock::new())
    }

    /// Creates an engine whose loops all read time from `clock`.
    ///
    /// # Errors
    ///
    /// Returns an error if the route settings are rejected by the router.
    pub fn with_clock(
        config: ConfigHandle,
        fetcher: Arc<dyn Fetcher>,
        clock: Clock,
    ) -> Result<Self> {
        let current = config.current();
        let store = SampleStore::new(StoreConfig {
            retention: current.global.retention(),
            out_of_order_tolerance: current.global.out_of_order_tolerance(),
        });
        let metrics = EngineMetrics::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let scraper = ScrapeManager::new(store.clone(), fetcher)
            .with_clock(clock)
            .with_metrics(metrics.clone());
        let evaluator = Evaluator::new(store.clone(), events_tx)
            .with_clock(clock)
            .with_metrics(metrics.clone());
        let router = Router::new(router_settings(&current.route, &current.global.external_url))?
            .with_clock(clock)
            .with_metrics(metrics.clone());
        let spool = current.global.spool_dir.as_ref().map(Spool::new);

        Ok(Self {
            config,
            store,
            metrics,
            clock,
            scraper,
            evaluator: Arc::new(evaluator),
            router: Arc::new(router),
            spool,
            events: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Vec::new()),
            shutdown: watch::channel(false).0,
            fatal: watch::channel(None).0,
            reload_lock: tokio::sync::Mutex::new(()),
            started_at: Instant::now(),
        })
    }

    // ============ Lifecycle ============

    /// Applies the current configuration, requeues spooled notifications and
    /// spawns the evaluator, router and maintenance tasks.
    ///
    /// Calling `start` a second time does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be turned into targets,
    /// rules, receivers and silences.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(events) = self.events.lock().take() else {
            warn!("engine already started");
            return Ok(());
        };

        let plan = Plan::build(&self.config.current(), self.wall_now())?;
        self.apply_plan(plan).await?;
        self.restore_spool();

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            Arc::clone(&self.evaluator).run(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.router).run(events, self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(self).maintain(self.shutdown.subscribe()),
        ));

        info!(
            generation = self.config.generation(),
            targets = self.scraper.len(),
            rules = self.evaluator.rule_count(),
            "engine started"
        );
        Ok(())
    }

    /// Stops every loop and spools notifications that are still undelivered.
    ///
    /// Scrapes and deliveries in flight get the configured grace period;
    /// whatever has not finished by then is abandoned. Returns the number of
    /// notifications left undelivered.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::Spool` if the spool cannot be written.
    pub async fn shutdown(&self) -> Result<usize> {
        let grace = self.config.current().global.shutdown_grace();
        info!(grace_ms = grace.as_millis(), "engine shutting down");
        self.shutdown.send_replace(true);

        self.scraper.shutdown(grace).await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<AbortHandle> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if timeout(grace, join_all(tasks)).await.is_err() {
            warn!(grace_ms = grace.as_millis(), "engine tasks did not stop within grace period");
            // Deliveries they still hold stay in the router and are spooled below.
            for task in aborts {
                task.abort();
            }
        }

        let now = self.clock.now_millis();
        self.router.flush(now);
        match timeout(grace, self.router.dispatch_due(now)).await {
            Ok(report) if report.attempted > 0 => {
                info!(
                    attempted = report.attempted,
                    delivered = report.delivered,
                    "final dispatch finished"
                );
            }
            Ok(_) => {}
            Err(_) => warn!("final dispatch abandoned after grace period"),
        }

        let pending = self.router.drain_pending();
        if !pending.is_empty() {
            match &self.spool {
                Some(spool) => spool.save(&pending)?,
                None => warn!(
                    count = pending.len(),
                    "no spool_dir configured, undelivered notifications are lost"
                ),
            }
        }

        info!(undelivered = pending.len(), "engine stopped");
        Ok(pending.len())
    }

    /// Subscribes to fatal errors. The value turns `Some` once the engine
    /// can no longer ingest, and the process should exit.
    #[must_use]
    pub fn fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.subscribe()
    }

    fn restore_spool(&self) {
        let Some(spool) = &self.spool else {
            return;
        };
        match spool.take() {
            Ok(notifications) if notifications.is_empty() => {}
            Ok(notifications) => {
                let restored = self.router.restore(notifications);
                info!(restored, path = %spool.path().display(), "requeued spooled notifications");
            }
            Err(e) => error!(error = %e, "failed to load notification spool"),
        }
    }

    // ============ Reload ============

    /// Re-reads the configuration file and applies it.
    ///
    /// Returns the new configuration generation.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no file to read or the new configuration
    /// is rejected. The previous configuration stays active.
    pub async fn reload(&self) -> Result<u64> {
        let loaded = self
            .config
            .source()
            .ok_or(ConfigError::NoSource)
            .and_then(EngineConfig::from_file);

        match loaded {
            Ok(config) => self.apply_config(config).await,
            Err(e) => {
                self.metrics.record_reload(false);
                warn!(error = %e, "configuration reload rejected, keeping previous configuration");
                Err(e.into())
            }
        }
    }

    /// Validates `config` and switches every component to it.
    ///
    /// Returns the new configuration generation.
    ///
    /// # Errors
    ///
    /// Returns an error if any part of the configuration is rejected. In that
    /// case no component is changed.
    pub async fn apply_config(&self, config: EngineConfig) -> Result<u64> {
        let _guard = self.reload_lock.lock().await;

        let result = self.try_apply(config).await;
        match &result {
            Ok(generation) => {
                self.metrics.record_reload(true);
                info!(generation, "configuration applied");
            }
            Err(e) => {
                self.metrics.record_reload(false);
                warn!(error = %e, "configuration reload rejected, keeping previous configuration");
            }
        }
        result
    }

    async fn try_apply(&self, config: EngineConfig) -> Result<u64> {
        config.validate()?;
        let plan = Plan::build(&config, self.wall_now())?;
        self.warn_restart_only(&config);
        self.commit(config, plan).await
    }

    /// Hands `plan` to the components, then publishes `config`.
    ///
    /// If a component refuses the plan, the components are put back on the
    /// active configuration, which stays published.
    async fn commit(&self, config: EngineConfig, plan: Plan) -> Result<u64> {
        if let Err(e) = self.apply_plan(plan).await {
            self.restore_active().await;
            return Err(e);
        }
        Ok(self.config.replace(config)?)
    }

    async fn restore_active(&self) {
        let active = self.config.current();
        let restored = match Plan::build(&active, self.wall_now()) {
            Ok(plan) => self.apply_plan(plan).await,
            Err(e) => Err(e),
        };
        if let Err(e) = restored {
            error!(error = %e, "failed to return components to the active configuration");
        }
    }

    async fn apply_plan(&self, plan: Plan) -> Result<()> {
        self.router.update_settings(plan.router)?;
        self.router.set_receivers(plan.receivers);
        self.router.silences().replace_configured(plan.silences);

        let rules = self.evaluator.replace_rules(plan.rules).await?;
        let targets = self.scraper.apply(plan.targets)?;

        info!(
            targets_started = targets.started,
            targets_stopped = targets.stopped,
            rules_added = rules.added,
            rules_changed = rules.changed,
            rules_removed = rules.removed,
            "components updated"
        );
        Ok(())
    }

    fn warn_restart_only(&self, next: &EngineConfig) {
        let current = self.config.current();
        let (old, new) = (&current.global, &next.global);
        if old.listen_addr != new.listen_addr {
            warn!(field = "global.listen_addr", "change takes effect after restart");
        }
        if old.out_of_order_tolerance_ms != new.out_of_order_tolerance_ms {
            warn!(field = "global.out_of_order_tolerance_ms", "change takes effect after restart");
        }
        if old.spool_dir != new.spool_dir {
            warn!(field = "global.spool_dir", "change takes effect after restart");
        }
    }

    // ============ Maintenance ============

    async fn maintain(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let interval = self.config.current().global.eviction_interval();
            tokio::select! {
                () = tokio::time::sleep(interval) => {
                    self.maintain_once();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Runs one maintenance pass: evicts samples older than the retention,
    /// drops long-expired silences, refreshes store gauges and checks the
    /// store for corruption.
    pub fn maintain_once(&self) -> EvictionReport {
        let now = self.clock.now_millis();
        let retention = self.config.current().global.retention();
        let cutoff = now.saturating_sub(i64::try_from(retention.as_millis()).unwrap_or(i64::MAX));

        let report = self.store.evict_before(cutoff);
        self.metrics.record_eviction(report.samples_removed);
        let stats = self.store.stats();
        self.metrics.set_store_stats(stats.series, stats.samples);

        let dropped = self.router.silences().gc(to_datetime(now));
        if dropped > 0 {
            info!(dropped, "expired silences removed");
        }

        if let Some(reason) = self.store.corruption() {
            self.fail(reason);
        }
        report
    }

    fn fail(&self, reason: String) {
        if self.fatal.borrow().is_some() {
            return;
        }
        error!(reason = %reason, "sample store corrupted, ingestion halted");
        self.fatal.send_replace(Some(reason));
    }

    /// Returns the fatal error, if one occurred.
    #[must_use]
    pub fn fatal_error(&self) -> Option<DaemonError> {
        self.fatal
            .borrow()
            .clone()
            .map(|reason| DaemonError::Corrupted { reason })
    }

    // ============ Accessors ============

    /// Evaluates an expression against the store at the current time.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::Parse` if the expression is malformed.
    pub fn query(&self, expr: &str) -> std::result::Result<Vec<Element>, RuleError> {
        let expr = Expr::parse(expr)?;
        Ok(expr.evaluate(&self.store.snapshot(), self.clock.now_millis()))
    }

    /// The configuration handle.
    #[must_use]
    pub const fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// The sample store.
    #[must_use]
    pub const fn store(&self) -> &SampleStore {
        &self.store
    }

    /// The engine's self-telemetry.
    #[must_use]
    pub const fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// The scrape manager.
    #[must_use]
    pub const fn scraper(&self) -> &ScrapeManager {
        &self.scraper
    }

    /// The rule evaluator.
    #[must_use]
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// The alert router.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The engine clock.
    #[must_use]
    pub const fn clock(&self) -> Clock {
        self.clock
    }

    /// Seconds since the engine was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn wall_now(&self) -> chrono::DateTime<chrono::Utc> {
        to_datetime(self.clock.now_millis())
    }
}
