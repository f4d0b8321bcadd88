//! In-memory sample storage with per-series locking.
//!
//! This module provides the [`SampleStore`], which keeps one append-only
//! [`Series`] per [`MetricIdentity`]. The series index is only locked long
//! enough to look up or create a series; all sample mutation happens under
//! that series' own lock, so writers to different series never contend.
//!
//! Writes go through an [`Appender`]. Samples written by an appender are
//! hidden from [`Snapshot`]s taken before it commits, which gives readers a
//! consistent view of the store as of the moment the snapshot was taken.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{MetricsError, Result};
use crate::isolation::{Isolation, IsolationState};
use crate::matcher::Selector;
use crate::types::{now_millis, Labels, MetricIdentity, MetricName, Sample, TimeRange};

/// Converts a Duration to milliseconds as i64.
#[allow(clippy::cast_possible_truncation)] // Durations won't exceed i64::MAX ms (~292M years)
pub(crate) const fn duration_to_millis(duration: Duration) -> i64 {
    duration.as_millis() as i64
}

/// Configuration for a [`SampleStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long samples are kept before the eviction pass removes them.
    pub retention: Duration,
    /// How far behind a series' newest sample a write may land.
    pub out_of_order_tolerance: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(15 * 24 * 3600),
            out_of_order_tolerance: Duration::ZERO,
        }
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// The cutoff used; samples strictly older were removed.
    pub cutoff: i64,
    /// Number of samples removed.
    pub samples_removed: usize,
    /// Number of series that became empty and were dropped.
    pub series_removed: usize,
}

/// Point-in-time size of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Number of series.
    pub series: usize,
    /// Number of samples across all series.
    pub samples: usize,
}

#[derive(Debug, Clone, Copy)]
struct StoredSample {
    timestamp: i64,
    value: f64,
    append_id: u64,
}

#[derive(Debug, Default)]
struct SeriesData {
    samples: Vec<StoredSample>,
    /// Set once the series was dropped from the index; writers must re-resolve.
    dropped: bool,
}

/// A time-ordered sequence of samples sharing one identity.
#[derive(Debug)]
pub struct Series {
    identity: Arc<MetricIdentity>,
    data: RwLock<SeriesData>,
}

impl Series {
    fn new(identity: MetricIdentity) -> Self {
        Self {
            identity: Arc::new(identity),
            data: RwLock::new(SeriesData::default()),
        }
    }

    /// The identity of this series.
    #[must_use]
    pub fn identity(&self) -> &Arc<MetricIdentity> {
        &self.identity
    }

    fn visible_in(&self, range: TimeRange, isolation: &IsolationState) -> Vec<Sample> {
        let data = self.data.read();
        let samples = &data.samples;
        let start = samples.partition_point(|s| s.timestamp < range.start);
        let end = samples.partition_point(|s| s.timestamp <= range.end);

        samples[start..end.max(start)]
            .iter()
            .filter(|s| isolation.is_visible(s.append_id))
            .map(|s| Sample::new(s.timestamp, s.value))
            .collect()
    }

    fn latest_visible(&self, range: TimeRange, isolation: &IsolationState) -> Option<Sample> {
        let data = self.data.read();
        let samples = &data.samples;
        let start = samples.partition_point(|s| s.timestamp < range.start);
        let end = samples.partition_point(|s| s.timestamp <= range.end);

        samples[start..end.max(start)]
            .iter()
            .rev()
            .find(|s| isolation.is_visible(s.append_id))
            .map(|s| Sample::new(s.timestamp, s.value))
    }
}

type SeriesIndex = HashMap<MetricName, HashMap<Labels, Arc<Series>>>;

#[derive(Debug)]
struct StoreInner {
    retention_millis: i64,
    tolerance_millis: i64,
    index: RwLock<SeriesIndex>,
    isolation: Isolation,
    corrupted: RwLock<Option<String>>,
}

impl StoreInner {
    fn check_healthy(&self) -> Result<()> {
        match self.corrupted.read().as_ref() {
            Some(reason) => Err(MetricsError::Corrupted {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn series_for(&self, identity: &MetricIdentity) -> Arc<Series> {
        if let Some(series) = self
            .index
            .read()
            .get(&identity.name)
            .and_then(|by_labels| by_labels.get(&identity.labels))
        {
            return Arc::clone(series);
        }

        let mut index = self.index.write();
        let series = index
            .entry(identity.name.clone())
            .or_default()
            .entry(identity.labels.clone())
            .or_insert_with(|| {
                debug!(series = %identity, "created series");
                Arc::new(Series::new(identity.clone()))
            });
        Arc::clone(series)
    }

    fn append(
        &self,
        append_id: u64,
        identity: &MetricIdentity,
        timestamp: i64,
        value: f64,
    ) -> Result<()> {
        self.check_healthy()?;

        loop {
            let series = self.series_for(identity);
            let mut data = series.data.write();
            if data.dropped {
                // Lost a race with eviction; resolve the replacement series.
                continue;
            }

            return insert_sample(
                &mut data.samples,
                identity,
                StoredSample {
                    timestamp,
                    value,
                    append_id,
                },
                self.tolerance_millis,
            );
        }
    }

    fn mark_corrupted(&self, reason: String) {
        error!(reason = %reason, "sample store corrupted, ingestion halted");
        let mut corrupted = self.corrupted.write();
        if corrupted.is_none() {
            *corrupted = Some(reason);
        }
    }
}

fn insert_sample(
    samples: &mut Vec<StoredSample>,
    identity: &MetricIdentity,
    sample: StoredSample,
    tolerance_millis: i64,
) -> Result<()> {
    let Some(last) = samples.last() else {
        samples.push(sample);
        return Ok(());
    };

    if sample.timestamp > last.timestamp {
        samples.push(sample);
        return Ok(());
    }

    if sample.timestamp < last.timestamp.saturating_sub(tolerance_millis) {
        return Err(MetricsError::OutOfOrder {
            series: identity.to_string(),
            timestamp: sample.timestamp,
            latest: last.timestamp,
            tolerance_ms: tolerance_millis,
        });
    }

    match samples.binary_search_by_key(&sample.timestamp, |s| s.timestamp) {
        Ok(pos) => {
            let existing = Sample::new(samples[pos].timestamp, samples[pos].value);
            if existing.same_value(sample.value) {
                Ok(())
            } else {
                Err(MetricsError::DuplicateSample {
                    series: identity.to_string(),
                    timestamp: sample.timestamp,
                })
            }
        }
        Err(pos) => {
            samples.insert(pos, sample);
            Ok(())
        }
    }
}

/// Thread-safe in-memory storage for series.
///
/// Cloning a `SampleStore` is cheap and yields a handle to the same data.
#[derive(Debug, Clone)]
pub struct SampleStore {
    inner: Arc<StoreInner>,
}

impl SampleStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                retention_millis: duration_to_millis(config.retention),
                tolerance_millis: duration_to_millis(config.out_of_order_tolerance),
                index: RwLock::new(HashMap::new()),
                isolation: Isolation::new(),
                corrupted: RwLock::new(None),
            }),
        }
    }

    /// Creates a store with the given retention and no out-of-order tolerance.
    #[must_use]
    pub fn with_retention(retention: Duration) -> Self {
        Self::new(StoreConfig {
            retention,
            ..StoreConfig::default()
        })
    }

    /// Returns the retention duration in milliseconds.
    #[must_use]
    pub fn retention_millis(&self) -> i64 {
        self.inner.retention_millis
    }

    /// Returns the out-of-order tolerance in milliseconds.
    #[must_use]
    pub fn tolerance_millis(&self) -> i64 {
        self.inner.tolerance_millis
    }

    /// Writes a single sample and commits it immediately.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::OutOfOrder` if the timestamp is older than the
    /// series head minus the tolerance, `MetricsError::DuplicateSample` if a
    /// different value already exists at this timestamp, and
    /// `MetricsError::Corrupted` once the store has been marked corrupted.
    pub fn write(&self, identity: &MetricIdentity, timestamp: i64, value: f64) -> Result<()> {
        let mut appender = self.appender();
        appender.append(identity, timestamp, value)?;
        appender.commit();
        Ok(())
    }

    /// Opens an appender for a batch of writes.
    #[must_use]
    pub fn appender(&self) -> Appender {
        Appender {
            inner: Arc::clone(&self.inner),
            id: self.inner.isolation.open(),
            appended: 0,
            closed: false,
        }
    }

    /// Captures a consistent read view of the store.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            inner: Arc::clone(&self.inner),
            isolation: Arc::new(self.inner.isolation.state()),
        }
    }

    /// Selects series through a fresh snapshot.
    #[must_use]
    pub fn query(&self, selector: &Selector, range: TimeRange) -> SeriesSet {
        self.snapshot().select(selector, range)
    }

    /// Removes samples older than `now - retention` from every series.
    pub fn evict(&self, retention: Duration) -> EvictionReport {
        self.evict_before(now_millis().saturating_sub(duration_to_millis(retention)))
    }

    /// Removes samples older than the configured retention.
    pub fn expire_old_data(&self) -> EvictionReport {
        self.evict_before(now_millis().saturating_sub(self.inner.retention_millis))
    }

    /// Removes every sample with a timestamp strictly before `cutoff`.
    ///
    /// Series are processed one at a time, so concurrent writers are blocked
    /// for at most one series' pass. The pass also verifies ordering; a
    /// violation marks the store corrupted.
    pub fn evict_before(&self, cutoff: i64) -> EvictionReport {
        let all_series: Vec<Arc<Series>> = self
            .inner
            .index
            .read()
            .values()
            .flat_map(|by_labels| by_labels.values().cloned())
            .collect();

        let mut report = EvictionReport {
            cutoff,
            ..EvictionReport::default()
        };
        let mut emptied = Vec::new();

        for series in all_series {
            let mut data = series.data.write();

            if let Some(pos) = data
                .samples
                .windows(2)
                .position(|w| w[0].timestamp >= w[1].timestamp)
            {
                let reason = format!(
                    "series {} is not strictly ordered at position {pos}",
                    series.identity
                );
                drop(data);
                self.inner.mark_corrupted(reason);
                continue;
            }

            let keep_from = data.samples.partition_point(|s| s.timestamp < cutoff);
            if keep_from > 0 {
                data.samples.drain(..keep_from);
                report.samples_removed += keep_from;
            }
            if data.samples.is_empty() {
                emptied.push(Arc::clone(&series));
            }
        }

        if !emptied.is_empty() {
            let mut index = self.inner.index.write();
            for series in emptied {
                let mut data = series.data.write();
                // A writer may have refilled it since the pass above.
                if !data.samples.is_empty() {
                    continue;
                }
                data.dropped = true;
                let name = &series.identity.name;
                if let Some(by_labels) = index.get_mut(name) {
                    by_labels.remove(&series.identity.labels);
                    if by_labels.is_empty() {
                        index.remove(name);
                    }
                }
                report.series_removed += 1;
            }
        }

        if report.samples_removed > 0 {
            info!(
                cutoff = report.cutoff,
                samples_removed = report.samples_removed,
                series_removed = report.series_removed,
                "evicted expired samples"
            );
        }

        report
    }

    /// Returns the corruption reason if ingestion has been halted.
    #[must_use]
    pub fn corruption(&self) -> Option<String> {
        self.inner.corrupted.read().clone()
    }

    /// Returns the number of series and samples currently held.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let index = self.inner.index.read();
        let mut stats = StoreStats::default();
        for series in index.values().flat_map(HashMap::values) {
            stats.series += 1;
            stats.samples += series.data.read().samples.len();
        }
        stats
    }

    /// Returns the number of samples stored for one identity.
    #[must_use]
    pub fn sample_count(&self, identity: &MetricIdentity) -> usize {
        self.inner
            .index
            .read()
            .get(&identity.name)
            .and_then(|by_labels| by_labels.get(&identity.labels))
            .map_or(0, |series| series.data.read().samples.len())
    }

    /// Returns every metric name in the store, sorted.
    #[must_use]
    pub fn metric_names(&self) -> Vec<MetricName> {
        let mut names: Vec<MetricName> = self.inner.index.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the distinct values of a label across all series, sorted.
    #[must_use]
    pub fn label_values(&self, label: &str) -> Vec<String> {
        let index = self.inner.index.read();
        let mut values: Vec<String> = index
            .values()
            .flat_map(HashMap::keys)
            .filter_map(|labels| labels.get(label).map(str::to_string))
            .collect();
        values.sort();
        values.dedup();
        values
    }
}

impl Default for SampleStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

/// A batch writer. Its samples become visible to snapshots on commit.
///
/// Dropping an appender without committing also closes it; the samples it
/// wrote stay in the store.
#[derive(Debug)]
pub struct Appender {
    inner: Arc<StoreInner>,
    id: u64,
    appended: usize,
    closed: bool,
}

impl Appender {
    /// Appends a sample.
    ///
    /// # Errors
    ///
    /// See [`SampleStore::write`]. A rejected sample leaves the series
    /// untouched and the appender usable.
    pub fn append(&mut self, identity: &MetricIdentity, timestamp: i64, value: f64) -> Result<()> {
        self.inner.append(self.id, identity, timestamp, value)?;
        self.appended += 1;
        Ok(())
    }

    /// Number of samples accepted so far.
    #[must_use]
    pub const fn appended(&self) -> usize {
        self.appended
    }

    /// Publishes the batch and returns the number of samples it held.
    pub fn commit(mut self) -> usize {
        self.close();
        self.appended
    }

    fn close(&mut self) {
        if !self.closed {
            self.inner.isolation.close(self.id);
            self.closed = true;
        }
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        self.close();
    }
}

/// A consistent read view of the store.
#[derive(Debug, Clone)]
pub struct Snapshot {
    inner: Arc<StoreInner>,
    isolation: Arc<IsolationState>,
}

impl Snapshot {
    /// Selects the series matching `selector`, restricted to `range`.
    ///
    /// The returned set is lazy: each series' samples are read only when an
    /// iterator reaches it.
    #[must_use]
    pub fn select(&self, selector: &Selector, range: TimeRange) -> SeriesSet {
        let mut series: Vec<Arc<Series>> = self
            .inner
            .index
            .read()
            .get(&selector.name)
            .map(|by_labels| {
                by_labels
                    .iter()
                    .filter(|(labels, _)| selector.matches_labels(labels))
                    .map(|(_, s)| Arc::clone(s))
                    .collect()
            })
            .unwrap_or_default();
        series.sort_by(|a, b| a.identity.cmp(&b.identity));

        SeriesSet {
            series,
            range,
            isolation: Arc::clone(&self.isolation),
        }
    }

    /// Returns the newest visible sample per matching series within
    /// `[at - lookback, at]`.
    #[must_use]
    pub fn latest(
        &self,
        selector: &Selector,
        at: i64,
        lookback: Duration,
    ) -> Vec<(Arc<MetricIdentity>, Sample)> {
        let range = TimeRange::ending_at(at, duration_to_millis(lookback));
        self.select(selector, range)
            .series
            .iter()
            .filter_map(|s| {
                s.latest_visible(range, &self.isolation)
                    .map(|sample| (Arc::clone(&s.identity), sample))
            })
            .collect()
    }
}

/// The samples of one series within a query range.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSamples {
    /// The series identity.
    pub identity: Arc<MetricIdentity>,
    /// Samples in strictly increasing timestamp order.
    pub samples: Vec<Sample>,
}

/// The lazy, restartable result of a selection.
#[derive(Debug, Clone)]
pub struct SeriesSet {
    series: Vec<Arc<Series>>,
    range: TimeRange,
    isolation: Arc<IsolationState>,
}

impl SeriesSet {
    /// Number of series that matched the selector (some may have no samples
    /// in range).
    #[must_use]
    pub fn matched_series(&self) -> usize {
        self.series.len()
    }

    /// Iterates series with at least one sample in range.
    #[must_use]
    pub fn iter(&self) -> SeriesIter<'_> {
        SeriesIter { set: self, pos: 0 }
    }

    /// Iterates every sample, series by series, with its identity.
    pub fn samples(&self) -> impl Iterator<Item = (Arc<MetricIdentity>, Sample)> + '_ {
        self.iter().flat_map(|s| {
            let identity = s.identity;
            s.samples
                .into_iter()
                .map(move |sample| (Arc::clone(&identity), sample))
        })
    }
}

impl<'a> IntoIterator for &'a SeriesSet {
    type Item = SeriesSamples;
    type IntoIter = SeriesIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [`SeriesSet`].
#[derive(Debug)]
pub struct SeriesIter<'a> {
    set: &'a SeriesSet,
    pos: usize,
}

impl Iterator for SeriesIter<'_> {
    type Item = SeriesSamples;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(series) = self.set.series.get(self.pos) {
            self.pos += 1;
            let samples = series.visible_in(self.set.range, &self.set.isolation);
            if !samples.is_empty() {
                return Some(SeriesSamples {
                    identity: Arc::clone(&series.identity),
                    samples,
                });
            }
        }
        None
    }
}
