//! In-memory time-series storage for the lookout scrape-and-alert engine.
#![forbid(unsafe_code)]
//!
//! `lookout-metrics` holds every scraped sample in memory, one append-only
//! series per metric identity, and answers selector queries against
//! consistent snapshots.
//!
//! # Features
//!
//! - **Per-series locking**: writers to different series never contend
//! - **Out-of-order tolerance**: late samples within a window are inserted in order
//! - **Snapshot isolation**: uncommitted appender batches are invisible to readers
//! - **Retention**: scheduled eviction of old samples, one series at a time
//! - **Range functions**: `rate`, `increase` and the `*_over_time` family
//!
//! # Example
//!
//! ```rust
//! use lookout_metrics::{Labels, MetricIdentity, SampleStore, Selector, TimeRange};
//! use std::time::Duration;
//!
//! // Create a store with 1 hour retention
//! let store = SampleStore::with_retention(Duration::from_secs(3600));
//!
//! let up = MetricIdentity::parse("up", Labels::new().with("job", "api")).unwrap();
//! store.write(&up, 1_000, 1.0).unwrap();
//! store.write(&up, 16_000, 1.0).unwrap();
//!
//! let selector = Selector::metric(up.name.clone());
//! let samples: Vec<_> = store.query(&selector, TimeRange::all()).samples().collect();
//! assert_eq!(samples.len(), 2);
//! ```

#![doc(html_root_url = "https://docs.rs/lookout-metrics/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod clock;
pub mod error;
mod isolation;
pub mod matcher;
#[cfg(feature = "prometheus")]
pub mod prometheus;
pub mod query;
pub mod storage;
pub mod types;

// Re-export main types at crate root
pub use clock::Clock;
pub use error::{MetricsError, Result};
pub use matcher::{all_match, LabelMatcher, MatchOp, Selector};
pub use query::{increase, rate, RangeFunction, DEFAULT_LOOKBACK};
pub use storage::{
    Appender, EvictionReport, SampleStore, SeriesSamples, SeriesSet, Snapshot, StoreConfig,
    StoreStats,
};
pub use types::{
    now_millis, validate_label_name, Aggregation, Labels, MetricIdentity, MetricName, Sample,
    TimeRange,
};
