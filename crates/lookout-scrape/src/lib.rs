//! Target scraping for the lookout scrape-and-alert engine.
#![forbid(unsafe_code)]
//!
//! Every configured [`Target`] gets its own scrape loop. On each tick the loop
//! fetches the target's metrics endpoint with a timeout shorter than the
//! interval, parses the exposition text and writes the samples into the
//! [`SampleStore`](lookout_metrics::SampleStore) through one appender. A
//! failed scrape never stops the loop; it is recorded as `up 0`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lookout_metrics::SampleStore;
//! use lookout_scrape::{HttpFetcher, ScrapeManager, Target};
//!
//! # async fn example() -> lookout_scrape::Result<()> {
//! let store = SampleStore::default();
//! let manager = ScrapeManager::new(store, Arc::new(HttpFetcher::new()?));
//!
//! manager.apply(vec![Target::new("app", "localhost:8080")
//!     .with_interval(Duration::from_secs(15))
//!     .with_timeout(Duration::from_secs(5))])?;
//!
//! manager.shutdown(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod exposition;
pub mod fetch;
pub mod manager;
pub mod scrape;
pub mod target;

pub use error::{Result, ScrapeError};
pub use exposition::{parse, ParsedSample};
pub use fetch::{Fetcher, HttpFetcher};
pub use manager::{ApplyReport, ScrapeManager, TargetStatus};
pub use scrape::{scrape_once, ScrapeReport, TargetHealth};
pub use target::{apply_target_labels, Target, TargetKey};
