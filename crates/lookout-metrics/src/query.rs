//! Range functions over series samples.
//!
//! These are the window functions the rule language exposes
//! (`rate(x[5m])`, `max_over_time(x[1m])`, ...). Each one reduces the samples
//! of a single series inside a window to one value, or `None` when the window
//! holds too little data.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Aggregation, Sample};

/// How far back an instant lookup searches for the newest sample.
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(5 * 60);

/// A function applied to the samples of one series over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeFunction {
    /// Per-second increase of a counter, adjusted for resets.
    Rate,
    /// Total increase of a counter, adjusted for resets.
    Increase,
    /// Mean of all values.
    AvgOverTime,
    /// Smallest value.
    MinOverTime,
    /// Largest value.
    MaxOverTime,
    /// Sum of all values.
    SumOverTime,
    /// Number of samples.
    CountOverTime,
    /// Newest value.
    LastOverTime,
}

impl RangeFunction {
    /// Looks up a function by its name in the rule language.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rate" => Some(Self::Rate),
            "increase" => Some(Self::Increase),
            "avg_over_time" => Some(Self::AvgOverTime),
            "min_over_time" => Some(Self::MinOverTime),
            "max_over_time" => Some(Self::MaxOverTime),
            "sum_over_time" => Some(Self::SumOverTime),
            "count_over_time" => Some(Self::CountOverTime),
            "last_over_time" => Some(Self::LastOverTime),
            _ => None,
        }
    }

    /// The function's name in the rule language.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Rate => "rate",
            Self::Increase => "increase",
            Self::AvgOverTime => "avg_over_time",
            Self::MinOverTime => "min_over_time",
            Self::MaxOverTime => "max_over_time",
            Self::SumOverTime => "sum_over_time",
            Self::CountOverTime => "count_over_time",
            Self::LastOverTime => "last_over_time",
        }
    }

    /// Applies the function to time-ordered samples.
    #[must_use]
    pub fn apply(&self, samples: &[Sample]) -> Option<f64> {
        match self {
            Self::Rate => rate(samples),
            Self::Increase => increase(samples),
            Self::AvgOverTime => over_time(samples, Aggregation::Avg),
            Self::MinOverTime => over_time(samples, Aggregation::Min),
            Self::MaxOverTime => over_time(samples, Aggregation::Max),
            Self::SumOverTime => over_time(samples, Aggregation::Sum),
            Self::CountOverTime => over_time(samples, Aggregation::Count),
            Self::LastOverTime => samples.last().map(|s| s.value),
        }
    }
}

impl fmt::Display for RangeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn over_time(samples: &[Sample], aggregation: Aggregation) -> Option<f64> {
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    aggregation.apply(&values)
}

/// Calculates how much a counter grew across the samples.
///
/// A value lower than its predecessor is treated as a counter reset: the
/// counter restarted from zero, so the new value itself counts as growth.
///
/// Returns `None` if there are fewer than 2 samples.
#[must_use]
pub fn increase(samples: &[Sample]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }

    let total = samples
        .windows(2)
        .map(|w| {
            let (prev, cur) = (w[0].value, w[1].value);
            if cur < prev { cur } else { cur - prev }
        })
        .sum();
    Some(total)
}

/// Calculates the per-second rate of a counter.
///
/// The increase is divided by the time between the first and last sample.
/// Returns `None` if there are fewer than 2 samples or they share a timestamp.
#[must_use]
#[allow(clippy::cast_precision_loss)] // Millisecond spans fit well within f64 precision
pub fn rate(samples: &[Sample]) -> Option<f64> {
    let first = samples.first()?;
    let last = samples.last()?;

    let time_diff_seconds = (last.timestamp - first.timestamp) as f64 / 1000.0;
    if time_diff_seconds <= 0.0 {
        return None;
    }

    increase(samples).map(|inc| inc / time_diff_seconds)
}
