//! Alerting rules for the lookout scrape-and-alert engine.
#![forbid(unsafe_code)]
//!
//! A [`Rule`] pairs an expression such as
//! `sum(rate(http_requests_total{status="500"}[5m])) by (job) > 1` with an
//! evaluation interval and a hold duration. The [`Evaluator`] runs the rules
//! against consistent snapshots of the sample store and tracks one alert
//! instance per (rule, label set):
//!
//! ```text
//! Inactive --true--> Pending --held for `for`--> Firing --false--> Resolved
//!                       |                                             |
//!                       +--false--> (discarded)     (pruned next evaluation)
//! ```
//!
//! Transitions to Firing and Resolved are sent as [`AlertEvent`]s on an mpsc
//! channel.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use lookout_metrics::{Labels, MetricIdentity, SampleStore};
//! use lookout_rules::{AlertState, Evaluator, Rule};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> lookout_rules::Result<()> {
//! let store = SampleStore::default();
//! let (tx, _rx) = tokio::sync::mpsc::channel(16);
//! let evaluator = Evaluator::new(store.clone(), tx);
//!
//! let rule = Rule::builder("InstanceDown", "up == 0")
//!     .for_duration(Duration::ZERO)
//!     .label("severity", "page")
//!     .build()?;
//! evaluator.replace_rules(vec![rule]).await?;
//!
//! let up = MetricIdentity::parse("up", Labels::new().with("job", "api"))?;
//! store.write(&up, 1_000, 0.0)?;
//!
//! let result = evaluator.evaluate_due(1_000);
//! assert_eq!(result.events[0].state, AlertState::Firing);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod evaluator;
pub mod expr;
pub mod rule;
pub mod state;
pub mod template;

pub use error::{Result, RuleError};
pub use evaluator::{
    AlertEvent, EvaluationResult, Evaluator, ReplaceReport, RuleHealth, RuleStatus,
};
pub use expr::{parse_duration, Comparison, ComparisonOperator, Element, Expr, ValueExpr};
pub use rule::{Rule, RuleBuilder, RuleSummary, DEFAULT_INTERVAL};
pub use state::{AlertInstance, AlertState, InstanceArena, InstanceKey};
