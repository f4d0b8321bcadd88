//! Alert routing for the lookout scrape-and-alert engine.
#![forbid(unsafe_code)]
//!
//! `lookout-alerts` takes the Firing and Resolved transitions produced by the
//! rule evaluator and turns them into notifications.
//!
//! # Features
//!
//! - **Grouping**: alerts sharing the configured `group_by` labels are batched
//! - **Deduplication**: a notified alert is not re-sent until it resolves or
//!   the repeat interval elapses
//! - **Silences**: alerts matching an active silence are suppressed
//! - **Retry**: failed deliveries back off exponentially and end up on a
//!   failed list once the attempt budget is spent
//! - **Receivers**: an Alertmanager-compatible webhook and a log receiver
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use lookout_alerts::{LogReceiver, Router, RouterSettings};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> lookout_alerts::Result<()> {
//! let router = Router::new(RouterSettings::default())?
//!     .with_receiver(Arc::new(LogReceiver::new("log")));
//!
//! // Normally fed by `Router::run` from the evaluator's event channel.
//! let queued = router.flush(0);
//! let report = router.dispatch_due(0).await;
//! assert_eq!(queued, 0);
//! assert_eq!(report.attempted, 0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod receiver;
pub mod retry;
pub mod router;
pub mod silence;
pub mod types;

pub use error::{AlertError, DeliveryError, Result};
pub use receiver::{
    LogReceiver, Receiver, SendFuture, WebhookAlert, WebhookPayload, WebhookReceiver,
};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use router::{DispatchReport, Router, RouterSettings, DISPATCH_TICK};
pub use silence::{Silence, SilenceSource, SilenceStore};
pub use types::{
    fingerprint, to_datetime, Alert, AlertStatus, DeliveryStatus, Notification,
    NotificationStatus,
};
