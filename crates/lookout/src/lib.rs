//! The lookout daemon.
#![forbid(unsafe_code)]
//!
//! Wires the sample store, the scrape manager, the rule evaluator and the
//! alert router into one [`Engine`], and exposes it over HTTP.
//!
//! - [`Engine`] owns the components, their tasks, reload and shutdown
//! - [`reload::Plan`] turns a configuration into component objects before
//!   anything running is changed
//! - [`persist::Spool`] keeps undelivered notifications across restarts
//! - [`server::ApiServer`] serves the API built by [`routes::create_router`]

#![warn(missing_docs)]

pub mod engine;
pub mod error;
pub mod handlers;
pub mod persist;
pub mod reload;
pub mod routes;
pub mod server;

pub use engine::Engine;
pub use error::{ApiError, ApiResult, DaemonError, Result};
pub use persist::{Spool, SPOOL_FILE};
pub use reload::Plan;
pub use routes::create_router;
pub use server::ApiServer;
