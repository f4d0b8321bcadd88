//! Configuration for the lookout scrape-and-alert engine.
#![forbid(unsafe_code)]
//!
//! The engine is configured from a single TOML file with `[global]`,
//! `[[targets]]`, `[[rules]]`, `[route]`, `[[receivers]]` and `[[silences]]`
//! sections. Every duration field carries its unit in the name
//! (`*_secs`, `*_ms`).
//!
//! # Example
//!
//! ```rust
//! use lookout_config::{ConfigHandle, EngineConfig};
//!
//! let config = EngineConfig::from_toml(r#"
//!     [[targets]]
//!     job = "app"
//!     address = "localhost:8080"
//! "#).unwrap();
//!
//! let handle = ConfigHandle::new(config);
//! assert_eq!(handle.current().targets[0].path, "/metrics");
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod handle;
pub mod model;

pub use error::{ConfigError, Result};
pub use handle::ConfigHandle;
pub use model::{
    EngineConfig, GlobalConfig, ReceiverConfig, ReceiverType, RetryConfig, RouteConfig,
    RuleConfig, SilenceConfig, TargetConfig,
};
