//! Engine configuration.
//!
//! Configuration for the lookout engine, including:
//! - Global scrape, evaluation and retention settings
//! - Scrape targets
//! - Alerting rules
//! - Notification routing, receivers and retry policy
//! - Static silences

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lookout_metrics::{validate_label_name, LabelMatcher};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Settings shared by every component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GlobalConfig {
    /// Default scrape interval in seconds.
    pub scrape_interval_secs: u64,
    /// Default scrape timeout in seconds; must be below the interval.
    pub scrape_timeout_secs: u64,
    /// Default rule evaluation interval in seconds.
    pub evaluation_interval_secs: u64,
    /// How long samples are kept, in seconds.
    pub retention_secs: u64,
    /// How far behind a series head a sample may land, in milliseconds.
    pub out_of_order_tolerance_ms: u64,
    /// How often the retention pass runs, in seconds.
    pub eviction_interval_secs: u64,
    /// Base URL put into notification payloads.
    pub external_url: String,
    /// Address of the HTTP API.
    pub listen_addr: String,
    /// Directory for spooled notifications; none disables spooling.
    pub spool_dir: Option<PathBuf>,
    /// Grace period for in-flight work on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_interval_secs: 15,
            scrape_timeout_secs: 10,
            evaluation_interval_secs: 15,
            retention_secs: 15 * 24 * 3600,
            out_of_order_tolerance_ms: 0,
            eviction_interval_secs: 60,
            external_url: "http://localhost:9095".to_string(),
            listen_addr: "127.0.0.1:9095".to_string(),
            spool_dir: None,
            shutdown_grace_secs: 5,
        }
    }
}

impl GlobalConfig {
    /// Retention as a `Duration`.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Out-of-order tolerance as a `Duration`.
    #[must_use]
    pub const fn out_of_order_tolerance(&self) -> Duration {
        Duration::from_millis(self.out_of_order_tolerance_ms)
    }

    /// Eviction interval as a `Duration`.
    #[must_use]
    pub const fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    /// Shutdown grace period as a `Duration`.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// One scrape endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetConfig {
    /// Job name, attached to every sample as the `job` label.
    pub job: String,
    /// `host:port` of the endpoint.
    pub address: String,
    /// `http` or `https`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Path of the metrics endpoint.
    #[serde(default = "default_metrics_path")]
    pub path: String,
    /// Overrides the global scrape interval.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Overrides the global scrape timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Static labels attached to every sample.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl TargetConfig {
    /// The effective scrape interval.
    #[must_use]
    pub fn interval(&self, global: &GlobalConfig) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(global.scrape_interval_secs))
    }

    /// The effective scrape timeout.
    #[must_use]
    pub fn timeout(&self, global: &GlobalConfig) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(global.scrape_timeout_secs))
    }
}

/// One alerting rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleConfig {
    /// Rule name; becomes the `alertname` label.
    pub name: String,
    /// Alerting expression, e.g. `rate(http_requests_total{status="500"}[5m]) > 0.5`.
    pub expr: String,
    /// How long the expression must stay true before firing, in seconds.
    #[serde(default)]
    pub for_secs: u64,
    /// Overrides the global evaluation interval.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Labels attached to the alerts.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotation templates.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl RuleConfig {
    /// The effective evaluation interval.
    #[must_use]
    pub fn interval(&self, global: &GlobalConfig) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(global.evaluation_interval_secs))
    }

    /// The "for" duration.
    #[must_use]
    pub const fn for_duration(&self) -> Duration {
        Duration::from_secs(self.for_secs)
    }
}

/// Backoff settings for failed deliveries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after each failure.
    pub multiplier: f64,
    /// Upper bound on the delay, in seconds.
    pub max_backoff_secs: u64,
    /// Total delivery attempts before a notification is marked failed.
    pub max_attempts: u32,
    /// Random jitter added to each delay, as a fraction of it (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_secs: 60,
            max_attempts: 5,
            jitter: 0.1,
        }
    }
}

/// How alerts are grouped and dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouteConfig {
    /// Labels that form the grouping key.
    pub group_by: Vec<String>,
    /// How often the dispatcher flushes groups, in seconds.
    pub group_interval_secs: u64,
    /// How long before a still-firing alert is notified again, in seconds.
    pub repeat_interval_secs: u64,
    /// Whether resolved alerts are notified.
    pub notify_on_resolve: bool,
    /// Receivers notifications go to; empty means all receivers.
    pub receivers: Vec<String>,
    /// Delivery retry policy.
    pub retry: RetryConfig,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            group_by: vec!["alertname".to_string()],
            group_interval_secs: 10,
            repeat_interval_secs: 4 * 3600,
            notify_on_resolve: true,
            receivers: Vec::new(),
            retry: RetryConfig::default(),
        }
    }
}

impl RouteConfig {
    /// Dispatch interval as a `Duration`.
    #[must_use]
    pub const fn group_interval(&self) -> Duration {
        Duration::from_secs(self.group_interval_secs)
    }

    /// Repeat interval as a `Duration`.
    #[must_use]
    pub const fn repeat_interval(&self) -> Duration {
        Duration::from_secs(self.repeat_interval_secs)
    }
}

/// The kind of a receiver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverType {
    /// JSON POST to a URL.
    Webhook,
    /// Writes notifications to the log.
    Log,
}

/// A notification receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// Unique receiver name.
    pub name: String,
    /// Receiver kind.
    #[serde(rename = "type")]
    pub kind: ReceiverType,
    /// Webhook URL (webhook only).
    #[serde(default)]
    pub url: Option<String>,
    /// Request timeout in seconds (webhook only).
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    /// Extra request headers (webhook only).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

const fn default_webhook_timeout() -> u64 {
    5
}

impl ReceiverConfig {
    /// Request timeout as a `Duration`.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A silence supplied through configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SilenceConfig {
    /// Matchers in text form, e.g. `job="batch"`.
    pub matchers: Vec<String>,
    /// Start of the silence; defaults to load time.
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    /// End of the silence (RFC 3339 string).
    pub ends_at: DateTime<Utc>,
    /// Who created the silence.
    #[serde(default = "default_created_by")]
    pub created_by: String,
    /// Free-form comment.
    #[serde(default)]
    pub comment: String,
}

fn default_created_by() -> String {
    "config".to_string()
}

impl SilenceConfig {
    /// Parses the matcher strings.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first matcher that fails to parse.
    pub fn parsed_matchers(&self) -> Result<Vec<LabelMatcher>> {
        self.matchers
            .iter()
            .map(|m| {
                LabelMatcher::parse(m)
                    .map_err(|e| ConfigError::invalid("silences.matchers", e.to_string()))
            })
            .collect()
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Global settings.
    #[serde(default)]
    pub global: GlobalConfig,
    /// Scrape targets.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    /// Alerting rules.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Notification routing.
    #[serde(default)]
    pub route: RouteConfig,
    /// Notification receivers.
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
    /// Static silences.
    #[serde(default)]
    pub silences: Vec<SilenceConfig>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// A small, valid configuration used by `init-config`.
    #[must_use]
    pub fn example() -> Self {
        Self {
            global: GlobalConfig::default(),
            targets: vec![TargetConfig {
                job: "app".to_string(),
                address: "localhost:8080".to_string(),
                scheme: default_scheme(),
                path: default_metrics_path(),
                interval_secs: None,
                timeout_secs: None,
                labels: BTreeMap::from([("env".to_string(), "dev".to_string())]),
            }],
            rules: vec![RuleConfig {
                name: "HighErrorRate".to_string(),
                expr: r#"rate(http_requests_total{status="500"}[1m]) > 5"#.to_string(),
                for_secs: 60,
                interval_secs: None,
                labels: BTreeMap::from([("severity".to_string(), "critical".to_string())]),
                annotations: BTreeMap::from([(
                    "summary".to_string(),
                    "{{ $labels.instance }} is serving {{ $value }} errors/s".to_string(),
                )]),
            }],
            route: RouteConfig::default(),
            receivers: vec![ReceiverConfig {
                name: "log".to_string(),
                kind: ReceiverType::Log,
                url: None,
                timeout_secs: default_webhook_timeout(),
                headers: BTreeMap::new(),
            }],
            silences: Vec::new(),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first invalid value found.
    pub fn validate(&self) -> Result<()> {
        self.validate_global()?;
        self.validate_targets()?;
        self.validate_rules()?;
        self.validate_receivers()?;
        self.validate_route()?;

        for (i, silence) in self.silences.iter().enumerate() {
            if silence.matchers.is_empty() {
                return Err(ConfigError::invalid(
                    format!("silences[{i}].matchers"),
                    "at least one matcher is required",
                ));
            }
            silence.parsed_matchers()?;
            if let Some(starts_at) = silence.starts_at {
                if starts_at >= silence.ends_at {
                    return Err(ConfigError::invalid(
                        format!("silences[{i}].ends_at"),
                        "must be after starts_at",
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_global(&self) -> Result<()> {
        let g = &self.global;
        for (field, value) in [
            ("global.scrape_interval_secs", g.scrape_interval_secs),
            ("global.scrape_timeout_secs", g.scrape_timeout_secs),
            ("global.evaluation_interval_secs", g.evaluation_interval_secs),
            ("global.retention_secs", g.retention_secs),
            ("global.eviction_interval_secs", g.eviction_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than 0"));
            }
        }

        if url::Url::parse(&g.external_url).is_err() {
            return Err(ConfigError::invalid("global.external_url", "not a valid URL"));
        }

        if g.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::invalid(
                "global.listen_addr",
                "must be an ip:port socket address",
            ));
        }

        Ok(())
    }

    fn validate_targets(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for (i, target) in self.targets.iter().enumerate() {
            let field = |name: &str| format!("targets[{i}].{name}");

            if target.job.is_empty() {
                return Err(ConfigError::invalid(field("job"), "cannot be empty"));
            }

            if target.scheme != "http" && target.scheme != "https" {
                return Err(ConfigError::invalid(field("scheme"), "must be http or https"));
            }

            if !target.path.starts_with('/') {
                return Err(ConfigError::invalid(field("path"), "must start with '/'"));
            }

            let url = format!("{}://{}{}", target.scheme, target.address, target.path);
            match url::Url::parse(&url) {
                Ok(parsed)
                    if parsed.port_or_known_default().is_some() && parsed.host().is_some() => {}
                _ => {
                    return Err(ConfigError::invalid(field("address"), "must be host:port"));
                }
            }

            let interval = target.interval(&self.global);
            let timeout = target.timeout(&self.global);
            if interval.is_zero() {
                return Err(ConfigError::invalid(field("interval_secs"), "must be greater than 0"));
            }
            if timeout.is_zero() || timeout >= interval {
                return Err(ConfigError::invalid(
                    field("timeout_secs"),
                    format!(
                        "must be greater than 0 and less than the scrape interval ({}s)",
                        interval.as_secs()
                    ),
                ));
            }

            for name in target.labels.keys() {
                validate_label_name(name)
                    .map_err(|e| ConfigError::invalid(field("labels"), e.to_string()))?;
            }

            if !seen.insert((target.job.as_str(), target.address.as_str())) {
                return Err(ConfigError::invalid(
                    field("address"),
                    format!("duplicate target {} for job {}", target.address, target.job),
                ));
            }
        }

        Ok(())
    }

    fn validate_rules(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for (i, rule) in self.rules.iter().enumerate() {
            let field = |name: &str| format!("rules[{i}].{name}");

            if rule.name.is_empty() {
                return Err(ConfigError::invalid(field("name"), "cannot be empty"));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(ConfigError::invalid(
                    field("name"),
                    format!("duplicate rule name '{}'", rule.name),
                ));
            }
            if rule.expr.trim().is_empty() {
                return Err(ConfigError::invalid(field("expr"), "cannot be empty"));
            }
            if rule.interval(&self.global).is_zero() {
                return Err(ConfigError::invalid(field("interval_secs"), "must be greater than 0"));
            }
            for name in rule.labels.keys() {
                validate_label_name(name)
                    .map_err(|e| ConfigError::invalid(field("labels"), e.to_string()))?;
            }
        }

        Ok(())
    }

    fn validate_receivers(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for (i, receiver) in self.receivers.iter().enumerate() {
            let field = |name: &str| format!("receivers[{i}].{name}");

            if receiver.name.is_empty() {
                return Err(ConfigError::invalid(field("name"), "cannot be empty"));
            }
            if !seen.insert(receiver.name.as_str()) {
                return Err(ConfigError::invalid(
                    field("name"),
                    format!("duplicate receiver name '{}'", receiver.name),
                ));
            }

            if receiver.kind == ReceiverType::Webhook {
                let Some(url) = &receiver.url else {
                    return Err(ConfigError::invalid(
                        field("url"),
                        "required for webhook receivers",
                    ));
                };
                match url::Url::parse(url) {
                    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                    _ => return Err(ConfigError::invalid(field("url"), "must be an http(s) URL")),
                }

                if receiver.timeout_secs == 0
                    || receiver.timeout_secs >= self.route.group_interval_secs
                {
                    return Err(ConfigError::invalid(
                        field("timeout_secs"),
                        format!(
                            "must be greater than 0 and less than route.group_interval_secs ({}s)",
                            self.route.group_interval_secs
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_route(&self) -> Result<()> {
        let route = &self.route;

        if route.group_interval_secs == 0 {
            return Err(ConfigError::invalid("route.group_interval_secs", "must be greater than 0"));
        }
        if route.repeat_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "route.repeat_interval_secs",
                "must be greater than 0",
            ));
        }
        for name in &route.group_by {
            validate_label_name(name)
                .map_err(|e| ConfigError::invalid("route.group_by", e.to_string()))?;
        }
        for name in &route.receivers {
            if !self.receivers.iter().any(|r| &r.name == name) {
                return Err(ConfigError::invalid(
                    "route.receivers",
                    format!("unknown receiver '{name}'"),
                ));
            }
        }

        let retry = &route.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid("route.retry.max_attempts", "must be at least 1"));
        }
        if retry.multiplier < 1.0 {
            return Err(ConfigError::invalid("route.retry.multiplier", "must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ConfigError::invalid("route.retry.jitter", "must be between 0.0 and 1.0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use test_case::test_case;

    // Helper to create a temporary config file
    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    const FULL: &str = r#"
        [global]
        scrape_interval_secs = 5
        scrape_timeout_secs = 2
        evaluation_interval_secs = 10
        retention_secs = 3600
        out_of_order_tolerance_ms = 250
        external_url = "http://lookout.example.com"

        [[targets]]
        job = "app"
        address = "app.internal:8080"
        labels = { env = "prod" }

        [[targets]]
        job = "node"
        address = "10.0.0.7:9100"
        scheme = "https"
        path = "/stats"
        interval_secs = 30
        timeout_secs = 10

        [[rules]]
        name = "HighErrorRate"
        expr = 'rate(http_requests_total{status="500"}[1m]) > 5'
        for_secs = 60
        labels = { severity = "critical" }
        annotations = { summary = "{{ $labels.instance }} erroring" }

        [route]
        group_by = ["alertname", "job"]
        repeat_interval_secs = 3600
        receivers = ["ops"]

        [route.retry]
        max_attempts = 3

        [[receivers]]
        name = "ops"
        type = "webhook"
        url = "http://hooks.example.com/alert"
        headers = { Authorization = "Bearer abc" }

        [[receivers]]
        name = "audit"
        type = "log"

        [[silences]]
        matchers = ['job="batch"']
        ends_at = "2030-01-01T00:00:00Z"
        comment = "batch jobs are noisy"
    "#;

    #[test]
    fn test_parse_minimal_config() {
        let config = EngineConfig::from_toml("").expect("should parse empty config");

        assert!(config.targets.is_empty());
        assert_eq!(config.global.scrape_interval_secs, 15);
        assert_eq!(config.route.group_by, vec!["alertname".to_string()]);
        assert!(config.route.notify_on_resolve);
    }

    #[test]
    fn test_parse_full_config() {
        let config = EngineConfig::from_toml(FULL).expect("should parse full config");

        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].scheme, "http");
        assert_eq!(config.targets[0].path, "/metrics");
        assert_eq!(config.targets[0].interval(&config.global), Duration::from_secs(5));
        assert_eq!(config.targets[1].timeout(&config.global), Duration::from_secs(10));

        assert_eq!(config.rules[0].for_duration(), Duration::from_secs(60));
        assert_eq!(config.rules[0].interval(&config.global), Duration::from_secs(10));

        assert_eq!(config.route.retry.max_attempts, 3);
        assert_eq!(config.route.retry.initial_backoff_ms, 500);
        assert_eq!(config.receivers[0].kind, ReceiverType::Webhook);
        assert_eq!(config.receivers[0].timeout(), Duration::from_secs(5));
        assert_eq!(config.receivers[1].kind, ReceiverType::Log);

        let matchers = config.silences[0].parsed_matchers().unwrap();
        assert_eq!(matchers[0].name(), "job");
        assert_eq!(config.silences[0].created_by, "config");
    }

    #[test]
    fn test_from_file() {
        let file = create_temp_config(FULL);
        let config = EngineConfig::from_file(file.path()).expect("should load from file");
        assert_eq!(config.global.out_of_order_tolerance(), Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file() {
        let result = EngineConfig::from_file("/nonexistent/lookout.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_invalid_toml() {
        let result = EngineConfig::from_toml("[[targets]\njob = ");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_example_is_valid_and_round_trips() {
        let example = EngineConfig::example();
        example.validate().expect("example should be valid");

        let rendered = example.to_toml().unwrap();
        let parsed = EngineConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed, example);
    }

    #[test_case(
        r#"[[targets]]
        job = "a"
        address = "h:1"
        interval_secs = 5
        timeout_secs = 5"#,
        "targets[0].timeout_secs" ; "timeout equal to interval"
    )]
    #[test_case(
        r#"[[targets]]
        job = "a"
        address = "h:1"
        [[targets]]
        job = "a"
        address = "h:1""#,
        "targets[1].address" ; "duplicate target"
    )]
    #[test_case(
        r#"[[targets]]
        job = "a"
        address = "h:1"
        scheme = "ftp""#,
        "targets[0].scheme" ; "bad scheme"
    )]
    #[test_case(
        r#"[[targets]]
        job = "a"
        address = "h:1"
        labels = { "bad-label" = "x" }"#,
        "targets[0].labels" ; "bad label name"
    )]
    #[test_case(
        r#"[[rules]]
        name = "A"
        expr = "up == 0"
        [[rules]]
        name = "A"
        expr = "up == 0""#,
        "rules[1].name" ; "duplicate rule"
    )]
    #[test_case(
        r#"[[receivers]]
        name = "hook"
        type = "webhook""#,
        "receivers[0].url" ; "webhook without url"
    )]
    #[test_case(
        r#"[[receivers]]
        name = "hook"
        type = "webhook"
        url = "http://x/y"
        timeout_secs = 30"#,
        "receivers[0].timeout_secs" ; "webhook timeout above dispatch interval"
    )]
    #[test_case(
        r#"[route]
        receivers = ["missing"]"#,
        "route.receivers" ; "unknown route receiver"
    )]
    #[test_case(
        r#"[route.retry]
        max_attempts = 0"#,
        "route.retry.max_attempts" ; "zero attempts"
    )]
    #[test_case(
        r#"[global]
        scrape_interval_secs = 0"#,
        "global.scrape_interval_secs" ; "zero interval"
    )]
    #[test_case(
        r#"[[silences]]
        matchers = ['job~"x"']
        ends_at = "2030-01-01T00:00:00Z""#,
        "silences.matchers" ; "bad silence matcher"
    )]
    fn test_validation_rejects(toml: &str, expected_field: &str) {
        match EngineConfig::from_toml(toml) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("expected Invalid({expected_field}), got {other:?}"),
        }
    }
}
