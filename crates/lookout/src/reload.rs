//! Conversion of an [`EngineConfig`] into the runtime objects of each component.
//!
//! A [`Plan`] is built in full before anything running is touched, so a
//! configuration that fails anywhere leaves the engine as it was.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lookout_alerts::{LogReceiver, Receiver, RetryPolicy, RouterSettings, Silence, WebhookReceiver};
use lookout_config::{
    ConfigError, EngineConfig, ReceiverConfig, ReceiverType, RetryConfig, RouteConfig,
    RuleConfig, SilenceConfig, TargetConfig,
};
use lookout_rules::Rule;
use lookout_scrape::Target;

use crate::error::Result;

/// Everything the engine needs to switch to a new configuration.
#[derive(Debug)]
pub struct Plan {
    /// Scrape targets.
    pub targets: Vec<Target>,
    /// Alerting rules.
    pub rules: Vec<Rule>,
    /// Router grouping and retry settings.
    pub router: RouterSettings,
    /// Notification receivers.
    pub receivers: Vec<Arc<dyn Receiver>>,
    /// Configuration-supplied silences.
    pub silences: Vec<Silence>,
}

impl Plan {
    /// Builds the plan for `config`. Silences without a start time begin at `now`.
    ///
    /// # Errors
    ///
    /// Returns the first target, rule, receiver, silence or retry setting
    /// that the components reject.
    pub fn build(config: &EngineConfig, now: DateTime<Utc>) -> Result<Self> {
        let targets = config
            .targets
            .iter()
            .map(|t| build_target(t, config))
            .collect::<Result<Vec<_>>>()?;

        let rules = config
            .rules
            .iter()
            .map(|r| build_rule(r, config))
            .collect::<Result<Vec<_>>>()?;

        let router = router_settings(&config.route, &config.global.external_url);
        router.retry.validate()?;

        let receivers = config
            .receivers
            .iter()
            .map(build_receiver)
            .collect::<Result<Vec<_>>>()?;

        let silences = config
            .silences
            .iter()
            .map(|s| build_silence(s, now))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            targets,
            rules,
            router,
            receivers,
            silences,
        })
    }
}

fn build_target(config: &TargetConfig, engine: &EngineConfig) -> Result<Target> {
    let mut target = Target::new(&config.job, &config.address)
        .with_scheme(&config.scheme)
        .with_path(&config.path)
        .with_interval(config.interval(&engine.global))
        .with_timeout(config.timeout(&engine.global));
    for (name, value) in &config.labels {
        target = target.with_label(name, value);
    }
    target.validate()?;
    Ok(target)
}

fn build_rule(config: &RuleConfig, engine: &EngineConfig) -> Result<Rule> {
    let rule = Rule::builder(&config.name, &config.expr)
        .interval(config.interval(&engine.global))
        .for_duration(config.for_duration())
        .labels(config.labels.iter())
        .annotations(config.annotations.clone())
        .build()?;
    Ok(rule)
}

/// Maps the route section onto router settings.
#[must_use]
pub fn router_settings(route: &RouteConfig, external_url: &str) -> RouterSettings {
    RouterSettings {
        group_by: route.group_by.clone(),
        group_interval: route.group_interval(),
        repeat_interval: route.repeat_interval(),
        notify_on_resolve: route.notify_on_resolve,
        receivers: route.receivers.clone(),
        retry: retry_policy(&route.retry),
        external_url: external_url.trim_end_matches('/').to_string(),
        ..RouterSettings::default()
    }
}

fn retry_policy(config: &RetryConfig) -> RetryPolicy {
    RetryPolicy {
        initial_backoff: Duration::from_millis(config.initial_backoff_ms),
        multiplier: config.multiplier,
        max_backoff: Duration::from_secs(config.max_backoff_secs),
        max_attempts: config.max_attempts,
        jitter: config.jitter,
    }
}

fn build_receiver(config: &ReceiverConfig) -> Result<Arc<dyn Receiver>> {
    match config.kind {
        ReceiverType::Log => Ok(Arc::new(LogReceiver::new(&config.name))),
        ReceiverType::Webhook => {
            let url = config.url.as_deref().ok_or_else(|| {
                ConfigError::invalid(format!("receivers.{}.url", config.name), "is required")
            })?;
            let receiver = WebhookReceiver::new(&config.name, url)?
                .with_timeout(config.timeout())
                .with_headers(&config.headers)?;
            Ok(Arc::new(receiver))
        }
    }
}

fn build_silence(config: &SilenceConfig, now: DateTime<Utc>) -> Result<Silence> {
    let matchers = config.parsed_matchers()?;
    let silence = Silence::new(
        matchers,
        config.starts_at.unwrap_or(now),
        config.ends_at,
        &config.created_by,
        &config.comment,
    )?
    .from_config();
    Ok(silence)
}
