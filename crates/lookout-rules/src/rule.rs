//! Alerting rule definitions.

use std::collections::BTreeMap;
use std::time::Duration;

use lookout_metrics::{validate_label_name, Labels};
use serde::Serialize;

use crate::error::{Result, RuleError};
use crate::expr::Expr;

/// Evaluation interval used when none is given.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

/// A named alerting expression with its schedule and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    name: String,
    expr_text: String,
    expr: Expr,
    interval: Duration,
    for_duration: Duration,
    labels: Labels,
    annotations: BTreeMap<String, String>,
}

impl Rule {
    /// Maximum allowed length for rule names.
    pub const MAX_NAME_LENGTH: usize = 256;

    /// Creates a new rule builder.
    pub fn builder(name: impl Into<String>, expr: impl Into<String>) -> RuleBuilder {
        RuleBuilder::new(name, expr)
    }

    /// The rule name, used as the `alertname` label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The expression as written.
    #[must_use]
    pub fn expr_text(&self) -> &str {
        &self.expr_text
    }

    /// The parsed expression.
    #[must_use]
    pub const fn expr(&self) -> &Expr {
        &self.expr
    }

    /// How often the rule is evaluated.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// How long the expression must hold before the alert fires.
    #[must_use]
    pub const fn for_duration(&self) -> Duration {
        self.for_duration
    }

    /// Labels added to every alert of this rule.
    #[must_use]
    pub const fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Annotation templates.
    #[must_use]
    pub const fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    /// Returns true if `other` evaluates the same expression under the same
    /// name, so alert state can carry over between the two.
    #[must_use]
    pub fn same_definition(&self, other: &Self) -> bool {
        self.name == other.name && self.expr == other.expr
    }

    /// Builds the label set of an alert from the labels of a result element.
    #[must_use]
    pub fn alert_labels(&self, element_labels: &Labels) -> Labels {
        let mut labels = element_labels.clone();
        labels.extend(&self.labels);
        labels.insert("alertname", self.name.clone());
        labels
    }
}

/// A serializable summary of a rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSummary {
    /// Rule name.
    pub name: String,
    /// Expression text.
    pub expr: String,
    /// Evaluation interval in seconds.
    pub interval_secs: f64,
    /// Hold duration in seconds.
    pub for_secs: f64,
    /// Static labels.
    pub labels: Labels,
    /// Annotation templates.
    pub annotations: BTreeMap<String, String>,
}

impl From<&Rule> for RuleSummary {
    fn from(rule: &Rule) -> Self {
        Self {
            name: rule.name.clone(),
            expr: rule.expr_text.clone(),
            interval_secs: rule.interval.as_secs_f64(),
            for_secs: rule.for_duration.as_secs_f64(),
            labels: rule.labels.clone(),
            annotations: rule.annotations.clone(),
        }
    }
}

/// Builder for creating [`Rule`] instances.
#[derive(Debug)]
pub struct RuleBuilder {
    name: String,
    expr: String,
    interval: Duration,
    for_duration: Duration,
    labels: Labels,
    annotations: BTreeMap<String, String>,
}

impl RuleBuilder {
    fn new(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expr: expr.into(),
            interval: DEFAULT_INTERVAL,
            for_duration: Duration::ZERO,
            labels: Labels::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Sets the evaluation interval.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets how long the expression must hold before firing.
    #[must_use]
    pub const fn for_duration(mut self, duration: Duration) -> Self {
        self.for_duration = duration;
        self
    }

    /// Adds a label to the rule.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key, value);
        self
    }

    /// Adds multiple labels to the rule.
    #[must_use]
    pub fn labels<K, V>(mut self, labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in labels {
            self.labels.insert(key, value);
        }
        self
    }

    /// Adds an annotation template.
    #[must_use]
    pub fn annotation(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), template.into());
        self
    }

    /// Adds multiple annotation templates.
    #[must_use]
    pub fn annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations.extend(annotations);
        self
    }

    /// Parses the expression and builds the [`Rule`].
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidRule` if:
    /// - The name is empty or too long
    /// - The interval is zero
    /// - A label name is invalid or is `alertname`
    ///
    /// Returns `RuleError::Parse` if the expression does not parse.
    pub fn build(self) -> Result<Rule> {
        if self.name.is_empty() {
            return Err(RuleError::invalid("rule name cannot be empty"));
        }
        if self.name.len() > Rule::MAX_NAME_LENGTH {
            return Err(RuleError::invalid(format!(
                "rule name exceeds maximum length of {} characters",
                Rule::MAX_NAME_LENGTH
            )));
        }
        if self.interval.is_zero() {
            return Err(RuleError::invalid(format!(
                "rule '{}' has a zero evaluation interval",
                self.name
            )));
        }
        for (name, _) in self.labels.iter() {
            validate_label_name(name)
                .map_err(|e| RuleError::invalid(format!("rule '{}': {e}", self.name)))?;
            if name == "alertname" {
                return Err(RuleError::invalid(format!(
                    "rule '{}' may not set the alertname label",
                    self.name
                )));
            }
        }

        let expr = Expr::parse(&self.expr)?;

        Ok(Rule {
            name: self.name,
            expr_text: self.expr,
            expr,
            interval: self.interval,
            for_duration: self.for_duration,
            labels: self.labels,
            annotations: self.annotations,
        })
    }
}
