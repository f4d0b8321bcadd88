//! Label matchers and series selectors.
//!
//! A [`Selector`] picks series by metric name plus any number of
//! [`LabelMatcher`]s. Matchers are also reused by silences in the router.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};
use crate::types::{validate_label_name, Labels, MetricIdentity, MetricName};

/// The comparison a matcher performs on a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOp {
    /// `=`: value equals.
    #[serde(rename = "=")]
    Equal,
    /// `!=`: value differs.
    #[serde(rename = "!=")]
    NotEqual,
    /// `=~`: value matches the anchored regex.
    #[serde(rename = "=~")]
    RegexMatch,
    /// `!~`: value does not match the anchored regex.
    #[serde(rename = "!~")]
    RegexNoMatch,
}

impl MatchOp {
    /// Returns the operator symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::RegexMatch => "=~",
            Self::RegexNoMatch => "!~",
        }
    }
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_symbol())
    }
}

/// Matches a single label against a value or pattern.
///
/// A missing label is treated as the empty string, so `foo=""` matches series
/// without `foo` and `foo!=""` selects series that carry it.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    name: String,
    op: MatchOp,
    value: String,
    regex: Option<Regex>,
}

impl LabelMatcher {
    /// Creates a matcher, compiling the pattern for regex operators.
    ///
    /// # Errors
    ///
    /// Returns an error if the label name or the regex is invalid.
    pub fn new(name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        validate_label_name(&name)?;

        let regex = match op {
            MatchOp::RegexMatch | MatchOp::RegexNoMatch => Some(
                Regex::new(&format!("^(?:{value})$")).map_err(|e| {
                    MetricsError::InvalidMatcher {
                        reason: format!("bad regex for label '{name}': {e}"),
                    }
                })?,
            ),
            MatchOp::Equal | MatchOp::NotEqual => None,
        };

        Ok(Self {
            name,
            op,
            value,
            regex,
        })
    }

    /// Shorthand for an equality matcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the label name is invalid.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new(name, MatchOp::Equal, value)
    }

    /// Parses the textual form `name<op>"value"`, e.g. `job=~"api.*"`.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidMatcher` if the text is malformed.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let op_start = text
            .find(['=', '!'])
            .ok_or_else(|| MetricsError::InvalidMatcher {
                reason: format!("no operator in '{text}'"),
            })?;
        let name = text[..op_start].trim();
        let rest = &text[op_start..];

        let (op, rest) = if let Some(r) = rest.strip_prefix("=~") {
            (MatchOp::RegexMatch, r)
        } else if let Some(r) = rest.strip_prefix("!~") {
            (MatchOp::RegexNoMatch, r)
        } else if let Some(r) = rest.strip_prefix("!=") {
            (MatchOp::NotEqual, r)
        } else if let Some(r) = rest.strip_prefix('=') {
            (MatchOp::Equal, r)
        } else {
            return Err(MetricsError::InvalidMatcher {
                reason: format!("unknown operator in '{text}'"),
            });
        };

        let rest = rest.trim();
        let value = rest
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .ok_or_else(|| MetricsError::InvalidMatcher {
                reason: format!("value must be double-quoted in '{text}'"),
            })?;

        Self::new(name, op, unescape(value))
    }

    /// The label name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The operator.
    #[must_use]
    pub const fn op(&self) -> MatchOp {
        self.op
    }

    /// The raw value or pattern.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Tests a single label value (`""` when the label is absent).
    #[must_use]
    pub fn matches_value(&self, value: &str) -> bool {
        match (self.op, &self.regex) {
            (MatchOp::Equal, _) => value == self.value,
            (MatchOp::NotEqual, _) => value != self.value,
            (MatchOp::RegexMatch, Some(re)) => re.is_match(value),
            (MatchOp::RegexNoMatch, Some(re)) => !re.is_match(value),
            (MatchOp::RegexMatch | MatchOp::RegexNoMatch, None) => false,
        }
    }

    /// Tests a label set.
    #[must_use]
    pub fn matches(&self, labels: &Labels) -> bool {
        self.matches_value(labels.get(&self.name).unwrap_or(""))
    }
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl PartialEq for LabelMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

impl Serialize for LabelMatcher {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LabelMatcher {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Returns true if every matcher accepts the label set.
#[must_use]
pub fn all_match(matchers: &[LabelMatcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}

/// Selects series by metric name and label matchers.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    /// The metric name every selected series must have.
    pub name: MetricName,
    /// Additional label constraints.
    pub matchers: Vec<LabelMatcher>,
}

impl Selector {
    /// Selects every series of a metric.
    #[must_use]
    pub const fn metric(name: MetricName) -> Self {
        Self {
            name,
            matchers: Vec::new(),
        }
    }

    /// Adds a matcher and returns self for chaining.
    #[must_use]
    pub fn with_matcher(mut self, matcher: LabelMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Returns true if the selector accepts the identity.
    #[must_use]
    pub fn matches(&self, identity: &MetricIdentity) -> bool {
        identity.name == self.name && self.matches_labels(&identity.labels)
    }

    /// Tests only the label matchers.
    #[must_use]
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        all_match(&self.matchers, labels)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.matchers.is_empty() {
            f.write_str("{")?;
            for (i, m) in self.matchers.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{m}")?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}
