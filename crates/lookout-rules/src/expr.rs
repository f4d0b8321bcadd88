//! The alerting expression language.
//!
//! ```text
//! expr      := value [ cmp number ]
//! value     := aggregate | call | selector
//! aggregate := agg [ "by" "(" labels ")" ] "(" value ")" [ "by" "(" labels ")" ]
//! call      := range_fn "(" selector "[" duration "]" ")"
//! selector  := metric_name [ "{" matcher { "," matcher } [ "," ] "}" ]
//! cmp       := ">" | ">=" | "<" | "<=" | "==" | "!="
//! ```
//!
//! `agg` is one of `sum`, `avg`, `min`, `max`, `count`; `range_fn` is any
//! [`RangeFunction`]. Durations are integers with an `ms`, `s`, `m`, `h` or
//! `d` suffix and may be chained (`1h30m`). Without a comparison every
//! element of the value is considered true.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::Peekable;
use std::str::{CharIndices, FromStr};
use std::time::Duration;

use lookout_metrics::{
    validate_label_name, Aggregation, LabelMatcher, Labels, MatchOp, MetricName, RangeFunction,
    Selector, Snapshot, TimeRange, DEFAULT_LOOKBACK,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuleError};

/// Comparison operators for thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    /// Value > threshold
    #[serde(rename = ">")]
    GreaterThan,
    /// Value >= threshold
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    /// Value < threshold
    #[serde(rename = "<")]
    LessThan,
    /// Value <= threshold
    #[serde(rename = "<=")]
    LessThanOrEqual,
    /// Value == threshold
    #[serde(rename = "==")]
    Equal,
    /// Value != threshold
    #[serde(rename = "!=")]
    NotEqual,
}

impl ComparisonOperator {
    /// Evaluates the comparison.
    #[must_use]
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterThanOrEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessThanOrEqual => value <= threshold,
            Self::Equal => (value - threshold).abs() < f64::EPSILON,
            Self::NotEqual => (value - threshold).abs() >= f64::EPSILON,
        }
    }

    /// Returns the operator as a symbol string.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
        }
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            ">" => Some(Self::GreaterThan),
            ">=" => Some(Self::GreaterThanOrEqual),
            "<" => Some(Self::LessThan),
            "<=" => Some(Self::LessThanOrEqual),
            "==" => Some(Self::Equal),
            "!=" => Some(Self::NotEqual),
            _ => None,
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_symbol())
    }
}

/// A threshold the value is compared against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    /// The operator.
    pub op: ComparisonOperator,
    /// The right-hand side.
    pub threshold: f64,
}

/// The part of an expression that produces values per label set.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    /// Newest sample of each matching series within the lookback window.
    Instant(Selector),
    /// A range function applied to each matching series over a window.
    Range {
        /// The function.
        function: RangeFunction,
        /// The series to read.
        selector: Selector,
        /// How far back the window reaches.
        window: Duration,
    },
    /// An aggregation across the elements of the inner value.
    Aggregate {
        /// The aggregation operator.
        op: Aggregation,
        /// Labels that survive aggregation; empty collapses to one element.
        by: Vec<String>,
        /// The aggregated value.
        inner: Box<ValueExpr>,
    },
}

/// One element of an evaluation result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Element {
    /// The element's labels, without the metric name.
    pub labels: Labels,
    /// The element's value.
    pub value: f64,
}

impl ValueExpr {
    /// Evaluates against `snapshot` at timestamp `at`.
    ///
    /// Elements are ordered by label set.
    #[must_use]
    pub fn evaluate(&self, snapshot: &Snapshot, at: i64) -> Vec<Element> {
        match self {
            Self::Instant(selector) => snapshot
                .latest(selector, at, DEFAULT_LOOKBACK)
                .into_iter()
                .map(|(identity, sample)| Element {
                    labels: identity.labels.clone(),
                    value: sample.value,
                })
                .collect(),
            Self::Range {
                function,
                selector,
                window,
            } => {
                let range = TimeRange::ending_at(at, window_millis(*window));
                snapshot
                    .select(selector, range)
                    .iter()
                    .filter_map(|series| {
                        function.apply(&series.samples).map(|value| Element {
                            labels: series.identity.labels.clone(),
                            value,
                        })
                    })
                    .collect()
            }
            Self::Aggregate { op, by, inner } => {
                let mut groups: BTreeMap<Labels, Vec<f64>> = BTreeMap::new();
                for element in inner.evaluate(snapshot, at) {
                    groups
                        .entry(element.labels.keep_only(by))
                        .or_default()
                        .push(element.value);
                }
                groups
                    .into_iter()
                    .filter_map(|(labels, values)| {
                        op.apply(&values).map(|value| Element { labels, value })
                    })
                    .collect()
            }
        }
    }
}

impl fmt::Display for ValueExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instant(selector) => write!(f, "{selector}"),
            Self::Range {
                function,
                selector,
                window,
            } => write!(f, "{function}({selector}[{}])", format_duration(*window)),
            Self::Aggregate { op, by, inner } => {
                if by.is_empty() {
                    write!(f, "{op}({inner})")
                } else {
                    write!(f, "{op} by ({}) ({inner})", by.join(", "))
                }
            }
        }
    }
}

/// A parsed alerting expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    value: ValueExpr,
    comparison: Option<Comparison>,
}

impl Expr {
    /// Parses expression text.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::Parse` with the byte offset of the problem.
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: text.len(),
        };
        parser.expr()
    }

    /// The value part of the expression.
    #[must_use]
    pub const fn value(&self) -> &ValueExpr {
        &self.value
    }

    /// The threshold comparison, if any.
    #[must_use]
    pub const fn comparison(&self) -> Option<Comparison> {
        self.comparison
    }

    /// Returns the elements for which the expression is true, with the
    /// left-hand value.
    #[must_use]
    pub fn evaluate(&self, snapshot: &Snapshot, at: i64) -> Vec<Element> {
        let mut elements = self.value.evaluate(snapshot, at);
        if let Some(cmp) = self.comparison {
            elements.retain(|e| cmp.op.evaluate(e.value, cmp.threshold));
        }
        elements
    }
}

impl FromStr for Expr {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)?;
        if let Some(cmp) = self.comparison {
            write!(f, " {} {}", cmp.op, cmp.threshold)?;
        }
        Ok(())
    }
}

/// Parses a duration such as `30s`, `5m` or `1h30m`.
///
/// # Errors
///
/// Returns `RuleError::Parse` for empty input, unknown units or overflow.
pub fn parse_duration(text: &str) -> Result<Duration> {
    const UNITS: [(&str, u64); 5] = [
        ("ms", 1),
        ("s", 1_000),
        ("m", 60_000),
        ("h", 3_600_000),
        ("d", 86_400_000),
    ];

    if text.is_empty() {
        return Err(RuleError::parse(0, "empty duration"));
    }

    let mut total: u64 = 0;
    let mut rest = text;
    while !rest.is_empty() {
        let offset = text.len() - rest.len();
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(RuleError::parse(offset, format!("expected a number in '{text}'")));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| RuleError::parse(offset, format!("number too large in '{text}'")))?;
        rest = &rest[digits..];

        let (unit, millis) = UNITS
            .iter()
            .find(|(unit, _)| rest.starts_with(unit))
            .ok_or_else(|| {
                RuleError::parse(offset + digits, format!("missing or unknown unit in '{text}'"))
            })?;
        rest = &rest[unit.len()..];

        total = amount
            .checked_mul(*millis)
            .and_then(|m| total.checked_add(m))
            .ok_or_else(|| RuleError::parse(offset, format!("duration '{text}' overflows")))?;
    }
    Ok(Duration::from_millis(total))
}

/// Renders a duration in the largest unit that divides it exactly.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    for (unit, size) in [("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)] {
        if millis > 0 && millis % size == 0 {
            return format!("{}{unit}", millis / size);
        }
    }
    format!("{millis}ms")
}

fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Duration(Duration),
    Str(String),
    Symbol(&'static str),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "'{s}'"),
            Self::Number(n) => write!(f, "number {n}"),
            Self::Duration(d) => write!(f, "duration {}", format_duration(*d)),
            Self::Str(s) => write!(f, "string {s:?}"),
            Self::Symbol(s) => write!(f, "'{s}'"),
        }
    }
}

#[derive(Debug)]
struct Spanned {
    token: Token,
    pos: usize,
}

fn tokenize(input: &str) -> Result<Vec<Spanned>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let token = match c {
            '(' | ')' | '{' | '}' | '[' | ']' | ',' => {
                chars.next();
                Token::Symbol(match c {
                    '(' => "(",
                    ')' => ")",
                    '{' => "{",
                    '}' => "}",
                    '[' => "[",
                    ']' => "]",
                    _ => ",",
                })
            }
            '=' | '!' | '<' | '>' => {
                chars.next();
                let next = chars.peek().map(|&(_, n)| n);
                let symbol = match (c, next) {
                    ('=', Some('=')) => "==",
                    ('=', Some('~')) => "=~",
                    ('!', Some('=')) => "!=",
                    ('!', Some('~')) => "!~",
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('=', _) => "=",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    _ => return Err(RuleError::parse(pos, "unexpected '!'")),
                };
                if symbol.len() == 2 {
                    chars.next();
                }
                Token::Symbol(symbol)
            }
            '"' => {
                chars.next();
                Token::Str(read_string(&mut chars, pos)?)
            }
            c if c.is_ascii_digit() || matches!(c, '.' | '-' | '+') => {
                let text = take_while(input, &mut chars, |i, ch| {
                    ch.is_ascii_alphanumeric() || ch == '.' || (i == pos && matches!(ch, '-' | '+'))
                });
                lex_number(text, pos)?
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == ':' => Token::Ident(
                take_while(input, &mut chars, |_, ch| {
                    ch.is_ascii_alphanumeric() || ch == '_' || ch == ':'
                })
                .to_string(),
            ),
            other => return Err(RuleError::parse(pos, format!("unexpected character '{other}'"))),
        };
        tokens.push(Spanned { token, pos });
    }

    Ok(tokens)
}

fn take_while<'a>(
    input: &'a str,
    chars: &mut Peekable<CharIndices<'a>>,
    accept: impl Fn(usize, char) -> bool,
) -> &'a str {
    let start = chars.peek().map_or(input.len(), |&(i, _)| i);
    let mut end = start;
    while let Some((i, c)) = chars.next_if(|&(i, c)| accept(i, c)) {
        end = i + c.len_utf8();
    }
    &input[start..end]
}

fn lex_number(text: &str, pos: usize) -> Result<Token> {
    if let Ok(n) = text.parse::<f64>() {
        return Ok(Token::Number(n));
    }
    parse_duration(text)
        .map(Token::Duration)
        .map_err(|_| RuleError::parse(pos, format!("invalid number or duration '{text}'")))
}

fn read_string(chars: &mut Peekable<CharIndices<'_>>, start: usize) -> Result<String> {
    let mut value = String::new();
    loop {
        match chars.next() {
            Some((_, '"')) => return Ok(value),
            Some((i, '\\')) => match chars.next() {
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, 'n')) => value.push('\n'),
                Some((_, c)) => return Err(RuleError::parse(i, format!("invalid escape '\\{c}'"))),
                None => return Err(RuleError::parse(start, "unterminated string")),
            },
            Some((_, c)) => value.push(c),
            None => return Err(RuleError::parse(start, "unterminated string")),
        }
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |s| s.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        self.pos += 1;
        token
    }

    fn error(&self, reason: impl Into<String>) -> RuleError {
        RuleError::parse(self.position(), reason)
    }

    fn unexpected(&self, expected: &str) -> RuleError {
        match self.peek() {
            Some(token) => self.error(format!("expected {expected}, found {token}")),
            None => self.error(format!("expected {expected}, found end of input")),
        }
    }

    fn at_symbol(&self, symbol: &str) -> bool {
        matches!(self.peek(), Some(Token::Symbol(s)) if *s == symbol)
    }

    fn at_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == word)
    }

    fn expect_symbol(&mut self, symbol: &'static str) -> Result<()> {
        if self.at_symbol(symbol) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{symbol}'")))
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        let value = self.value()?;

        let comparison = match self.peek() {
            None => None,
            Some(Token::Symbol(s)) => {
                let op = ComparisonOperator::from_symbol(s)
                    .ok_or_else(|| self.unexpected("a comparison operator"))?;
                self.pos += 1;
                let threshold = match self.peek() {
                    Some(Token::Number(n)) => *n,
                    _ => return Err(self.unexpected("a number")),
                };
                self.pos += 1;
                Some(Comparison { op, threshold })
            }
            Some(_) => return Err(self.unexpected("a comparison operator")),
        };

        if self.peek().is_some() {
            return Err(self.unexpected("end of expression"));
        }

        Ok(Expr { value, comparison })
    }

    fn value(&mut self) -> Result<ValueExpr> {
        let start = self.position();
        let word = match self.peek() {
            Some(Token::Ident(word)) => word.clone(),
            _ => return Err(self.unexpected("a metric name, function or aggregation")),
        };
        self.pos += 1;

        if let Some(op) = Aggregation::from_keyword(&word) {
            if self.at_symbol("(") || self.at_ident("by") {
                return self.aggregate(op);
            }
        }
        if let Some(function) = RangeFunction::from_name(&word) {
            if self.at_symbol("(") {
                return self.call(function);
            }
        }

        Ok(ValueExpr::Instant(self.selector(&word, start)?))
    }

    fn aggregate(&mut self, op: Aggregation) -> Result<ValueExpr> {
        let mut by = None;
        if self.at_ident("by") {
            self.pos += 1;
            by = Some(self.label_list()?);
        }

        self.expect_symbol("(")?;
        let inner = self.value()?;
        self.expect_symbol(")")?;

        if self.at_ident("by") {
            if by.is_some() {
                return Err(self.error("duplicate 'by' clause"));
            }
            self.pos += 1;
            by = Some(self.label_list()?);
        }

        Ok(ValueExpr::Aggregate {
            op,
            by: by.unwrap_or_default(),
            inner: Box::new(inner),
        })
    }

    fn call(&mut self, function: RangeFunction) -> Result<ValueExpr> {
        self.expect_symbol("(")?;
        let start = self.position();
        let name = match self.advance() {
            Some(Token::Ident(name)) => name,
            _ => {
                return Err(RuleError::parse(
                    start,
                    format!("{function}() expects a series selector"),
                ));
            }
        };
        let selector = self.selector(&name, start)?;

        self.expect_symbol("[")?;
        let window = match self.peek() {
            Some(Token::Duration(d)) if !d.is_zero() => *d,
            Some(Token::Duration(_)) => return Err(self.error("range window must be positive")),
            _ => return Err(self.unexpected("a range window such as 5m")),
        };
        self.pos += 1;
        self.expect_symbol("]")?;
        self.expect_symbol(")")?;

        Ok(ValueExpr::Range {
            function,
            selector,
            window,
        })
    }

    fn label_list(&mut self) -> Result<Vec<String>> {
        self.expect_symbol("(")?;
        let mut labels = Vec::new();
        loop {
            if self.at_symbol(")") {
                self.pos += 1;
                return Ok(labels);
            }
            let pos = self.position();
            let label = match self.advance() {
                Some(Token::Ident(label)) => label,
                _ => return Err(RuleError::parse(pos, "expected a label name")),
            };
            validate_label_name(&label).map_err(|e| RuleError::parse(pos, e.to_string()))?;
            labels.push(label);

            if self.at_symbol(",") {
                self.pos += 1;
            } else if !self.at_symbol(")") {
                return Err(self.unexpected("',' or ')'"));
            }
        }
    }

    fn selector(&mut self, name: &str, start: usize) -> Result<Selector> {
        let name = MetricName::new(name).map_err(|e| RuleError::parse(start, e.to_string()))?;
        let mut selector = Selector::metric(name);
        if !self.at_symbol("{") {
            return Ok(selector);
        }
        self.pos += 1;

        loop {
            if self.at_symbol("}") {
                self.pos += 1;
                return Ok(selector);
            }

            let pos = self.position();
            let label = match self.advance() {
                Some(Token::Ident(label)) => label,
                _ => return Err(RuleError::parse(pos, "expected a label name")),
            };
            let op = match self.advance() {
                Some(Token::Symbol("=")) => MatchOp::Equal,
                Some(Token::Symbol("!=")) => MatchOp::NotEqual,
                Some(Token::Symbol("=~")) => MatchOp::RegexMatch,
                Some(Token::Symbol("!~")) => MatchOp::RegexNoMatch,
                _ => {
                    return Err(RuleError::parse(
                        pos,
                        format!("expected a matcher operator after '{label}'"),
                    ));
                }
            };
            let value = match self.advance() {
                Some(Token::Str(value)) => value,
                _ => {
                    return Err(RuleError::parse(
                        pos,
                        format!("label '{label}' value must be double-quoted"),
                    ));
                }
            };
            let matcher = LabelMatcher::new(label, op, value)
                .map_err(|e| RuleError::parse(pos, e.to_string()))?;
            selector = selector.with_matcher(matcher);

            if self.at_symbol(",") {
                self.pos += 1;
            } else if !self.at_symbol("}") {
                return Err(self.unexpected("',' or '}'"));
            }
        }
    }
}
