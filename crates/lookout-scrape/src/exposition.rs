//! Parser for the plain-text exposition format.
//!
//! One sample per line:
//!
//! ```text
//! # HELP http_requests_total Total requests.
//! http_requests_total{method="GET",status="200"} 1027 1395066363000
//! up 1
//! ```
//!
//! Blank lines and `#` lines are skipped. Label values support the `\\`,
//! `\"` and `\n` escapes. Values may be `NaN`, `+Inf` or `-Inf`. The
//! optional trailing timestamp is in milliseconds. A single malformed line
//! rejects the whole body.

use std::iter::Peekable;
use std::str::CharIndices;

use lookout_metrics::{validate_label_name, Labels, MetricName};

use crate::error::{Result, ScrapeError};

/// One parsed exposition line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSample {
    /// The metric name.
    pub name: MetricName,
    /// Labels as exposed by the target.
    pub labels: Labels,
    /// The sample value.
    pub value: f64,
    /// The explicit timestamp, if the line carried one.
    pub timestamp: Option<i64>,
}

/// Parses a full response body.
///
/// # Errors
///
/// Returns `ScrapeError::Parse` for the first malformed line.
pub fn parse(body: &str) -> Result<Vec<ParsedSample>> {
    body.lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                None
            } else {
                Some(parse_line(line).map_err(|reason| ScrapeError::Parse { line: i + 1, reason }))
            }
        })
        .collect()
}

type Cursor<'a> = Peekable<CharIndices<'a>>;

fn parse_line(line: &str) -> std::result::Result<ParsedSample, String> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or_else(|| "missing value".to_string())?;
    let name = MetricName::new(&line[..name_end]).map_err(|e| e.to_string())?;

    let mut rest = &line[name_end..];
    let mut labels = Labels::new();
    if rest.starts_with('{') {
        let consumed = parse_labels(rest, &mut labels)?;
        rest = &rest[consumed..];
    }

    let mut fields = rest.split_whitespace();
    let value = fields
        .next()
        .ok_or_else(|| "missing value".to_string())
        .and_then(parse_value)?;
    let timestamp = fields
        .next()
        .map(|ts| {
            ts.parse::<i64>()
                .map_err(|_| format!("invalid timestamp '{ts}'"))
        })
        .transpose()?;

    if let Some(extra) = fields.next() {
        return Err(format!("unexpected trailing content '{extra}'"));
    }

    Ok(ParsedSample {
        name,
        labels,
        value,
        timestamp,
    })
}

/// Parses `{a="b",...}` and returns the number of bytes consumed.
fn parse_labels(text: &str, labels: &mut Labels) -> std::result::Result<usize, String> {
    let mut chars: Cursor<'_> = text.char_indices().peekable();
    chars.next(); // '{'

    loop {
        skip_whitespace(&mut chars);
        match chars.peek() {
            Some(&(i, '}')) => return Ok(i + 1),
            Some(_) => {}
            None => return Err("unterminated label set".to_string()),
        }

        let name = read_label_name(text, &mut chars)?;
        validate_label_name(&name).map_err(|e| e.to_string())?;

        skip_whitespace(&mut chars);
        if chars.next().map(|(_, c)| c) != Some('=') {
            return Err(format!("expected '=' after label '{name}'"));
        }
        skip_whitespace(&mut chars);
        if chars.next().map(|(_, c)| c) != Some('"') {
            return Err(format!("label '{name}' value must be double-quoted"));
        }

        let value = read_quoted(&mut chars)?;
        if labels.insert(name.clone(), value).is_some() {
            return Err(format!("duplicate label '{name}'"));
        }

        skip_whitespace(&mut chars);
        match chars.next() {
            Some((_, ',')) => {}
            Some((i, '}')) => return Ok(i + 1),
            Some((_, c)) => return Err(format!("unexpected '{c}' in label set")),
            None => return Err("unterminated label set".to_string()),
        }
    }
}

fn skip_whitespace(chars: &mut Cursor<'_>) {
    while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
}

fn read_label_name(text: &str, chars: &mut Cursor<'_>) -> std::result::Result<String, String> {
    let start = chars.peek().map_or(text.len(), |&(i, _)| i);
    let mut end = start;
    while let Some((i, c)) = chars.next_if(|(_, c)| c.is_ascii_alphanumeric() || *c == '_') {
        end = i + c.len_utf8();
    }
    if start == end {
        return Err("expected label name".to_string());
    }
    Ok(text[start..end].to_string())
}

fn read_quoted(chars: &mut Cursor<'_>) -> std::result::Result<String, String> {
    let mut value = String::new();
    loop {
        match chars.next() {
            Some((_, '"')) => return Ok(value),
            Some((_, '\\')) => match chars.next() {
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, 'n')) => value.push('\n'),
                Some((_, c)) => return Err(format!("invalid escape '\\{c}'")),
                None => return Err("unterminated label value".to_string()),
            },
            Some((_, c)) => value.push(c),
            None => return Err("unterminated label value".to_string()),
        }
    }
}

fn parse_value(text: &str) -> std::result::Result<f64, String> {
    match text {
        "NaN" => Ok(f64::NAN),
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        _ => text
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("invalid value '{text}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parse_simple_lines() {
        let body = "up 1\nhttp_requests_total{method=\"GET\",status=\"200\"} 1027\n";
        let samples = parse(body).unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name.as_str(), "up");
        assert!(samples[0].labels.is_empty());
        assert!((samples[0].value - 1.0).abs() < f64::EPSILON);
        assert_eq!(samples[0].timestamp, None);

        assert_eq!(samples[1].labels.get("method"), Some("GET"));
        assert_eq!(samples[1].labels.get("status"), Some("200"));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let body = "# HELP up Whether the target is up.\n# TYPE up gauge\n\n   \nup 1\n";
        assert_eq!(parse(body).unwrap().len(), 1);
    }

    #[test]
    fn empty_body_has_no_samples() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn explicit_timestamp() {
        let samples = parse("errors_total 3 1395066363000").unwrap();
        assert_eq!(samples[0].timestamp, Some(1_395_066_363_000));
    }

    #[test]
    fn escaped_label_values() {
        let samples = parse(r#"msg{text="say \"hi\"\\n\nnext"} 1"#).unwrap();
        assert_eq!(samples[0].labels.get("text"), Some("say \"hi\"\\n\nnext"));
    }

    #[test]
    fn label_values_may_contain_separators() {
        let samples = parse(r#"req{path="/a,b}c d"} 2"#).unwrap();
        assert_eq!(samples[0].labels.get("path"), Some("/a,b}c d"));
    }

    #[test]
    fn whitespace_and_trailing_comma_in_labels() {
        let samples = parse(r#"req{ a = "1" , b="2", } 2"#).unwrap();
        assert_eq!(samples[0].labels.len(), 2);
        assert_eq!(samples[0].labels.get("b"), Some("2"));
    }

    #[test]
    fn special_values() {
        let samples = parse("a NaN\nb +Inf\nc -Inf\nd 1.5e3\ne -0.25").unwrap();
        assert!(samples[0].value.is_nan());
        assert_eq!(samples[1].value, f64::INFINITY);
        assert_eq!(samples[2].value, f64::NEG_INFINITY);
        assert!((samples[3].value - 1500.0).abs() < f64::EPSILON);
        assert!((samples[4].value + 0.25).abs() < f64::EPSILON);
    }

    #[test_case("up" ; "missing value")]
    #[test_case("up one" ; "non numeric value")]
    #[test_case("up 1 2 3" ; "trailing content")]
    #[test_case("up 1 12.5" ; "fractional timestamp")]
    #[test_case("9up 1" ; "bad metric name")]
    #[test_case("up{job=\"a\" 1" ; "unterminated labels")]
    #[test_case("up{job=a} 1" ; "unquoted value")]
    #[test_case("up{job=\"a\",job=\"b\"} 1" ; "duplicate label")]
    #[test_case("up{job=\"a\\x\"} 1" ; "bad escape")]
    #[test_case("up{1job=\"a\"} 1" ; "bad label name")]
    #[test_case("up{job=\"a\"}x 1" ; "garbage after labels")]
    fn malformed_lines_are_rejected(line: &str) {
        assert!(matches!(parse(line), Err(ScrapeError::Parse { line: 1, .. })));
    }

    #[test]
    fn one_bad_line_fails_whole_body() {
        let body = "up 1\nrequests_total 5\nbroken{\n";
        match parse(body) {
            Err(ScrapeError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn label_values_survive_escaping(value in "[ -~\n]{0,40}") {
                let escaped = value
                    .replace('\\', "\\\\")
                    .replace('"', "\\\"")
                    .replace('\n', "\\n");
                let line = format!("m{{v=\"{escaped}\"}} 1");

                let samples = parse(&line).unwrap();
                prop_assert_eq!(samples[0].labels.get("v"), Some(value.as_str()));
            }
        }
    }
}
