//! Annotation templates.
//!
//! Two placeholders are understood: `{{ $value }}` expands to the value that
//! made the rule true, `{{ $labels.<name> }}` to one of the alert's labels
//! (empty if absent). Anything else is copied verbatim.

use std::collections::BTreeMap;

use lookout_metrics::Labels;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*\$(value|labels\.([a-zA-Z_][a-zA-Z0-9_]*))\s*\}\}")
        .unwrap_or_else(|_| unreachable!())
});

/// Expands one template.
#[must_use]
pub fn expand(template: &str, labels: &Labels, value: f64) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match caps.get(2) {
            Some(name) => labels.get(name.as_str()).unwrap_or_default().to_string(),
            None => value.to_string(),
        })
        .into_owned()
}

/// Expands every annotation of a rule.
#[must_use]
pub fn expand_all(
    templates: &BTreeMap<String, String>,
    labels: &Labels,
    value: f64,
) -> BTreeMap<String, String> {
    templates
        .iter()
        .map(|(key, template)| (key.clone(), expand(template, labels, value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn labels() -> Labels {
        Labels::new().with("instance", "web-1:8080").with("job", "web")
    }

    #[test_case("{{ $value }}", "12.5" ; "value")]
    #[test_case("{{$value}}", "12.5" ; "value without spaces")]
    #[test_case("{{ $labels.instance }} is down", "web-1:8080 is down" ; "label")]
    #[test_case("{{ $labels.missing }}!", "!" ; "missing label")]
    #[test_case("{{ .Value }}", "{{ .Value }}" ; "unknown placeholder")]
    #[test_case("no placeholders", "no placeholders" ; "plain text")]
    #[test_case(
        "{{ $labels.job }}/{{ $labels.instance }} has {{ $value }} errors",
        "web/web-1:8080 has 12.5 errors" ;
        "several"
    )]
    fn expands(template: &str, expected: &str) {
        assert_eq!(expand(template, &labels(), 12.5), expected);
    }

    #[test]
    fn integral_values_render_without_fraction() {
        assert_eq!(expand("{{ $value }}", &labels(), 6.0), "6");
    }

    #[test]
    fn expand_all_keeps_keys() {
        let mut templates = BTreeMap::new();
        templates.insert("summary".to_string(), "{{ $labels.job }} errors".to_string());
        templates.insert("description".to_string(), "value {{ $value }}".to_string());

        let expanded = expand_all(&templates, &labels(), 1.0);
        assert_eq!(expanded["summary"], "web errors");
        assert_eq!(expanded["description"], "value 1");
    }
}
