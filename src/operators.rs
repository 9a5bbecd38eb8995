//! The typed operator registry used to evaluate `Clause`s.
//!
//! Each operator compares one user attribute value against one clause value.
//! An unknown operator name is defined to never match rather than error.

use chrono::{DateTime, Utc};
use regex::Regex;
use semver::Version;
use serde_json::Value;

/// Whether `op` names an operator this registry understands. The evaluator
/// checks this before attribute lookup: an unrecognised operator is a miss
/// that bypasses `negate`, same as a missing attribute — both are "couldn't
/// evaluate this clause" rather than "evaluated to false".
pub fn is_known(op: &str) -> bool {
    matches!(
        op,
        "in" | "endsWith"
            | "startsWith"
            | "contains"
            | "matches"
            | "lessThan"
            | "lessThanOrEqual"
            | "greaterThan"
            | "greaterThanOrEqual"
            | "before"
            | "after"
            | "semVerEqual"
            | "semVerLessThan"
            | "semVerGreaterThan"
    )
}

/// Evaluates `op(user_value, clause_value)`. Returns `false` for any
/// combination the operator doesn't understand (wrong types, bad regex,
/// unparseable dates/versions) as well as for unknown operator names —
/// operator mismatches are misses, never errors.
pub fn matches(op: &str, user_value: &Value, clause_value: &Value) -> bool {
    match op {
        "in" => values_equal(user_value, clause_value),
        "endsWith" => with_strings(user_value, clause_value, |u, c| u.ends_with(c)),
        "startsWith" => with_strings(user_value, clause_value, |u, c| u.starts_with(c)),
        "contains" => with_strings(user_value, clause_value, |u, c| u.contains(c)),
        "matches" => with_strings(user_value, clause_value, |u, pattern| {
            Regex::new(pattern).map(|re| re.is_match(u)).unwrap_or(false)
        }),
        "lessThan" => with_numbers(user_value, clause_value, |u, c| u < c),
        "lessThanOrEqual" => with_numbers(user_value, clause_value, |u, c| u <= c),
        "greaterThan" => with_numbers(user_value, clause_value, |u, c| u > c),
        "greaterThanOrEqual" => with_numbers(user_value, clause_value, |u, c| u >= c),
        "before" => with_dates(user_value, clause_value, |u, c| u < c),
        "after" => with_dates(user_value, clause_value, |u, c| u > c),
        "semVerEqual" => with_versions(user_value, clause_value, |u, c| u == c),
        "semVerLessThan" => with_versions(user_value, clause_value, |u, c| u < c),
        "semVerGreaterThan" => with_versions(user_value, clause_value, |u, c| u > c),
        // "segmentMatch" is dispatched specially by the evaluator; any other
        // unrecognised name is a deliberate no-match, never an error.
        _ => false,
    }
}

/// Structural equality, except two `Value::Number`s compare by `as_f64()` —
/// `serde_json::Number`'s derived `PartialEq` treats `1` and `1.0` as
/// distinct since they land in different internal variants, which would
/// otherwise make `in` miss numerically identical values encoded differently.
fn values_equal(user: &Value, clause: &Value) -> bool {
    match (user, clause) {
        (Value::Number(u), Value::Number(c)) => u.as_f64() == c.as_f64(),
        _ => user == clause,
    }
}

fn with_strings(user: &Value, clause: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    match (user.as_str(), clause.as_str()) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

fn with_numbers(user: &Value, clause: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (user.as_f64(), clause.as_f64()) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_f64()
            .and_then(|millis| DateTime::from_timestamp_millis(millis as i64)),
        _ => None,
    }
}

fn with_dates(user: &Value, clause: &Value, f: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool) -> bool {
    match (parse_date(user), parse_date(clause)) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

fn parse_version(value: &Value) -> Option<Version> {
    let text = value.as_str()?;
    // LaunchDarkly allows a two-part "1.2" version; pad it like the other
    // SDKs do rather than rejecting it.
    let normalized = match text.split('.').count() {
        1 => format!("{}.0.0", text),
        2 => format!("{}.0", text),
        _ => text.to_string(),
    };
    Version::parse(&normalized).ok()
}

fn with_versions(user: &Value, clause: &Value, f: impl Fn(Version, Version) -> bool) -> bool {
    match (parse_version(user), parse_version(clause)) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn in_is_structural_equality() {
        assert!(matches("in", &json!("a"), &json!("a")));
        assert!(!matches("in", &json!("a"), &json!("b")));
        assert!(matches("in", &json!(1), &json!(1.0)));
    }

    #[test]
    fn string_operators() {
        assert!(matches("startsWith", &json!("hello world"), &json!("hello")));
        assert!(matches("endsWith", &json!("hello world"), &json!("world")));
        assert!(matches("contains", &json!("hello world"), &json!("lo wo")));
        assert!(!matches("contains", &json!("hello world"), &json!("xyz")));
    }

    #[test]
    fn regex_operator() {
        assert!(matches("matches", &json!("foo123"), &json!("^foo[0-9]+$")));
        assert!(!matches("matches", &json!("foo"), &json!("^[0-9]+$")));
        // invalid pattern never matches, never panics
        assert!(!matches("matches", &json!("foo"), &json!("(")));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(matches("lessThan", &json!(1), &json!(2)));
        assert!(matches("lessThanOrEqual", &json!(2), &json!(2)));
        assert!(matches("greaterThan", &json!(3), &json!(2)));
        assert!(matches("greaterThanOrEqual", &json!(2), &json!(2)));
        assert!(!matches("lessThan", &json!("a"), &json!(2)));
    }

    #[test]
    fn date_comparisons() {
        assert!(matches(
            "before",
            &json!("2019-01-01T00:00:00Z"),
            &json!("2020-01-01T00:00:00Z")
        ));
        assert!(matches("after", &json!(2_000_000_000_000i64), &json!(1_000_000_000_000i64)));
    }

    #[test]
    fn semver_comparisons() {
        assert!(matches("semVerEqual", &json!("2.0.0"), &json!("2.0")));
        assert!(matches("semVerLessThan", &json!("1.9.0"), &json!("2.0.0")));
        assert!(matches("semVerGreaterThan", &json!("2.0.1"), &json!("2.0.0")));
        assert!(!matches("semVerEqual", &json!("not-a-version"), &json!("2.0.0")));
    }

    #[test]
    fn unknown_operator_never_matches() {
        assert!(!matches("bogusOp", &json!("a"), &json!("a")));
    }

    #[test]
    fn is_known_distinguishes_real_operators_from_segment_match() {
        assert!(is_known("in"));
        assert!(is_known("semVerGreaterThan"));
        assert!(!is_known("segmentMatch"));
        assert!(!is_known("bogusOp"));
    }
}
