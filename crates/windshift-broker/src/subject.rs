//! Subject syntax: dot-separated tokens, `*` matches one token, `>` matches
//! one or more trailing tokens and may only appear last.

use crate::{BrokerError, Result};

/// Validate a literal subject as used for publishing. Wildcards are rejected.
pub fn validate_literal(subject: &str) -> Result<()> {
    validate_tokens(subject, false)
}

/// Validate a subject pattern as used for stream subjects and consumer filters.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    validate_tokens(pattern, true)
}

fn validate_tokens(subject: &str, wildcards: bool) -> Result<()> {
    if subject.is_empty() {
        return Err(BrokerError::InvalidSubject(subject.to_string()));
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (index, token) in tokens.iter().enumerate() {
        let valid = match *token {
            "" => false,
            "*" => wildcards,
            ">" => wildcards && index == tokens.len() - 1,
            literal => !literal.contains(char::is_whitespace),
        };
        if !valid {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

/// Does `pattern` match the literal `subject`?
pub fn matches(pattern: &str, subject: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let subject: Vec<&str> = subject.split('.').collect();
    matches_tokens(&pattern, &subject)
}

fn matches_tokens(pattern: &[&str], subject: &[&str]) -> bool {
    match (pattern.first(), subject.first()) {
        (None, None) => true,
        (Some(&">"), _) => !subject.is_empty(),
        (Some(&"*"), Some(_)) => matches_tokens(&pattern[1..], &subject[1..]),
        (Some(&token), Some(&head)) => token == head && matches_tokens(&pattern[1..], &subject[1..]),
        _ => false,
    }
}

/// Does `outer` cover every subject that `inner` can match?
///
/// Used to check that a consumer's filters stay within the owning stream's
/// subject set.
pub fn covers(outer: &str, inner: &str) -> bool {
    let outer: Vec<&str> = outer.split('.').collect();
    let inner: Vec<&str> = inner.split('.').collect();
    covers_tokens(&outer, &inner)
}

fn covers_tokens(outer: &[&str], inner: &[&str]) -> bool {
    match (outer.first(), inner.first()) {
        (None, None) => true,
        (Some(&">"), _) => !inner.is_empty(),
        (Some(&"*"), Some(&head)) => head != ">" && covers_tokens(&outer[1..], &inner[1..]),
        (Some(&token), Some(&head)) => token == head && covers_tokens(&outer[1..], &inner[1..]),
        _ => false,
    }
}

/// Can any subject match both patterns?
///
/// Streams may not claim overlapping subject spaces, so a publish always
/// resolves to exactly one stream.
pub fn overlaps(a: &str, b: &str) -> bool {
    let a: Vec<&str> = a.split('.').collect();
    let b: Vec<&str> = b.split('.').collect();
    overlaps_tokens(&a, &b)
}

fn overlaps_tokens(a: &[&str], b: &[&str]) -> bool {
    match (a.first(), b.first()) {
        (None, None) => true,
        (Some(&">"), _) => !b.is_empty(),
        (_, Some(&">")) => !a.is_empty(),
        (Some(&x), Some(&y)) => {
            (x == "*" || y == "*" || x == y) && overlaps_tokens(&a[1..], &b[1..])
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_subjects_reject_wildcards() {
        validate_literal("orders.created").expect("literal");
        validate_literal("orders.*").expect_err("star");
        validate_literal("orders.>").expect_err("full wildcard");
        validate_literal("orders..created").expect_err("empty token");
        validate_literal("").expect_err("empty");
    }

    #[test]
    fn patterns_constrain_full_wildcard_position() {
        validate_pattern("orders.>").expect("trailing");
        validate_pattern("orders.*.shipped").expect("star");
        validate_pattern("orders.>.shipped").expect_err("inner full wildcard");
        validate_pattern("orders. created").expect_err("whitespace");
    }

    #[test]
    fn matching() {
        assert!(matches("orders.*", "orders.created"));
        assert!(matches("orders.>", "orders.eu.created"));
        assert!(matches("orders.created", "orders.created"));
        assert!(!matches("orders.*", "orders.eu.created"));
        assert!(!matches("orders.>", "orders"));
        assert!(!matches("orders.created", "orders.shipped"));
    }

    #[test]
    fn coverage() {
        assert!(covers("events.>", "events.test"));
        assert!(covers("events.>", "events.>"));
        assert!(covers("events.>", "events.*.done"));
        assert!(covers("events.*", "events.test"));
        assert!(!covers("events.*", "events.>"));
        assert!(!covers("events.>", "other.test"));
        assert!(!covers("events.a", "events.*"));
    }

    #[test]
    fn overlap() {
        assert!(overlaps("events.>", "events.test"));
        assert!(overlaps("events.*", "*.test"));
        assert!(!overlaps("events.>", "orders.>"));
        assert!(!overlaps("events.a", "events.b"));
    }
}
