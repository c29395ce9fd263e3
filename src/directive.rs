//! Cache directives embedded in SQL comments.
//!
//! A query opts into caching by carrying both directives, usually as line
//! comments so the database ignores them:
//!
//! ```sql
//! -- @cache-ttl 30
//! -- @cache-max-rows 1000
//! SELECT a FROM t WHERE a > ?
//! ```
//!
//! Anything short of exactly one well-formed pair means "do not cache".

use once_cell::sync::Lazy;
use regex::Regex;
use std::num::ParseIntError;
use std::time::Duration;
use thiserror::Error;

pub const TTL_DIRECTIVE: &str = "@cache-ttl";
pub const MAX_ROWS_DIRECTIVE: &str = "@cache-max-rows";

static DIRECTIVE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(@cache-ttl|@cache-max-rows)[ \t]+([^\s;,*/]+)")
        .expect("directive pattern is a valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("invalid value {value:?} for {directive}: {source}")]
    InvalidValue {
        directive: String,
        value: String,
        #[source]
        source: ParseIntError,
    },
}

/// Cache policy for a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    /// Seconds a populated result stays valid.
    pub ttl: u64,
    /// Largest row count eligible for caching.
    pub max_rows: u64,
}

impl Attributes {
    pub fn new(ttl: u64, max_rows: u64) -> Self {
        Self { ttl, max_rows }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    /// Whether a result of `rows` rows may be stored.
    pub fn admits(&self, rows: usize) -> bool {
        (rows as u64) <= self.max_rows
    }
}

/// Extract the cache policy from `query`.
///
/// Returns `Ok(None)` unless the first two directive occurrences are one
/// `@cache-ttl` and one `@cache-max-rows`. A value that is not a non-negative
/// integer is an error, and no partial policy is returned.
pub fn parse(query: &str) -> Result<Option<Attributes>, DirectiveError> {
    let found: Vec<_> = DIRECTIVE_PATTERN.captures_iter(query).take(2).collect();
    if found.len() != 2 {
        return Ok(None);
    }

    let mut ttl = None;
    let mut max_rows = None;
    for caps in &found {
        let (Some(directive), Some(value)) = (caps.get(1), caps.get(2)) else {
            return Ok(None);
        };
        let parsed = parse_value(directive.as_str(), value.as_str())?;
        match directive.as_str() {
            TTL_DIRECTIVE => ttl = Some(parsed),
            MAX_ROWS_DIRECTIVE => max_rows = Some(parsed),
            _ => {}
        }
    }

    match (ttl, max_rows) {
        (Some(ttl), Some(max_rows)) => Ok(Some(Attributes { ttl, max_rows })),
        _ => Ok(None),
    }
}

fn parse_value(directive: &str, value: &str) -> Result<u64, DirectiveError> {
    value
        .parse::<u64>()
        .map_err(|source| DirectiveError::InvalidValue {
            directive: directive.to_string(),
            value: value.to_string(),
            source,
        })
}

/// Remove directive-bearing line comments from `query`.
///
/// Only a `--` comment that starts in plain SQL text is considered; string
/// literals, quoted identifiers and block comments are skipped, so a `--`
/// inside them never truncates the query. A directive-bearing comment is
/// dropped together with the whitespace before it, and its line too when
/// nothing else is left on it. Everything else is kept byte-for-byte apart
/// from leading/trailing whitespace of the result.
pub fn strip(query: &str) -> String {
    let bytes = query.as_bytes();
    let mut out = String::with_capacity(query.len());
    let mut state = Scan::Code;
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        match state {
            Scan::Code => match (bytes[i], bytes.get(i + 1)) {
                (b'\'', _) | (b'"', _) => {
                    state = Scan::Quoted(bytes[i]);
                    i += 1;
                }
                (b'/', Some(b'*')) => {
                    state = Scan::Block;
                    i += 2;
                }
                (b'-', Some(b'-')) => {
                    let end = query[i..].find('\n').map_or(query.len(), |n| i + n);
                    if DIRECTIVE_PATTERN.is_match(&query[i..end]) {
                        out.push_str(query[copied..i].trim_end_matches([' ', '\t']));
                        let line_empty = out.is_empty() || out.ends_with('\n');
                        copied = if line_empty && end < query.len() {
                            end + 1
                        } else {
                            end
                        };
                    }
                    i = end;
                }
                _ => i += 1,
            },
            // a doubled quote closes and reopens, which scans the same
            Scan::Quoted(quote) => {
                if bytes[i] == quote {
                    state = Scan::Code;
                }
                i += 1;
            }
            Scan::Block => {
                if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    state = Scan::Code;
                    i += 2;
                } else {
                    i += 1;
                }
            }
        }
    }
    out.push_str(&query[copied..]);
    out.trim().to_string()
}

#[derive(Clone, Copy)]
enum Scan {
    Code,
    Quoted(u8),
    Block,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_directives_means_no_caching() {
        assert_eq!(parse("SELECT 1").unwrap(), None);
        assert_eq!(parse("").unwrap(), None);
    }

    #[test]
    fn single_directive_means_no_caching() {
        assert_eq!(parse("-- @cache-ttl 30\nSELECT 1").unwrap(), None);
        assert_eq!(parse("-- @cache-max-rows 10\nSELECT 1").unwrap(), None);
    }

    #[test]
    fn both_directives_in_either_order() {
        let q1 = "-- @cache-ttl 30\n-- @cache-max-rows 1000\nSELECT a FROM t";
        let q2 = "-- @cache-max-rows 1000\n-- @cache-ttl 30\nSELECT a FROM t";
        assert_eq!(parse(q1).unwrap(), Some(Attributes::new(30, 1000)));
        assert_eq!(parse(q2).unwrap(), Some(Attributes::new(30, 1000)));
    }

    #[test]
    fn duplicated_key_is_not_a_policy() {
        let q = "-- @cache-ttl 30\n-- @cache-ttl 60\nSELECT 1";
        assert_eq!(parse(q).unwrap(), None);
    }

    #[test]
    fn only_first_two_occurrences_count() {
        let q = "-- @cache-ttl 30\n-- @cache-max-rows 5\n-- @cache-ttl oops\nSELECT 1";
        assert_eq!(parse(q).unwrap(), Some(Attributes::new(30, 5)));
    }

    #[test]
    fn non_numeric_value_is_an_error() {
        let q = "-- @cache-ttl abc\n-- @cache-max-rows 10\nSELECT 1";
        let err = parse(q).unwrap_err();
        let DirectiveError::InvalidValue {
            directive, value, ..
        } = err;
        assert_eq!(directive, "@cache-ttl");
        assert_eq!(value, "abc");
    }

    #[test]
    fn negative_and_overflowing_values_are_errors() {
        assert!(parse("-- @cache-ttl -5\n-- @cache-max-rows 10").is_err());
        assert!(parse("-- @cache-ttl 5\n-- @cache-max-rows 99999999999999999999999").is_err());
    }

    #[test]
    fn keys_are_case_sensitive() {
        assert_eq!(parse("-- @Cache-TTL 5\n-- @cache-max-rows 10").unwrap(), None);
    }

    #[test]
    fn block_comment_terminator_is_not_part_of_the_value() {
        let q = "/* @cache-ttl 5 @cache-max-rows 10*/ SELECT 1";
        assert_eq!(parse(q).unwrap(), Some(Attributes::new(5, 10)));
    }

    #[test]
    fn attributes_helpers() {
        let attrs = Attributes::new(30, 2);
        assert_eq!(attrs.ttl(), Duration::from_secs(30));
        assert!(attrs.admits(0));
        assert!(attrs.admits(2));
        assert!(!attrs.admits(3));
    }

    #[test]
    fn strip_removes_directive_comments_only() {
        let q = "\n  -- @cache-ttl 30\n  -- @cache-max-rows 1000\n  SELECT a FROM t WHERE a > ? -- hot path\n";
        assert_eq!(strip(q), "SELECT a FROM t WHERE a > ? -- hot path");
    }

    #[test]
    fn strip_keeps_code_before_trailing_directive() {
        let q = "SELECT a FROM t -- @cache-ttl 30\n-- @cache-max-rows 10";
        assert_eq!(strip(q), "SELECT a FROM t");
    }

    #[test]
    fn strip_ignores_dashes_inside_literals() {
        let x = "SELECT a FROM t WHERE tag = '--x' -- @cache-ttl 30\n-- @cache-max-rows 10";
        let y = "SELECT a FROM t WHERE tag = '--y' -- @cache-ttl 30\n-- @cache-max-rows 10";
        assert_eq!(strip(x), "SELECT a FROM t WHERE tag = '--x'");
        assert_ne!(strip(x), strip(y));

        let ident = "SELECT \"a--b\" FROM t -- @cache-ttl 5";
        assert_eq!(strip(ident), "SELECT \"a--b\" FROM t");
    }

    #[test]
    fn strip_keeps_block_comments_and_the_code_after_them() {
        let q = "/* -- @cache-ttl 1 */ SELECT a FROM t WHERE a > 1";
        assert_eq!(strip(q), q);
        let multi = "/* note\n-- @cache-ttl 1\n*/ SELECT 1";
        assert_eq!(strip(multi), multi);
    }

    #[test]
    fn strip_handles_escaped_quotes() {
        let q = "SELECT 'it''s -- @cache-ttl 1' FROM t -- @cache-ttl 30";
        assert_eq!(strip(q), "SELECT 'it''s -- @cache-ttl 1' FROM t");
    }

    #[test]
    fn strip_preserves_inner_whitespace() {
        assert_ne!(strip("SELECT 'a  b'"), strip("SELECT 'a b'"));
    }
}
