//! URI pattern compilation and specificity ordering
//!
//! Patterns support `*` wildcards (match across segments) and `{name}`
//! variables (match a single segment, captured by name). When several
//! patterns match one request URI the most specific wins: exact match
//! first, then more path segments, fewer wildcards, fewer variables, and
//! finally the longer pattern string.

use regex::Regex;
use std::collections::HashMap;

use crate::error::{AcsError, AcsResult};

/// Ordering key for pattern specificity; larger compares as more specific
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    /// Exact patterns (no wildcards, no variables) beat everything
    exact: bool,
    /// More path segments first
    segments: usize,
    /// Fewer wildcards first (stored negated)
    wildcard_rank: i64,
    /// Fewer variables first (stored negated)
    variable_rank: i64,
    /// Longer pattern string breaks remaining ties
    length: usize,
}

/// A compiled URI pattern
#[derive(Debug, Clone)]
pub struct UriPattern {
    pattern: String,
    regex: Regex,
    wildcards: usize,
    variables: usize,
}

impl UriPattern {
    /// Compile a pattern into an anchored regex
    pub fn compile(pattern: &str) -> AcsResult<Self> {
        let mut regex_src = String::with_capacity(pattern.len() + 8);
        regex_src.push('^');

        let mut wildcards = 0;
        let mut variables = 0;
        let mut rest = pattern;
        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix('*') {
                regex_src.push_str(".*");
                wildcards += 1;
                rest = tail;
            } else if rest.starts_with('{') {
                let close = rest.find('}').ok_or_else(|| {
                    AcsError::InvalidArgument(format!("unterminated variable in pattern {pattern:?}"))
                })?;
                let name = &rest[1..close];
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(AcsError::InvalidArgument(format!(
                        "invalid variable name {name:?} in pattern {pattern:?}"
                    )));
                }
                regex_src.push_str(&format!("(?P<{name}>[^/]+)"));
                variables += 1;
                rest = &rest[close + 1..];
            } else {
                let next = rest
                    .find(|c| c == '*' || c == '{')
                    .unwrap_or(rest.len());
                regex_src.push_str(&regex::escape(&rest[..next]));
                rest = &rest[next..];
            }
        }
        regex_src.push('$');

        let regex = Regex::new(&regex_src)
            .map_err(|e| AcsError::InvalidArgument(format!("bad pattern {pattern:?}: {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            wildcards,
            variables,
        })
    }

    /// The source pattern string
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the pattern matches a concrete URI
    pub fn matches(&self, uri: &str) -> bool {
        self.regex.is_match(uri)
    }

    /// Match and extract `{name}` variable bindings
    pub fn extract(&self, uri: &str) -> Option<HashMap<String, String>> {
        let captures = self.regex.captures(uri)?;
        let mut bindings = HashMap::new();
        for name in self.regex.capture_names().flatten() {
            if let Some(value) = captures.name(name) {
                bindings.insert(name.to_string(), value.as_str().to_string());
            }
        }
        Some(bindings)
    }

    /// Whether the pattern contains no wildcards or variables
    pub fn is_exact(&self) -> bool {
        self.wildcards == 0 && self.variables == 0
    }

    /// Specificity key for ordering competing matches
    pub fn specificity(&self) -> Specificity {
        Specificity {
            exact: self.is_exact(),
            segments: self
                .pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .count(),
            wildcard_rank: -(self.wildcards as i64),
            variable_rank: -(self.variables as i64),
            length: self.pattern.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_extraction() {
        let pattern = UriPattern::compile("/users/{id}").unwrap();
        assert!(pattern.matches("/users/42"));
        assert!(!pattern.matches("/users/42/roles"));

        let bindings = pattern.extract("/users/42").unwrap();
        assert_eq!(bindings.get("id"), Some(&"42".to_string()));
    }

    #[test]
    fn test_wildcard_crosses_segments() {
        let pattern = UriPattern::compile("/users/*").unwrap();
        assert!(pattern.matches("/users/42"));
        assert!(pattern.matches("/users/42/roles"));
        assert!(!pattern.matches("/orders/42"));
    }

    #[test]
    fn test_literal_dots_are_escaped() {
        let pattern = UriPattern::compile("/files/report.pdf").unwrap();
        assert!(pattern.matches("/files/report.pdf"));
        assert!(!pattern.matches("/files/reportXpdf"));
    }

    #[test]
    fn test_specificity_ordering() {
        let exact = UriPattern::compile("/a/b").unwrap();
        let deep_var = UriPattern::compile("/a/b/{x}").unwrap();
        let wild = UriPattern::compile("/a/*").unwrap();

        assert!(exact.specificity() > deep_var.specificity());
        assert!(deep_var.specificity() > wild.specificity());
    }

    #[test]
    fn test_bad_patterns_rejected() {
        assert!(UriPattern::compile("/a/{unclosed").is_err());
        assert!(UriPattern::compile("/a/{bad name}").is_err());
    }
}
