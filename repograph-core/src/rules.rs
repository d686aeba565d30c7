//! Exclusion rules for entity merge candidates.
//!
//! Names are normalized (trimmed, case-folded) before any rule is checked.
//! Test detection works on words instead: `test_login`, `LoginTest` and
//! `login_spec` are test names, `Testament` and `InstanceSpec` are not.
//! Custom patterns use `*` (any run of characters) and `?` (one character)
//! and must match the whole normalized name.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Terms too generic to identify a single concept across sources.
pub const DEFAULT_GENERIC_TERMS: &[&str] = &[
    "main", "init", "index", "config", "configuration", "utils", "util", "helper", "helpers",
    "common", "base", "core", "data", "item", "items", "value", "values", "result", "error",
    "errors", "type", "types", "test", "tests", "app", "lib", "mod", "module", "new", "get",
    "set", "run", "start", "stop", "default", "options", "settings", "readme", "overview",
    "introduction", "usage", "installation", "example", "examples", "todo", "license",
];

/// Fragments that mark test scaffolding.
pub const DEFAULT_TEST_TERMS: &[&str] = &["mock", "fixture", "stub", "fake", "dummy"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("invalid exclusion pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("invalid name length bounds: min {min} > max {max}")]
    InvalidBounds { min: usize, max: usize },
}

/// Why a candidate name was excluded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    Empty,
    PrivatePrefix,
    GenericTerm,
    TestRelated,
    TooShort,
    TooLong,
    Pattern(String),
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionReason::Empty => "empty",
            ExclusionReason::PrivatePrefix => "private_prefix",
            ExclusionReason::GenericTerm => "generic_term",
            ExclusionReason::TestRelated => "test_related",
            ExclusionReason::TooShort => "too_short",
            ExclusionReason::TooLong => "too_long",
            ExclusionReason::Pattern(_) => "pattern",
        }
    }
}

/// Normalize an entity name for comparison.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Compiled exclusion rules.
#[derive(Clone, Debug)]
pub struct ExclusionRules {
    private_prefixes: Vec<String>,
    generic_terms: HashSet<String>,
    test_terms: Vec<String>,
    min_len: usize,
    max_len: usize,
    patterns: Vec<(String, Regex)>,
}

impl Default for ExclusionRules {
    fn default() -> Self {
        Self {
            private_prefixes: vec!["_".to_string()],
            generic_terms: DEFAULT_GENERIC_TERMS.iter().map(|t| t.to_string()).collect(),
            test_terms: DEFAULT_TEST_TERMS.iter().map(|t| t.to_string()).collect(),
            min_len: 3,
            max_len: 64,
            patterns: Vec::new(),
        }
    }
}

impl ExclusionRules {
    /// Set the inclusive length range for normalized names.
    pub fn with_length_bounds(mut self, min_len: usize, max_len: usize) -> Result<Self, RuleError> {
        if min_len > max_len {
            return Err(RuleError::InvalidBounds {
                min: min_len,
                max: max_len,
            });
        }
        self.min_len = min_len;
        self.max_len = max_len;
        Ok(self)
    }

    /// Add generic terms on top of the defaults.
    pub fn with_generic_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.generic_terms
            .extend(terms.into_iter().map(|t| normalize_name(t.as_ref())));
        self
    }

    /// Add wildcard exclusion patterns.
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let regex = compile_wildcard(pattern)?;
            self.patterns.push((pattern.to_string(), regex));
        }
        Ok(self)
    }

    /// Check a raw entity name. Returns `None` if it is a valid candidate.
    pub fn exclusion_reason(&self, name: &str) -> Option<ExclusionReason> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Some(ExclusionReason::Empty);
        }
        // Prefix check runs on the raw name; case folding does not change `_`
        if self.private_prefixes.iter().any(|p| trimmed.starts_with(p.as_str())) {
            return Some(ExclusionReason::PrivatePrefix);
        }

        let normalized = normalize_name(trimmed);
        if self.generic_terms.contains(&normalized) {
            return Some(ExclusionReason::GenericTerm);
        }
        if is_test_related(trimmed, &self.test_terms) {
            return Some(ExclusionReason::TestRelated);
        }

        let len = normalized.chars().count();
        if len < self.min_len {
            return Some(ExclusionReason::TooShort);
        }
        if len > self.max_len {
            return Some(ExclusionReason::TooLong);
        }

        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(&normalized))
            .map(|(p, _)| ExclusionReason::Pattern(p.clone()))
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclusion_reason(name).is_some()
    }
}

/// Split an identifier into lowercase words at separators and case changes.
/// An acronym run ends before its last capital: `HTTPServer` is `http server`.
fn split_words(name: &str) -> Vec<String> {
    let chars: Vec<char> = name.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_numeric() || (prev.is_uppercase() && next_lower) {
                words.push(std::mem::take(&mut current));
            }
        }
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn is_test_word(word: &str) -> bool {
    word == "test" || word == "tests"
}

fn is_test_related(name: &str, test_terms: &[String]) -> bool {
    let words = split_words(name);
    let (Some(first), Some(last)) = (words.first(), words.last()) else {
        return false;
    };
    if is_test_word(first) || is_test_word(last) {
        return true;
    }
    // `spec` only as a separated suffix; `InstanceSpec` is a domain type
    let lowered = name.to_lowercase();
    if words.len() > 1 && ["_spec", "-spec", ".spec"].iter().any(|s| lowered.ends_with(s)) {
        return true;
    }
    words.iter().any(|w| {
        test_terms
            .iter()
            .any(|t| w == t || w.strip_suffix('s') == Some(t.as_str()))
    })
}

fn compile_wildcard(pattern: &str) -> Result<Regex, RuleError> {
    let escaped = regex::escape(&normalize_name(pattern))
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{}$", escaped)).map_err(|e| RuleError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  UserService "), "userservice");
        assert_eq!(normalize_name("userservice"), "userservice");
    }

    #[test]
    fn test_default_rules() {
        let rules = ExclusionRules::default();
        assert_eq!(rules.exclusion_reason("_private"), Some(ExclusionReason::PrivatePrefix));
        assert_eq!(rules.exclusion_reason(" Config "), Some(ExclusionReason::GenericTerm));
        assert_eq!(rules.exclusion_reason("test_login"), Some(ExclusionReason::TestRelated));
        assert_eq!(rules.exclusion_reason("UserServiceTests"), Some(ExclusionReason::TestRelated));
        assert_eq!(rules.exclusion_reason("MockClient"), Some(ExclusionReason::TestRelated));
        assert_eq!(rules.exclusion_reason("db"), Some(ExclusionReason::TooShort));
        assert_eq!(rules.exclusion_reason("   "), Some(ExclusionReason::Empty));
        assert_eq!(rules.exclusion_reason("UserService"), None);
    }

    #[test]
    fn test_split_words() {
        assert_eq!(split_words("test_login"), vec!["test", "login"]);
        assert_eq!(split_words("UserServiceTest"), vec!["user", "service", "test"]);
        assert_eq!(split_words("HTTPServer2Tests"), vec!["http", "server2", "tests"]);
        assert_eq!(split_words("login-spec.ts"), vec!["login", "spec", "ts"]);
        assert_eq!(split_words("Testament"), vec!["testament"]);
    }

    #[test]
    fn test_test_detection_uses_word_boundaries() {
        let rules = ExclusionRules::default();
        for name in ["test_foo", "TestHarness", "UserServiceTest", "user_spec", "MockInstaller", "api_fixtures"] {
            assert_eq!(
                rules.exclusion_reason(name),
                Some(ExclusionReason::TestRelated),
                "{} should be test related",
                name
            );
        }
        for name in ["Testament", "InstanceSpec", "Contest", "Stubborn", "LatestRelease"] {
            assert_eq!(rules.exclusion_reason(name), None, "{} should be kept", name);
        }
    }

    #[test]
    fn test_length_bounds() {
        let rules = ExclusionRules::default().with_length_bounds(2, 5).unwrap();
        assert_eq!(rules.exclusion_reason("db"), None);
        assert_eq!(rules.exclusion_reason("Parser"), Some(ExclusionReason::TooLong));

        let err = ExclusionRules::default().with_length_bounds(9, 2).unwrap_err();
        assert_eq!(err, RuleError::InvalidBounds { min: 9, max: 2 });
    }

    #[test]
    fn test_wildcard_patterns() {
        let rules = ExclusionRules::default()
            .with_patterns(["*Handler", "tmp?"])
            .unwrap();
        assert_eq!(
            rules.exclusion_reason("RequestHandler"),
            Some(ExclusionReason::Pattern("*Handler".to_string()))
        );
        assert!(rules.is_excluded("tmp1"));
        assert!(!rules.is_excluded("tmp12"));
        assert!(!rules.is_excluded("HandlerRegistry"));
    }

    #[test]
    fn test_pattern_special_characters_are_literal() {
        let rules = ExclusionRules::default().with_patterns(["a.b*"]).unwrap();
        assert!(rules.is_excluded("a.bcd"));
        assert!(!rules.is_excluded("axbcd"));
    }

    #[test]
    fn test_extra_generic_terms() {
        let rules = ExclusionRules::default().with_generic_terms(["Service"]);
        assert!(rules.is_excluded("service"));
        assert!(!rules.is_excluded("UserService"));
    }
}
