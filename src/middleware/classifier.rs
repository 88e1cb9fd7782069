//! Request path to rule name classification.

use serde::{Deserialize, Serialize};

/// Rule applied to requests that match no pattern.
pub const DEFAULT_RULE: &str = "api:general";

/// A path prefix and the rule that guards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePattern {
    pub prefix: String,
    pub rule: String,
}

impl RoutePattern {
    pub fn new(prefix: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            rule: rule.into(),
        }
    }

    /// Whether `path` is this prefix or lies beneath it.
    ///
    /// Matching respects segment boundaries: `/api/search` covers
    /// `/api/search/cards` but not `/api/searchable`.
    fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || self.prefix.ends_with('/') || rest.starts_with('/'),
            None => false,
        }
    }
}

/// The route table the service ships with.
pub fn default_patterns() -> Vec<RoutePattern> {
    vec![
        RoutePattern::new("/api/auth/login", "auth:login"),
        RoutePattern::new("/api/auth/register", "auth:register"),
        RoutePattern::new("/api/auth/password-reset", "auth:password-reset"),
        RoutePattern::new("/api/auth/2fa", "auth:2fa"),
        RoutePattern::new("/api/tarot", "api:tarot"),
        RoutePattern::new("/api/payment", "api:payment"),
        RoutePattern::new("/api/upload", "upload:image"),
        RoutePattern::new("/api/search", "search:general"),
        RoutePattern::new("/api", "api:general"),
    ]
}

/// Picks the rule for a request path. The longest matching prefix wins.
#[derive(Debug, Clone)]
pub struct RouteClassifier {
    patterns: Vec<RoutePattern>,
    default_rule: String,
}

impl RouteClassifier {
    pub fn new(mut patterns: Vec<RoutePattern>, default_rule: impl Into<String>) -> Self {
        // Stable, so equal prefixes keep their configured order.
        patterns.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            patterns,
            default_rule: default_rule.into(),
        }
    }

    pub fn classify(&self, path: &str) -> &str {
        self.patterns
            .iter()
            .find(|pattern| pattern.matches(path))
            .map(|pattern| pattern.rule.as_str())
            .unwrap_or(&self.default_rule)
    }

    pub fn default_rule(&self) -> &str {
        &self.default_rule
    }

    pub fn patterns(&self) -> &[RoutePattern] {
        &self.patterns
    }
}

impl Default for RouteClassifier {
    fn default() -> Self {
        Self::new(default_patterns(), DEFAULT_RULE)
    }
}
