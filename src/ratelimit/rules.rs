//! Rate limit rules and the registry that owns them.
//!
//! A registry is built once at startup, usually from [`RuleRegistry::with_defaults`]
//! plus an optional YAML rule file, and shared by `Arc` with the limiter and the
//! HTTP layer. Rules can still be added at runtime for features that are not
//! known at compile time.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::key::{KeyGenerator, RequestContext, KEY_SEPARATOR};
use crate::error::{Result, TurnstileError};

const MINUTE: u64 = 60;

/// The rules every deployment ships with: (name, window seconds, max requests).
pub const DEFAULT_RULES: &[(&str, u64, u64)] = &[
    ("auth:login", 15 * MINUTE, 5),
    ("auth:register", 60 * MINUTE, 3),
    ("auth:password-reset", 60 * MINUTE, 3),
    ("auth:2fa", 5 * MINUTE, 10),
    ("api:general", 15 * MINUTE, 100),
    ("api:tarot", 60 * MINUTE, 50),
    ("api:payment", 60 * MINUTE, 20),
    ("upload:image", 60 * MINUTE, 10),
    ("search:general", MINUTE, 30),
];

/// A named fixed-window limit.
#[derive(Clone)]
pub struct Rule {
    name: String,
    window: Duration,
    max_requests: u64,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
    key_generator: Option<KeyGenerator>,
}

impl Rule {
    pub fn new(name: impl Into<String>, window: Duration, max_requests: u64) -> Self {
        Self {
            name: name.into(),
            window,
            max_requests,
            skip_successful_requests: false,
            skip_failed_requests: false,
            key_generator: None,
        }
    }

    /// Give back quota for requests whose guarded operation succeeded.
    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    /// Give back quota for requests whose guarded operation failed.
    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    /// Count requests against a custom identity instead of the default one.
    pub fn with_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(KeyGenerator::custom(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn skips_successful(&self) -> bool {
        self.skip_successful_requests
    }

    pub fn skips_failed(&self) -> bool {
        self.skip_failed_requests
    }

    pub fn key_generator(&self) -> Option<&KeyGenerator> {
        self.key_generator.as_ref()
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TurnstileError::Config("rule name must not be empty".into()));
        }
        if self.name.contains(KEY_SEPARATOR) {
            return Err(TurnstileError::Config(format!(
                "rule name '{}' must not contain '{}'",
                self.name, KEY_SEPARATOR
            )));
        }
        if self.window.is_zero() {
            return Err(TurnstileError::Config(format!(
                "rule '{}' has a zero-length window",
                self.name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .field("key_generator", &self.key_generator)
            .finish()
    }
}

/// A rule as written in a YAML rule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub window_secs: u64,
    pub max_requests: u64,
    #[serde(default)]
    pub skip_successful_requests: bool,
    #[serde(default)]
    pub skip_failed_requests: bool,
}

impl From<RuleConfig> for Rule {
    fn from(config: RuleConfig) -> Self {
        Rule::new(config.name, Duration::from_secs(config.window_secs), config.max_requests)
            .skip_successful_requests(config.skip_successful_requests)
            .skip_failed_requests(config.skip_failed_requests)
    }
}

/// Top-level shape of a rule file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Maps rule names to rules.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<Rule>>>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding [`DEFAULT_RULES`].
    pub fn with_defaults() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .map(|&(name, window_secs, max)| {
                (
                    name.to_string(),
                    Arc::new(Rule::new(name, Duration::from_secs(window_secs), max)),
                )
            })
            .collect();

        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Register a rule, replacing any rule with the same name.
    pub fn register(&self, rule: Rule) -> Result<()> {
        rule.validate()?;

        let name = rule.name.clone();
        let previous = self.rules.write().insert(name.clone(), Arc::new(rule));
        info!(
            rule = %name,
            replaced = previous.is_some(),
            "Registered rate limit rule"
        );
        Ok(())
    }

    /// Look up a rule by name.
    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.read().contains_key(name)
    }

    /// All rules, sorted by name.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        let mut rules: Vec<_> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Register every rule in a YAML rule document. Returns how many were added.
    ///
    /// The document is applied as a whole: if any rule is invalid, none are
    /// registered.
    pub fn load_yaml(&self, yaml: &str) -> Result<usize> {
        let file: RuleFile = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse rule file: {}", e)))?;

        let rules: Vec<Rule> = file.rules.into_iter().map(Rule::from).collect();
        for rule in &rules {
            rule.validate()?;
        }

        let count = rules.len();
        let mut registered = self.rules.write();
        for rule in rules {
            let previous = registered.insert(rule.name.clone(), Arc::new(rule));
            if let Some(previous) = previous {
                info!(rule = %previous.name, "Replaced rate limit rule");
            }
        }
        info!(count = count, "Loaded rate limit rules");
        Ok(count)
    }

    /// Register every rule in a YAML rule file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        self.load_yaml(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rule_table() {
        let registry = RuleRegistry::with_defaults();
        assert_eq!(registry.len(), 9);

        let expected = [
            ("auth:login", 15 * 60, 5),
            ("auth:register", 60 * 60, 3),
            ("auth:password-reset", 60 * 60, 3),
            ("auth:2fa", 5 * 60, 10),
            ("api:general", 15 * 60, 100),
            ("api:tarot", 60 * 60, 50),
            ("api:payment", 60 * 60, 20),
            ("upload:image", 60 * 60, 10),
            ("search:general", 60, 30),
        ];
        for (name, window_secs, max) in expected {
            let rule = registry.get(name).unwrap();
            assert_eq!(rule.window(), Duration::from_secs(window_secs), "{}", name);
            assert_eq!(rule.max_requests(), max, "{}", name);
            assert!(!rule.skips_successful());
            assert!(!rule.skips_failed());
        }
    }

    #[test]
    fn test_register_at_runtime() {
        let registry = RuleRegistry::new();
        assert!(registry.is_empty());

        registry
            .register(Rule::new("api:export", Duration::from_secs(3600), 5))
            .unwrap();
        assert!(registry.contains("api:export"));
        assert_eq!(registry.get("api:export").unwrap().max_requests(), 5);
    }

    #[test]
    fn test_register_replaces_existing() {
        let registry = RuleRegistry::with_defaults();
        registry
            .register(Rule::new("auth:login", Duration::from_secs(60), 1))
            .unwrap();

        let rule = registry.get("auth:login").unwrap();
        assert_eq!(rule.max_requests(), 1);
        assert_eq!(registry.len(), 9);
    }

    #[test]
    fn test_register_rejects_zero_window() {
        let registry = RuleRegistry::new();
        let result = registry.register(Rule::new("broken", Duration::ZERO, 5));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_rejects_key_separator_in_name() {
        let registry = RuleRegistry::new();
        let result = registry.register(Rule::new("api|general", Duration::from_secs(60), 5));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_yaml_is_all_or_nothing() {
        let yaml = r#"
rules:
  - name: api:export
    window_secs: 3600
    max_requests: 5
  - name: api:webhook
    window_secs: 60
    max_requests: 600
  - name: api:broken
    window_secs: 0
    max_requests: 1
"#;
        let registry = RuleRegistry::with_defaults();
        assert!(registry.load_yaml(yaml).is_err());

        assert!(!registry.contains("api:export"));
        assert!(!registry.contains("api:webhook"));
        assert_eq!(registry.len(), 9);
    }

    #[test]
    fn test_load_yaml() {
        let yaml = r#"
rules:
  - name: api:export
    window_secs: 3600
    max_requests: 5
    skip_failed_requests: true
  - name: api:webhook
    window_secs: 60
    max_requests: 600
"#;
        let registry = RuleRegistry::new();
        assert_eq!(registry.load_yaml(yaml).unwrap(), 2);

        let export = registry.get("api:export").unwrap();
        assert_eq!(export.window(), Duration::from_secs(3600));
        assert!(export.skips_failed());
        assert!(!export.skips_successful());

        assert_eq!(registry.get("api:webhook").unwrap().max_requests(), 600);
    }

    #[test]
    fn test_load_yaml_invalid() {
        let registry = RuleRegistry::new();
        assert!(registry.load_yaml("rules: [{ name: x }]").is_err());
    }

    #[test]
    fn test_rules_sorted_by_name() {
        let registry = RuleRegistry::with_defaults();
        let names: Vec<_> = registry.rules().iter().map(|r| r.name().to_string()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
