//! Configuration management for Turnstile.
//!
//! Settings come from an optional YAML file, overridden by environment
//! variables prefixed with `TURNSTILE__` (e.g. `TURNSTILE__STORE__BACKEND=redis`).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock::Clock;
use crate::error::{Result, TurnstileError};
use crate::middleware::{
    default_patterns, RateLimitLayer, RouteClassifier, RoutePattern, DEFAULT_RULE,
};
use crate::ratelimit::store::{
    CounterStore, MemoryStore, RedisStore, DEFAULT_KEY_PREFIX, DEFAULT_OPERATION_TIMEOUT,
    DEFAULT_SWEEP_INTERVAL,
};
use crate::ratelimit::{FailurePolicy, RateLimiter, RuleRegistry};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Counter storage configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Request classification configuration
    #[serde(default)]
    pub routes: RoutesConfig,
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Counter storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for counter keys in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on a single Redis round-trip in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// How often the in-memory store drops expired counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_operation_timeout() -> u64 {
    DEFAULT_OPERATION_TIMEOUT.as_millis() as u64
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Behaviour when the counter store is unreachable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Start from the built-in rule table
    #[serde(default = "default_true")]
    pub include_default_rules: bool,

    /// Optional YAML file with additional rules
    #[serde(default)]
    pub rules_path: Option<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            include_default_rules: true,
            rules_path: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Request classification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutesConfig {
    /// Rule for requests matching no pattern
    #[serde(default = "default_rule")]
    pub default_rule: String,

    /// Use `X-Forwarded-For` for the caller address
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Path prefixes and their rules; longest prefix wins
    #[serde(default = "default_patterns")]
    pub patterns: Vec<RoutePattern>,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            default_rule: default_rule(),
            trust_forwarded_for: false,
            patterns: default_patterns(),
        }
    }
}

fn default_rule() -> String {
    DEFAULT_RULE.to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TURNSTILE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(TurnstileError::Config(
                "store.redis_url is required for the redis backend".into(),
            ));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "store.sweep_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Build the rule registry described by this configuration.
    pub fn build_rules(&self) -> Result<RuleRegistry> {
        let rules = if self.limiter.include_default_rules {
            RuleRegistry::with_defaults()
        } else {
            RuleRegistry::new()
        };
        if let Some(path) = &self.limiter.rules_path {
            rules.load_file(path)?;
        }
        Ok(rules)
    }

    /// Connect the configured counter store.
    ///
    /// The in-memory store gets its sweeper started, so this must run inside a
    /// Tokio runtime.
    pub async fn build_store(&self, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
        match self.store.backend {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::with_clock(clock));
                store.spawn_sweeper(Duration::from_secs(self.store.sweep_interval_secs));
                Ok(store as Arc<dyn CounterStore>)
            }
            StoreBackend::Redis => {
                let url = self.store.redis_url.as_deref().ok_or_else(|| {
                    TurnstileError::Config("store.redis_url is required for the redis backend".into())
                })?;
                let store = RedisStore::connect(url)
                    .await?
                    .with_key_prefix(self.store.key_prefix.clone())
                    .with_timeout(Duration::from_millis(self.store.operation_timeout_ms))
                    .with_clock(clock);
                Ok(Arc::new(store) as Arc<dyn CounterStore>)
            }
        }
    }

    /// Build a limiter with this configuration's rules, store and policy.
    pub async fn build_limiter(&self, clock: Arc<dyn Clock>) -> Result<RateLimiter> {
        let rules = Arc::new(self.build_rules()?);
        let store = self.build_store(clock.clone()).await?;

        info!(
            store = store.name(),
            rules = rules.len(),
            failure_policy = ?self.limiter.failure_policy,
            "Rate limiter initialized"
        );

        Ok(RateLimiter::new(rules, store)
            .with_clock(clock)
            .with_failure_policy(self.limiter.failure_policy))
    }

    pub fn classifier(&self) -> RouteClassifier {
        RouteClassifier::new(self.routes.patterns.clone(), self.routes.default_rule.clone())
    }

    /// The HTTP middleware for `limiter` under this configuration's routes.
    pub fn layer(&self, limiter: Arc<RateLimiter>) -> RateLimitLayer {
        RateLimitLayer::new(limiter, self.classifier())
            .trust_forwarded_for(self.routes.trust_forwarded_for)
    }
}
