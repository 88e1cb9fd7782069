//! Core rate limiter implementation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::counter::{window_millis, AdmissionResult, CounterRecord};
use super::key::{storage_key, KeyGenerator, RequestContext};
use super::rules::{Rule, RuleRegistry};
use super::store::CounterStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TurnstileError};

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request without consuming quota.
    #[default]
    Open,
    /// Reject the request and ask the caller to retry after one rule window.
    Closed,
}

/// How the guarded operation ended, for rules that skip some outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Running totals of limiter decisions.
#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    rejected: AtomicU64,
    unknown_rule: AtomicU64,
    storage_failures: AtomicU64,
}

/// A point-in-time copy of the limiter's decision totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub allowed: u64,
    pub rejected: u64,
    pub unknown_rule: u64,
    pub storage_failures: u64,
}

/// Fixed-window rate limiter.
///
/// Each check counts the request first and decides second, so the request
/// that crosses the limit is itself recorded and rejected. Windows reset
/// wholesale at their boundary.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    rules: Arc<RuleRegistry>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_generator: KeyGenerator,
    failure_policy: FailurePolicy,
    counters: Counters,
}

impl RateLimiter {
    /// Create a fail-open limiter over `rules` and `store`.
    pub fn new(rules: Arc<RuleRegistry>, store: Arc<dyn CounterStore>) -> Self {
        Self {
            rules,
            store,
            clock: Arc::new(SystemClock),
            key_generator: KeyGenerator::default(),
            failure_policy: FailurePolicy::default(),
            counters: Counters::default(),
        }
    }

    /// Use `clock` for retry-after calculations. Should be the store's clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Replace the identity derivation used for rules without their own.
    pub fn with_key_generator(mut self, key_generator: KeyGenerator) -> Self {
        self.key_generator = key_generator;
        self
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Count one request by `identity` against `rule_name` and decide on it.
    ///
    /// `override_rule` takes precedence over the registry. Unknown rules never
    /// block.
    pub async fn check_limit(
        &self,
        identity: &str,
        rule_name: &str,
        override_rule: Option<&Rule>,
    ) -> AdmissionResult {
        let registered;
        let rule = match override_rule {
            Some(rule) => rule,
            None => match self.rules.get(rule_name) {
                Some(rule) => {
                    registered = rule;
                    registered.as_ref()
                }
                None => {
                    debug!(rule = %rule_name, "No rate limit rule registered, allowing");
                    self.counters.unknown_rule.fetch_add(1, Ordering::Relaxed);
                    return AdmissionResult::unlimited(None, self.clock.now_millis());
                }
            },
        };

        self.check_rule(identity, rule_name, rule).await
    }

    /// Derive the identity for `request` and check it against `rule_name`.
    pub async fn check_request_limit(
        &self,
        request: &RequestContext,
        rule_name: &str,
    ) -> AdmissionResult {
        match self.rules.get(rule_name) {
            Some(rule) => {
                let identity = self.identity_for(&rule, request);
                self.check_rule(&identity, rule_name, &rule).await
            }
            None => self.check_limit("", rule_name, None).await,
        }
    }

    /// Counts under `rule_name`, whichever rule supplies the limit.
    async fn check_rule(&self, identity: &str, rule_name: &str, rule: &Rule) -> AdmissionResult {
        let key = storage_key(rule_name, identity);

        trace!(key = %key, rule = %rule.name(), "Checking rate limit");

        let record = match self.store.increment(&key, rule.window()).await {
            Ok(record) => record,
            Err(err) => return self.storage_failure(rule, &key, err),
        };

        let result = AdmissionResult::from_record(&record, rule.max_requests(), self.clock.now_millis());
        if result.allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %key,
                count = record.count,
                limit = rule.max_requests(),
                retry_after = ?result.retry_after,
                "Rate limit exceeded"
            );
        }
        result
    }

    fn storage_failure(&self, rule: &Rule, key: &str, err: TurnstileError) -> AdmissionResult {
        self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_millis();
        let reset_time = now.saturating_add(window_millis(rule.window()));

        match self.failure_policy {
            FailurePolicy::Open => {
                warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %err,
                    "Counter store unavailable, allowing request"
                );
                AdmissionResult::unlimited(Some(rule.max_requests()), reset_time)
            }
            FailurePolicy::Closed => {
                warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %err,
                    "Counter store unavailable, rejecting request"
                );
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                AdmissionResult {
                    allowed: false,
                    limit: Some(rule.max_requests()),
                    remaining: Some(0),
                    reset_time,
                    retry_after: Some(rule.window().as_secs().max(1)),
                    window_start: None,
                }
            }
        }
    }

    /// Second phase of a check for rules that skip some outcomes.
    ///
    /// Gives back the request counted by `decision` when `outcome` matches the
    /// rule's skip flags. Only the window the request was counted in is
    /// touched: once that window has ended there is nothing to give back.
    /// Rules without skip flags, unknown rules and decisions that counted
    /// nothing are left untouched. Returns whether quota was given back.
    pub async fn release(
        &self,
        identity: &str,
        rule_name: &str,
        decision: &AdmissionResult,
        outcome: Outcome,
    ) -> bool {
        match self.rules.get(rule_name) {
            Some(rule) => {
                self.release_rule(identity, rule_name, &rule, decision, outcome)
                    .await
            }
            None => false,
        }
    }

    /// [`release`](Self::release) for the identity derived from `request`.
    pub async fn release_request(
        &self,
        request: &RequestContext,
        rule_name: &str,
        decision: &AdmissionResult,
        outcome: Outcome,
    ) -> bool {
        match self.rules.get(rule_name) {
            Some(rule) => {
                let identity = self.identity_for(&rule, request);
                self.release_rule(&identity, rule_name, &rule, decision, outcome)
                    .await
            }
            None => false,
        }
    }

    async fn release_rule(
        &self,
        identity: &str,
        rule_name: &str,
        rule: &Rule,
        decision: &AdmissionResult,
        outcome: Outcome,
    ) -> bool {
        let skip = match outcome {
            Outcome::Success => rule.skips_successful(),
            Outcome::Failure => rule.skips_failed(),
        };
        let Some(window_start) = decision.window_start.filter(|_| skip) else {
            return false;
        };

        let key = storage_key(rule_name, identity);
        match self.store.decrement(&key, window_start).await {
            Ok(released) => {
                trace!(key = %key, outcome = ?outcome, released = released, "Released request");
                released
            }
            Err(err) => {
                self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %err, "Failed to release counted request");
                false
            }
        }
    }

    /// Clear the counter for `identity` under `rule_name` immediately.
    pub async fn reset_limit(&self, identity: &str, rule_name: &str) -> Result<()> {
        let key = storage_key(rule_name, identity);
        self.store.remove(&key).await?;
        debug!(key = %key, "Rate limit reset");
        Ok(())
    }

    /// The live counter for `identity` under `rule_name`, without counting a request.
    pub async fn status(&self, identity: &str, rule_name: &str) -> Result<Option<CounterRecord>> {
        self.store.get(&storage_key(rule_name, identity)).await
    }

    /// Snapshot of decision totals since startup.
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            unknown_rule: self.counters.unknown_rule.load(Ordering::Relaxed),
            storage_failures: self.counters.storage_failures.load(Ordering::Relaxed),
        }
    }

    fn identity_for(&self, rule: &Rule, request: &RequestContext) -> String {
        rule.key_generator()
            .unwrap_or(&self.key_generator)
            .generate(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    const START: u64 = 1_700_000_000_000;

    fn limiter() -> (Arc<ManualClock>, Arc<MemoryStore>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = RateLimiter::new(Arc::new(RuleRegistry::with_defaults()), store.clone())
            .with_clock(clock.clone());
        (clock, store, limiter)
    }

    /// A store whose backend is always down.
    struct UnavailableStore;

    #[async_trait]
    impl CounterStore for UnavailableStore {
        async fn get(&self, _key: &str) -> Result<Option<CounterRecord>> {
            Err(TurnstileError::StorageUnavailable("connection refused".into()))
        }

        async fn increment(&self, _key: &str, _window: Duration) -> Result<CounterRecord> {
            Err(TurnstileError::StorageUnavailable("connection refused".into()))
        }

        async fn decrement(&self, _key: &str, _window_start: u64) -> Result<bool> {
            Err(TurnstileError::StorageUnavailable("connection refused".into()))
        }

        async fn remove(&self, _key: &str) -> Result<()> {
            Err(TurnstileError::StorageUnavailable("connection refused".into()))
        }

        fn name(&self) -> &'static str {
            "unavailable"
        }
    }

    #[tokio::test]
    async fn test_login_scenario() {
        let (clock, _store, limiter) = limiter();

        for expected in [4, 3, 2, 1, 0] {
            let result = limiter.check_limit("ip:1.2.3.4", "auth:login", None).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, Some(expected));
            assert_eq!(result.limit, Some(5));
            assert_eq!(result.retry_after, None);
        }

        clock.advance(Duration::from_secs(100));
        let result = limiter.check_limit("ip:1.2.3.4", "auth:login", None).await;
        assert!(!result.allowed);
        assert_eq!(result.remaining, Some(0));
        assert_eq!(result.retry_after, Some(800));
        assert_eq!(result.reset_time, START + 900_000);
    }

    #[tokio::test]
    async fn test_remaining_floors_at_zero() {
        let (_clock, _store, limiter) = limiter();

        for _ in 0..10 {
            limiter.check_limit("user:1", "upload:image", None).await;
        }
        for _ in 0..3 {
            let result = limiter.check_limit("user:1", "upload:image", None).await;
            assert!(!result.allowed);
            assert_eq!(result.remaining, Some(0));
            assert!(result.retry_after.unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn test_search_window_resets_after_sixty_seconds() {
        let (clock, _store, limiter) = limiter();

        for _ in 0..30 {
            assert!(limiter.check_limit("ip:9.9.9.9", "search:general", None).await.allowed);
        }
        assert!(!limiter.check_limit("ip:9.9.9.9", "search:general", None).await.allowed);

        clock.advance(Duration::from_secs(60));
        let result = limiter.check_limit("ip:9.9.9.9", "search:general", None).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, Some(29));
    }

    #[tokio::test]
    async fn test_unknown_rule_never_rejects() {
        let (_clock, store, limiter) = limiter();

        for _ in 0..1_000 {
            let result = limiter.check_limit("user:1", "no:such-rule", None).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, None);
            assert_eq!(result.limit, None);
        }
        assert!(store.is_empty());
        assert_eq!(limiter.stats().unknown_rule, 1_000);
    }

    #[tokio::test]
    async fn test_override_rule_takes_precedence() {
        let (_clock, _store, limiter) = limiter();
        let strict = Rule::new("api:general", Duration::from_secs(60), 1);

        assert!(limiter.check_limit("user:1", "api:general", Some(&strict)).await.allowed);
        assert!(!limiter.check_limit("user:1", "api:general", Some(&strict)).await.allowed);
    }

    #[tokio::test]
    async fn test_override_rule_counts_under_requested_name() {
        let (_clock, _store, limiter) = limiter();
        let strict = Rule::new("strict", Duration::from_secs(60), 1);

        for _ in 0..3 {
            limiter.check_limit("user:1", "api:general", Some(&strict)).await;
        }
        assert_eq!(limiter.status("user:1", "strict").await.unwrap(), None);
        let record = limiter.status("user:1", "api:general").await.unwrap().unwrap();
        assert_eq!(record.count, 3);

        limiter.reset_limit("user:1", "api:general").await.unwrap();
        let result = limiter.check_limit("user:1", "api:general", Some(&strict)).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, Some(0));
    }

    #[tokio::test]
    async fn test_identities_and_rules_are_independent() {
        let (_clock, _store, limiter) = limiter();

        for _ in 0..5 {
            limiter.check_limit("user:1", "auth:login", None).await;
        }
        assert!(!limiter.check_limit("user:1", "auth:login", None).await.allowed);
        assert!(limiter.check_limit("user:2", "auth:login", None).await.allowed);
        assert!(limiter.check_limit("user:1", "api:general", None).await.allowed);
    }

    #[tokio::test]
    async fn test_reset_limit_starts_new_window() {
        let (clock, _store, limiter) = limiter();

        for _ in 0..6 {
            limiter.check_limit("user:1", "auth:login", None).await;
        }
        clock.advance(Duration::from_secs(10));
        tokio_test::assert_ok!(limiter.reset_limit("user:1", "auth:login").await);

        let result = limiter.check_limit("user:1", "auth:login", None).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, Some(4));
        assert_eq!(result.reset_time, START + 10_000 + 900_000);
    }

    #[tokio::test]
    async fn test_check_request_limit_uses_rule_key_fn() {
        let (_clock, _store, limiter) = limiter();
        limiter
            .rules()
            .register(
                Rule::new("auth:login-email", Duration::from_secs(60), 1).with_key_fn(|req| {
                    format!("email:{}", req.attribute("email").unwrap_or_default())
                }),
            )
            .unwrap();

        let from_a = RequestContext::new("/login")
            .with_remote_addr("10.0.0.1".parse().unwrap())
            .with_attribute("email", "x@example.com");
        let from_b = RequestContext::new("/login")
            .with_remote_addr("10.0.0.2".parse().unwrap())
            .with_attribute("email", "x@example.com");

        assert!(limiter.check_request_limit(&from_a, "auth:login-email").await.allowed);
        assert!(!limiter.check_request_limit(&from_b, "auth:login-email").await.allowed);

        let record = limiter.status("email:x@example.com", "auth:login-email").await.unwrap();
        assert_eq!(record.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_check_request_limit_default_identity() {
        let (_clock, _store, limiter) = limiter();
        let request = RequestContext::new("/api/tarot").with_user("7");

        limiter.check_request_limit(&request, "api:tarot").await;
        let record = limiter.status("user:7", "api:tarot").await.unwrap().unwrap();
        assert_eq!(record.count, 1);
    }

    #[tokio::test]
    async fn test_release_gives_back_matching_outcomes() {
        let (_clock, _store, limiter) = limiter();
        limiter
            .rules()
            .register(
                Rule::new("auth:attempts", Duration::from_secs(60), 2).skip_successful_requests(true),
            )
            .unwrap();

        for _ in 0..5 {
            let decision = limiter.check_limit("user:1", "auth:attempts", None).await;
            assert!(decision.allowed);
            assert!(limiter.release("user:1", "auth:attempts", &decision, Outcome::Success).await);
        }

        let decision = limiter.check_limit("user:1", "auth:attempts", None).await;
        assert!(!limiter.release("user:1", "auth:attempts", &decision, Outcome::Failure).await);
        limiter.check_limit("user:1", "auth:attempts", None).await;
        assert!(!limiter.check_limit("user:1", "auth:attempts", None).await.allowed);
    }

    #[tokio::test]
    async fn test_release_after_window_end_keeps_next_window_capped() {
        let (clock, _store, limiter) = limiter();
        limiter
            .rules()
            .register(Rule::new("r", Duration::from_secs(60), 2).skip_successful_requests(true))
            .unwrap();

        let slow = limiter.check_limit("user:1", "r", None).await;
        assert!(slow.allowed);

        clock.advance(Duration::from_secs(61));
        assert!(limiter.check_limit("user:1", "r", None).await.allowed);
        assert!(limiter.check_limit("user:1", "r", None).await.allowed);

        // The slow request finishes in the next window; its window is gone.
        assert!(!limiter.release("user:1", "r", &slow, Outcome::Success).await);
        assert!(!limiter.check_limit("user:1", "r", None).await.allowed);

        let record = limiter.status("user:1", "r").await.unwrap().unwrap();
        assert_eq!(record.count, 3);
    }

    #[tokio::test]
    async fn test_release_of_last_request_clears_record() {
        let (_clock, _store, limiter) = limiter();
        limiter
            .rules()
            .register(Rule::new("r", Duration::from_secs(60), 2).skip_failed_requests(true))
            .unwrap();

        let decision = limiter.check_limit("user:1", "r", None).await;
        assert!(limiter.release("user:1", "r", &decision, Outcome::Failure).await);

        assert_eq!(limiter.status("user:1", "r").await.unwrap(), None);
        assert!(!limiter.release("user:1", "r", &decision, Outcome::Failure).await);
    }

    #[tokio::test]
    async fn test_release_after_fail_open_is_inert() {
        let registry = Arc::new(RuleRegistry::new());
        registry
            .register(Rule::new("r", Duration::from_secs(60), 2).skip_successful_requests(true))
            .unwrap();
        let limiter = RateLimiter::new(registry, Arc::new(UnavailableStore));

        let decision = limiter.check_limit("user:1", "r", None).await;
        assert!(decision.allowed);
        assert_eq!(decision.window_start, None);
        assert!(!limiter.release("user:1", "r", &decision, Outcome::Success).await);
        assert_eq!(limiter.stats().storage_failures, 1);
    }

    #[tokio::test]
    async fn test_release_without_skip_flags_is_inert() {
        let (_clock, _store, limiter) = limiter();

        let decision = limiter.check_limit("user:1", "auth:login", None).await;
        assert!(!limiter.release("user:1", "auth:login", &decision, Outcome::Success).await);
        assert!(!limiter.release("user:1", "auth:login", &decision, Outcome::Failure).await);
        assert!(!limiter.release("user:1", "no:such-rule", &decision, Outcome::Failure).await);

        let record = limiter.status("user:1", "auth:login").await.unwrap().unwrap();
        assert_eq!(record.count, 1);
    }

    #[tokio::test]
    async fn test_storage_failure_fails_open() {
        let limiter = RateLimiter::new(
            Arc::new(RuleRegistry::with_defaults()),
            Arc::new(UnavailableStore),
        );

        let result = limiter.check_limit("user:1", "api:payment", None).await;
        assert!(result.allowed);
        assert_eq!(result.limit, Some(20));
        assert_eq!(result.remaining, None);
        assert_eq!(result.retry_after, None);

        let stats = limiter.stats();
        assert_eq!(stats.storage_failures, 1);
        assert_eq!(stats.rejected, 0);
    }

    #[tokio::test]
    async fn test_storage_failure_fails_closed_when_configured() {
        let limiter = RateLimiter::new(
            Arc::new(RuleRegistry::with_defaults()),
            Arc::new(UnavailableStore),
        )
        .with_failure_policy(FailurePolicy::Closed);

        let result = limiter.check_limit("user:1", "api:payment", None).await;
        assert!(!result.allowed);
        assert_eq!(result.remaining, Some(0));
        assert_eq!(result.retry_after, Some(3600));
        assert_eq!(limiter.stats().storage_failures, 1);
    }

    #[tokio::test]
    async fn test_reset_surfaces_storage_errors() {
        let limiter = RateLimiter::new(
            Arc::new(RuleRegistry::with_defaults()),
            Arc::new(UnavailableStore),
        );
        let err = limiter.reset_limit("user:1", "auth:login").await.unwrap_err();
        assert!(err.is_storage());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_admit_at_most_limit() {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(RuleRegistry::with_defaults()),
            Arc::new(MemoryStore::new()),
        ));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.check_limit("ip:6.6.6.6", "api:payment", None).await.allowed
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 20);
        let stats = limiter.stats();
        assert_eq!(stats.allowed, 20);
        assert_eq!(stats.rejected, 80);
    }
}
