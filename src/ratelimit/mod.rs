//! Rate limiting logic and state management.

mod counter;
mod key;
mod limiter;
mod rules;
pub mod store;

pub use counter::{AdmissionResult, CounterRecord};
pub use key::{storage_key, KeyFn, KeyGenerator, RequestContext, KEY_SEPARATOR};
pub use limiter::{FailurePolicy, LimiterStats, Outcome, RateLimiter};
pub use rules::{Rule, RuleConfig, RuleFile, RuleRegistry, DEFAULT_RULES};
pub use store::{CounterStore, MemoryStore, RedisStore};
