//! Counter storage backends.
//!
//! The limiter talks to storage only through [`CounterStore`]. Two backends are
//! provided: [`MemoryStore`] for single-instance deployments and tests, and
//! [`RedisStore`] for deployments where several processes share one budget.

mod distributed;
mod memory;

pub use distributed::{RedisStore, DEFAULT_KEY_PREFIX, DEFAULT_OPERATION_TIMEOUT};
pub use memory::{MemoryStore, DEFAULT_SWEEP_INTERVAL};

use async_trait::async_trait;
use std::time::Duration;

use super::counter::CounterRecord;
use crate::error::Result;

/// Storage for fixed-window counters.
///
/// Implementations must make `increment` and `decrement` atomic per key: two
/// concurrent increments on the same key always produce two distinct counts.
/// Expired records must never be returned or incremented; they are replaced by
/// a fresh window instead.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// The live record for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>>;

    /// Count one request against `key`, opening a new window of length
    /// `window` if no live record exists.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterRecord>;

    /// Give back one request counted in the window that started at
    /// `window_start`. Does nothing unless that window is still live for
    /// `key`. A record whose count reaches zero is deleted. Returns whether a
    /// request was given back.
    async fn decrement(&self, key: &str, window_start: u64) -> Result<bool>;

    /// Drop any record for `key`.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Short backend name used in logs.
    fn name(&self) -> &'static str;
}
