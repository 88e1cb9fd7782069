//! In-process counter store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::CounterStore;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::counter::CounterRecord;

/// How often the background sweep runs by default.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Counter store held in process memory.
///
/// Records live in a sharded map. Every mutation goes through the map's entry
/// API, which holds the shard lock for the whole read-compare-write, so
/// concurrent increments on one key never lose an update.
#[derive(Debug)]
pub struct MemoryStore {
    records: DashMap<String, CounterRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store that reads the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Remove every expired record. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());

        debug!(
            removed = removed,
            live = self.records.len(),
            "Swept expired rate limit counters"
        );
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.sweep();
                    }
                    None => break,
                }
            }
        })
    }

    /// Number of records held, live or not yet swept.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop all records.
    pub fn clear(&self) {
        self.records.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>> {
        let now = self.clock.now_millis();
        Ok(self
            .records
            .get(key)
            .map(|record| *record)
            .filter(|record| !record.is_expired(now)))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<CounterRecord> {
        let now = self.clock.now_millis();
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| CounterRecord {
                count: 0,
                ..CounterRecord::open(now, window)
            });

        if record.is_expired(now) {
            trace!(key = %key, "Window elapsed, opening a new one");
            *record = CounterRecord {
                count: 0,
                ..CounterRecord::open(now, window)
            };
        }
        record.count += 1;

        Ok(*record)
    }

    async fn decrement(&self, key: &str, window_start: u64) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut entry = match self.records.entry(key.to_string()) {
            Entry::Occupied(entry) => entry,
            Entry::Vacant(_) => return Ok(false),
        };

        let record = entry.get_mut();
        if record.window_start != window_start || record.is_expired(now) || record.count == 0 {
            return Ok(false);
        }
        record.count -= 1;

        if record.count == 0 {
            entry.remove();
        }
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
