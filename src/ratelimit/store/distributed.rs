//! Redis-backed counter store for deployments with several processes.
//!
//! Each counter is a Redis hash holding `count`, `window_start` and
//! `reset_time`. All mutations run as Lua scripts, so the check of the window
//! boundary and the write that follows it are one atomic step on the server.
//! Redis expires the hash at the end of its window.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::CounterStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::counter::{window_millis, CounterRecord};

/// Default prefix for counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "turnstile:";
/// Default bound on a single Redis round-trip.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(500);

const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

local reset = tonumber(redis.call('HGET', key, 'reset_time'))
if reset == nil or reset <= now then
    redis.call('DEL', key)
    redis.call('HSET', key, 'count', 1, 'window_start', now, 'reset_time', now + window)
    redis.call('PEXPIRE', key, window)
    return {1, now, now + window}
end

local count = redis.call('HINCRBY', key, 'count', 1)
local start = tonumber(redis.call('HGET', key, 'window_start'))
return {count, start, reset}
"#;

const DECREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_start = tonumber(ARGV[2])

local fields = redis.call('HMGET', key, 'count', 'window_start', 'reset_time')
local count = tonumber(fields[1])
local start = tonumber(fields[2])
local reset = tonumber(fields[3])
if count == nil or start ~= window_start or reset <= now or count < 1 then
    return 0
end

if count == 1 then
    redis.call('DEL', key)
else
    redis.call('HINCRBY', key, 'count', -1)
end
return 1
"#;

/// Counter store shared through a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    timeout: Duration,
    increment: Script,
    decrement: Script,
    clock: Arc<dyn Clock>,
}

impl RedisStore {
    /// Connect to Redis at `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = with_timeout(DEFAULT_OPERATION_TIMEOUT * 4, ConnectionManager::new(client))
            .await?;

        info!(backend = "redis", "Connected counter store");
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
            increment: Script::new(INCREMENT_SCRIPT),
            decrement: Script::new(DECREMENT_SCRIPT),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

async fn with_timeout<T, F>(limit: Duration, op: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result.map_err(TurnstileError::from),
        Err(_) => Err(TurnstileError::StorageUnavailable(format!(
            "redis operation timed out after {:?}",
            limit
        ))),
    }
}

fn record_from_parts((count, window_start, reset_time): (u64, u64, u64)) -> CounterRecord {
    CounterRecord {
        count,
        window_start,
        reset_time,
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>> {
        let mut conn = self.conn.clone();
        let key = self.redis_key(key);

        let fields: (Option<u64>, Option<u64>, Option<u64>) = with_timeout(
            self.timeout,
            redis::cmd("HMGET")
                .arg(&key)
                .arg("count")
                .arg("window_start")
                .arg("reset_time")
                .query_async(&mut conn),
        )
        .await?;

        let now = self.clock.now_millis();
        Ok(match fields {
            (Some(count), Some(window_start), Some(reset_time)) if reset_time > now => {
                Some(record_from_parts((count, window_start, reset_time)))
            }
            _ => None,
        })
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<CounterRecord> {
        let mut conn = self.conn.clone();
        let key = self.redis_key(key);
        let now = self.clock.now_millis();

        let parts: (u64, u64, u64) = with_timeout(
            self.timeout,
            self.increment
                .key(&key)
                .arg(now)
                .arg(window_millis(window))
                .invoke_async(&mut conn),
        )
        .await?;

        let record = record_from_parts(parts);
        if record.count == 1 {
            debug!(key = %key, reset_time = record.reset_time, "Opened counter window");
        }
        trace!(key = %key, count = record.count, "Incremented counter");
        Ok(record)
    }

    async fn decrement(&self, key: &str, window_start: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = self.redis_key(key);
        let now = self.clock.now_millis();

        let released: bool = with_timeout(
            self.timeout,
            self.decrement
                .key(&key)
                .arg(now)
                .arg(window_start)
                .invoke_async(&mut conn),
        )
        .await?;

        trace!(key = %key, released = released, "Decremented counter");
        Ok(released)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.redis_key(key);

        with_timeout(self.timeout, conn.del::<_, ()>(&key)).await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
