use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::time::timeout;

/// Commands must come back quickly or the request-path caller treats the
/// store as down; rate limiting fails closed rather than waiting.
const REDIS_TIMEOUT_MILLISECS: u64 = 200;

/// A thin wrapper over the few Redis commands the gateway uses, so tests
/// can substitute a counting fake and inject failures. The INCR on the
/// rate-limit key is the single point of truth for a window: Redis
/// linearizes concurrent increments across every gateway process, so no
/// in-process locking exists anywhere on this path.
#[async_trait]
pub trait CounterClient {
    /// Atomic increment, returning the post-increment count.
    async fn incr(&self, key: String) -> Result<u64>;
    /// Arm the TTL for a fresh window. Only called when `incr` returned 1.
    async fn expire(&self, key: String, seconds: u64) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}

pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub fn new(addr: String) -> Result<RedisClient> {
        let client = redis::Client::open(addr)?;
        Ok(RedisClient { client })
    }
}

#[async_trait]
impl CounterClient for RedisClient {
    async fn incr(&self, key: String) -> Result<u64> {
        let mut conn = self.client.get_async_connection().await?;
        let count = conn.incr(key, 1u64);
        let count = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), count).await?;
        Ok(count?)
    }

    async fn expire(&self, key: String, seconds: u64) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let done = conn.expire::<_, ()>(key, seconds as usize);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), done).await??;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let cmd = redis::cmd("PING");
        let pong = cmd.query_async::<_, String>(&mut conn);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), pong).await??;
        Ok(())
    }
}

/// Counting fake for tests. Keeps real per-key counters so rate-limit
/// sequences behave like Redis would, and can be flipped into a failing
/// mode to exercise the fail-closed paths.
#[derive(Clone, Default)]
pub struct MockCounterClient {
    counts: Arc<Mutex<HashMap<String, u64>>>,
    ttls: Arc<Mutex<HashMap<String, u64>>>,
    failing: Arc<Mutex<bool>>,
}

impl MockCounterClient {
    pub fn new() -> MockCounterClient {
        Default::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counts.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn total_count(&self) -> u64 {
        self.counts.lock().unwrap().values().sum()
    }

    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.ttls.lock().unwrap().get(key).copied()
    }

    /// Simulate the window elapsing: the key vanishes and the next
    /// increment starts a fresh count.
    pub fn expire_now(&self, key: &str) {
        self.counts.lock().unwrap().remove(key);
        self.ttls.lock().unwrap().remove(key);
    }

    fn check_failing(&self) -> Result<()> {
        if *self.failing.lock().unwrap() {
            return Err(anyhow!("mock redis is down"));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterClient for MockCounterClient {
    async fn incr(&self, key: String) -> Result<u64> {
        self.check_failing()?;
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(key).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn expire(&self, key: String, seconds: u64) -> Result<()> {
        self.check_failing()?;
        self.ttls.lock().unwrap().insert(key, seconds);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_failing()
    }
}
