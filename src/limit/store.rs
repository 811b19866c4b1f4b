use crate::error::GatewayError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Result of one atomic bucket check. `tokens_left` is what remains after
/// the consume (or the current level when denied); -1 signals that the
/// store could not be consulted and the request was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    pub allowed: bool,
    pub tokens_left: i64,
}

/// Token bucket parameters for one check, all in whole tokens per second.
#[derive(Debug, Clone, Copy)]
pub struct BucketParams {
    pub replenish_rate: u64,
    pub burst_capacity: u64,
    pub requested_tokens: u64,
}

/// Atomic refill-check-consume against a shared bucket. The Redis variant
/// is the production store: every gateway instance draws from the same
/// bucket, so limits hold globally. The memory variant serves standalone
/// deployments and tests.
pub enum CounterStore {
    Redis(RedisCounterStore),
    Memory(MemoryCounterStore),
    #[cfg(test)]
    Failing,
}

impl CounterStore {
    pub async fn check_and_consume(
        &self,
        key: &str,
        params: BucketParams,
    ) -> Result<CounterOutcome, GatewayError> {
        match self {
            CounterStore::Redis(store) => store.check_and_consume(key, params).await,
            CounterStore::Memory(store) => Ok(store.check_and_consume(key, params).await),
            #[cfg(test)]
            CounterStore::Failing => Err(GatewayError::Store("injected failure".to_string())),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            CounterStore::Redis(_) => "redis",
            CounterStore::Memory(_) => "memory",
            #[cfg(test)]
            CounterStore::Failing => "failing",
        }
    }
}

/// Refill, check, and consume in a single Lua script so concurrent gateway
/// instances never interleave read-modify-write on the same bucket. Two
/// keys per bucket: the token count and the last-refill timestamp, both
/// expiring after twice the time it takes to fill the bucket from empty.
const CHECK_AND_CONSUME_LUA: &str = r#"
local tokens_key = KEYS[1]
local timestamp_key = KEYS[2]
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

local fill_time = capacity / rate
local ttl = math.floor(fill_time * 2)
if ttl < 1 then
  ttl = 1
end

local last_tokens = tonumber(redis.call('get', tokens_key))
if last_tokens == nil then
  last_tokens = capacity
end

local last_refreshed = tonumber(redis.call('get', timestamp_key))
if last_refreshed == nil then
  last_refreshed = now
end

local delta = math.max(0, now - last_refreshed)
local filled = math.min(capacity, last_tokens + (delta * rate))

local allowed = filled >= requested
local new_tokens = filled
if allowed then
  new_tokens = filled - requested
end

redis.call('setex', tokens_key, ttl, new_tokens)
redis.call('setex', timestamp_key, ttl, now)

local allowed_num = 0
if allowed then
  allowed_num = 1
end
return { allowed_num, new_tokens }
"#;

pub struct RedisCounterStore {
    conn: redis::aio::ConnectionManager,
    script: redis::Script,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        tracing::info!("limit: connected counter store, url={}", url);
        Ok(Self {
            conn,
            script: redis::Script::new(CHECK_AND_CONSUME_LUA),
        })
    }

    async fn check_and_consume(
        &self,
        key: &str,
        params: BucketParams,
    ) -> Result<CounterOutcome, GatewayError> {
        let now_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut conn = self.conn.clone();
        let (allowed, tokens_left): (i64, i64) = self
            .script
            .key(format!("{{{key}}}.tokens"))
            .key(format!("{{{key}}}.timestamp"))
            .arg(params.replenish_rate)
            .arg(params.burst_capacity)
            .arg(now_secs)
            .arg(params.requested_tokens)
            .invoke_async(&mut conn)
            .await?;

        Ok(CounterOutcome {
            allowed: allowed == 1,
            tokens_left,
        })
    }
}

/// Entries idle longer than this are evicted by the GC sweep.
const GC_EXPIRE_SECS: u64 = 300;
const GC_INTERVAL_SECS: u64 = 60;

/// In-process token buckets. Same refill math as the Lua script, but at
/// microsecond resolution since there is no cross-process clock to agree
/// on.
pub struct MemoryCounterStore {
    buckets: DashMap<String, Arc<Bucket>>,
}

struct Bucket {
    inner: Mutex<BucketInner>,
    /// For GC. Updated outside the lock.
    last_access: AtomicU64,
}

struct BucketInner {
    tokens: f64,
    last_refill: u64,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn check_and_consume(&self, key: &str, params: BucketParams) -> CounterOutcome {
        let now = now_us();

        // Fast path: key already exists, no allocation.
        let bucket = if let Some(entry) = self.buckets.get(key) {
            entry.value().clone()
        } else {
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Bucket {
                        inner: Mutex::new(BucketInner {
                            tokens: params.burst_capacity as f64,
                            last_refill: now,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };

        bucket.last_access.store(now, Ordering::Relaxed);

        let mut b = bucket.inner.lock().await;
        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            let refill = elapsed as f64 * params.replenish_rate as f64 / 1_000_000.0;
            b.tokens = (b.tokens + refill).min(params.burst_capacity as f64);
            b.last_refill = now;
        }

        let requested = params.requested_tokens as f64;
        if b.tokens >= requested {
            b.tokens -= requested;
            CounterOutcome {
                allowed: true,
                tokens_left: b.tokens as i64,
            }
        } else {
            CounterOutcome {
                allowed: false,
                tokens_left: b.tokens as i64,
            }
        }
    }

    /// Spawn a background task that evicts idle buckets. Call once after
    /// construction.
    pub fn start_gc(store: Arc<CounterStore>) {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if let CounterStore::Memory(mem) = store.as_ref() {
                    mem.evict_stale();
                }
            }
        });
    }

    fn evict_stale(&self) {
        let now = now_us();
        let expire_us = GC_EXPIRE_SECS * 1_000_000;
        self.buckets
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}
