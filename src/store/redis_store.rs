//! Redis-backed counter store.
//!
//! Every mutation is a single server-side Lua script so that the
//! read-modify-write for one key happens in one round trip and cannot
//! interleave with another instance's update.
//!
//! Layout:
//! - window counters are plain integers with a millisecond TTL set on creation
//! - buckets are hashes `{tokens, ts}` without TTL; `ts` is the server's own
//!   `TIME` in milliseconds, so instance clocks never enter the refill math

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, warn};

use super::{BucketOutcome, BucketSpec, CounterStore, WindowCount};
use crate::clock::duration_millis;
use crate::error::{Result, TollgateError};

const WINDOW_INCR: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

const BUCKET_CONSUME: &str = r"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end
local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, math.max(0, tokens + elapsed / 1000 * rate))
local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(now))
return {allowed, tostring(tokens)}
";

/// Redis storage for distributed quota enforcement.
pub struct RedisStore {
    connection: ConnectionManager,
    window_incr: Script,
    bucket_consume: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis and verify the connection with `PING`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client");
            TollgateError::from(e)
        })?;
        let connection = ConnectionManager::new(client).await?;

        let mut conn = connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!("Connected to Redis counter store");

        Ok(Self {
            connection,
            window_incr: Script::new(WINDOW_INCR),
            bucket_consume: Script::new(BUCKET_CONSUME),
        })
    }
}

/// Convert a `PTTL` reply into a duration; negative replies mean "no expiry".
fn pttl_to_duration(pttl: i64) -> Duration {
    Duration::from_millis(u64::try_from(pttl).unwrap_or(0))
}

fn parse_tokens(raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|e| TollgateError::StoreUnavailable(format!("bad bucket value {raw:?}: {e}")))
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<WindowCount> {
        let mut conn = self.connection.clone();
        let (used, pttl): (u64, i64) = self
            .window_incr
            .key(key)
            .arg(duration_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowCount {
            used,
            resets_in: pttl_to_duration(pttl),
        })
    }

    async fn read_window(&self, key: &str) -> Result<Option<WindowCount>> {
        let mut conn = self.connection.clone();
        let (used, pttl): (Option<u64>, i64) = redis::pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        Ok(used.map(|used| WindowCount {
            used,
            resets_in: pttl_to_duration(pttl),
        }))
    }

    async fn consume_bucket(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: f64,
    ) -> Result<BucketOutcome> {
        let mut conn = self.connection.clone();
        let (allowed, tokens): (i64, String) = self
            .bucket_consume
            .key(key)
            .arg(spec.capacity)
            .arg(spec.refill_per_sec)
            .arg(cost)
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketOutcome {
            allowed: allowed == 1,
            tokens: parse_tokens(&tokens)?,
        })
    }

    async fn peek_bucket(&self, key: &str, spec: BucketSpec) -> Result<f64> {
        let mut conn = self.connection.clone();
        let (state, (secs, micros)): (Vec<Option<String>>, (u64, u64)) = redis::pipe()
            .cmd("HMGET")
            .arg(key)
            .arg("tokens")
            .arg("ts")
            .cmd("TIME")
            .query_async(&mut conn)
            .await?;

        let (tokens, ts) = match state.as_slice() {
            [Some(tokens), Some(ts)] => (parse_tokens(tokens)?, parse_tokens(ts)? as u64),
            _ => return Ok(spec.capacity),
        };
        let now = secs * 1000 + micros / 1000;
        Ok(spec.refill(tokens, now.saturating_sub(ts)))
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> Option<String> {
        std::env::var("TOLLGATE_TEST_REDIS_URL").ok()
    }

    #[test]
    fn test_pttl_conversion() {
        assert_eq!(pttl_to_duration(1500), Duration::from_millis(1500));
        assert_eq!(pttl_to_duration(-1), Duration::ZERO);
        assert_eq!(pttl_to_duration(-2), Duration::ZERO);
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!(parse_tokens("2.5").unwrap(), 2.5);
        assert!(parse_tokens("nan-ish").is_err());
    }

    #[tokio::test]
    #[ignore = "requires TOLLGATE_TEST_REDIS_URL"]
    async fn test_redis_window_roundtrip() {
        let Some(url) = redis_url() else { return };
        let store = RedisStore::connect(&url).await.unwrap();
        let key = format!("tollgate-test:window:{}", std::process::id());
        store.delete(&[key.clone()]).await.unwrap();

        let first = store.incr_window(&key, Duration::from_secs(60)).await.unwrap();
        let second = store.incr_window(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.used, 1);
        assert_eq!(second.used, 2);
        assert!(second.resets_in <= Duration::from_secs(60));

        let read = store.read_window(&key).await.unwrap().unwrap();
        assert_eq!(read.used, 2);
        store.delete(&[key]).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires TOLLGATE_TEST_REDIS_URL"]
    async fn test_redis_bucket_drains() {
        let Some(url) = redis_url() else { return };
        let store = RedisStore::connect(&url).await.unwrap();
        let key = format!("tollgate-test:bucket:{}", std::process::id());
        store.delete(&[key.clone()]).await.unwrap();
        let spec = BucketSpec {
            capacity: 2.0,
            refill_per_sec: 0.001,
        };

        assert!(store.consume_bucket(&key, spec, 1.0).await.unwrap().allowed);
        assert!(store.consume_bucket(&key, spec, 1.0).await.unwrap().allowed);
        assert!(!store.consume_bucket(&key, spec, 1.0).await.unwrap().allowed);
        assert!(store.peek_bucket(&key, spec).await.unwrap() < 1.0);
        store.delete(&[key]).await.unwrap();
    }
}
