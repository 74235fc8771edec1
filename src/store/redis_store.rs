use super::{SharedStore, StoredValue, WindowOutcome};
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::info;

/// Redis-backed shared tier.
///
/// Uses a [`ConnectionManager`], which multiplexes commands over one
/// connection and reconnects transparently after failures.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> GatewayResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| GatewayError::Redis(format!("Failed to create Redis client: {}", e)))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| GatewayError::Redis(format!("Failed to connect to Redis: {}", e)))?;

        info!(target: "covergate::store", "Connected to Redis shared store");

        Ok(Self { manager })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> GatewayResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::Redis(format!("Ping failed: {}", e)))
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<StoredValue>> {
        let mut conn = self.manager.clone();
        let (value, pttl): (Option<String>, i64) = redis::pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatewayError::Redis(format!("GET failed: {}", e)))?;

        Ok(value.map(|value| StoredValue {
            value,
            ttl: u64::try_from(pttl).ok().map(Duration::from_millis),
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> GatewayResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PSETEX")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| GatewayError::Redis(format!("PSETEX failed: {}", e)))
    }

    async fn delete(&self, key: &str) -> GatewayResult<bool> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await
            .map(|deleted| deleted > 0)
            .map_err(|e| GatewayError::Redis(format!("DEL failed: {}", e)))
    }

    async fn delete_prefix(&self, prefix: &str) -> GatewayResult<u64> {
        let mut conn = self.manager.clone();
        let pattern = prefix_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(|e| GatewayError::Redis(format!("SCAN failed: {}", e)))?;

            if !keys.is_empty() {
                let deleted: i64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| GatewayError::Redis(format!("DEL failed: {}", e)))?;
                removed += deleted.max(0) as u64;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }

    async fn record_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        max: u64,
        member: &str,
    ) -> GatewayResult<WindowOutcome> {
        let mut conn = self.manager.clone();
        let window_ms = window.as_millis() as u64;
        let window_start = now_ms.saturating_sub(window_ms);

        // Purge, count and peek at the oldest entry in one round trip.
        let (count, oldest): (u64, Vec<(String, f64)>) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(window_start)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(|e| GatewayError::Redis(format!("Sliding window read failed: {}", e)))?;

        let oldest_ms = oldest.first().map(|(_, score)| *score as u64);

        if count >= max {
            return Ok(WindowOutcome {
                admitted: false,
                count,
                oldest_ms,
            });
        }

        redis::pipe()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window_ms.max(1))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| GatewayError::Redis(format!("Sliding window write failed: {}", e)))?;

        Ok(WindowOutcome {
            admitted: true,
            count: count + 1,
            oldest_ms: oldest_ms.or(Some(now_ms)),
        })
    }
}

/// `SCAN MATCH` pattern for keys starting with `prefix` literally.
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}
