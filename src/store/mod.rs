//! The shared (cross-process) key/value tier.
//!
//! Both the second cache tier and the distributed rate limiter sit on top of
//! a [`SharedStore`]. Production deployments use [`RedisStore`]; tests and the
//! local-only mode use [`MemoryStore`]. Every operation touches a single key.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::GatewayResult;
use async_trait::async_trait;
use std::time::Duration;

/// A value read from the shared tier with its remaining time to live.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub value: String,
    pub ttl: Option<Duration>,
}

/// Result of recording a hit in a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub admitted: bool,
    /// Entries inside the window after this call.
    pub count: u64,
    /// Score of the oldest entry still inside the window.
    pub oldest_ms: Option<u64>,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> GatewayResult<()>;

    async fn get(&self, key: &str) -> GatewayResult<Option<StoredValue>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> GatewayResult<()>;

    async fn delete(&self, key: &str) -> GatewayResult<bool>;

    /// Deletes every key starting with `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> GatewayResult<u64>;

    /// Sliding-window admission on a sorted set keyed by `key`.
    ///
    /// Members scored at or before `now_ms - window` are purged first. When
    /// fewer than `max` remain, `member` is added with score `now_ms` and the
    /// key's expiry is refreshed to `window`.
    async fn record_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        max: u64,
        member: &str,
    ) -> GatewayResult<WindowOutcome>;
}
