use super::{SharedStore, StoredValue, WindowOutcome};
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum MemoryData {
    Text(String),
    SortedSet(Vec<(u64, String)>),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    data: MemoryData,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process stand-in for the shared tier.
///
/// Availability can be toggled to exercise degraded modes of the services
/// built on top of it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the backend going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> GatewayResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(GatewayError::Redis(
                "connection refused: shared store unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> GatewayResult<()> {
        self.check_available()
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<StoredValue>> {
        self.check_available()?;
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                return Ok(match &entry.data {
                    MemoryData::Text(value) => Some(StoredValue {
                        value: value.clone(),
                        ttl: entry.expires_at.map(|at| at.saturating_duration_since(now)),
                    }),
                    MemoryData::SortedSet(_) => None,
                })
            }
        };

        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> GatewayResult<()> {
        self.check_available()?;
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                data: MemoryData::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> GatewayResult<bool> {
        self.check_available()?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> GatewayResult<u64> {
        self.check_available()?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn record_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        max: u64,
        member: &str,
    ) -> GatewayResult<WindowOutcome> {
        self.check_available()?;
        let now = Instant::now();
        let window_start = now_ms.saturating_sub(window.as_millis() as u64);

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| MemoryEntry {
            data: MemoryData::SortedSet(Vec::new()),
            expires_at: None,
        });

        if entry.is_expired(now) || !matches!(entry.data, MemoryData::SortedSet(_)) {
            entry.data = MemoryData::SortedSet(Vec::new());
            entry.expires_at = None;
        }

        let mut admitted = false;
        if let MemoryData::SortedSet(members) = &mut entry.data {
            members.retain(|(score, _)| *score > window_start);
            if (members.len() as u64) < max {
                members.push((now_ms, member.to_string()));
                members.sort_by_key(|(score, _)| *score);
                admitted = true;
            }
        }
        if admitted {
            entry.expires_at = Some(now + window);
        }

        let (count, oldest_ms) = match &entry.data {
            MemoryData::SortedSet(members) => {
                (members.len() as u64, members.first().map(|(score, _)| *score))
            }
            MemoryData::Text(_) => (0, None),
        };

        Ok(WindowOutcome {
            admitted,
            count,
            oldest_ms,
        })
    }
}
