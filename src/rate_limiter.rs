use crate::clock::now_millis;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{Tier, User};
use crate::rate_limit_config::{RateLimitRule, TierLimits};
use crate::store::{SharedStore, WindowOutcome};
use crate::tasks::{PeriodicTask, TaskGroup};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// What the limiter does when the shared store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendErrorPolicy {
    /// Count in-process with a fixed window keyed the same way.
    #[default]
    LocalFallback,
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix milliseconds at which a slot frees up.
    pub reset_at_ms: u64,
    /// Zero when allowed.
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    /// Seconds since the epoch, as sent in `X-RateLimit-Reset`.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }
}

/// Local window state for in-process rate limiting
#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: u64,
    reset_at: u64,
}

/// Sliding-window limiter over the shared store with a local fallback.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    rule: RateLimitRule,
    key_prefix: String,
    on_backend_error: BackendErrorPolicy,
    local_windows: Arc<RwLock<HashMap<String, LocalWindow>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, rule: RateLimitRule, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            rule,
            key_prefix: key_prefix.into(),
            on_backend_error: BackendErrorPolicy::default(),
            local_windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_backend_error_policy(mut self, policy: BackendErrorPolicy) -> Self {
        self.on_backend_error = policy;
        self
    }

    pub fn rule(&self) -> RateLimitRule {
        self.rule
    }

    fn window_ms(&self) -> u64 {
        self.rule.window.as_millis() as u64
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Records one request for `key` and reports whether it is admitted.
    ///
    /// Never fails: backend errors are handled by the configured
    /// [`BackendErrorPolicy`], and errors inside the local fallback admit.
    pub async fn is_allowed(&self, key: &str) -> RateLimitDecision {
        let now = now_millis();
        let store_key = self.store_key(key);
        let member = format!("{}-{}", now, Uuid::new_v4().simple());

        let result = self
            .store
            .record_in_window(
                &store_key,
                now,
                self.rule.window,
                self.rule.max_requests,
                &member,
            )
            .await;

        match result {
            Ok(outcome) => self.decision_from_window(outcome, now),
            Err(e) => {
                warn!(
                    key = %store_key,
                    error = %e,
                    policy = ?self.on_backend_error,
                    "Rate limit backend unavailable"
                );
                match self.on_backend_error {
                    BackendErrorPolicy::LocalFallback => {
                        self.check_local(&store_key, now).unwrap_or_else(|e| {
                            error!(key = %store_key, error = %e, "Local rate limit failed, allowing request");
                            self.open_decision(now)
                        })
                    }
                    BackendErrorPolicy::Allow => self.open_decision(now),
                    BackendErrorPolicy::Deny => self.closed_decision(now),
                }
            }
        }
    }

    fn decision_from_window(&self, outcome: WindowOutcome, now: u64) -> RateLimitDecision {
        let reset_at_ms = outcome
            .oldest_ms
            .map(|oldest| oldest + self.window_ms())
            .unwrap_or(now + self.window_ms());
        let remaining = self.rule.max_requests.saturating_sub(outcome.count);

        if outcome.admitted {
            debug!(count = outcome.count, remaining, "Request admitted");
            RateLimitDecision {
                allowed: true,
                limit: self.rule.max_requests,
                remaining,
                reset_at_ms,
                retry_after_secs: 0,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                limit: self.rule.max_requests,
                remaining: 0,
                reset_at_ms,
                retry_after_secs: retry_after(reset_at_ms, now),
            }
        }
    }

    /// Fixed-window counting in this process only.
    fn check_local(&self, key: &str, now: u64) -> GatewayResult<RateLimitDecision> {
        let window_ms = self.window_ms();
        let mut windows = self.local_windows.write().map_err(|_| {
            GatewayError::Internal("Failed to acquire write lock on local windows".to_string())
        })?;

        let window = windows.entry(key.to_string()).or_insert(LocalWindow {
            count: 0,
            reset_at: now + window_ms,
        });
        if now >= window.reset_at {
            *window = LocalWindow {
                count: 0,
                reset_at: now + window_ms,
            };
        }

        if window.count < self.rule.max_requests {
            window.count += 1;
            Ok(RateLimitDecision {
                allowed: true,
                limit: self.rule.max_requests,
                remaining: self.rule.max_requests - window.count,
                reset_at_ms: window.reset_at,
                retry_after_secs: 0,
            })
        } else {
            Ok(RateLimitDecision {
                allowed: false,
                limit: self.rule.max_requests,
                remaining: 0,
                reset_at_ms: window.reset_at,
                retry_after_secs: retry_after(window.reset_at, now),
            })
        }
    }

    fn open_decision(&self, now: u64) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            limit: self.rule.max_requests,
            remaining: self.rule.max_requests,
            reset_at_ms: now + self.window_ms(),
            retry_after_secs: 0,
        }
    }

    fn closed_decision(&self, now: u64) -> RateLimitDecision {
        let reset_at_ms = now + self.window_ms();
        RateLimitDecision {
            allowed: false,
            limit: self.rule.max_requests,
            remaining: 0,
            reset_at_ms,
            retry_after_secs: retry_after(reset_at_ms, now),
        }
    }

    /// Reset rate limit for a specific key
    pub async fn reset(&self, key: &str) -> GatewayResult<()> {
        let store_key = self.store_key(key);
        {
            let mut windows = self.local_windows.write().map_err(|_| {
                GatewayError::Internal("Failed to acquire write lock on local windows".to_string())
            })?;
            windows.remove(&store_key);
        }
        self.store.delete(&store_key).await?;
        Ok(())
    }

    /// Drops local windows whose reset time has passed.
    pub fn cleanup_local(&self) -> GatewayResult<usize> {
        let now = now_millis();
        let mut windows = self.local_windows.write().map_err(|_| {
            GatewayError::Internal("Failed to acquire write lock on local windows".to_string())
        })?;

        let initial_count = windows.len();
        windows.retain(|_, window| window.reset_at > now);
        Ok(initial_count - windows.len())
    }

    pub fn local_window_count(&self) -> usize {
        self.local_windows.read().map(|w| w.len()).unwrap_or(0)
    }
}

fn retry_after(reset_at_ms: u64, now: u64) -> u64 {
    reset_at_ms.saturating_sub(now).div_ceil(1000).max(1)
}

/// Outcome of a tiered check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieredDecision {
    pub tier: Tier,
    /// User id, or `ip:<addr>` for anonymous callers.
    pub identity: String,
    pub decision: RateLimitDecision,
}

/// One [`RateLimiter`] per subscription tier.
pub struct TieredRateLimiter {
    free: Arc<RateLimiter>,
    premium: Arc<RateLimiter>,
    enterprise: Arc<RateLimiter>,
    tasks: TaskGroup,
}

impl TieredRateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, limits: TierLimits, policy: BackendErrorPolicy) -> Self {
        let build = |tier: Tier| {
            Arc::new(
                RateLimiter::new(store.clone(), limits.rule(tier), format!("ratelimit:{}", tier))
                    .with_backend_error_policy(policy),
            )
        };
        Self {
            free: build(Tier::Free),
            premium: build(Tier::Premium),
            enterprise: build(Tier::Enterprise),
            tasks: TaskGroup::new(),
        }
    }

    pub fn limiter(&self, tier: Tier) -> &Arc<RateLimiter> {
        match tier {
            Tier::Free => &self.free,
            Tier::Premium => &self.premium,
            Tier::Enterprise => &self.enterprise,
        }
    }

    /// Checks the caller against the limiter for their effective tier.
    ///
    /// Lapsed subscriptions are limited as free for this request only;
    /// anonymous callers are limited as free by IP.
    pub async fn check(&self, user: Option<&User>, client_ip: &str) -> TieredDecision {
        let (tier, identity) = match user {
            Some(user) => (user.effective_tier(Utc::now()), user.id.clone()),
            None => (Tier::Free, format!("ip:{}", client_ip)),
        };
        let decision = self.limiter(tier).is_allowed(&identity).await;
        TieredDecision {
            tier,
            identity,
            decision,
        }
    }

    /// Periodically drops expired local fallback windows.
    pub fn start(&self, interval: Duration) {
        for tier in [Tier::Free, Tier::Premium, Tier::Enterprise] {
            let limiter = self.limiter(tier).clone();
            self.tasks.push(PeriodicTask::spawn("ratelimit-cleanup", interval, move || {
                let limiter = limiter.clone();
                async move {
                    match limiter.cleanup_local() {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Dropped expired local rate limit windows"),
                        Err(e) => warn!(error = %e, "Local rate limit cleanup failed"),
                    }
                }
            }));
        }
    }

    pub fn stop(&self) {
        self.tasks.stop_all();
    }
}
