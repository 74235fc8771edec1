use crate::models::Tier;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Individual rate limiting rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_requests: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn per_minute(max_requests: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Validate rule parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_requests == 0 {
            return Err("Max requests must be greater than 0".to_string());
        }
        if self.window.is_zero() {
            return Err("Window must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// One rule per subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub free: RateLimitRule,
    pub premium: RateLimitRule,
    pub enterprise: RateLimitRule,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free: RateLimitRule::per_minute(10),
            premium: RateLimitRule::per_minute(60),
            enterprise: RateLimitRule::per_minute(300),
        }
    }
}

impl TierLimits {
    pub fn rule(&self, tier: Tier) -> RateLimitRule {
        match tier {
            Tier::Free => self.free,
            Tier::Premium => self.premium,
            Tier::Enterprise => self.enterprise,
        }
    }

    /// Validates every rule and that limits never shrink as the tier rises.
    pub fn validate(&self) -> Result<(), String> {
        for (tier, rule) in [
            (Tier::Free, self.free),
            (Tier::Premium, self.premium),
            (Tier::Enterprise, self.enterprise),
        ] {
            rule.validate().map_err(|e| format!("{} tier: {}", tier, e))?;
        }
        if self.free.max_requests > self.premium.max_requests
            || self.premium.max_requests > self.enterprise.max_requests
        {
            return Err("Tier limits must not decrease from free to enterprise".to_string());
        }
        Ok(())
    }
}
