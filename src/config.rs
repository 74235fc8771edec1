use crate::cache::{CacheConfig, CacheTtl};
use crate::error::{GatewayError, GatewayResult};
use crate::rate_limit_config::{RateLimitRule, TierLimits};
use crate::rate_limiter::BackendErrorPolicy;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
    Test,
}

impl Environment {
    /// Production hides internal error messages from clients.
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Runtime settings; every flag can also come from the environment.
#[derive(Debug, Clone, Parser, Validate)]
#[command(name = "covergate", version, about = "Request-governance gateway for the cover letter API")]
pub struct Settings {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; without it the shared tier is in-process only
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "APP_ENV", value_enum, default_value_t = Environment::Development)]
    pub environment: Environment,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Upper bound for a whole request, pipeline included
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,

    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 1_048_576)]
    #[validate(range(min = 1024, max = 16_777_216))]
    pub max_body_bytes: usize,

    #[arg(long, env = "CACHE_NAMESPACE", default_value = "covergate")]
    #[validate(length(min = 1, max = 64))]
    pub cache_namespace: String,

    #[arg(long, env = "CACHE_FAST_TTL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub cache_fast_ttl: Duration,

    #[arg(long, env = "CACHE_SHARED_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub cache_shared_ttl: Duration,

    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value_t = 10_000)]
    #[validate(range(min = 1))]
    pub cache_max_entries: usize,

    #[arg(long, env = "CACHE_SWEEP_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    pub cache_sweep_interval: Duration,

    /// Requests per window for each tier
    #[arg(long, env = "RATE_LIMIT_FREE", default_value_t = 10)]
    #[validate(range(min = 1))]
    pub rate_limit_free: u64,

    #[arg(long, env = "RATE_LIMIT_PREMIUM", default_value_t = 60)]
    #[validate(range(min = 1))]
    pub rate_limit_premium: u64,

    #[arg(long, env = "RATE_LIMIT_ENTERPRISE", default_value_t = 300)]
    #[validate(range(min = 1))]
    pub rate_limit_enterprise: u64,

    #[arg(long, env = "RATE_LIMIT_WINDOW", default_value = "1m", value_parser = humantime::parse_duration)]
    pub rate_limit_window: Duration,

    #[arg(long, env = "RATE_LIMIT_BACKEND_POLICY", value_enum, default_value_t = BackendErrorPolicy::LocalFallback)]
    pub rate_limit_backend_policy: BackendErrorPolicy,

    #[arg(long, env = "RATE_LIMIT_CLEANUP_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub rate_limit_cleanup_interval: Duration,

    /// How long a completed MFA challenge is honoured
    #[arg(long, env = "MFA_SESSION_TTL", default_value = "15m", value_parser = humantime::parse_duration)]
    pub mfa_session_ttl: Duration,

    #[arg(long, env = "MFA_CODE_TTL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub mfa_code_ttl: Duration,

    #[arg(long, env = "METRICS_MAX_SAMPLES", default_value_t = 10_000)]
    #[validate(range(min = 10))]
    pub metrics_max_samples: usize,

    #[arg(long, env = "METRICS_FLUSH_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    pub metrics_flush_interval: Duration,

    #[arg(long, env = "HEALTH_SAMPLE_INTERVAL", default_value = "30s", value_parser = humantime::parse_duration)]
    pub health_sample_interval: Duration,

    #[arg(long, env = "ALERT_POLL_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    pub alert_poll_interval: Duration,

    /// Receives alerts as JSON when set
    #[arg(long, env = "ALERT_WEBHOOK_URL")]
    #[validate(url)]
    pub alert_webhook_url: Option<String>,

    #[arg(long, env = "AUDIT_CAPACITY", default_value_t = 10_000)]
    #[validate(range(min = 1))]
    pub audit_capacity: usize,

    /// Operations slower than this are logged as warnings
    #[arg(long, env = "SLOW_OPERATION_THRESHOLD", default_value = "1s", value_parser = humantime::parse_duration)]
    pub slow_operation_threshold: Duration,

    /// Seed a demo user and print its session token at startup
    #[arg(long, env = "SEED_DEMO_USER", default_value_t = false)]
    pub seed_demo_user: bool,
}

impl Settings {
    /// Settings built from defaults and the environment only.
    pub fn from_env() -> Self {
        Self::parse_from(["covergate"])
    }

    /// Field-level checks plus the cross-field rules the derive cannot express.
    pub fn validated(self) -> GatewayResult<Self> {
        self.validate()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;

        if let Some(url) = &self.redis_url {
            validate_redis_url(url)?;
        }
        if self.cache_fast_ttl > self.cache_shared_ttl {
            return Err(GatewayError::Configuration(
                "Fast cache TTL must not exceed the shared cache TTL".to_string(),
            ));
        }
        self.tier_limits()
            .validate()
            .map_err(GatewayError::Configuration)?;
        for (name, interval) in [
            ("request timeout", self.request_timeout),
            ("rate limit window", self.rate_limit_window),
            ("metrics flush interval", self.metrics_flush_interval),
            ("health sample interval", self.health_sample_interval),
            ("alert poll interval", self.alert_poll_interval),
            ("cache sweep interval", self.cache_sweep_interval),
        ] {
            if interval.is_zero() {
                return Err(GatewayError::Configuration(format!(
                    "The {} must be greater than 0",
                    name
                )));
            }
        }
        Ok(self)
    }

    pub fn tier_limits(&self) -> TierLimits {
        TierLimits {
            free: RateLimitRule::new(self.rate_limit_free, self.rate_limit_window),
            premium: RateLimitRule::new(self.rate_limit_premium, self.rate_limit_window),
            enterprise: RateLimitRule::new(self.rate_limit_enterprise, self.rate_limit_window),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            namespace: self.cache_namespace.clone(),
            default_ttl: CacheTtl::new(self.cache_fast_ttl, self.cache_shared_ttl),
            max_entries: self.cache_max_entries,
        }
    }
}

/// Validates a Redis URL
pub fn validate_redis_url(url: &str) -> GatewayResult<()> {
    if url.is_empty() {
        return Err(GatewayError::Configuration(
            "Redis URL cannot be empty".to_string(),
        ));
    }

    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(GatewayError::Configuration(
            "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Settings {
        let mut argv = vec!["covergate"];
        argv.extend_from_slice(args);
        Settings::parse_from(argv)
    }

    #[test]
    fn test_flags_parse_durations_and_enums() {
        let settings = parse(&[
            "--environment",
            "production",
            "--rate-limit-window",
            "90s",
            "--rate-limit-backend-policy",
            "deny",
            "--log-format",
            "json",
        ]);
        assert!(settings.environment.is_production());
        assert_eq!(settings.rate_limit_window, Duration::from_secs(90));
        assert_eq!(settings.rate_limit_backend_policy, BackendErrorPolicy::Deny);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.tier_limits().premium.window, Duration::from_secs(90));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(parse(&["--redis-url", "http://localhost"]).validated().is_err());
        assert!(parse(&["--max-body-bytes", "10"]).validated().is_err());
        assert!(parse(&["--alert-webhook-url", "not a url"]).validated().is_err());
        assert!(parse(&["--cache-fast-ttl", "2h"]).validated().is_err());
        assert!(parse(&["--rate-limit-free", "500"]).validated().is_err());
        assert!(parse(&["--redis-url", "redis://127.0.0.1:6379"]).validated().is_ok());
    }

    #[test]
    fn test_redis_url_validation() {
        assert!(validate_redis_url("redis://localhost:6379").is_ok());
        assert!(validate_redis_url("rediss://localhost:6380").is_ok());
        assert!(validate_redis_url("").is_err());
        assert!(validate_redis_url("localhost:6379").is_err());
    }
}
