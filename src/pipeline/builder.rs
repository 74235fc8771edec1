use super::{AuthStage, MonitoringStage, Pipeline, RateLimitStage, ValidationStage, VersioningStage};
use crate::auth::{AuthGate, AuthRequirement};
use crate::logger::StructuredLogger;
use crate::metrics::MetricsCollector;
use crate::normalizer::ErrorNormalizer;
use crate::rate_limiter::TieredRateLimiter;
use crate::validation::Schema;
use crate::versioning::VersionRegistry;
use std::sync::Arc;

/// Which stages a route runs. The order between them is fixed.
#[derive(Clone)]
pub struct RouteConfig {
    pub auth: Option<AuthRequirement>,
    pub schema: Option<Arc<Schema>>,
    pub rate_limit: bool,
    pub versioned: bool,
}

impl RouteConfig {
    /// Versioned and rate limited, no credentials needed.
    pub fn public() -> Self {
        Self {
            auth: None,
            schema: None,
            rate_limit: true,
            versioned: true,
        }
    }

    pub fn optional_auth() -> Self {
        Self {
            auth: Some(AuthRequirement::Optional),
            ..Self::public()
        }
    }

    pub fn authenticated() -> Self {
        Self {
            auth: Some(AuthRequirement::Required),
            ..Self::public()
        }
    }

    pub fn mfa_protected() -> Self {
        Self {
            auth: Some(AuthRequirement::RequiredWithMfa),
            ..Self::public()
        }
    }

    pub fn with_schema(mut self, schema: Arc<Schema>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = false;
        self
    }

    pub fn unversioned(mut self) -> Self {
        self.versioned = false;
        self
    }
}

/// Builds per-route pipelines over services constructed once at startup.
#[derive(Clone)]
pub struct PipelineBuilder {
    versions: Arc<VersionRegistry>,
    metrics: Arc<MetricsCollector>,
    gate: Arc<AuthGate>,
    limiter: Arc<TieredRateLimiter>,
    logger: Arc<StructuredLogger>,
    normalizer: Arc<ErrorNormalizer>,
    body_limit: usize,
}

impl PipelineBuilder {
    pub fn new(
        versions: Arc<VersionRegistry>,
        metrics: Arc<MetricsCollector>,
        gate: Arc<AuthGate>,
        limiter: Arc<TieredRateLimiter>,
        logger: Arc<StructuredLogger>,
        normalizer: Arc<ErrorNormalizer>,
    ) -> Self {
        Self {
            versions,
            metrics,
            gate,
            limiter,
            logger,
            normalizer,
            body_limit: 1024 * 1024,
        }
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// versioning → monitoring → auth → validation → rate limit
    pub fn build(&self, route: &RouteConfig) -> Pipeline {
        let mut pipeline = Pipeline::new(self.normalizer.clone(), self.metrics.clone(), self.logger.clone())
            .with_body_limit(self.body_limit);

        if route.versioned {
            pipeline = pipeline.stage(Arc::new(VersioningStage::new(self.versions.clone())));
        }
        pipeline = pipeline.stage(Arc::new(MonitoringStage::new(self.metrics.clone())));
        if let Some(requirement) = route.auth {
            pipeline = pipeline.stage(Arc::new(AuthStage::new(self.gate.clone(), requirement)));
        }
        if let Some(schema) = &route.schema {
            pipeline = pipeline.stage(Arc::new(ValidationStage::new(schema.clone(), self.versions.clone())));
        }
        if route.rate_limit {
            pipeline = pipeline.stage(Arc::new(RateLimitStage::new(self.limiter.clone(), self.logger.clone())));
        }
        pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, MultiLevelCache};
    use crate::config::Environment;
    use crate::mfa::MfaService;
    use crate::rate_limit_config::TierLimits;
    use crate::rate_limiter::BackendErrorPolicy;
    use crate::store::MemoryStore;
    use crate::stores::MemoryUserStore;
    use std::time::Duration;

    fn builder() -> PipelineBuilder {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(MetricsCollector::new(100));
        let logger = Arc::new(StructuredLogger::new("test", 10));
        let cache = Arc::new(MultiLevelCache::new(store.clone(), CacheConfig::default()));
        let mfa = Arc::new(MfaService::new(cache, Duration::from_secs(900)));
        let gate = Arc::new(AuthGate::new(Arc::new(MemoryUserStore::new()), mfa, logger.clone()));
        let limiter = Arc::new(TieredRateLimiter::new(
            store,
            TierLimits::default(),
            BackendErrorPolicy::LocalFallback,
        ));
        let normalizer = Arc::new(ErrorNormalizer::new(Environment::Test, logger.clone(), metrics.clone()));
        PipelineBuilder::new(
            Arc::new(VersionRegistry::standard().unwrap()),
            metrics,
            gate,
            limiter,
            logger,
            normalizer,
        )
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let builder = builder();
        let full = builder.build(&RouteConfig::mfa_protected().with_schema(Arc::new(Schema::new())));
        assert_eq!(
            full.stage_names(),
            vec!["versioning", "monitoring", "auth", "validation", "rate_limit"]
        );

        let bare = builder.build(&RouteConfig::public().unversioned().without_rate_limit());
        assert_eq!(bare.stage_names(), vec!["monitoring"]);
    }
}
