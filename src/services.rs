//! Process-wide services, constructed once and shared by every route.

use crate::alerting::{AlertSeverity, AlertingEngine, LogChannel, WebhookChannel};
use crate::auth::AuthGate;
use crate::cache::MultiLevelCache;
use crate::config::Settings;
use crate::error::GatewayResult;
use crate::health::HealthChecker;
use crate::logger::StructuredLogger;
use crate::metrics::MetricsCollector;
use crate::mfa::{CodeVerifier, IssuedCodeVerifier, MfaService};
use crate::models::MfaMethod;
use crate::normalizer::ErrorNormalizer;
use crate::pipeline::PipelineBuilder;
use crate::rate_limiter::TieredRateLimiter;
use crate::store::{MemoryStore, RedisStore, SharedStore};
use crate::stores::{
    CoverLetterStore, GenerationService, MemoryCoverLetterStore, MemoryUserStore, TemplateGenerator, UserStore,
};
use crate::tasks::TaskGroup;
use crate::versioning::VersionRegistry;
use std::sync::Arc;
use tracing::{info, warn};

/// Opens the shared tier: Redis when configured and reachable, otherwise
/// an in-process store.
pub async fn shared_store(settings: &Settings) -> Arc<dyn SharedStore> {
    let Some(url) = &settings.redis_url else {
        info!("No Redis URL configured, using the in-process shared store");
        return Arc::new(MemoryStore::new());
    };
    match RedisStore::connect(url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, "Redis unavailable, falling back to the in-process shared store");
            Arc::new(MemoryStore::new())
        }
    }
}

/// External systems the routes talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub users: Arc<dyn UserStore>,
    pub letters: Arc<dyn CoverLetterStore>,
    pub generator: Arc<dyn GenerationService>,
}

impl Collaborators {
    /// In-memory stores and the offline template generator.
    pub fn memory(users: Arc<MemoryUserStore>) -> Self {
        Self {
            users,
            letters: Arc::new(MemoryCoverLetterStore::new()),
            generator: Arc::new(TemplateGenerator::new()),
        }
    }
}

pub struct Services {
    pub settings: Settings,
    pub store: Arc<dyn SharedStore>,
    pub cache: Arc<MultiLevelCache>,
    pub metrics: Arc<MetricsCollector>,
    pub logger: Arc<StructuredLogger>,
    pub alerting: Arc<AlertingEngine>,
    pub limiter: Arc<TieredRateLimiter>,
    pub versions: Arc<VersionRegistry>,
    pub mfa: Arc<MfaService>,
    pub gate: Arc<AuthGate>,
    pub normalizer: Arc<ErrorNormalizer>,
    pub health: HealthChecker,
    pub users: Arc<dyn UserStore>,
    pub letters: Arc<dyn CoverLetterStore>,
    pub generator: Arc<dyn GenerationService>,
    verifiers: Vec<Arc<IssuedCodeVerifier>>,
    tasks: TaskGroup,
}

impl Services {
    pub fn new(settings: Settings, store: Arc<dyn SharedStore>, collaborators: Collaborators) -> GatewayResult<Self> {
        let metrics = Arc::new(MetricsCollector::new(settings.metrics_max_samples));
        let logger = Arc::new(
            StructuredLogger::new("covergate", settings.audit_capacity)
                .with_slow_threshold(settings.slow_operation_threshold),
        );
        let cache = Arc::new(MultiLevelCache::new(store.clone(), settings.cache_config()).with_metrics(metrics.clone()));

        let mut alerting = AlertingEngine::new(metrics.clone(), cache.clone())
            .with_window(settings.alert_poll_interval.max(settings.metrics_flush_interval))
            .with_channel(Arc::new(LogChannel::new(AlertSeverity::Low)));
        if let Some(url) = &settings.alert_webhook_url {
            alerting = alerting.with_channel(Arc::new(WebhookChannel::new(url.clone(), AlertSeverity::Medium)?));
        }

        let limiter = Arc::new(TieredRateLimiter::new(
            store.clone(),
            settings.tier_limits(),
            settings.rate_limit_backend_policy,
        ));

        let verifiers: Vec<Arc<IssuedCodeVerifier>> = [MfaMethod::Totp, MfaMethod::Sms, MfaMethod::Email]
            .into_iter()
            .map(|method| Arc::new(IssuedCodeVerifier::new(method, settings.mfa_code_ttl)))
            .collect();
        let mfa = Arc::new(verifiers.iter().fold(
            MfaService::new(cache.clone(), settings.mfa_session_ttl),
            |service, verifier| service.with_verifier(verifier.clone()),
        ));

        let gate = Arc::new(AuthGate::new(collaborators.users.clone(), mfa.clone(), logger.clone()));
        let normalizer = Arc::new(ErrorNormalizer::new(settings.environment, logger.clone(), metrics.clone()));
        let health = HealthChecker::new(store.clone(), metrics.clone());

        Ok(Self {
            store,
            cache,
            metrics,
            logger,
            alerting: Arc::new(alerting),
            limiter,
            versions: Arc::new(VersionRegistry::standard()?),
            mfa,
            gate,
            normalizer,
            health,
            users: collaborators.users,
            letters: collaborators.letters,
            generator: collaborators.generator,
            verifiers,
            tasks: TaskGroup::new(),
            settings,
        })
    }

    /// Everything in memory; used by tests and the local-only mode.
    pub fn in_memory(settings: Settings, users: Arc<MemoryUserStore>) -> GatewayResult<Self> {
        Self::new(settings, Arc::new(MemoryStore::new()), Collaborators::memory(users))
    }

    pub fn pipelines(&self) -> PipelineBuilder {
        PipelineBuilder::new(
            self.versions.clone(),
            self.metrics.clone(),
            self.gate.clone(),
            self.limiter.clone(),
            self.logger.clone(),
            self.normalizer.clone(),
        )
        .with_body_limit(self.settings.max_body_bytes)
    }

    /// The verifier that issues codes for `method`.
    pub fn code_verifier(&self, method: MfaMethod) -> Option<&Arc<IssuedCodeVerifier>> {
        self.verifiers.iter().find(|v| v.method() == method)
    }

    /// Starts every background timer.
    pub fn start(&self) {
        let s = &self.settings;
        self.metrics.start(s.metrics_flush_interval, s.health_sample_interval);
        self.tasks.push(self.cache.start_sweeper(s.cache_sweep_interval));
        self.limiter.start(s.rate_limit_cleanup_interval);
        self.alerting.start(s.alert_poll_interval);
        info!(backend = self.store.backend(), "Background services started");
    }

    pub fn stop(&self) {
        self.alerting.stop();
        self.limiter.stop();
        self.tasks.stop_all();
        self.metrics.stop();
        info!("Background services stopped");
    }
}
