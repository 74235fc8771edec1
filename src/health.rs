use crate::clock::now_millis;
use crate::metrics::MetricsCollector;
use crate::store::SharedStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub in_flight_requests: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyStatus {
    pub shared_store: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub status: String,
    pub backend: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    store: Arc<dyn SharedStore>,
    metrics: Arc<MetricsCollector>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn SharedStore>, metrics: Arc<MetricsCollector>) -> Self {
        std::sync::LazyLock::force(&START_TIME);
        Self { store, metrics }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let uptime = SystemTime::now()
            .duration_since(*START_TIME)
            .unwrap_or_default()
            .as_secs();

        let store_status = self.check_store().await;

        let overall_status = if store_status.status == "healthy" {
            "healthy"
        } else {
            "degraded" // limiter and cache fall back to local state
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now_millis() / 1000,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            in_flight_requests: self.metrics.in_flight(),
            dependencies: DependencyStatus {
                shared_store: store_status,
            },
        }
    }

    /// Ready once the shared store answers.
    pub async fn is_ready(&self) -> bool {
        self.store.ping().await.is_ok()
    }

    async fn check_store(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = self.store.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => ServiceStatus {
                status: "healthy".to_string(),
                backend: self.store.backend().to_string(),
                response_time_ms,
                error: None,
            },
            Err(e) => ServiceStatus {
                status: "unavailable".to_string(),
                backend: self.store.backend().to_string(),
                response_time_ms,
                error: Some(e.to_string()),
            },
        }
    }
}
