//! Threshold alerting over the metrics collector.
//!
//! Rules are evaluated against the latest aggregation window. A rule that
//! fires is silenced for its cooldown through a cache entry, so replicas
//! sharing the cache do not raise the same alert twice. Alerts stay active
//! until someone resolves them; nothing resolves automatically.

use crate::cache::{CacheTtl, MultiLevelCache};
use crate::clock::now_rfc3339;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::{AggregatedMetrics, MetricsCollector};
use crate::tasks::{PeriodicTask, TaskGroup};
use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

pub type AlertCondition = Arc<dyn Fn(&AggregatedMetrics) -> bool + Send + Sync>;

/// When to raise an alert, and how to word it.
///
/// `title` and `message` may reference `{errorRate}`, `{p95}`, `{p99}`,
/// `{requests}`, `{aiSuccessRate}`, `{aiFailures}`, `{cacheHitRate}` and
/// `{activeUsers}`.
#[derive(Clone)]
pub struct AlertRule {
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub condition: AlertCondition,
    pub title: String,
    pub message: String,
    pub cooldown: Duration,
    pub enabled: bool,
}

impl AlertRule {
    pub fn new<F>(alert_type: impl Into<String>, severity: AlertSeverity, condition: F) -> Self
    where
        F: Fn(&AggregatedMetrics) -> bool + Send + Sync + 'static,
    {
        let alert_type = alert_type.into();
        Self {
            title: alert_type.clone(),
            message: alert_type.clone(),
            alert_type,
            severity,
            condition: Arc::new(condition),
            cooldown: Duration::from_secs(300),
            enabled: true,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

impl fmt::Debug for AlertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertRule")
            .field("alert_type", &self.alert_type)
            .field("severity", &self.severity)
            .field("cooldown", &self.cooldown)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Rules shipped with the service.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new("high_error_rate", AlertSeverity::High, |m| {
            m.api.total >= 10 && m.api.error_rate > 0.05
        })
        .title("High API error rate")
        .message("Error rate is {errorRate}% across {requests} requests"),
        AlertRule::new("high_response_time", AlertSeverity::Medium, |m| {
            m.api.total >= 10 && m.api.p95_ms > 2000.0
        })
        .title("Slow API responses")
        .message("p95 response time is {p95}ms (p99 {p99}ms)"),
        AlertRule::new("ai_generation_failures", AlertSeverity::High, |m| {
            m.ai.total >= 5 && m.ai.success_rate < 0.9
        })
        .title("AI generation failures")
        .message("AI success rate dropped to {aiSuccessRate}% with {aiFailures} failures")
        .cooldown(Duration::from_secs(600)),
        AlertRule::new("low_cache_hit_rate", AlertSeverity::Low, |m| {
            m.cache.lookups >= 50 && m.cache.hit_rate < 0.5
        })
        .title("Low cache hit rate")
        .message("Cache hit rate is {cacheHitRate}%")
        .cooldown(Duration::from_secs(1800)),
    ]
}

fn render(template: &str, metrics: &AggregatedMetrics) -> String {
    let values: HashMap<&str, String> = HashMap::from([
        ("errorRate", format!("{:.1}", metrics.api.error_rate * 100.0)),
        ("p95", format!("{:.0}", metrics.api.p95_ms)),
        ("p99", format!("{:.0}", metrics.api.p99_ms)),
        ("requests", metrics.api.total.to_string()),
        ("aiSuccessRate", format!("{:.1}", metrics.ai.success_rate * 100.0)),
        ("aiFailures", metrics.ai.failure.to_string()),
        ("cacheHitRate", format!("{:.1}", metrics.cache.hit_rate * 100.0)),
        ("activeUsers", metrics.active_users.to_string()),
    ]);
    values.iter().fold(template.to_string(), |text, (name, value)| {
        text.replace(&format!("{{{}}}", name), value)
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub timestamp: String,
    pub resolved: bool,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<String>,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    fn accepts(&self, severity: AlertSeverity) -> bool;

    async fn send(&self, alert: &Alert) -> GatewayResult<()>;
}

/// Writes alerts to the log at a level matching their severity.
pub struct LogChannel {
    min_severity: AlertSeverity,
}

impl LogChannel {
    pub fn new(min_severity: AlertSeverity) -> Self {
        Self { min_severity }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn accepts(&self, severity: AlertSeverity) -> bool {
        severity >= self.min_severity
    }

    async fn send(&self, alert: &Alert) -> GatewayResult<()> {
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => error!(
                target: "covergate::alerts",
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                severity = alert.severity.as_str(),
                "{}: {}",
                alert.title,
                alert.message
            ),
            _ => warn!(
                target: "covergate::alerts",
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                severity = alert.severity.as_str(),
                "{}: {}",
                alert.title,
                alert.message
            ),
        }
        Ok(())
    }
}

/// Posts alerts as JSON to an HTTP endpoint.
pub struct WebhookChannel {
    client: Client,
    url: String,
    min_severity: AlertSeverity,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, min_severity: AlertSeverity) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("Failed to build webhook client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            min_severity,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn accepts(&self, severity: AlertSeverity) -> bool {
        severity >= self.min_severity
    }

    async fn send(&self, alert: &Alert) -> GatewayResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "alert": alert }))
            .send()
            .await
            .map_err(|e| GatewayError::Internal(format!("Webhook delivery failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(GatewayError::Internal(format!(
                "Webhook responded with {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub fn cooldown_key(alert_type: &str) -> String {
    format!("alert:cooldown:{}", alert_type)
}

const DEFAULT_HISTORY_CAPACITY: usize = 500;

pub struct AlertingEngine {
    metrics: Arc<MetricsCollector>,
    cache: Arc<MultiLevelCache>,
    rules: RwLock<Vec<AlertRule>>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    alerts: RwLock<VecDeque<Alert>>,
    history_capacity: usize,
    window: Duration,
    tasks: TaskGroup,
}

impl AlertingEngine {
    pub fn new(metrics: Arc<MetricsCollector>, cache: Arc<MultiLevelCache>) -> Self {
        Self {
            metrics,
            cache,
            rules: RwLock::new(default_rules()),
            channels: Vec::new(),
            alerts: RwLock::new(VecDeque::new()),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            window: Duration::from_secs(300),
            tasks: TaskGroup::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<AlertRule>) -> Self {
        self.rules = RwLock::new(rules);
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// The trailing window each poll aggregates over.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Alerts kept in memory. When full, the oldest resolved alert goes
    /// first, then the oldest active one.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub async fn add_rule(&self, rule: AlertRule) {
        self.rules.write().await.push(rule);
    }

    /// Returns false when no rule has that type.
    pub async fn set_rule_enabled(&self, alert_type: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write().await;
        match rules.iter_mut().find(|r| r.alert_type == alert_type) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Evaluates every enabled rule once and returns the alerts raised.
    pub async fn poll_once(&self) -> Vec<Alert> {
        let snapshot = self.metrics.latest(self.window).await;
        let rules: Vec<AlertRule> = self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect();

        let mut raised = Vec::new();
        for rule in rules {
            if !(rule.condition)(&snapshot) {
                continue;
            }
            let key = cooldown_key(&rule.alert_type);
            if self.cache.get(&key).await.is_some() {
                continue;
            }

            let alert = Alert {
                id: Uuid::new_v4().to_string(),
                alert_type: rule.alert_type.clone(),
                severity: rule.severity,
                title: render(&rule.title, &snapshot),
                message: render(&rule.message, &snapshot),
                timestamp: now_rfc3339(),
                resolved: false,
                resolved_at: None,
                resolved_by: None,
            };
            self.remember(alert.clone()).await;
            self.dispatch(&alert).await;
            self.cache
                .set(&key, json!(alert.id), CacheTtl::uniform(rule.cooldown))
                .await;
            raised.push(alert);
        }
        raised
    }

    async fn remember(&self, alert: Alert) {
        let mut alerts = self.alerts.write().await;
        if alerts.len() >= self.history_capacity {
            match alerts.iter().position(|a| a.resolved) {
                Some(index) => {
                    alerts.remove(index);
                }
                None => {
                    alerts.pop_front();
                }
            }
        }
        alerts.push_back(alert);
    }

    async fn dispatch(&self, alert: &Alert) {
        for channel in self.channels.iter().filter(|c| c.accepts(alert.severity)) {
            if let Err(e) = channel.send(alert).await {
                warn!(
                    channel = channel.name(),
                    alert_id = %alert.id,
                    error = %e,
                    "Alert notification failed"
                );
            }
        }
    }

    /// Marks an alert resolved. A second resolution is a conflict.
    pub async fn resolve(&self, id: &str, resolved_by: &str) -> GatewayResult<Alert> {
        let mut alerts = self.alerts.write().await;
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| GatewayError::NotFound(format!("Alert {} not found", id)))?;
        if alert.resolved {
            return Err(GatewayError::http(
                StatusCode::CONFLICT,
                "ALERT_ALREADY_RESOLVED",
                format!("Alert {} is already resolved", id),
            ));
        }
        alert.resolved = true;
        alert.resolved_at = Some(now_rfc3339());
        alert.resolved_by = Some(resolved_by.to_string());
        info!(alert_id = %id, resolved_by, "Alert resolved");
        Ok(alert.clone())
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    /// Most recent first.
    pub async fn alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts.read().await.iter().rev().take(limit).cloned().collect()
    }

    pub fn start(self: &Arc<Self>, interval: Duration) {
        let engine = self.clone();
        self.tasks.push(PeriodicTask::spawn("alert-poll", interval, move || {
            let engine = engine.clone();
            async move {
                let raised = engine.poll_once().await;
                if !raised.is_empty() {
                    info!(raised = raised.len(), "Alert rules fired");
                }
            }
        }));
    }

    pub fn stop(&self) {
        self.tasks.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::clock::now_millis;
    use crate::metrics::ApiMetric;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Recording {
        min: AlertSeverity,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl NotificationChannel for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn accepts(&self, severity: AlertSeverity) -> bool {
            severity >= self.min
        }

        async fn send(&self, _alert: &Alert) -> GatewayResult<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn record_requests(metrics: &MetricsCollector, ok: usize, failed: usize) {
        for i in 0..ok + failed {
            let success = i < ok;
            metrics
                .record_api(ApiMetric {
                    timestamp_ms: now_millis(),
                    request_id: format!("r{}", i),
                    method: "GET".into(),
                    endpoint: "/x".into(),
                    status_code: if success { 200 } else { 500 },
                    duration_ms: 10.0,
                    success,
                    user_id: None,
                    user_tier: None,
                    error_code: None,
                })
                .await;
        }
    }

    fn engine(metrics: Arc<MetricsCollector>) -> AlertingEngine {
        let cache = Arc::new(MultiLevelCache::new(Arc::new(MemoryStore::new()), CacheConfig::default()));
        AlertingEngine::new(metrics, cache)
    }

    #[test]
    fn test_template_placeholders() {
        let mut metrics = AggregatedMetrics::default();
        metrics.api.error_rate = 0.125;
        metrics.api.total = 40;
        assert_eq!(
            render("Error rate is {errorRate}% across {requests} requests", &metrics),
            "Error rate is 12.5% across 40 requests"
        );
    }

    #[tokio::test]
    async fn test_rule_fires_once_per_cooldown() {
        let metrics = Arc::new(MetricsCollector::new(1000));
        record_requests(&metrics, 8, 4).await;
        let channel = Arc::new(Recording {
            min: AlertSeverity::Low,
            sent: AtomicUsize::new(0),
        });
        let engine = engine(metrics).with_channel(channel.clone());

        let raised = engine.poll_once().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].alert_type, "high_error_rate");
        assert!(raised[0].message.contains("33.3%"));
        assert_eq!(channel.sent.load(Ordering::SeqCst), 1);

        assert!(engine.poll_once().await.is_empty());
        assert_eq!(engine.active_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_severity_filter_and_disabled_rules() {
        let metrics = Arc::new(MetricsCollector::new(1000));
        record_requests(&metrics, 8, 4).await;
        let critical_only = Arc::new(Recording {
            min: AlertSeverity::Critical,
            sent: AtomicUsize::new(0),
        });
        let engine = engine(metrics).with_channel(critical_only.clone());

        engine.poll_once().await;
        assert_eq!(critical_only.sent.load(Ordering::SeqCst), 0);

        let metrics = Arc::new(MetricsCollector::new(1000));
        record_requests(&metrics, 8, 4).await;
        let engine = self::engine(metrics);
        assert!(engine.set_rule_enabled("high_error_rate", false).await);
        assert!(!engine.set_rule_enabled("no_such_rule", false).await);
        assert!(engine.poll_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_exactly_once() {
        let metrics = Arc::new(MetricsCollector::new(1000));
        record_requests(&metrics, 8, 4).await;
        let engine = engine(metrics);
        let alert = engine.poll_once().await.remove(0);

        let resolved = engine.resolve(&alert.id, "admin-1").await.unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("admin-1"));
        assert!(engine.active_alerts().await.is_empty());

        match engine.resolve(&alert.id, "admin-2").await {
            Err(GatewayError::Http { status, code, .. }) => {
                assert_eq!(status, StatusCode::CONFLICT);
                assert_eq!(code, "ALERT_ALREADY_RESOLVED");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            engine.resolve("missing", "admin").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_alert_stays_active_after_condition_clears() {
        let firing = Arc::new(AtomicBool::new(true));
        let flag = firing.clone();
        let rule = AlertRule::new("flapping", AlertSeverity::High, move |_: &AggregatedMetrics| {
            flag.load(Ordering::SeqCst)
        })
        .cooldown(Duration::from_millis(1));
        let engine = engine(Arc::new(MetricsCollector::new(100))).with_rules(vec![rule]);

        let alert = engine.poll_once().await.remove(0);
        firing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(engine.poll_once().await.is_empty());

        let active = engine.active_alerts().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, alert.id);
        assert!(!active[0].resolved);
        assert!(active[0].resolved_at.is_none());
    }

    #[tokio::test]
    async fn test_history_drops_resolved_alerts_first() {
        let rule = AlertRule::new("always", AlertSeverity::Low, |_: &AggregatedMetrics| true)
            .cooldown(Duration::from_millis(1));
        let engine = engine(Arc::new(MetricsCollector::new(100)))
            .with_rules(vec![rule])
            .with_history_capacity(2);

        let mut ids = Vec::new();
        for _ in 0..2 {
            ids.push(engine.poll_once().await.remove(0).id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        engine.resolve(&ids[1], "admin").await.unwrap();

        let third = engine.poll_once().await.remove(0);
        let kept: Vec<String> = engine.alerts(10).await.into_iter().map(|a| a.id).collect();
        assert_eq!(kept, vec![third.id.clone(), ids[0].clone()]);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let fourth = engine.poll_once().await.remove(0);
        let kept: Vec<String> = engine.alerts(10).await.into_iter().map(|a| a.id).collect();
        assert_eq!(kept, vec![fourth.id, third.id]);
    }

    #[tokio::test]
    async fn test_quiet_window_raises_nothing() {
        let engine = engine(Arc::new(MetricsCollector::new(100)));
        assert!(engine.poll_once().await.is_empty());
    }
}
