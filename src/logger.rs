//! Structured event logging.
//!
//! All events go through `tracing`; each channel has its own target so they
//! can be filtered or routed separately:
//!
//! | channel     | target                   |
//! |-------------|--------------------------|
//! | performance | `covergate::performance` |
//! | security    | `covergate::security`    |
//! | business    | `covergate::business`    |
//! | audit       | `covergate::audit`       |
//!
//! Audit events are additionally kept in an in-memory, append-only trail with
//! sensitive values replaced by digests.

use crate::clock::now_rfc3339;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Field names whose values never reach a log or the audit trail verbatim.
/// Compared against field names lowercased with `_` and `-` removed.
const SENSITIVE_FIELDS: [&str; 14] = [
    "password",
    "token",
    "accesstoken",
    "refreshtoken",
    "sessiontoken",
    "secret",
    "apikey",
    "authorization",
    "cookie",
    "code",
    "mfacode",
    "ssn",
    "cardnumber",
    "totpsecret",
];

static IPV4: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.\d{1,3}$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A security-relevant occurrence (auth outcome, rate-limit rejection, ...).
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub event: String,
    pub severity: Severity,
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: Value,
}

impl SecurityEvent {
    pub fn new(event: impl Into<String>, severity: Severity) -> Self {
        Self {
            event: event.into(),
            severity,
            user_id: None,
            ip: None,
            user_agent: None,
            details: Value::Null,
        }
    }

    pub fn user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self
    }

    /// Records the source; the IP is redacted on the way in.
    pub fn source(mut self, ip: &str, user_agent: Option<&str>) -> Self {
        self.ip = Some(redact_ip(ip));
        self.user_agent = user_agent.map(str::to_string);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event_type: String,
    pub action: String,
    pub user_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub success: bool,
    pub timestamp: String,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            action: action.into(),
            user_id: None,
            resource_type: None,
            resource_id: None,
            old_values: None,
            new_values: None,
            success: true,
            timestamp: now_rfc3339(),
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn old_values(mut self, values: Value) -> Self {
        self.old_values = Some(values);
        self
    }

    pub fn new_values(mut self, values: Value) -> Self {
        self.new_values = Some(values);
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

pub struct StructuredLogger {
    service: String,
    slow_threshold: Duration,
    audit_capacity: usize,
    audit_trail: RwLock<VecDeque<AuditEvent>>,
    security_events: AtomicU64,
}

impl StructuredLogger {
    pub fn new(service: impl Into<String>, audit_capacity: usize) -> Self {
        Self {
            service: service.into(),
            slow_threshold: Duration::from_secs(1),
            audit_capacity: audit_capacity.max(1),
            audit_trail: RwLock::new(VecDeque::new()),
            security_events: AtomicU64::new(0),
        }
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Timing of an operation; anything over the slow threshold is a warning.
    pub fn performance(&self, operation: &str, duration: Duration, fields: Value) {
        let duration_ms = duration.as_secs_f64() * 1000.0;
        if duration > self.slow_threshold {
            warn!(
                target: "covergate::performance",
                service = %self.service,
                operation,
                duration_ms,
                fields = %fields,
                "Slow operation"
            );
        } else {
            debug!(
                target: "covergate::performance",
                service = %self.service,
                operation,
                duration_ms,
                fields = %fields,
                "Operation timing"
            );
        }
    }

    pub fn security(&self, event: SecurityEvent) {
        self.security_events.fetch_add(1, Ordering::Relaxed);
        let details = redact_value(&event.details);
        let user_id = event.user_id.as_deref().unwrap_or("-");
        let ip = event.ip.as_deref().unwrap_or("-");
        let user_agent = event.user_agent.as_deref().unwrap_or("-");

        match event.severity {
            Severity::Low => info!(
                target: "covergate::security",
                service = %self.service,
                event = %event.event,
                severity = %event.severity,
                user_id,
                ip,
                user_agent,
                details = %details,
                "Security event"
            ),
            Severity::Medium => warn!(
                target: "covergate::security",
                service = %self.service,
                event = %event.event,
                severity = %event.severity,
                user_id,
                ip,
                user_agent,
                details = %details,
                "Security event"
            ),
            Severity::High | Severity::Critical => error!(
                target: "covergate::security",
                service = %self.service,
                event = %event.event,
                severity = %event.severity,
                user_id,
                ip,
                user_agent,
                details = %details,
                "Security event"
            ),
        }
    }

    pub fn business(&self, event: &str, user_id: Option<&str>, data: Value) {
        info!(
            target: "covergate::business",
            service = %self.service,
            event,
            user_id = user_id.unwrap_or("-"),
            data = %redact_value(&data),
            "Business event"
        );
    }

    /// Appends to the audit trail. Values are redacted before storage.
    pub async fn audit(&self, mut event: AuditEvent) {
        event.old_values = event.old_values.as_ref().map(redact_value);
        event.new_values = event.new_values.as_ref().map(redact_value);

        info!(
            target: "covergate::audit",
            service = %self.service,
            event_type = %event.event_type,
            action = %event.action,
            user_id = event.user_id.as_deref().unwrap_or("-"),
            resource_type = event.resource_type.as_deref().unwrap_or("-"),
            resource_id = event.resource_id.as_deref().unwrap_or("-"),
            success = event.success,
            "Audit event"
        );

        let mut trail = self.audit_trail.write().await;
        if trail.len() >= self.audit_capacity {
            trail.pop_front();
        }
        trail.push_back(event);
    }

    /// Most recent audit events first, optionally for one user.
    pub async fn audit_trail(&self, user_id: Option<&str>, limit: usize) -> Vec<AuditEvent> {
        let trail = self.audit_trail.read().await;
        trail
            .iter()
            .rev()
            .filter(|e| user_id.is_none() || e.user_id.as_deref() == user_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn security_event_count(&self) -> u64 {
        self.security_events.load(Ordering::Relaxed)
    }
}

/// Masks the host part of an address: `203.0.113.7` becomes `203.0.113.xxx`.
pub fn redact_ip(ip: &str) -> String {
    if let Some(caps) = IPV4.captures(ip) {
        return format!("{}.{}.{}.xxx", &caps[1], &caps[2], &caps[3]);
    }
    if ip.contains(':') {
        let prefix: Vec<&str> = ip.split(':').take(4).collect();
        return format!("{}:xxxx", prefix.join(":"));
    }
    ip.to_string()
}

/// Short, stable digest used in place of a sensitive value.
pub fn digest(value: &str) -> String {
    let hash = Sha256::digest(value.as_bytes());
    format!("sha256:{}", &hex::encode(hash)[..12])
}

/// Copies `value`, hashing every field whose name looks sensitive.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, v) in map {
                let normalized: String = key
                    .chars()
                    .filter(|c| *c != '_' && *c != '-')
                    .collect::<String>()
                    .to_lowercase();
                let sensitive = SENSITIVE_FIELDS.contains(&normalized.as_str());
                let redacted = if sensitive && !v.is_null() {
                    let raw = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Value::String(digest(&raw))
                } else {
                    redact_value(v)
                };
                out.insert(key.clone(), redacted);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redact_ip() {
        assert_eq!(redact_ip("192.168.1.42"), "192.168.1.xxx");
        assert_eq!(redact_ip("2001:db8:85a3:0:0:8a2e:370:7334"), "2001:db8:85a3:0:xxxx");
        assert_eq!(redact_ip("unknown"), "unknown");
    }

    #[test]
    fn test_redact_value_hashes_nested_secrets() {
        let value = json!({
            "email": "a@b.c",
            "password": "hunter2",
            "profile": { "apiKey": "abc", "name": "Ada" },
            "list": [{ "token": "t" }],
            "tokens_used": 420
        });
        let redacted = redact_value(&value);
        assert_eq!(redacted["email"], "a@b.c");
        assert_eq!(redacted["password"], digest("hunter2"));
        assert_eq!(redacted["profile"]["apiKey"], digest("abc"));
        assert_eq!(redacted["profile"]["name"], "Ada");
        assert!(redacted["list"][0]["token"].as_str().unwrap().starts_with("sha256:"));
        assert_eq!(redacted["tokens_used"], 420);
    }

    #[tokio::test]
    async fn test_audit_trail_is_redacted_and_ordered() {
        let logger = StructuredLogger::new("test", 10);
        logger
            .audit(
                AuditEvent::new("user", "update")
                    .user("u1")
                    .resource("user", "u1")
                    .old_values(json!({ "password": "old" }))
                    .new_values(json!({ "password": "new", "name": "Ada" })),
            )
            .await;
        logger.audit(AuditEvent::new("letter", "create").user("u2")).await;

        let all = logger.audit_trail(None, 10).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].action, "create");

        let mine = logger.audit_trail(Some("u1"), 10).await;
        assert_eq!(mine.len(), 1);
        let new_values = mine[0].new_values.as_ref().unwrap();
        assert_eq!(new_values["name"], "Ada");
        assert_ne!(new_values["password"], "new");
    }

    #[tokio::test]
    async fn test_audit_trail_capacity() {
        let logger = StructuredLogger::new("test", 2);
        for i in 0..3 {
            logger.audit(AuditEvent::new("e", format!("a{}", i))).await;
        }
        let trail = logger.audit_trail(None, 10).await;
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[1].action, "a1");
    }

    #[test]
    fn test_security_event_counter() {
        let logger = StructuredLogger::new("test", 10);
        logger.security(
            SecurityEvent::new("login_failed", Severity::Medium)
                .source("10.0.0.1", Some("curl"))
                .details(json!({ "reason": "bad token" })),
        );
        assert_eq!(logger.security_event_count(), 1);
    }
}
