use crate::clock::now_millis;
use crate::config::Environment;
use crate::error::{classify, ErrorKind, GatewayError};
use crate::logger::{redact_ip, SecurityEvent, Severity, StructuredLogger};
use crate::metrics::{ApiMetric, MetricsCollector};
use crate::pipeline::RequestContext;
use crate::response::{set_header, ErrorEnvelope, RETRY_AFTER};
use axum::response::Response;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

/// Turns any [`GatewayError`] into the uniform error envelope.
pub struct ErrorNormalizer {
    environment: Environment,
    logger: Arc<StructuredLogger>,
    metrics: Arc<MetricsCollector>,
}

impl ErrorNormalizer {
    pub fn new(environment: Environment, logger: Arc<StructuredLogger>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            environment,
            logger,
            metrics,
        }
    }

    /// Classifies, logs and records `err`, then renders it.
    pub async fn handle(&self, err: &GatewayError, ctx: Option<&RequestContext>) -> Response {
        let classification = classify(err);
        let hide_internals = self.environment.is_production() && classification.status.is_server_error();

        let (message, details) = match classification.kind {
            Some(kind) if hide_internals => (kind.public_message().to_string(), None),
            None if hide_internals => ("Internal server error".to_string(), None),
            _ => (classification.message.clone(), classification.details.clone()),
        };
        let envelope = ErrorEnvelope::new(&classification.code, message).with_details(details);
        let error_id = envelope.id().to_string();

        let request_id = ctx.map(|c| c.request_id.as_str()).unwrap_or("-");
        let method = ctx.map(|c| c.method.as_str()).unwrap_or("-");
        let path = ctx.map(|c| c.path.as_str()).unwrap_or("-");
        let user_id = ctx.and_then(|c| c.user()).map(|u| u.id.as_str());
        let tier = ctx.and_then(|c| c.metrics.user_tier);
        let ip = ctx.map(|c| redact_ip(&c.client_ip)).unwrap_or_else(|| "-".to_string());
        let user_agent = ctx.and_then(|c| c.user_agent.as_deref()).unwrap_or("-");
        let duration_ms = ctx.map(|c| c.elapsed().as_secs_f64() * 1000.0).unwrap_or(0.0);

        if classification.kind == Some(ErrorKind::Database) {
            error!(
                target: "covergate::database",
                error_id = %error_id,
                request_id,
                method,
                path,
                error = ?err,
                "Database failure while handling request"
            );
        } else {
            error!(
                error_id = %error_id,
                request_id,
                code = %classification.code,
                status = classification.status.as_u16(),
                method,
                path,
                user_id = user_id.unwrap_or("-"),
                tier = tier.map(|t| t.as_str()).unwrap_or("-"),
                ip = %ip,
                user_agent,
                duration_ms,
                error = ?err,
                "Request failed"
            );
        }

        if classification.kind == Some(ErrorKind::Authentication) {
            let mut event = SecurityEvent::new("auth_error", Severity::Medium)
                .user(user_id)
                .details(json!({ "errorId": error_id, "path": path }));
            if let Some(ctx) = ctx {
                event = event.source(&ctx.client_ip, ctx.user_agent.as_deref());
            }
            self.logger.security(event);
        }

        self.metrics
            .record_api(ApiMetric {
                timestamp_ms: now_millis(),
                request_id: request_id.to_string(),
                method: method.to_string(),
                endpoint: path.to_string(),
                status_code: classification.status.as_u16(),
                duration_ms,
                success: false,
                user_id: user_id.map(str::to_string),
                user_tier: tier,
                error_code: Some(classification.code.clone()),
            })
            .await;

        let mut response = envelope.respond(classification.status);
        if let GatewayError::RateLimited { retry_after_secs } = err {
            set_header(response.headers_mut(), RETRY_AFTER, retry_after_secs.to_string());
        }
        response
    }
}
