use super::{Flow, Middleware, PipelineRequest, RequestContext};
use crate::auth::{AuthFailure, AuthGate, AuthOutcome, AuthRequirement};
use crate::error::GatewayResult;
use crate::logger::{SecurityEvent, Severity, StructuredLogger};
use crate::metrics::MetricsCollector;
use crate::rate_limiter::TieredRateLimiter;
use crate::response::{mfa_required_response, rate_limited_response, ErrorEnvelope};
use crate::validation::{RequestValidator, Schema};
use crate::versioning::{VersionRegistry, VersionStatus};
use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Negotiates the API version and rejects unknown or sunset ones.
pub struct VersioningStage {
    registry: Arc<VersionRegistry>,
}

impl VersioningStage {
    pub fn new(registry: Arc<VersionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Middleware for VersioningStage {
    fn name(&self) -> &'static str {
        "versioning"
    }

    async fn process(&self, req: &PipelineRequest, ctx: &mut RequestContext) -> GatewayResult<Flow> {
        let requested = self.registry.extract_version(&req.headers, &req.query);
        let info = self.registry.resolve(&requested)?.clone();

        if info.status == VersionStatus::Deprecated {
            warn!(
                request_id = %ctx.request_id,
                version = %info.version,
                path = %ctx.path,
                "Deprecated API version in use"
            );
        }
        for (name, value) in self.registry.response_headers(&info) {
            ctx.add_response_header(name, value);
        }
        ctx.set_version(info);
        Ok(Flow::Continue)
    }
}

/// Tracks the request as in flight.
pub struct MonitoringStage {
    metrics: Arc<MetricsCollector>,
}

impl MonitoringStage {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Middleware for MonitoringStage {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    async fn process(&self, _req: &PipelineRequest, ctx: &mut RequestContext) -> GatewayResult<Flow> {
        self.metrics.request_started();
        ctx.metrics.in_flight = true;
        debug!(
            request_id = %ctx.request_id,
            in_flight = self.metrics.in_flight(),
            "Request admitted"
        );
        Ok(Flow::Continue)
    }
}

pub struct AuthStage {
    gate: Arc<AuthGate>,
    requirement: AuthRequirement,
}

impl AuthStage {
    pub fn new(gate: Arc<AuthGate>, requirement: AuthRequirement) -> Self {
        Self { gate, requirement }
    }
}

#[async_trait]
impl Middleware for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn process(&self, req: &PipelineRequest, ctx: &mut RequestContext) -> GatewayResult<Flow> {
        match self.gate.check(&req.headers, &ctx.client_ip, self.requirement).await {
            AuthOutcome::Authenticated(user) => {
                let tier = user.effective_tier(Utc::now());
                ctx.set_user(user, tier);
                Ok(Flow::Continue)
            }
            AuthOutcome::Anonymous => Ok(Flow::Continue),
            AuthOutcome::Rejected(AuthFailure::MfaRequired) => Ok(Flow::Respond(mfa_required_response())),
            AuthOutcome::Rejected(_) => Ok(Flow::Respond(
                ErrorEnvelope::new("AUTH_ERROR", "Authentication required").respond(StatusCode::UNAUTHORIZED),
            )),
        }
    }
}

/// Parses, upgrades and checks the JSON body against a schema.
///
/// Bodies sent against an older API version are migrated to the current
/// version first, so the schema and the handler only ever see current shapes.
pub struct ValidationStage {
    schema: Arc<Schema>,
    registry: Arc<VersionRegistry>,
}

impl ValidationStage {
    pub fn new(schema: Arc<Schema>, registry: Arc<VersionRegistry>) -> Self {
        Self { schema, registry }
    }
}

#[async_trait]
impl Middleware for ValidationStage {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn process(&self, req: &PipelineRequest, ctx: &mut RequestContext) -> GatewayResult<Flow> {
        let body = match req.json_body() {
            Ok(body) => body,
            Err(_) => {
                return Ok(Flow::Respond(
                    ErrorEnvelope::new("VALIDATION_ERROR", "Request body is not valid JSON")
                        .respond(StatusCode::BAD_REQUEST),
                ))
            }
        };

        let current = self.registry.current().version.clone();
        let body = match ctx.api_version() {
            Some(version) if version != current => self.registry.transform(&body, version, &current),
            _ => body,
        };

        let errors = RequestValidator::validate(&body, &self.schema);
        if !errors.is_empty() {
            debug!(request_id = %ctx.request_id, errors = errors.len(), "Request body rejected");
            return Ok(Flow::Respond(
                ErrorEnvelope::new("VALIDATION_ERROR", "Validation failed")
                    .with_details(Some(json!({ "errors": errors })))
                    .respond(StatusCode::BAD_REQUEST),
            ));
        }

        ctx.set_body(body);
        Ok(Flow::Continue)
    }
}

/// Applies the caller's tier limit; anonymous callers are limited by IP.
pub struct RateLimitStage {
    limiter: Arc<TieredRateLimiter>,
    logger: Arc<StructuredLogger>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<TieredRateLimiter>, logger: Arc<StructuredLogger>) -> Self {
        Self { limiter, logger }
    }
}

#[async_trait]
impl Middleware for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn process(&self, _req: &PipelineRequest, ctx: &mut RequestContext) -> GatewayResult<Flow> {
        let checked = self.limiter.check(ctx.user(), &ctx.client_ip).await;
        ctx.metrics.rate_limit = Some(checked.decision);
        if ctx.metrics.user_tier.is_none() {
            ctx.metrics.user_tier = Some(checked.tier);
        }

        if checked.decision.allowed {
            return Ok(Flow::Continue);
        }

        self.logger.security(
            SecurityEvent::new("rate_limit_exceeded", Severity::Medium)
                .user(ctx.user().map(|u| u.id.as_str()))
                .source(&ctx.client_ip, ctx.user_agent.as_deref())
                .details(json!({
                    "tier": checked.tier.as_str(),
                    "identity": checked.identity,
                    "limit": checked.decision.limit,
                    "path": ctx.path,
                })),
        );
        Ok(Flow::Respond(rate_limited_response(&checked.decision)))
    }
}
