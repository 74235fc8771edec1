use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::clock::now_millis;
use crate::error::{GatewayError, GatewayResult};
use crate::logger::{AuditEvent, SecurityEvent, Severity};
use crate::metrics::AiMetric;
use crate::models::{CoverLetter, MfaMethod, MfaSettings, User};
use crate::pipeline::{PipelineRequest, RequestContext};
use crate::response::set_header;
use crate::services::Services;
use crate::stores::GenerationRequest;
use crate::validation::{FieldRule, FieldType, Schema};

/// Shared application state
pub type SharedState = Arc<Services>;

pub const X_CACHE: &str = "x-cache";

static MFA_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{6}$").expect("mfa code regex"));

pub fn cover_letter_schema() -> Schema {
    Schema::new()
        .field("jobTitle", FieldRule::required(FieldType::String).length(2, 100))
        .field("companyName", FieldRule::required(FieldType::String).length(2, 100))
        .field("jobDescription", FieldRule::required(FieldType::String).length(50, 10_000))
        .field(
            "tone",
            FieldRule::optional(FieldType::String).one_of(["professional", "enthusiastic", "formal", "casual"]),
        )
        .field("applicantName", FieldRule::optional(FieldType::String).max_length(100))
}

pub fn mfa_code_schema() -> Schema {
    Schema::new()
        .field("code", FieldRule::required(FieldType::String).pattern(MFA_CODE.clone()))
        .field("method", FieldRule::optional(FieldType::String).one_of(["totp", "sms", "email"]))
}

pub fn mfa_challenge_schema() -> Schema {
    Schema::new().field("method", FieldRule::required(FieldType::String).one_of(["totp", "sms", "email"]))
}

fn list_key(user_id: &str) -> String {
    format!("letters:list:{}", user_id)
}

fn require_admin(ctx: &RequestContext) -> GatewayResult<&User> {
    let user = ctx.require_user()?;
    if !user.is_admin() {
        return Err(GatewayError::Forbidden("Admin access required".to_string()));
    }
    Ok(user)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub id: String,
    pub email: String,
    pub name: String,
    pub tier: String,
    pub effective_tier: String,
    pub monthly_usage: u32,
    pub monthly_quota: Option<u32>,
    pub usage_reset_at: String,
    pub mfa_enabled: bool,
    pub api_version: Option<String>,
}

pub async fn health_check(State(services): State<SharedState>) -> impl IntoResponse {
    Json(services.health.check_health().await)
}

pub async fn readiness_check(State(services): State<SharedState>) -> impl IntoResponse {
    if services.health.is_ready().await {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready", "reason": "shared store unreachable" })),
        )
    }
}

/// `GET /api/v1/me`
pub async fn get_profile(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    _req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    let user = ctx.require_user()?;
    let effective = user.effective_tier(Utc::now());
    let mfa_enabled = services.users.get_mfa_settings(&user.id).await?.is_enabled();

    Ok(Json(ProfileResponse {
        id: user.id.clone(),
        email: user.email.clone(),
        name: user.name.clone(),
        tier: user.tier.to_string(),
        effective_tier: effective.to_string(),
        monthly_usage: user.monthly_usage,
        monthly_quota: effective.monthly_quota(),
        usage_reset_at: user.usage_reset_at.to_rfc3339(),
        mfa_enabled,
        api_version: ctx.api_version().map(str::to_string),
    })
    .into_response())
}

/// `GET /api/cover-letters`
pub async fn list_letters(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    _req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    let user = ctx.require_user()?;
    let key = list_key(&user.id);

    if let Some(letters) = services.cache.get_as::<Vec<CoverLetter>>(&key).await {
        let mut response = Json(json!({ "letters": letters, "count": letters.len() })).into_response();
        set_header(response.headers_mut(), X_CACHE, "HIT");
        return Ok(response);
    }

    let letters = services.letters.list_by_user(&user.id).await?;
    services
        .cache
        .set_as(&key, &letters, services.cache.default_ttl())
        .await;

    let mut response = Json(json!({ "letters": letters, "count": letters.len() })).into_response();
    set_header(response.headers_mut(), X_CACHE, "MISS");
    Ok(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateLetterBody {
    job_title: String,
    company_name: String,
    job_description: String,
    tone: Option<String>,
    applicant_name: Option<String>,
}

/// `POST /api/cover-letters`
pub async fn create_letter(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    _req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    let caller = ctx.require_user()?;
    let body: CreateLetterBody = ctx.body_as()?;
    let now = Utc::now();

    let mut user = services
        .users
        .get_user_by_id(&caller.id)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("user {}", caller.id)))?;
    if now >= user.usage_reset_at {
        user.monthly_usage = 0;
        user.usage_reset_at = now + ChronoDuration::days(30);
    }

    let tier = user.effective_tier(now);
    if let Some(quota) = tier.monthly_quota() {
        if user.monthly_usage >= quota {
            return Err(GatewayError::Http {
                status: StatusCode::FORBIDDEN,
                code: "QUOTA_EXCEEDED".to_string(),
                message: format!("Monthly limit of {} cover letters reached for the {} tier", quota, tier),
                details: Some(json!({
                    "quota": quota,
                    "used": user.monthly_usage,
                    "resetAt": user.usage_reset_at.to_rfc3339(),
                })),
            });
        }
    }

    let request = GenerationRequest {
        job_title: body.job_title,
        company_name: body.company_name,
        job_description: body.job_description,
        tone: body.tone.unwrap_or_else(|| "professional".to_string()),
        applicant_name: body.applicant_name.unwrap_or_else(|| user.name.clone()),
    };

    let started = Instant::now();
    let outcome = tokio::time::timeout(services.settings.request_timeout, services.generator.generate(&request))
        .await
        .unwrap_or_else(|_| Err(GatewayError::Timeout("AI generation timed out".to_string())));
    let elapsed = started.elapsed();

    services
        .metrics
        .record_ai(AiMetric {
            timestamp_ms: now_millis(),
            user_id: user.id.clone(),
            model: outcome
                .as_ref()
                .map(|g| g.model.clone())
                .unwrap_or_else(|_| "unknown".to_string()),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            success: outcome.is_ok(),
            tokens_used: outcome.as_ref().map(|g| g.tokens_used).unwrap_or(0),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        })
        .await;
    services
        .logger
        .performance("ai_generation", elapsed, json!({ "userId": user.id }));
    let generated = outcome?;

    let letter = services
        .letters
        .create(CoverLetter {
            id: Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            job_title: request.job_title,
            company_name: request.company_name,
            content: generated.content,
            model: generated.model,
            created_at: now,
        })
        .await?;

    user.monthly_usage += 1;
    let user = services.users.update_user(user).await?;
    services.cache.delete(&list_key(&user.id)).await;

    services
        .logger
        .audit(
            AuditEvent::new("cover_letter", "create")
                .user(user.id.as_str())
                .resource("cover_letter", letter.id.as_str())
                .new_values(json!({
                    "jobTitle": letter.job_title,
                    "companyName": letter.company_name,
                    "model": letter.model,
                })),
        )
        .await;
    services.logger.business(
        "cover_letter_generated",
        Some(user.id.as_str()),
        json!({ "tier": tier.as_str(), "tokensUsed": generated.tokens_used }),
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "letter": letter,
            "usage": { "used": user.monthly_usage, "quota": tier.monthly_quota() },
        })),
    )
        .into_response())
}

async fn owned_letter(services: &Services, ctx: &RequestContext, req: &PipelineRequest) -> GatewayResult<CoverLetter> {
    let user = ctx.require_user()?;
    let id = req
        .param("id")
        .ok_or_else(|| GatewayError::validation("Missing letter id"))?;
    match services.letters.get(id).await? {
        // other users' letters are indistinguishable from missing ones
        Some(letter) if letter.user_id == user.id || user.is_admin() => Ok(letter),
        _ => Err(GatewayError::NotFound(format!("Cover letter {} not found", id))),
    }
}

/// `GET /api/cover-letters/:id`
pub async fn get_letter(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    let letter = owned_letter(&services, &ctx, &req).await?;
    Ok(Json(letter).into_response())
}

/// `DELETE /api/cover-letters/:id`
pub async fn delete_letter(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    let user = ctx.require_user()?;
    let letter = owned_letter(&services, &ctx, &req).await?;
    services.letters.delete(&letter.id).await?;
    services.cache.delete(&list_key(&letter.user_id)).await;

    services
        .logger
        .audit(
            AuditEvent::new("cover_letter", "delete")
                .user(user.id.as_str())
                .resource("cover_letter", letter.id.as_str())
                .old_values(json!({
                    "jobTitle": letter.job_title,
                    "companyName": letter.company_name,
                })),
        )
        .await;

    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
struct MfaCodeBody {
    code: String,
    method: Option<MfaMethod>,
}

async fn check_code(services: &Services, ctx: &RequestContext, body: &MfaCodeBody) -> GatewayResult<MfaMethod> {
    let user = ctx.require_user()?;
    let accepted = match body.method {
        Some(method) => services
            .mfa
            .verify(&user.id, method, &body.code)
            .await?
            .then_some(method),
        None => services.mfa.verify_any(&user.id, &body.code).await,
    };

    accepted.ok_or_else(|| {
        services.logger.security(
            SecurityEvent::new("mfa_verification_failed", Severity::Medium)
                .user(Some(user.id.as_str()))
                .source(&ctx.client_ip, ctx.user_agent.as_deref()),
        );
        GatewayError::http(StatusCode::UNAUTHORIZED, "MFA_INVALID_CODE", "Invalid verification code")
    })
}

#[derive(Debug, Deserialize)]
struct MfaChallengeBody {
    method: MfaMethod,
}

/// `POST /api/mfa/challenge`: issues a one-time code for out-of-band delivery.
pub async fn issue_mfa_challenge(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    _req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    let user = ctx.require_user()?;
    let body: MfaChallengeBody = ctx.body_as()?;
    let verifier = services
        .code_verifier(body.method)
        .ok_or_else(|| GatewayError::validation("Unsupported MFA method"))?;
    let code = verifier.issue(&user.id);
    if !services.settings.environment.is_production() {
        tracing::debug!(user_id = %user.id, method = ?body.method, code = %code, "Issued MFA code");
    }

    Ok(Json(json!({
        "sent": true,
        "method": body.method,
        "expiresIn": services.settings.mfa_code_ttl.as_secs(),
    }))
    .into_response())
}

/// `POST /api/mfa/verify`
pub async fn verify_mfa(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    _req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    let user = ctx.require_user()?;
    let body: MfaCodeBody = ctx.body_as()?;
    let method = check_code(&services, &ctx, &body).await?;

    services.mfa.mark_verified(&user.id).await;
    services.logger.security(
        SecurityEvent::new("mfa_verified", Severity::Low)
            .user(Some(user.id.as_str()))
            .source(&ctx.client_ip, ctx.user_agent.as_deref())
            .details(json!({ "method": method })),
    );

    Ok(Json(json!({
        "verified": true,
        "method": method,
        "expiresIn": services.settings.mfa_session_ttl.as_secs(),
    }))
    .into_response())
}

/// `POST /api/mfa/disable`. Any enabled method's code is accepted.
pub async fn disable_mfa(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    _req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    let user = ctx.require_user()?;
    let body: MfaCodeBody = ctx.body_as()?;
    check_code(&services, &ctx, &body).await?;

    let previous = services.users.get_mfa_settings(&user.id).await?;
    services
        .users
        .update_mfa_settings(&user.id, MfaSettings::disabled())
        .await?;
    services.mfa.revoke(&user.id).await;

    services
        .logger
        .audit(
            AuditEvent::new("mfa", "disable")
                .user(user.id.as_str())
                .resource("mfa_settings", user.id.as_str())
                .old_values(serde_json::to_value(previous)?)
                .new_values(serde_json::to_value(MfaSettings::disabled())?),
        )
        .await;
    services.logger.security(
        SecurityEvent::new("mfa_disabled", Severity::High)
            .user(Some(user.id.as_str()))
            .source(&ctx.client_ip, ctx.user_agent.as_deref()),
    );

    Ok(Json(json!({ "mfaEnabled": false })).into_response())
}

/// `GET /admin/metrics?window=<secs>`
pub async fn admin_metrics(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    require_admin(&ctx)?;
    let window = req
        .query
        .get("window")
        .and_then(|w| w.parse::<u64>().ok())
        .filter(|w| *w > 0)
        .unwrap_or(300);

    let aggregated = services.metrics.latest(Duration::from_secs(window)).await;
    Ok(Json(json!({
        "windowSeconds": window,
        "metrics": aggregated,
        "cache": services.cache.stats(),
        "inFlight": services.metrics.in_flight(),
        "systemHealth": services.metrics.latest_health().await,
        "securityEvents": services.logger.security_event_count(),
    }))
    .into_response())
}

/// `GET /admin/alerts?active=true`
pub async fn admin_alerts(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    require_admin(&ctx)?;
    let alerts = if req.query.get("active").map(String::as_str) == Some("true") {
        services.alerting.active_alerts().await
    } else {
        services.alerting.alerts(100).await
    };
    Ok(Json(json!({ "alerts": alerts, "count": alerts.len() })).into_response())
}

/// `POST /admin/alerts/:id/resolve`
pub async fn resolve_alert(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    let admin = require_admin(&ctx)?;
    let id = req
        .param("id")
        .ok_or_else(|| GatewayError::validation("Missing alert id"))?;
    let alert = services.alerting.resolve(id, &admin.id).await?;

    services
        .logger
        .audit(
            AuditEvent::new("alert", "resolve")
                .user(admin.id.as_str())
                .resource("alert", alert.id.as_str())
                .new_values(json!({ "resolved": true })),
        )
        .await;

    Ok(Json(json!({ "alert": alert })).into_response())
}

/// `GET /admin/audit?userId=<id>&limit=<n>`
pub async fn admin_audit(
    services: Arc<Services>,
    ctx: Arc<RequestContext>,
    req: Arc<PipelineRequest>,
) -> GatewayResult<Response> {
    require_admin(&ctx)?;
    let limit = req
        .query
        .get("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(100)
        .min(1000);
    let events = services
        .logger
        .audit_trail(req.query.get("userId").map(String::as_str), limit)
        .await;
    Ok(Json(json!({ "events": events, "count": events.len() })).into_response())
}
