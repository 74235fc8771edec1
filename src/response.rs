use crate::clock::now_rfc3339;
use crate::rate_limiter::RateLimitDecision;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_RESPONSE_TIME: &str = "x-response-time";
pub const X_HANDLER_TIME: &str = "x-handler-time";
pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
pub const X_USER_TIER: &str = "x-user-tier";
pub const X_ERROR_ID: &str = "x-error-id";
pub const RETRY_AFTER: &str = "retry-after";

/// Sets `name` to `value`, skipping values that are not valid header text.
pub fn set_header(headers: &mut HeaderMap, name: &str, value: impl AsRef<str>) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value.as_ref()),
    ) {
        headers.insert(name, value);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub id: String,
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// `{error: {id, message, code, details?}, timestamp}`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
    pub timestamp: String,
}

impl ErrorEnvelope {
    /// New envelope with a freshly generated error id.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                id: Uuid::new_v4().to_string(),
                message: message.into(),
                code: code.into(),
                details: None,
            },
            timestamp: now_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: Option<Value>) -> Self {
        self.error.details = details;
        self
    }

    pub fn id(&self) -> &str {
        &self.error.id
    }

    pub fn respond(self, status: StatusCode) -> Response {
        let id = self.error.id.clone();
        let mut response = (status, Json(self)).into_response();
        set_header(response.headers_mut(), X_ERROR_ID, id);
        response
    }
}

/// 401 telling the client to run an MFA challenge.
pub fn mfa_required_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "message": "Multi-factor authentication required",
                "code": "MFA_REQUIRED",
            },
            "mfaRequired": true,
            "timestamp": now_rfc3339(),
        })),
    )
        .into_response()
}

pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    set_header(headers, X_RATELIMIT_LIMIT, decision.limit.to_string());
    set_header(headers, X_RATELIMIT_REMAINING, decision.remaining.to_string());
    set_header(headers, X_RATELIMIT_RESET, decision.reset_at_secs().to_string());
}

/// 429 with the rate-limit headers and `Retry-After`.
pub fn rate_limited_response(decision: &RateLimitDecision) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": {
                "message": "Rate limit exceeded. Please try again later.",
                "code": "RATE_LIMIT_EXCEEDED",
            },
            "timestamp": now_rfc3339(),
            "retryAfter": decision.retry_after_secs,
        })),
    )
        .into_response();
    let headers = response.headers_mut();
    apply_rate_limit_headers(headers, decision);
    set_header(headers, RETRY_AFTER, decision.retry_after_secs.to_string());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_envelope_shape() {
        let envelope = ErrorEnvelope::new("NOT_FOUND", "Resource not found");
        let id = envelope.id().to_string();
        let response = envelope.respond(StatusCode::NOT_FOUND);

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[X_ERROR_ID], id.as_str());
        let body = body_json(response).await;
        assert_eq!(body["error"]["id"], id.as_str());
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert!(body["error"].get("details").is_none());
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_rate_limited_response_headers() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_at_ms: 1_700_000_000_500,
            retry_after_secs: 12,
        };
        let response = rate_limited_response(&decision);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "12");
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "10");
        assert_eq!(response.headers()[X_RATELIMIT_RESET], "1700000001");
        let body = body_json(response).await;
        assert_eq!(body["retryAfter"], 12);
        assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_mfa_required_body() {
        let response = mfa_required_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["mfaRequired"], true);
        assert_eq!(body["error"]["code"], "MFA_REQUIRED");
    }
}
