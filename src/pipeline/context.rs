use crate::error::{GatewayError, GatewayResult};
use crate::models::{Tier, User};
use crate::rate_limiter::RateLimitDecision;
use crate::versioning::ApiVersionDescriptor;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, Request};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A request with its body buffered, shared by every stage and the handler.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub path_params: HashMap<String, String>,
    pub body: Bytes,
    pub client_ip: String,
}

impl PipelineRequest {
    /// Buffers the body once, refusing anything over `body_limit` bytes.
    pub async fn from_request(
        request: Request,
        path_params: HashMap<String, String>,
        body_limit: usize,
    ) -> GatewayResult<Self> {
        let (parts, body) = request.into_parts();
        let client_ip = client_ip(&parts.headers, parts.extensions.get::<ConnectInfo<SocketAddr>>());
        let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .unwrap_or_default();
        let body = axum::body::to_bytes(body, body_limit).await.map_err(|_| {
            GatewayError::http(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                format!("Request body exceeds {} bytes", body_limit),
            )
        })?;

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            query,
            path_params,
            body,
            client_ip,
        })
    }

    /// A request built in code rather than read off the wire.
    pub fn new(method: Method, uri: &str) -> Self {
        let uri: Uri = uri.parse().unwrap_or_default();
        let query = Query::<HashMap<String, String>>::try_from_uri(&uri)
            .map(|Query(q)| q)
            .unwrap_or_default();
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            query,
            path_params: HashMap::new(),
            body: Bytes::new(),
            client_ip: "unknown".to_string(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = Bytes::from(body.to_string());
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.path_params.insert(name.to_string(), value.to_string());
        self
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
    }

    /// Parses the raw body as JSON. An empty body reads as `null`.
    pub fn json_body(&self) -> GatewayResult<Value> {
        if self.body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| GatewayError::validation(format!("Invalid JSON body: {}", e)))
    }
}

/// Forwarding headers first, then the socket address.
pub fn client_ip(headers: &HeaderMap, connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return first_ip.to_string();
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.trim().to_string();
        }
    }

    match connect_info {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageTiming {
    pub name: &'static str,
    pub duration: Duration,
}

/// Values stages accumulate for headers and metric records.
#[derive(Debug, Clone, Default)]
pub struct ContextMetrics {
    pub stage_timings: Vec<StageTiming>,
    pub rate_limit: Option<RateLimitDecision>,
    pub user_tier: Option<Tier>,
    pub in_flight: bool,
}

/// Per-request state. Created at pipeline entry and only ever added to.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub started_at: Instant,
    pub method: Method,
    pub path: String,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub metrics: ContextMetrics,
    user: Option<User>,
    api_version: Option<String>,
    version_info: Option<ApiVersionDescriptor>,
    body: Option<Value>,
    response_headers: Vec<(&'static str, String)>,
}

impl RequestContext {
    pub fn new(request: &PipelineRequest) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            started_at: Instant::now(),
            method: request.method.clone(),
            path: request.path().to_string(),
            client_ip: request.client_ip.clone(),
            user_agent: request.user_agent().map(str::to_string),
            metrics: ContextMetrics::default(),
            user: None,
            api_version: None,
            version_info: None,
            body: None,
            response_headers: Vec::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    /// The authenticated user, or an authentication error.
    pub fn require_user(&self) -> GatewayResult<&User> {
        self.user
            .as_ref()
            .ok_or_else(|| GatewayError::Unauthorized("authentication required".to_string()))
    }

    /// Records the resolved identity; a second call is ignored.
    pub fn set_user(&mut self, user: User, tier: Tier) {
        if self.user.is_none() {
            self.user = Some(user);
            self.metrics.user_tier = Some(tier);
        }
    }

    pub fn api_version(&self) -> Option<&str> {
        self.api_version.as_deref()
    }

    pub fn version_info(&self) -> Option<&ApiVersionDescriptor> {
        self.version_info.as_ref()
    }

    /// Records the negotiated version; a second call is ignored.
    pub fn set_version(&mut self, info: ApiVersionDescriptor) {
        if self.api_version.is_none() {
            self.api_version = Some(info.version.clone());
            self.version_info = Some(info);
        }
    }

    /// The validated body, upgraded to the current API version.
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> GatewayResult<T> {
        let body = self
            .body
            .clone()
            .ok_or_else(|| GatewayError::validation("Request body is required"))?;
        serde_json::from_value(body)
            .map_err(|e| GatewayError::validation(format!("Invalid request body: {}", e)))
    }

    pub fn set_body(&mut self, body: Value) {
        if self.body.is_none() {
            self.body = Some(body);
        }
    }

    pub fn add_response_header(&mut self, name: &'static str, value: String) {
        self.response_headers.push((name, value));
    }

    pub fn response_headers(&self) -> &[(&'static str, String)] {
        &self.response_headers
    }

    pub fn record_stage(&mut self, name: &'static str, duration: Duration) {
        self.metrics.stage_timings.push(StageTiming { name, duration });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use axum::body::Body;
    use chrono::Utc;

    fn user(id: &str) -> User {
        User {
            id: id.into(),
            email: format!("{}@example.com", id),
            name: id.into(),
            tier: Tier::Premium,
            role: Role::User,
            subscription_expiry: None,
            monthly_usage: 0,
            usage_reset_at: Utc::now(),
        }
    }

    #[test]
    fn test_client_ip_precedence() {
        let mut headers = HeaderMap::new();
        let addr = ConnectInfo("10.1.1.1:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(client_ip(&headers, Some(&addr)), "10.1.1.1");
        assert_eq!(client_ip(&headers, None), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));
        assert_eq!(client_ip(&headers, Some(&addr)), "203.0.113.1");

        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1, 10.0.0.1"));
        assert_eq!(client_ip(&headers, Some(&addr)), "192.168.1.1");
    }

    #[test]
    fn test_context_fields_are_set_once() {
        let request = PipelineRequest::new(Method::GET, "/api/v1/me");
        let mut ctx = RequestContext::new(&request);
        assert!(ctx.require_user().is_err());

        ctx.set_user(user("u1"), Tier::Premium);
        ctx.set_user(user("u2"), Tier::Free);
        assert_eq!(ctx.user().unwrap().id, "u1");
        assert_eq!(ctx.metrics.user_tier, Some(Tier::Premium));

        ctx.set_body(serde_json::json!({"a": 1}));
        ctx.set_body(serde_json::json!({"a": 2}));
        assert_eq!(ctx.body().unwrap()["a"], 1);
    }

    #[tokio::test]
    async fn test_from_request_buffers_and_parses_query() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/cover-letters?version=1&draft=true")
            .header("x-forwarded-for", "198.51.100.7")
            .body(Body::from(r#"{"jobTitle":"Engineer"}"#))
            .unwrap();
        let req = PipelineRequest::from_request(request, HashMap::new(), 1024)
            .await
            .unwrap();
        assert_eq!(req.query.get("version").map(String::as_str), Some("1"));
        assert_eq!(req.client_ip, "198.51.100.7");
        assert_eq!(req.json_body().unwrap()["jobTitle"], "Engineer");
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let request = Request::builder()
            .uri("/")
            .body(Body::from(vec![b'x'; 2048]))
            .unwrap();
        let err = PipelineRequest::from_request(request, HashMap::new(), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Http { status, .. } if status == StatusCode::PAYLOAD_TOO_LARGE));
    }
}
