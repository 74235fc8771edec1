use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use covergate::config::Settings;
use covergate::models::{CoverLetter, MfaSettings, Role, Tier, User};
use covergate::pipeline::{handler, PipelineBuilder, PipelineRequest, RouteConfig};
use covergate::services::Services;
use covergate::stores::{CoverLetterStore, MemoryUserStore, UserStore};
use covergate::versioning::{VersionRegistry, VersionStatus};
use covergate::{create_app, GatewayError};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const DESCRIPTION: &str = "We are looking for an engineer to build reliable, observable backend services in Rust.";

struct TestApp {
    app: Router,
    services: Arc<Services>,
    users: Arc<MemoryUserStore>,
}

impl TestApp {
    fn new(extra_args: &[&str]) -> Self {
        let mut args = vec!["covergate", "--environment", "test"];
        args.extend_from_slice(extra_args);
        let settings = Settings::parse_from(args).validated().unwrap();
        let users = Arc::new(MemoryUserStore::new());
        let services = Arc::new(Services::in_memory(settings, users.clone()).unwrap());
        Self {
            app: create_app(services.clone()),
            services,
            users,
        }
    }

    /// Creates a user and returns a bearer token for them.
    async fn user(&self, id: &str, tier: Tier, role: Role) -> String {
        self.users
            .create_user(User {
                id: id.to_string(),
                email: format!("{}@example.com", id),
                name: format!("User {}", id),
                tier,
                role,
                subscription_expiry: None,
                monthly_usage: 0,
                usage_reset_at: Utc::now() + ChronoDuration::days(30),
            })
            .await
            .unwrap();
        let session = self.users.create_session(id, Duration::from_secs(3600)).await;
        session.token
    }

    async fn send(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, HeaderMap, Value) {
        self.send_with(method, uri, token, body, &[]).await
    }

    async fn send_with(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, HeaderMap, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, json)
    }
}

fn letter_body() -> Value {
    json!({
        "jobTitle": "Backend Engineer",
        "companyName": "Acme",
        "jobDescription": DESCRIPTION,
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = TestApp::new(&[]);
    let (status, _, body) = app.send(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["dependencies"]["sharedStore"]["backend"], "memory");

    let (status, _, body) = app.send(Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_observability_headers_on_success() {
    let app = TestApp::new(&[]);
    let token = app.user("u1", Tier::Premium, Role::User).await;

    let (status, headers, body) = app.send(Method::GET, "/api/v1/me", Some(&token), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "u1");
    assert_eq!(body["effectiveTier"], "premium");
    assert!(headers.contains_key("x-request-id"));
    assert!(headers["x-response-time"].to_str().unwrap().ends_with("ms"));
    assert!(headers.contains_key("x-handler-time"));
    assert_eq!(headers["x-ratelimit-limit"], "60");
    assert_eq!(headers["x-ratelimit-remaining"], "59");
    assert!(headers.contains_key("x-ratelimit-reset"));
    assert_eq!(headers["x-user-tier"], "premium");
    assert_eq!(headers["api-version"], "v2");
    assert_eq!(headers["api-current-version"], "v2");
}

#[tokio::test]
async fn test_missing_credentials_rejected() {
    let app = TestApp::new(&[]);
    let (status, headers, body) = app.send(Method::GET, "/api/v1/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "AUTH_ERROR");
    assert_eq!(headers["x-error-id"], body["error"]["id"].as_str().unwrap());
}

#[tokio::test]
async fn test_sunset_version_never_reaches_handler() {
    let app = TestApp::new(&[]);
    let token = app.user("u1", Tier::Free, Role::User).await;
    let services = &app.services;

    let mut registry = VersionRegistry::standard().unwrap();
    registry.advance_status("v1", VersionStatus::Sunset).unwrap();
    let pipelines = PipelineBuilder::new(
        Arc::new(registry),
        services.metrics.clone(),
        services.gate.clone(),
        services.limiter.clone(),
        services.logger.clone(),
        services.normalizer.clone(),
    );
    let pipeline = pipelines.build(&RouteConfig::authenticated());

    let calls = Arc::new(AtomicUsize::new(0));
    let spy = {
        let calls = calls.clone();
        handler(move |_ctx, _req| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, GatewayError>(StatusCode::OK.into_response())
            }
        })
    };

    let request = PipelineRequest::new(Method::GET, "/api/v1/me")
        .with_header("api-version", "v1")
        .with_header("authorization", &format!("Bearer {}", token));
    let response = pipeline.handle(request, spy.clone()).await;
    assert_eq!(response.status(), StatusCode::GONE);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "VERSION_SUNSET");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let request = PipelineRequest::new(Method::GET, "/api/v1/me")
        .with_header("api-version", "v2")
        .with_header("authorization", &format!("Bearer {}", token));
    let response = pipeline.handle(request, spy).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_version_is_bad_request() {
    let app = TestApp::new(&[]);
    let token = app.user("u1", Tier::Free, Role::User).await;
    let (status, _, body) = app
        .send(Method::GET, "/api/v1/me?version=7", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "UNSUPPORTED_VERSION");
}

#[tokio::test]
async fn test_validation_reports_three_errors() {
    let app = TestApp::new(&[]);
    let token = app.user("u1", Tier::Premium, Role::User).await;

    let (status, _, body) = app
        .send(
            Method::POST,
            "/api/cover-letters",
            Some(&token),
            Some(json!({ "jobTitle": "Engineer", "companyName": "A", "tone": "angry" })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    let errors = body["error"]["details"]["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[0], "companyName must be at least 2 characters");
    assert_eq!(errors[1], "jobDescription is required");
    assert!(errors[2].as_str().unwrap().starts_with("tone must be one of"));
}

#[tokio::test]
async fn test_create_then_list_uses_cache_and_invalidates() {
    let app = TestApp::new(&[]);
    let token = app.user("u1", Tier::Premium, Role::User).await;

    let (status, headers, body) = app.send(Method::GET, "/api/cover-letters", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    assert_eq!(headers["x-cache"], "MISS");

    let (_, headers, _) = app.send(Method::GET, "/api/cover-letters", Some(&token), None).await;
    assert_eq!(headers["x-cache"], "HIT");

    let (status, _, body) = app
        .send(Method::POST, "/api/cover-letters", Some(&token), Some(letter_body()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["letter"]["jobTitle"], "Backend Engineer");
    assert_eq!(body["usage"]["used"], 1);
    assert_eq!(body["usage"]["quota"], 50);
    let id = body["letter"]["id"].as_str().unwrap().to_string();

    let (_, headers, body) = app.send(Method::GET, "/api/cover-letters", Some(&token), None).await;
    assert_eq!(headers["x-cache"], "MISS");
    assert_eq!(body["count"], 1);

    let (status, _, body) = app
        .send(Method::GET, &format!("/api/cover-letters/{}", id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["companyName"], "Acme");

    let agg = app.services.metrics.latest(Duration::from_secs(60)).await;
    assert_eq!(agg.ai.total, 1);
    assert_eq!(agg.ai.success, 1);
}

#[tokio::test]
async fn test_old_version_payload_is_upgraded() {
    let app = TestApp::new(&[]);
    let token = app.user("u1", Tier::Premium, Role::User).await;

    let (status, headers, body) = app
        .send_with(
            Method::POST,
            "/api/cover-letters",
            Some(&token),
            Some(json!({
                "position": "Data Engineer",
                "company": "Globex",
                "description": DESCRIPTION,
                "format": "pdf",
            })),
            &[("api-version", "v1")],
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["letter"]["jobTitle"], "Data Engineer");
    assert_eq!(headers["api-version"], "v1");
    assert!(headers.contains_key("api-deprecation-warning"));
    assert!(headers.contains_key("sunset"));
}

#[tokio::test]
async fn test_free_quota_exhausted() {
    let app = TestApp::new(&[]);
    let token = app.user("u1", Tier::Free, Role::User).await;
    let mut user = app.users.get_user_by_id("u1").await.unwrap().unwrap();
    user.monthly_usage = 3;
    app.users.update_user(user).await.unwrap();

    let (status, _, body) = app
        .send(Method::POST, "/api/cover-letters", Some(&token), Some(letter_body()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");
    assert_eq!(body["error"]["details"]["quota"], 3);
}

#[tokio::test]
async fn test_error_envelopes_have_distinct_ids() {
    let app = TestApp::new(&[]);
    let token = app.user("u1", Tier::Premium, Role::User).await;

    let (first_status, first_headers, first) = app
        .send(Method::GET, "/api/cover-letters/missing", Some(&token), None)
        .await;
    let (_, _, second) = app
        .send(Method::GET, "/api/cover-letters/missing", Some(&token), None)
        .await;

    assert_eq!(first_status, StatusCode::NOT_FOUND);
    assert_eq!(first["error"]["code"], "NOT_FOUND");
    assert!(first["timestamp"].is_string());
    assert_eq!(first_headers["x-error-id"], first["error"]["id"].as_str().unwrap());
    assert!(first_headers.contains_key("x-request-id"));
    assert_ne!(first["error"]["id"], second["error"]["id"]);
}

#[tokio::test]
async fn test_rate_limit_exceeded_after_limit() {
    let app = TestApp::new(&["--rate-limit-free", "2"]);
    let token = app.user("u1", Tier::Free, Role::User).await;

    for remaining in ["1", "0"] {
        let (status, headers, _) = app.send(Method::GET, "/api/v1/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-ratelimit-remaining"], remaining);
    }

    let (status, headers, body) = app.send(Method::GET, "/api/v1/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert!(headers.contains_key("retry-after"));
    assert_eq!(headers["x-ratelimit-limit"], "2");
}

#[tokio::test]
async fn test_mfa_gate_then_verified_session() {
    let app = TestApp::new(&[]);
    let token = app.user("u1", Tier::Premium, Role::User).await;
    app.users
        .update_mfa_settings(
            "u1",
            MfaSettings {
                totp_enabled: true,
                ..MfaSettings::disabled()
            },
        )
        .await
        .unwrap();
    let letter = app
        .services
        .letters
        .create(CoverLetter {
            id: "l1".into(),
            user_id: "u1".into(),
            job_title: "Engineer".into(),
            company_name: "Acme".into(),
            content: "Dear Hiring Manager".into(),
            model: "template-v1".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let uri = format!("/api/cover-letters/{}", letter.id);

    let (status, _, body) = app.send(Method::DELETE, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["mfaRequired"], true);
    assert_eq!(body["error"]["code"], "MFA_REQUIRED");

    let (status, _, body) = app
        .send(Method::POST, "/api/mfa/verify", Some(&token), Some(json!({ "code": "000000" })))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "MFA_INVALID_CODE");

    let code = app
        .services
        .code_verifier(covergate::models::MfaMethod::Totp)
        .unwrap()
        .issue("u1");
    let (status, _, body) = app
        .send(Method::POST, "/api/mfa/verify", Some(&token), Some(json!({ "code": code })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["verified"], true);
    assert_eq!(body["method"], "totp");

    let (status, _, _) = app.send(Method::DELETE, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let trail = app.services.logger.audit_trail(Some("u1"), 10).await;
    assert_eq!(trail[0].action, "delete");
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let app = TestApp::new(&[]);
    let user_token = app.user("u1", Tier::Premium, Role::User).await;
    let admin_token = app.user("admin", Tier::Enterprise, Role::Admin).await;

    let (status, _, body) = app.send(Method::GET, "/admin/metrics", Some(&user_token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");

    let (status, _, body) = app
        .send(Method::GET, "/admin/metrics?window=60", Some(&admin_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["windowSeconds"], 60);
    assert!(body["metrics"]["api"]["total"].as_u64().unwrap() >= 1);

    let (status, _, body) = app.send(Method::GET, "/admin/alerts", Some(&admin_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);

    let (status, _, _) = app
        .send(Method::POST, "/admin/alerts/nope/resolve", Some(&admin_token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
