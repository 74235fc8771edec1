//! Session authentication and the MFA gate.
//!
//! Resolution never raises: a missing token, unknown session, expired
//! session, missing user or store error all end in "no user". Whether a
//! failed MFA settings or MFA session lookup admits the caller is decided
//! by [`MfaPolicy`].

use crate::error::GatewayError;
use crate::logger::{SecurityEvent, Severity, StructuredLogger};
use crate::mfa::MfaService;
use crate::models::User;
use crate::stores::UserStore;
use axum::http::{header, HeaderMap};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

pub const SESSION_COOKIE: &str = "session";

/// What a route demands of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequirement {
    /// Resolve a user when credentials are present; never reject.
    Optional,
    Required,
    /// Required, plus a verified MFA session when the user has MFA enabled.
    RequiredWithMfa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Deny,
}

/// Declared outcome for the two MFA edge cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaPolicy {
    /// The MFA status lookup itself failed.
    pub on_check_error: PolicyAction,
    /// MFA is enabled and no verified session exists.
    pub on_missing_session: PolicyAction,
}

impl Default for MfaPolicy {
    fn default() -> Self {
        Self {
            on_check_error: PolicyAction::Allow,
            on_missing_session: PolicyAction::Deny,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingCredentials,
    InvalidSession,
    SessionExpired,
    UserNotFound,
    StoreUnavailable,
    MfaRequired,
}

impl AuthFailure {
    pub fn reason(self) -> &'static str {
        match self {
            AuthFailure::MissingCredentials => "missing_credentials",
            AuthFailure::InvalidSession => "invalid_session",
            AuthFailure::SessionExpired => "session_expired",
            AuthFailure::UserNotFound => "user_not_found",
            AuthFailure::StoreUnavailable => "store_unavailable",
            AuthFailure::MfaRequired => "mfa_required",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Anonymous,
    Authenticated(User),
    Rejected(AuthFailure),
}

/// Bearer token first, then the session cookie.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok())
}

pub struct AuthGate {
    users: Arc<dyn UserStore>,
    mfa: Arc<MfaService>,
    logger: Arc<StructuredLogger>,
    policy: MfaPolicy,
}

impl AuthGate {
    pub fn new(users: Arc<dyn UserStore>, mfa: Arc<MfaService>, logger: Arc<StructuredLogger>) -> Self {
        Self {
            users,
            mfa,
            logger,
            policy: MfaPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MfaPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> MfaPolicy {
        self.policy
    }

    /// The user behind the request's credentials, if any.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Option<User> {
        let token = extract_token(headers)?;
        self.resolve(&token).await.ok()
    }

    async fn resolve(&self, token: &str) -> Result<User, AuthFailure> {
        let session = match self.users.get_session_by_token(token).await {
            Ok(Some(session)) => session,
            Ok(None) => return Err(AuthFailure::InvalidSession),
            Err(e) => {
                warn!(error = %e, "Session lookup failed");
                return Err(AuthFailure::StoreUnavailable);
            }
        };
        if session.is_expired(Utc::now()) {
            return Err(AuthFailure::SessionExpired);
        }
        match self.users.get_user_by_id(&session.user_id).await {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(AuthFailure::UserNotFound),
            Err(e) => {
                warn!(error = %e, user_id = %session.user_id, "User lookup failed");
                Err(AuthFailure::StoreUnavailable)
            }
        }
    }

    /// Applies `requirement` to the request and logs the outcome.
    pub async fn check(&self, headers: &HeaderMap, client_ip: &str, requirement: AuthRequirement) -> AuthOutcome {
        let ua = user_agent(headers);

        let resolved = match extract_token(headers) {
            Some(token) => self.resolve(&token).await,
            None => Err(AuthFailure::MissingCredentials),
        };

        let user = match resolved {
            Ok(user) => user,
            Err(failure) if requirement == AuthRequirement::Optional => {
                if failure != AuthFailure::MissingCredentials {
                    self.logger.security(
                        SecurityEvent::new("auth_ignored", Severity::Low)
                            .source(client_ip, ua)
                            .details(json!({ "reason": failure.reason() })),
                    );
                }
                return AuthOutcome::Anonymous;
            }
            Err(failure) => {
                self.logger.security(
                    SecurityEvent::new("auth_failure", Severity::Medium)
                        .source(client_ip, ua)
                        .details(json!({ "reason": failure.reason() })),
                );
                return AuthOutcome::Rejected(failure);
            }
        };

        if requirement == AuthRequirement::RequiredWithMfa && !self.mfa_satisfied(&user, client_ip, ua).await {
            return AuthOutcome::Rejected(AuthFailure::MfaRequired);
        }

        self.logger.security(
            SecurityEvent::new("auth_success", Severity::Low)
                .user(Some(user.id.as_str()))
                .source(client_ip, ua),
        );
        AuthOutcome::Authenticated(user)
    }

    async fn mfa_satisfied(&self, user: &User, client_ip: &str, ua: Option<&str>) -> bool {
        let settings = match self.users.get_mfa_settings(&user.id).await {
            Ok(settings) => settings,
            Err(e) => return self.on_check_error(user, client_ip, ua, "settings", &e),
        };
        if !settings.is_enabled() {
            return true;
        }

        match self.mfa.is_verified(&user.id).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => return self.on_check_error(user, client_ip, ua, "session", &e),
        }

        let admitted = self.policy.on_missing_session == PolicyAction::Allow;
        self.logger.security(
            SecurityEvent::new("mfa_required", Severity::Medium)
                .user(Some(user.id.as_str()))
                .source(client_ip, ua)
                .details(json!({ "admitted": admitted })),
        );
        admitted
    }

    fn on_check_error(
        &self,
        user: &User,
        client_ip: &str,
        ua: Option<&str>,
        lookup: &str,
        error: &GatewayError,
    ) -> bool {
        let admitted = self.policy.on_check_error == PolicyAction::Allow;
        self.logger.security(
            SecurityEvent::new("mfa_check_error", Severity::Medium)
                .user(Some(user.id.as_str()))
                .source(client_ip, ua)
                .details(json!({ "lookup": lookup, "error": error.to_string(), "admitted": admitted })),
        );
        admitted
    }
}
