use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Result alias used across the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors raised anywhere in the request pipeline or its services.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// An error that already knows how it must be surfaced.
    #[error("{message}")]
    Http {
        status: StatusCode,
        code: String,
        message: String,
        details: Option<Value>,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("MFA verification required")]
    MfaRequired,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn http(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Http {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::Redis(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(format!("serialization failed: {}", err))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(format!("{:#}", err))
    }
}

/// The fixed taxonomy every error is classified into before it reaches a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Authentication,
    MfaRequired,
    Forbidden,
    NotFound,
    RateLimited,
    Timeout,
    Database,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication | ErrorKind::MfaRequired => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Database | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, independent of the HTTP status.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Authentication => "AUTH_ERROR",
            ErrorKind::MfaRequired => "MFA_REQUIRED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::RateLimited => "RATE_LIMIT_EXCEEDED",
            ErrorKind::Timeout => "TIMEOUT_ERROR",
            ErrorKind::Database => "DATABASE_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Message shown to clients when the original message must not leak.
    pub fn public_message(self) -> &'static str {
        match self {
            ErrorKind::Validation => "Invalid request data",
            ErrorKind::Authentication => "Authentication required",
            ErrorKind::MfaRequired => "Multi-factor authentication required",
            ErrorKind::Forbidden => "Access denied",
            ErrorKind::NotFound => "Resource not found",
            ErrorKind::RateLimited => "Too many requests",
            ErrorKind::Timeout => "Request timeout",
            ErrorKind::Database => "Database operation failed",
            ErrorKind::Internal => "Internal server error",
        }
    }
}

/// Outcome of classifying a [`GatewayError`].
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// `None` for errors that carried their own status and code.
    pub kind: Option<ErrorKind>,
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

const AUTH_KEYWORDS: [&str; 4] = ["unauthorized", "authentication", "authorization", "not authenticated"];
const DATABASE_KEYWORDS: [&str; 4] = ["database", "connection", "sql", "redis"];
const TIMEOUT_KEYWORDS: [&str; 2] = ["timeout", "timed out"];

/// Classifies an error; first match wins.
///
/// Typed variants map directly. Untyped ones (`Internal`, `Configuration`) are
/// classified by keywords found in their message.
pub fn classify(err: &GatewayError) -> Classification {
    let kind = match err {
        GatewayError::Http {
            status,
            code,
            message,
            details,
        } => {
            return Classification {
                kind: None,
                status: *status,
                code: code.clone(),
                message: message.clone(),
                details: details.clone(),
            }
        }
        GatewayError::Validation { message, details } => {
            return Classification {
                kind: Some(ErrorKind::Validation),
                status: ErrorKind::Validation.status(),
                code: ErrorKind::Validation.code().to_string(),
                message: message.clone(),
                details: details.clone(),
            }
        }
        GatewayError::Unauthorized(_) => ErrorKind::Authentication,
        GatewayError::MfaRequired => ErrorKind::MfaRequired,
        GatewayError::Forbidden(_) => ErrorKind::Forbidden,
        GatewayError::NotFound(_) => ErrorKind::NotFound,
        GatewayError::RateLimited { .. } => ErrorKind::RateLimited,
        GatewayError::Timeout(_) => ErrorKind::Timeout,
        GatewayError::Database(_) | GatewayError::Redis(_) => ErrorKind::Database,
        GatewayError::Configuration(msg) | GatewayError::Internal(msg) => classify_message(msg),
    };

    let message = match err {
        GatewayError::Unauthorized(msg)
        | GatewayError::Forbidden(msg)
        | GatewayError::NotFound(msg)
        | GatewayError::Timeout(msg) => msg.clone(),
        other => other.to_string(),
    };

    Classification {
        kind: Some(kind),
        status: kind.status(),
        code: kind.code().to_string(),
        message,
        details: None,
    }
}

fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if AUTH_KEYWORDS.iter().any(|k| lower.contains(k)) {
        ErrorKind::Authentication
    } else if DATABASE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        ErrorKind::Database
    } else if TIMEOUT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        ErrorKind::Timeout
    } else {
        ErrorKind::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_error_passes_through() {
        let err = GatewayError::http(StatusCode::CONFLICT, "ALERT_ALREADY_RESOLVED", "already resolved");
        let c = classify(&err);
        assert_eq!(c.kind, None);
        assert_eq!(c.status, StatusCode::CONFLICT);
        assert_eq!(c.code, "ALERT_ALREADY_RESOLVED");
        assert_eq!(c.message, "already resolved");
    }

    #[test]
    fn test_keyword_classification_order() {
        let auth = classify(&GatewayError::Internal("Authorization header malformed".into()));
        assert_eq!(auth.kind, Some(ErrorKind::Authentication));

        let db = classify(&GatewayError::Internal("connection reset by peer".into()));
        assert_eq!(db.kind, Some(ErrorKind::Database));
        assert_eq!(db.status, StatusCode::INTERNAL_SERVER_ERROR);

        let timeout = classify(&GatewayError::Internal("upstream timeout after 30s".into()));
        assert_eq!(timeout.kind, Some(ErrorKind::Timeout));
        assert_eq!(timeout.status, StatusCode::GATEWAY_TIMEOUT);

        let other = classify(&GatewayError::Internal("index out of range".into()));
        assert_eq!(other.kind, Some(ErrorKind::Internal));
    }

    #[test]
    fn test_typed_variants_map_directly() {
        assert_eq!(classify(&GatewayError::validation("bad")).status, StatusCode::BAD_REQUEST);
        assert_eq!(classify(&GatewayError::MfaRequired).code, "MFA_REQUIRED");
        assert_eq!(
            classify(&GatewayError::Forbidden("nope".into())).status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            classify(&GatewayError::NotFound("letter".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            classify(&GatewayError::RateLimited { retry_after_secs: 3 }).status,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            classify(&GatewayError::Redis("down".into())).code,
            "DATABASE_ERROR"
        );
    }

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err: GatewayError = anyhow::anyhow!("socket closed")
            .context("database query failed")
            .into();
        let c = classify(&err);
        assert_eq!(c.kind, Some(ErrorKind::Database));
        assert!(c.message.contains("socket closed"));
    }
}
