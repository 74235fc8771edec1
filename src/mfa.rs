use crate::cache::{CacheTtl, MultiLevelCache};
use crate::clock::now_rfc3339;
use crate::error::GatewayResult;
use crate::models::MfaMethod;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Cache key marking a completed MFA challenge.
pub fn verified_key(user_id: &str) -> String {
    format!("mfa:verified:{}", user_id)
}

/// Checks a one-time code for one MFA method.
#[async_trait]
pub trait CodeVerifier: Send + Sync {
    fn method(&self) -> MfaMethod;

    async fn verify(&self, user_id: &str, code: &str) -> GatewayResult<bool>;
}

/// Verifier for codes this process issued and delivered out of band.
/// A code is single use and expires after `ttl`.
pub struct IssuedCodeVerifier {
    method: MfaMethod,
    ttl: Duration,
    codes: DashMap<String, (String, Instant)>,
}

impl IssuedCodeVerifier {
    pub fn new(method: MfaMethod, ttl: Duration) -> Self {
        Self {
            method,
            ttl,
            codes: DashMap::new(),
        }
    }

    /// Issues a fresh six-digit code for `user_id`, replacing any earlier one.
    pub fn issue(&self, user_id: &str) -> String {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        self.insert(user_id, &code);
        code
    }

    pub fn insert(&self, user_id: &str, code: &str) {
        self.codes.insert(
            user_id.to_string(),
            (code.to_string(), Instant::now() + self.ttl),
        );
    }
}

#[async_trait]
impl CodeVerifier for IssuedCodeVerifier {
    fn method(&self) -> MfaMethod {
        self.method
    }

    async fn verify(&self, user_id: &str, code: &str) -> GatewayResult<bool> {
        let matched = self
            .codes
            .remove_if(user_id, |_, (expected, expires_at)| {
                expected == code && *expires_at > Instant::now()
            })
            .is_some();
        Ok(matched)
    }
}

/// Verified-MFA sessions and code verification.
pub struct MfaService {
    cache: Arc<MultiLevelCache>,
    session_ttl: Duration,
    verifiers: Vec<Arc<dyn CodeVerifier>>,
}

impl MfaService {
    pub fn new(cache: Arc<MultiLevelCache>, session_ttl: Duration) -> Self {
        Self {
            cache,
            session_ttl,
            verifiers: Vec::new(),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn CodeVerifier>) -> Self {
        self.verifiers.push(verifier);
        self
    }

    pub async fn mark_verified(&self, user_id: &str) {
        self.cache
            .set(
                &verified_key(user_id),
                json!({ "verifiedAt": now_rfc3339() }),
                CacheTtl::uniform(self.session_ttl),
            )
            .await;
        debug!(user_id, "MFA session verified");
    }

    /// `Err` when the verified-session lookup itself failed.
    pub async fn is_verified(&self, user_id: &str) -> GatewayResult<bool> {
        Ok(self.cache.try_get(&verified_key(user_id)).await?.is_some())
    }

    pub async fn revoke(&self, user_id: &str) {
        self.cache.delete(&verified_key(user_id)).await;
    }

    /// Checks `code` against a single method.
    pub async fn verify(&self, user_id: &str, method: MfaMethod, code: &str) -> GatewayResult<bool> {
        match self.verifiers.iter().find(|v| v.method() == method) {
            Some(verifier) => verifier.verify(user_id, code).await,
            None => Ok(false),
        }
    }

    /// Runs every verifier concurrently and returns the first method that
    /// accepts `code`. Verifier errors count as a rejection.
    pub async fn verify_any(&self, user_id: &str, code: &str) -> Option<MfaMethod> {
        let mut set = JoinSet::new();
        for verifier in &self.verifiers {
            let verifier = verifier.clone();
            let user_id = user_id.to_string();
            let code = code.to_string();
            set.spawn(async move {
                let method = verifier.method();
                (method, verifier.verify(&user_id, &code).await)
            });
        }

        let mut accepted = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((method, Ok(true))) => {
                    accepted.get_or_insert(method);
                }
                Ok((_, Ok(false))) => {}
                Ok((method, Err(e))) => {
                    warn!(user_id, method = ?method, error = %e, "MFA verifier failed");
                }
                Err(e) => warn!(user_id, error = %e, "MFA verifier task aborted"),
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::store::MemoryStore;

    fn cache() -> Arc<MultiLevelCache> {
        Arc::new(MultiLevelCache::new(Arc::new(MemoryStore::new()), CacheConfig::default()))
    }

    #[tokio::test]
    async fn test_verified_session_lifecycle() {
        let mfa = MfaService::new(cache(), Duration::from_secs(60));
        assert!(!mfa.is_verified("u1").await.unwrap());
        mfa.mark_verified("u1").await;
        assert!(mfa.is_verified("u1").await.unwrap());
        assert!(!mfa.is_verified("u2").await.unwrap());
        mfa.revoke("u1").await;
        assert!(!mfa.is_verified("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_verified_session_expires() {
        let mfa = MfaService::new(cache(), Duration::from_millis(30));
        mfa.mark_verified("u1").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!mfa.is_verified("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_session_lookup_outage_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let mfa = MfaService::new(
            Arc::new(MultiLevelCache::new(store.clone(), CacheConfig::default())),
            Duration::from_secs(60),
        );
        store.set_available(false);
        assert!(mfa.is_verified("u1").await.is_err());
    }

    #[tokio::test]
    async fn test_issued_codes_are_single_use() {
        let sms = IssuedCodeVerifier::new(MfaMethod::Sms, Duration::from_secs(60));
        let code = sms.issue("u1");
        assert_eq!(code.len(), 6);
        assert!(!sms.verify("u1", "not-it").await.unwrap());
        assert!(sms.verify("u1", &code).await.unwrap());
        assert!(!sms.verify("u1", &code).await.unwrap());
    }

    #[tokio::test]
    async fn test_any_method_accepts() {
        let totp = Arc::new(IssuedCodeVerifier::new(MfaMethod::Totp, Duration::from_secs(60)));
        let email = Arc::new(IssuedCodeVerifier::new(MfaMethod::Email, Duration::from_secs(60)));
        email.insert("u1", "123456");
        let mfa = MfaService::new(cache(), Duration::from_secs(60))
            .with_verifier(totp)
            .with_verifier(email);

        assert_eq!(mfa.verify_any("u1", "654321").await, None);
        assert_eq!(mfa.verify_any("u1", "123456").await, Some(MfaMethod::Email));
        assert!(!mfa.verify("u1", MfaMethod::Sms, "123456").await.unwrap());
    }
}
