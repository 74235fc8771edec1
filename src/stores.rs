//! Collaborators consumed by the pipeline and the route handlers.
//!
//! The relational store and the AI provider are external; they are reached
//! through these traits. The in-memory implementations back the local-only
//! mode of the binary and the test suite.

use crate::error::{GatewayError, GatewayResult};
use crate::models::{CoverLetter, MfaSettings, Session, User};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Not-found is `Ok(None)`; `Err` means the store itself failed.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user_by_id(&self, id: &str) -> GatewayResult<Option<User>>;

    async fn get_user_by_email(&self, email: &str) -> GatewayResult<Option<User>>;

    async fn get_session_by_token(&self, token: &str) -> GatewayResult<Option<Session>>;

    async fn create_user(&self, user: User) -> GatewayResult<User>;

    async fn update_user(&self, user: User) -> GatewayResult<User>;

    async fn get_mfa_settings(&self, user_id: &str) -> GatewayResult<MfaSettings>;

    async fn update_mfa_settings(&self, user_id: &str, settings: MfaSettings) -> GatewayResult<()>;
}

#[async_trait]
pub trait CoverLetterStore: Send + Sync {
    async fn create(&self, letter: CoverLetter) -> GatewayResult<CoverLetter>;

    async fn get(&self, id: &str) -> GatewayResult<Option<CoverLetter>>;

    async fn list_by_user(&self, user_id: &str) -> GatewayResult<Vec<CoverLetter>>;

    async fn delete(&self, id: &str) -> GatewayResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub job_title: String,
    pub company_name: String,
    pub job_description: String,
    pub tone: String,
    pub applicant_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedLetter {
    pub content: String,
    pub model: String,
    pub tokens_used: u64,
}

/// The AI text-generation provider.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> GatewayResult<GeneratedLetter>;
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, User>>,
    sessions: RwLock<HashMap<String, Session>>,
    mfa: RwLock<HashMap<String, MfaSettings>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session for `user_id` and returns it.
    pub async fn create_session(&self, user_id: &str, ttl: Duration) -> Session {
        let session = Session {
            token: Uuid::new_v4().simple().to_string(),
            user_id: user_id.to_string(),
            expires_at: Utc::now()
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1)),
        };
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());
        session
    }

    pub async fn insert_session(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_user_by_id(&self, id: &str) -> GatewayResult<Option<User>> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> GatewayResult<Option<User>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn get_session_by_token(&self, token: &str) -> GatewayResult<Option<Session>> {
        Ok(self.sessions.read().await.get(token).cloned())
    }

    async fn create_user(&self, user: User) -> GatewayResult<User> {
        if self.get_user_by_email(&user.email).await?.is_some() {
            return Err(GatewayError::validation(format!(
                "A user with email {} already exists",
                user.email
            )));
        }
        self.users
            .write()
            .await
            .insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn update_user(&self, user: User) -> GatewayResult<User> {
        let mut users = self.users.write().await;
        match users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(user)
            }
            None => Err(GatewayError::NotFound(format!("user {}", user.id))),
        }
    }

    async fn get_mfa_settings(&self, user_id: &str) -> GatewayResult<MfaSettings> {
        Ok(self
            .mfa
            .read()
            .await
            .get(user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn update_mfa_settings(&self, user_id: &str, settings: MfaSettings) -> GatewayResult<()> {
        self.mfa.write().await.insert(user_id.to_string(), settings);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCoverLetterStore {
    letters: RwLock<HashMap<String, CoverLetter>>,
}

impl MemoryCoverLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoverLetterStore for MemoryCoverLetterStore {
    async fn create(&self, letter: CoverLetter) -> GatewayResult<CoverLetter> {
        self.letters
            .write()
            .await
            .insert(letter.id.clone(), letter.clone());
        Ok(letter)
    }

    async fn get(&self, id: &str) -> GatewayResult<Option<CoverLetter>> {
        Ok(self.letters.read().await.get(id).cloned())
    }

    async fn list_by_user(&self, user_id: &str) -> GatewayResult<Vec<CoverLetter>> {
        let letters = self.letters.read().await;
        let mut mine: Vec<CoverLetter> = letters
            .values()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(mine)
    }

    async fn delete(&self, id: &str) -> GatewayResult<bool> {
        Ok(self.letters.write().await.remove(id).is_some())
    }
}

/// Offline generator used when no AI provider is configured.
pub struct TemplateGenerator {
    model: String,
}

impl TemplateGenerator {
    pub fn new() -> Self {
        Self {
            model: "template-v1".to_string(),
        }
    }
}

impl Default for TemplateGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationService for TemplateGenerator {
    async fn generate(&self, request: &GenerationRequest) -> GatewayResult<GeneratedLetter> {
        let content = format!(
            "Dear Hiring Manager,\n\nI am excited to apply for the {} position at {}. {}\n\n\
             My background aligns closely with what you describe, and I would welcome the \
             chance to contribute.\n\nSincerely,\n{}",
            request.job_title,
            request.company_name,
            match request.tone.as_str() {
                "enthusiastic" => "This role is exactly the challenge I have been looking for.",
                "formal" => "I believe my qualifications make me a strong candidate.",
                _ => "I would bring focus and care to this role.",
            },
            request.applicant_name,
        );
        let tokens_used = content.split_whitespace().count() as u64;

        Ok(GeneratedLetter {
            content,
            model: self.model.clone(),
            tokens_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, Tier};

    fn user(id: &str, email: &str) -> User {
        User {
            id: id.into(),
            email: email.into(),
            name: "Test".into(),
            tier: Tier::Free,
            role: Role::User,
            subscription_expiry: None,
            monthly_usage: 0,
            usage_reset_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_user_store_roundtrip() {
        let store = MemoryUserStore::new();
        store.create_user(user("u1", "a@example.com")).await.unwrap();
        assert!(store.create_user(user("u2", "A@example.com")).await.is_err());

        let found = store.get_user_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(found.id, "u1");

        let session = store.create_session("u1", Duration::from_secs(60)).await;
        let loaded = store.get_session_by_token(&session.token).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "u1");
        assert!(store.update_user(user("missing", "m@example.com")).await.is_err());
    }

    #[test]
    fn test_missing_records_are_none() {
        let users = MemoryUserStore::new();
        let letters = MemoryCoverLetterStore::new();
        assert!(tokio_test::block_on(users.get_user_by_id("nobody")).unwrap().is_none());
        assert!(tokio_test::block_on(letters.get("nothing")).unwrap().is_none());
        assert!(!tokio_test::block_on(letters.delete("nothing")).unwrap());
    }

    #[tokio::test]
    async fn test_letters_listed_newest_first() {
        let store = MemoryCoverLetterStore::new();
        for (i, id) in ["l1", "l2"].iter().enumerate() {
            store
                .create(CoverLetter {
                    id: id.to_string(),
                    user_id: "u1".into(),
                    job_title: "Engineer".into(),
                    company_name: "Acme".into(),
                    content: "...".into(),
                    model: "m".into(),
                    created_at: Utc::now() + ChronoDuration::seconds(i as i64),
                })
                .await
                .unwrap();
        }
        let letters = store.list_by_user("u1").await.unwrap();
        assert_eq!(letters[0].id, "l2");
        assert!(store.delete("l1").await.unwrap());
        assert_eq!(store.list_by_user("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_template_generator_counts_tokens() {
        let generated = TemplateGenerator::new()
            .generate(&GenerationRequest {
                job_title: "Engineer".into(),
                company_name: "Acme".into(),
                job_description: "Build things".into(),
                tone: "formal".into(),
                applicant_name: "Ada".into(),
            })
            .await
            .unwrap();
        assert!(generated.content.contains("Acme"));
        assert!(generated.tokens_used > 10);
    }
}
