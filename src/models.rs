//! Records read and written by the pipeline. Only the fields the pipeline
//! needs are modelled; the full relational schema lives elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Subscription level; governs rate-limit thresholds and monthly quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Premium,
    Enterprise,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Letters a user of this tier may generate per month; `None` is unlimited.
    pub fn monthly_quota(self) -> Option<u32> {
        match self {
            Tier::Free => Some(3),
            Tier::Premium => Some(50),
            Tier::Enterprise => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "premium" => Ok(Tier::Premium),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub tier: Tier,
    #[serde(default)]
    pub role: Role,
    pub subscription_expiry: Option<DateTime<Utc>>,
    pub monthly_usage: u32,
    pub usage_reset_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// The tier in force right now: a paid tier whose subscription has lapsed
    /// counts as free. The stored tier is left untouched.
    pub fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        match self.subscription_expiry {
            Some(expiry) if expiry <= now => Tier::Free,
            _ => self.tier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MfaMethod {
    Totp,
    Sms,
    Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaSettings {
    pub totp_enabled: bool,
    pub sms_enabled: bool,
    pub email_enabled: bool,
}

impl MfaSettings {
    pub fn is_enabled(&self) -> bool {
        self.totp_enabled || self.sms_enabled || self.email_enabled
    }

    pub fn disabled() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverLetter {
    pub id: String,
    pub user_id: String,
    pub job_title: String,
    pub company_name: String,
    pub content: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(tier: Tier, expiry: Option<DateTime<Utc>>) -> User {
        User {
            id: "u1".into(),
            email: "u1@example.com".into(),
            name: "U One".into(),
            tier,
            role: Role::User,
            subscription_expiry: expiry,
            monthly_usage: 0,
            usage_reset_at: Utc::now(),
        }
    }

    #[test]
    fn test_expired_subscription_counts_as_free() {
        let now = Utc::now();
        let lapsed = user(Tier::Premium, Some(now - Duration::days(1)));
        assert_eq!(lapsed.effective_tier(now), Tier::Free);
        assert_eq!(lapsed.tier, Tier::Premium);

        let active = user(Tier::Enterprise, Some(now + Duration::days(30)));
        assert_eq!(active.effective_tier(now), Tier::Enterprise);

        let open_ended = user(Tier::Premium, None);
        assert_eq!(open_ended.effective_tier(now), Tier::Premium);
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("Premium".parse::<Tier>().unwrap(), Tier::Premium);
        assert!("gold".parse::<Tier>().is_err());
        assert_eq!(serde_json::to_string(&Tier::Enterprise).unwrap(), "\"enterprise\"");
    }
}
