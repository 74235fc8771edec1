use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use covergate::config::Settings;
use covergate::models::{Role, Tier, User};
use covergate::server::Server;
use covergate::services::{shared_store, Collaborators, Services};
use covergate::stores::{MemoryUserStore, UserStore};
use covergate::telemetry;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let settings = Settings::parse()
        .validated()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    telemetry::init(&settings.log_level, settings.log_format)?;

    tracing::info!("Starting covergate");
    tracing::info!(
        "Configuration: bind_addr={}, environment={:?}, redis={}",
        settings.bind_addr,
        settings.environment,
        if settings.redis_url.is_some() { "configured" } else { "none" }
    );

    let store = shared_store(&settings).await;
    let users = Arc::new(MemoryUserStore::new());
    if settings.seed_demo_user {
        seed_demo_users(&users).await?;
    }

    let services = Services::new(settings, store, Collaborators::memory(users))
        .map_err(|e| anyhow::anyhow!("Failed to build services: {}", e))?;

    Server::new(Arc::new(services))
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}

async fn seed_demo_users(users: &MemoryUserStore) -> Result<()> {
    let now = Utc::now();
    for (id, email, tier, role) in [
        ("demo-user", "demo@example.com", Tier::Premium, Role::User),
        ("demo-admin", "admin@example.com", Tier::Enterprise, Role::Admin),
    ] {
        users
            .create_user(User {
                id: id.to_string(),
                email: email.to_string(),
                name: id.to_string(),
                tier,
                role,
                subscription_expiry: Some(now + ChronoDuration::days(365)),
                monthly_usage: 0,
                usage_reset_at: now + ChronoDuration::days(30),
            })
            .await?;
        let session = users.create_session(id, Duration::from_secs(24 * 3600)).await;
        tracing::info!(user_id = id, token = %session.token, "Seeded demo session");
    }
    Ok(())
}
