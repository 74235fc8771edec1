pub mod alerting;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod logger;
pub mod metrics;
pub mod mfa;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod services;
pub mod store;
pub mod stores;
pub mod tasks;
pub mod telemetry;
pub mod validation;
pub mod versioning;

pub use config::Settings;
pub use error::{GatewayError, GatewayResult};
pub use server::create_app;
pub use services::Services;
