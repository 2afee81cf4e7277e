use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub openai_api_key: Option<String>,
    pub ai_model: String,
    /// Per-task deadline for the AI side-channel, milliseconds
    pub ai_timeout_ms: u64,
    /// Persist a snapshot every N applied events
    pub snapshot_interval: i64,
    /// When false the AI side-channel handles events synchronously
    /// instead of going through the durable task queue
    pub ai_queue_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "grimoire".to_string()),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            ai_model: env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            ai_timeout_ms: env::var("AI_TIMEOUT_MS")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .context("AI_TIMEOUT_MS must be a valid number")?,
            snapshot_interval: env::var("SNAPSHOT_INTERVAL")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .context("SNAPSHOT_INTERVAL must be a valid number")?,
            ai_queue_enabled: env::var("AI_QUEUE_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        })
    }
}
