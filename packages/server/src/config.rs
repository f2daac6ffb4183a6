use std::path::PathBuf;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub events_channel: String,
    pub catalog_base_url: String,
    pub catalog_token: String,
    pub file_explorer_base_url: String,
    pub file_explorer_token: Option<String>,
    pub ai_connector_base_url: String,
    pub ai_connector_model: String,
    pub workspace_root: PathBuf,
    pub tagging_concurrency: usize,
    pub prompt_template_path: PathBuf,
    pub webhook_url: Option<String>,
    pub database_path: String,
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            events_channel: env::var("REDIS_EVENTS_CHANNEL")
                .unwrap_or_else(|_| "apphub:events".to_string()),
            catalog_base_url: env::var("CATALOG_BASE_URL")
                .context("CATALOG_BASE_URL must be set")?,
            catalog_token: env::var("CATALOG_TOKEN")
                .context("CATALOG_TOKEN must be set")?,
            file_explorer_base_url: env::var("FILE_EXPLORER_BASE_URL")
                .context("FILE_EXPLORER_BASE_URL must be set")?,
            file_explorer_token: env::var("FILE_EXPLORER_TOKEN").ok(),
            ai_connector_base_url: env::var("AI_CONNECTOR_BASE_URL")
                .context("AI_CONNECTOR_BASE_URL must be set")?,
            ai_connector_model: env::var("AI_CONNECTOR_MODEL")
                .context("AI_CONNECTOR_MODEL must be set")?,
            workspace_root: env::var("WORKSPACE_ROOT")
                .unwrap_or_else(|_| "workspace".to_string())
                .into(),
            tagging_concurrency: env::var("TAGGING_CONCURRENCY")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("TAGGING_CONCURRENCY must be a valid number")?,
            prompt_template_path: env::var("TAGGING_PROMPT_TEMPLATE_PATH")
                .unwrap_or_else(|_| "prompts/repository-tags.txt".to_string())
                .into(),
            webhook_url: env::var("WEBHOOK_URL").ok(),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/tagging.db".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
        })
    }
}
