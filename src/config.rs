use crate::purge::{BULK_DELETE_MAX_AGE, MAX_CHECK_INTERVAL_MINUTES};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Clone, Deserialize)]
pub struct Config {
    pub discord_token: String,
    pub application_id: u64,
    pub owner_id: Option<u64>,
    pub dev_guild_id: Option<u64>,
    pub register_commands: bool,
    pub database_url: String,
    pub status_message: String,

    // Purge engine settings
    pub purge_config_path: String,
    pub default_check_interval_mins: u64,
    pub bulk_delete_max_age_days: u64,
    pub purge_page_size: u8,

    // Run history retention (SQLite)
    pub run_history_retention_days: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            application_id: env::var("APPLICATION_ID")
                .map_err(|_| anyhow::anyhow!("APPLICATION_ID must be set"))?
                .parse()
                .map_err(|_| anyhow::anyhow!("APPLICATION_ID must be a valid u64"))?,
            owner_id: env::var("OWNER_ID").ok().and_then(|id| id.parse().ok()),
            dev_guild_id: env::var("DEV_GUILD_ID").ok().and_then(|id| id.parse().ok()),
            register_commands: env::var("REGISTER_COMMANDS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/sweeper.db".to_string()),
            status_message: env::var("STATUS_MESSAGE")
                .unwrap_or_else(|_| "Keeping channels tidy".to_string()),
            purge_config_path: env::var("PURGE_CONFIG_PATH")
                .unwrap_or_else(|_| "purge.toml".to_string()),
            default_check_interval_mins: env::var("DEFAULT_CHECK_INTERVAL_MINS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .ok()
                .filter(|mins| (1..=MAX_CHECK_INTERVAL_MINUTES).contains(mins))
                .unwrap_or(5),
            bulk_delete_max_age_days: env::var("BULK_DELETE_MAX_AGE_DAYS")
                .unwrap_or_else(|_| "14".to_string())
                .parse()
                .unwrap_or(14u64)
                .clamp(1, 14),
            purge_page_size: env::var("PURGE_PAGE_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100u8)
                .clamp(1, 100),
            run_history_retention_days: env::var("RUN_HISTORY_RETENTION_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
        })
    }

    pub fn default_check_interval(&self) -> Duration {
        let mins = self.default_check_interval_mins.clamp(1, MAX_CHECK_INTERVAL_MINUTES);
        Duration::from_secs(mins * 60)
    }

    pub fn bulk_delete_max_age(&self) -> Duration {
        Duration::from_secs(self.bulk_delete_max_age_days.saturating_mul(24 * 60 * 60))
            .min(BULK_DELETE_MAX_AGE)
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            discord_token: "test".to_string(),
            application_id: 0,
            owner_id: Some(1),
            dev_guild_id: None,
            register_commands: false,
            database_url: ":memory:".to_string(),
            status_message: "test".to_string(),
            purge_config_path: "purge.toml".to_string(),
            default_check_interval_mins: 5,
            bulk_delete_max_age_days: 14,
            purge_page_size: 100,
            run_history_retention_days: 30,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("application_id", &self.application_id)
            .field("owner_id", &self.owner_id)
            .field("dev_guild_id", &self.dev_guild_id)
            .field("register_commands", &self.register_commands)
            .field("database_url", &self.database_url)
            .field("status_message", &self.status_message)
            .field("purge_config_path", &self.purge_config_path)
            .field(
                "default_check_interval_mins",
                &self.default_check_interval_mins,
            )
            .field("bulk_delete_max_age_days", &self.bulk_delete_max_age_days)
            .field("purge_page_size", &self.purge_page_size)
            .field(
                "run_history_retention_days",
                &self.run_history_retention_days,
            )
            .finish()
    }
}

/// Discord message limit is 2000 characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;
