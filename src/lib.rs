pub mod commands;
pub mod config;
pub mod db;
pub mod discord;
pub mod purge;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub db: db::Database,
    pub scheduler: purge::PurgeScheduler,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
