pub mod anonymize;
pub mod config;
pub mod convert;
pub mod db;
pub mod discord;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod gateway;
pub mod indexer;
pub mod model;
pub mod scheduler;
pub mod settings;
pub mod settings_cache;
pub mod sitemap;
pub mod snowflake;

/// Shared context built once at startup and passed explicitly to every
/// handler and background job.
pub struct App {
    pub config: config::Config,
    pub db: db::Database,
    pub settings: settings_cache::SettingsCache,
    pub events: events::EventBus,
    pub http_client: reqwest::Client,
}
