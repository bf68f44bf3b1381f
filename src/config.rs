use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fs;

/// Per-guild indexing overrides, for operators who need to throttle or
/// exclude a specific community without redeploying.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GuildOverride {
    pub guild_id: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub max_messages: Option<usize>,
}

#[derive(Clone, Deserialize)]
pub struct Config {
    pub discord_token: String,
    pub environment: String,
    pub database_url: String,
    pub status_message: String,

    // Indexing cadence & limits
    pub indexing_interval_hours: u64,
    pub indexing_disabled: bool,
    pub max_messages_per_channel: usize,
    pub max_archived_threads: usize,
    pub max_concurrent_servers: usize,
    pub max_concurrent_channels: usize,
    pub channel_fetch_timeout_secs: u64,
    pub message_batch_size: usize,

    // Post-index sitemap warming
    pub sitemap_warm_delay_ms: u64,
    pub sitemap_ping_url: Option<String>,

    pub settings_cache_capacity: usize,
    pub indexing_overrides: Vec<GuildOverride>,
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
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/overcord.db".to_string()),
            status_message: env::var("STATUS_MESSAGE")
                .unwrap_or_else(|_| "Indexing community answers".to_string()),
            indexing_interval_hours: env::var("INDEXING_INTERVAL_HOURS")
                .unwrap_or_else(|_| "6".to_string())
                .parse()
                .unwrap_or(6),
            indexing_disabled: env::var("INDEXING_DISABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            max_messages_per_channel: env::var("MAX_MESSAGES_PER_CHANNEL")
                .unwrap_or_else(|_| "20000".to_string())
                .parse()
                .unwrap_or(20_000),
            max_archived_threads: env::var("MAX_ARCHIVED_THREADS")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),
            max_concurrent_servers: env::var("MAX_CONCURRENT_SERVERS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            max_concurrent_channels: env::var("MAX_CONCURRENT_CHANNELS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .unwrap_or(2),
            channel_fetch_timeout_secs: env::var("CHANNEL_FETCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .unwrap_or(600),
            message_batch_size: env::var("MESSAGE_BATCH_SIZE")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .unwrap_or(500),
            sitemap_warm_delay_ms: env::var("SITEMAP_WARM_DELAY_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            sitemap_ping_url: env::var("SITEMAP_PING_URL").ok(),
            settings_cache_capacity: env::var("SETTINGS_CACHE_CAPACITY")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            indexing_overrides: Self::load_indexing_overrides()?,
        })
    }

    /// True outside production, where the scheduler also runs one indexing
    /// pass immediately at startup for fast feedback.
    pub fn run_index_on_start(&self) -> bool {
        self.environment != "production"
    }

    pub fn load_indexing_overrides() -> anyhow::Result<Vec<GuildOverride>> {
        if let Ok(content) = fs::read_to_string("indexing_overrides.toml") {
            #[derive(Deserialize)]
            struct OverridesWrapper {
                overrides: Vec<GuildOverride>,
            }
            if let Ok(wrapper) = toml::from_str::<OverridesWrapper>(&content) {
                return Ok(wrapper.overrides);
            }
        }

        // Fallback to env variable
        if let Ok(env_overrides) = env::var("INDEXING_OVERRIDES") {
            if let Ok(overrides) = serde_json::from_str(&env_overrides) {
                return Ok(overrides);
            }
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
impl Config {
    /// A fully-populated config for unit tests, without touching the
    /// process environment.
    pub(crate) fn test_fixture() -> Self {
        Config {
            discord_token: "test".to_string(),
            environment: "test".to_string(),
            database_url: ":memory:".to_string(),
            status_message: "test".to_string(),
            indexing_interval_hours: 6,
            indexing_disabled: false,
            max_messages_per_channel: 1000,
            max_archived_threads: 10,
            max_concurrent_servers: 2,
            max_concurrent_channels: 2,
            channel_fetch_timeout_secs: 5,
            message_batch_size: 50,
            sitemap_warm_delay_ms: 0,
            sitemap_ping_url: None,
            settings_cache_capacity: 100,
            indexing_overrides: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("environment", &self.environment)
            .field("database_url", &self.database_url)
            .field("status_message", &self.status_message)
            .field("indexing_interval_hours", &self.indexing_interval_hours)
            .field("indexing_disabled", &self.indexing_disabled)
            .field("max_messages_per_channel", &self.max_messages_per_channel)
            .field("max_archived_threads", &self.max_archived_threads)
            .field("max_concurrent_servers", &self.max_concurrent_servers)
            .field("max_concurrent_channels", &self.max_concurrent_channels)
            .field(
                "channel_fetch_timeout_secs",
                &self.channel_fetch_timeout_secs,
            )
            .field("message_batch_size", &self.message_batch_size)
            .field("sitemap_warm_delay_ms", &self.sitemap_warm_delay_ms)
            .field("sitemap_ping_url", &self.sitemap_ping_url)
            .field("settings_cache_capacity", &self.settings_cache_capacity)
            .field("indexing_overrides", &self.indexing_overrides)
            .finish()
    }
}
