use overcord::config::Config;
use overcord::db::Database;
use overcord::events::EventBus;
use overcord::gateway::Handler;
use overcord::settings_cache::SettingsCache;
use overcord::App;
use serenity::client::ClientBuilder;
use serenity::model::gateway::GatewayIntents;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;
    let discord_token = config.discord_token.clone();

    let db = Database::new(&config)
        .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;
    db.execute_init()?;

    let app = Arc::new(App {
        settings: SettingsCache::new(config.settings_cache_capacity),
        db,
        events: EventBus::default(),
        http_client: reqwest::Client::new(),
        config,
    });

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MESSAGES;

    let mut client = ClientBuilder::new(&discord_token, intents)
        .event_handler(Handler::new(app))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}
