//! Live gateway surface.
//!
//! Indexing-enabled channels get their messages persisted as they arrive,
//! so public pages stay fresh between scheduled passes. Guild membership
//! changes keep the server lifecycle (kicked/rejoined) current. The first
//! `ready` also spawns the scheduler, once.

use crate::convert;
use crate::discord::SerenityReader;
use crate::events::Event;
use crate::indexer::{Indexer, IndexerOptions};
use crate::scheduler::IndexScheduler;
use crate::settings::{ChannelFlag, UserServerFlag};
use crate::sitemap::SitemapWarmer;
use crate::App;
use chrono::Utc;
use serenity::client::{Context, EventHandler};
use serenity::gateway::ActivityData;
use serenity::model::channel::Message as DiscordMessage;
use serenity::model::gateway::Ready;
use serenity::model::guild::{Guild, UnavailableGuild};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Handler {
    app: Arc<App>,
    scheduler_started: AtomicBool,
}

impl Handler {
    pub fn new(app: Arc<App>) -> Self {
        Self {
            app,
            scheduler_started: AtomicBool::new(false),
        }
    }

    /// Persists one live message if its channel is indexed and its author
    /// has not opted out. Thread messages inherit the parent channel's
    /// settings.
    pub async fn handle_message(&self, message: DiscordMessage) -> anyhow::Result<()> {
        let Some(guild_id) = message.guild_id else {
            return Ok(());
        };
        if !convert::is_human_message(&message) {
            return Ok(());
        }

        let app = &self.app;
        let server_id = guild_id.to_string();
        let channel_id = message.channel_id.to_string();

        let mut flags = app
            .settings
            .channel_flags(&app.db, &channel_id)?
            .unwrap_or_default();
        if !flags.has(ChannelFlag::IndexingEnabled) {
            // Messages in a thread follow the root channel's settings.
            let parent_flags = match app.db.get_channel(&channel_id)? {
                Some(channel) if channel.kind.is_thread() => match channel.parent_id {
                    Some(parent_id) => app.settings.channel_flags(&app.db, &parent_id)?,
                    None => None,
                },
                _ => None,
            };
            match parent_flags {
                Some(parent_flags) => flags = parent_flags,
                None => return Ok(()),
            }
        }
        if !flags.has(ChannelFlag::IndexingEnabled) {
            return Ok(());
        }

        let author_id = message.author.id.to_string();
        let consent = app
            .settings
            .user_server_flags(&app.db, &author_id, &server_id)?
            .unwrap_or_default();
        if consent.has(UserServerFlag::MessageIndexingDisabled) {
            return Ok(());
        }

        let account = convert::account_from_user(&message.author);
        let converted = convert::message_from_discord(&message, &server_id)?;
        let message_id = converted.id.clone();
        app.db
            .run_blocking(move |db| {
                db.upsert_accounts(&[account])?;
                db.upsert_many_messages(std::slice::from_ref(&converted))?;
                Ok(())
            })
            .await?;

        app.events.publish(Event::MessageIndexed {
            server_id,
            channel_id,
            message_id,
        });
        Ok(())
    }
}

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("Gateway: connected as {}", ready.user.name);
        ctx.set_activity(Some(ActivityData::custom(
            self.app.config.status_message.clone(),
        )));

        // `ready` fires again on reconnect; the scheduler must not.
        if !self.scheduler_started.swap(true, Ordering::SeqCst) {
            let app = &self.app;
            let reader = Arc::new(SerenityReader::new(ctx.http.clone()));
            let indexer = Indexer::new(
                reader,
                app.db.clone(),
                app.events.clone(),
                IndexerOptions::from_config(&app.config),
            );
            let warmer = SitemapWarmer::new(app.db.clone(), app.http_client.clone(), &app.config);
            let scheduler = IndexScheduler::new(
                indexer,
                warmer,
                app.config.indexing_interval_hours,
                app.config.run_index_on_start(),
            );
            info!(
                "Gateway: starting index scheduler (every {}h)",
                app.config.indexing_interval_hours
            );
            tokio::spawn(scheduler.run());
        }
    }

    async fn message(&self, _ctx: Context, new_message: DiscordMessage) {
        let message_id = new_message.id.to_string();
        if let Err(e) = self.handle_message(new_message).await {
            warn!("Gateway: failed to index live message {}: {:#}", message_id, e);
        }
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        debug!("Gateway: joined or resumed guild {}", guild.id);
        let server = crate::model::Server {
            id: guild.id.to_string(),
            name: guild.name.clone(),
            icon: guild.icon.map(|hash| hash.to_string()),
            ..crate::model::Server::default()
        };
        if let Err(e) = self.app.db.upsert_server(&server) {
            warn!("Gateway: failed to upsert guild {}: {:#}", guild.id, e);
        }
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // `unavailable` means an outage, not a kick; only a real removal
        // stamps the kicked timestamp.
        if incomplete.unavailable {
            return;
        }
        info!("Gateway: removed from guild {}", incomplete.id);
        if let Err(e) = self
            .app
            .db
            .mark_server_kicked(&incomplete.id.to_string(), Utc::now())
        {
            warn!("Gateway: failed to mark guild {} kicked: {:#}", incomplete.id, e);
        }
    }
}
