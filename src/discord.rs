//! The narrow Discord read capability the indexing pipeline consumes.
//!
//! Everything the crawler needs from Discord goes through [`DiscordReader`],
//! so tests drive the pipeline with an in-memory implementation and the
//! orchestrator never touches serenity's HTTP surface directly.

use crate::convert;
use crate::error::IndexError;
use crate::model::{Channel, Server};
use crate::snowflake;
use async_trait::async_trait;
use serenity::http::{GuildPagination, Http, MessagePagination};
use serenity::model::channel::Message as DiscordMessage;
use serenity::model::id::{ChannelId, GuildId, MessageId};
use std::sync::Arc;
use tracing::debug;

/// Discord's hard page-size limit for message history requests.
pub const MESSAGE_PAGE_LIMIT: usize = 100;

const GUILD_PAGE_LIMIT: u64 = 200;

#[async_trait]
pub trait DiscordReader: Send + Sync {
    /// All guilds the bot is currently a member of.
    async fn guilds(&self) -> Result<Vec<Server>, IndexError>;

    /// Top-level text/news/forum channels of a guild.
    async fn root_channels(&self, server_id: &str) -> Result<Vec<Channel>, IndexError>;

    /// Currently active threads across the guild.
    async fn active_threads(&self, server_id: &str) -> Result<Vec<Channel>, IndexError>;

    /// Up to `limit` archived public threads under a root channel.
    async fn archived_threads(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<Channel>, IndexError>;

    /// One page of messages strictly older than `before` (or the newest
    /// page when `before` is None), newest first.
    async fn messages_before(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DiscordMessage>, IndexError>;
}

/// Production reader over serenity's HTTP client. Rate-limit backoff and
/// request retries are the client's responsibility; errors that reach us
/// are already final.
pub struct SerenityReader {
    http: Arc<Http>,
}

impl SerenityReader {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn guild_id(server_id: &str) -> Result<GuildId, IndexError> {
    snowflake::parse(server_id)
        .map(GuildId::new)
        .map_err(|_| IndexError::Conversion {
            id: server_id.to_string(),
            reason: "not a guild snowflake".to_string(),
        })
}

fn channel_id(id: &str) -> Result<ChannelId, IndexError> {
    snowflake::parse(id)
        .map(ChannelId::new)
        .map_err(|_| IndexError::Conversion {
            id: id.to_string(),
            reason: "not a channel snowflake".to_string(),
        })
}

#[async_trait]
impl DiscordReader for SerenityReader {
    async fn guilds(&self) -> Result<Vec<Server>, IndexError> {
        let mut servers = Vec::new();
        let mut after: Option<GuildId> = None;

        loop {
            let page = self
                .http
                .get_guilds(after.map(GuildPagination::After), Some(GUILD_PAGE_LIMIT))
                .await
                .map_err(IndexError::Fetch)?;
            if page.is_empty() {
                break;
            }
            after = page.last().map(|guild| guild.id);
            let full_page = page.len() as u64 == GUILD_PAGE_LIMIT;
            servers.extend(page.iter().map(convert::server_from_guild_info));
            if !full_page {
                break;
            }
        }

        debug!("Discord: bot is a member of {} guilds", servers.len());
        Ok(servers)
    }

    async fn root_channels(&self, server_id: &str) -> Result<Vec<Channel>, IndexError> {
        let channels = self
            .http
            .get_channels(guild_id(server_id)?)
            .await
            .map_err(|e| IndexError::from_discord(e, server_id))?;

        Ok(channels
            .iter()
            .filter_map(|raw| convert::channel_from_guild_channel(raw).ok())
            .filter(|channel| channel.kind.is_root())
            .collect())
    }

    async fn active_threads(&self, server_id: &str) -> Result<Vec<Channel>, IndexError> {
        let data = self
            .http
            .get_guild_active_threads(guild_id(server_id)?)
            .await
            .map_err(|e| IndexError::from_discord(e, server_id))?;

        Ok(data
            .threads
            .iter()
            .filter_map(|raw| convert::channel_from_guild_channel(raw).ok())
            .collect())
    }

    async fn archived_threads(
        &self,
        channel_id_str: &str,
        limit: usize,
    ) -> Result<Vec<Channel>, IndexError> {
        let data = self
            .http
            .get_channel_archived_public_threads(
                channel_id(channel_id_str)?,
                None,
                Some(limit as u64),
            )
            .await
            .map_err(|e| IndexError::from_discord(e, channel_id_str))?;

        Ok(data
            .threads
            .iter()
            .filter_map(|raw| convert::channel_from_guild_channel(raw).ok())
            .take(limit)
            .collect())
    }

    async fn messages_before(
        &self,
        channel_id_str: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DiscordMessage>, IndexError> {
        let cursor = match before {
            Some(id) => Some(MessagePagination::Before(MessageId::new(
                snowflake::parse(id).map_err(|_| IndexError::Conversion {
                    id: id.to_string(),
                    reason: "not a message snowflake".to_string(),
                })?,
            ))),
            None => None,
        };

        self.http
            .get_messages(
                channel_id(channel_id_str)?,
                cursor,
                Some(limit.min(MESSAGE_PAGE_LIMIT) as u8),
            )
            .await
            .map_err(|e| IndexError::from_discord(e, channel_id_str))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use serenity::model::id::UserId;
    use serenity::model::user::User;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory reader: channels keyed by server, messages kept ascending
    /// by id per channel, with per-channel failure injection.
    #[derive(Default)]
    pub struct MockReader {
        pub servers: Vec<Server>,
        pub root_channels: HashMap<String, Vec<Channel>>,
        pub active_threads: HashMap<String, Vec<Channel>>,
        pub archived_threads: HashMap<String, Vec<Channel>>,
        pub messages: HashMap<String, Vec<DiscordMessage>>,
        pub fail_channels: HashSet<String>,
        pub fail_servers: HashSet<String>,
        pub fetch_calls: AtomicUsize,
    }

    impl MockReader {
        pub fn add_messages(&mut self, channel_id: &str, mut messages: Vec<DiscordMessage>) {
            // The real Discord API returns every message stamped with the
            // channel it was fetched from; mirror that so the conversion
            // layer (which reads `message.channel_id`) sees the right id.
            if let Ok(id) = channel_id.parse::<u64>() {
                for message in &mut messages {
                    message.channel_id = ChannelId::new(id);
                }
            }
            self.messages.insert(channel_id.to_string(), messages);
        }
    }

    pub fn raw_message(id: u64, author_id: u64, content: &str) -> DiscordMessage {
        let mut msg = DiscordMessage::default();
        msg.id = MessageId::new(id);
        msg.author = User::default();
        msg.author.id = UserId::new(author_id);
        msg.author.name = format!("user-{author_id}");
        msg.content = content.to_string();
        msg
    }

    #[async_trait]
    impl DiscordReader for MockReader {
        async fn guilds(&self) -> Result<Vec<Server>, IndexError> {
            Ok(self.servers.clone())
        }

        async fn root_channels(&self, server_id: &str) -> Result<Vec<Channel>, IndexError> {
            if self.fail_servers.contains(server_id) {
                return Err(IndexError::Fetch(serenity::Error::Other(
                    "simulated channel-list failure",
                )));
            }
            Ok(self.root_channels.get(server_id).cloned().unwrap_or_default())
        }

        async fn active_threads(&self, server_id: &str) -> Result<Vec<Channel>, IndexError> {
            Ok(self.active_threads.get(server_id).cloned().unwrap_or_default())
        }

        async fn archived_threads(
            &self,
            channel_id: &str,
            limit: usize,
        ) -> Result<Vec<Channel>, IndexError> {
            if self.fail_channels.contains(channel_id) {
                return Err(IndexError::Fetch(serenity::Error::Other(
                    "simulated archived-thread failure",
                )));
            }
            let mut threads = self
                .archived_threads
                .get(channel_id)
                .cloned()
                .unwrap_or_default();
            threads.truncate(limit);
            Ok(threads)
        }

        async fn messages_before(
            &self,
            channel_id: &str,
            before: Option<&str>,
            limit: usize,
        ) -> Result<Vec<DiscordMessage>, IndexError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_channels.contains(channel_id) {
                return Err(IndexError::Fetch(serenity::Error::Other(
                    "simulated fetch failure",
                )));
            }

            let ascending = self.messages.get(channel_id).cloned().unwrap_or_default();
            let cutoff = match before {
                Some(id) => crate::snowflake::parse(id)
                    .map_err(|_| IndexError::Conversion {
                        id: id.to_string(),
                        reason: "bad cursor".to_string(),
                    })?,
                None => u64::MAX,
            };

            let mut page: Vec<DiscordMessage> = ascending
                .into_iter()
                .filter(|m| m.id.get() < cutoff)
                .collect();
            // Newest first, like the real API.
            page.reverse();
            page.truncate(limit);
            Ok(page)
        }
    }
}
