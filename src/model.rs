//! Canonical persisted shapes for Discord entities.
//!
//! These are the rows the indexing pipeline writes; raw serenity types never
//! cross the storage boundary. All ids are snowflake strings.

use crate::settings::Bitfield;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub icon: Option<String>,
    /// Set when the bot is removed from the guild; cleared when it rejoins.
    /// Servers are never hard-deleted.
    pub kicked_at: Option<DateTime<Utc>>,
    pub flags: Bitfield,
    pub custom_domain: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Text,
    News,
    Forum,
    PublicThread,
    PrivateThread,
    NewsThread,
}

impl ChannelKind {
    /// Top-level channels the indexer enumerates, as opposed to threads
    /// nested under one.
    pub fn is_root(self) -> bool {
        matches!(self, ChannelKind::Text | ChannelKind::News | ChannelKind::Forum)
    }

    pub fn is_thread(self) -> bool {
        !self.is_root()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Text => "text",
            ChannelKind::News => "news",
            ChannelKind::Forum => "forum",
            ChannelKind::PublicThread => "public_thread",
            ChannelKind::PrivateThread => "private_thread",
            ChannelKind::NewsThread => "news_thread",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "text" => Some(ChannelKind::Text),
            "news" => Some(ChannelKind::News),
            "forum" => Some(ChannelKind::Forum),
            "public_thread" => Some(ChannelKind::PublicThread),
            "private_thread" => Some(ChannelKind::PrivateThread),
            "news_thread" => Some(ChannelKind::NewsThread),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub server_id: String,
    pub name: String,
    pub kind: ChannelKind,
    /// None for root channels; a thread's parent must be a root channel in
    /// the same server.
    pub parent_id: Option<String>,
    pub flags: Bitfield,
    /// Forum-only: the tag moderators apply to solved posts.
    pub solution_tag_id: Option<String>,
}

impl Default for Channel {
    fn default() -> Self {
        Channel {
            id: String::new(),
            server_id: String::new(),
            name: String::new(),
            kind: ChannelKind::Text,
            parent_id: None,
            flags: Bitfield::default(),
            solution_tag_id: None,
        }
    }
}

/// A Discord identity as stored. Anonymization never touches these rows; it
/// is an output-time transform over the stored record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscordAccount {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
}

/// Per-user, per-server junction record: consent flags plus the API key and
/// usage counter for the public API.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserServerSettings {
    pub user_id: String,
    pub server_id: String,
    pub flags: Bitfield,
    pub api_key: Option<String>,
    pub api_calls_used: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    pub server_id: String,
    pub author_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// The message this one replies to, resolved lazily at read time.
    pub reference_id: Option<String>,
    /// The thread-starter message this one answers, when linked.
    pub question_id: Option<String>,
    /// A message marked as solving this question.
    pub solution_id: Option<String>,
    /// The thread spawned from this message, if any. A thread shares its id
    /// with the message that started it.
    pub child_thread_id: Option<String>,
}

/// A message assembled for public output. `public` is derived from current
/// consent and server settings at read time, never trusted from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicMessage {
    pub message: Message,
    pub author: DiscordAccount,
    pub public: bool,
}
