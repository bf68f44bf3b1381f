//! Pure mapping from raw serenity entities to the canonical model.
//!
//! No I/O happens here. Converters either succeed or return
//! [`IndexError::Conversion`] carrying the offending id; a malformed entity
//! is skipped by the caller, never aborts a batch.

use crate::anonymize::pseudonym;
use crate::error::IndexError;
use crate::model::{Attachment, Channel, ChannelKind, DiscordAccount, Message, PublicMessage, Server};
use crate::settings::{Bitfield, ServerFlag, UserServerFlag};
use serenity::model::channel::{ChannelType, GuildChannel, MessageType};
use serenity::model::guild::GuildInfo;
use serenity::model::user::User;
use std::collections::HashMap;

pub fn server_from_guild_info(guild: &GuildInfo) -> Server {
    Server {
        id: guild.id.to_string(),
        name: guild.name.clone(),
        icon: guild.icon.map(|hash| hash.to_string()),
        kicked_at: None,
        flags: Bitfield::default(),
        custom_domain: None,
    }
}

pub fn channel_from_guild_channel(channel: &GuildChannel) -> Result<Channel, IndexError> {
    let kind = match channel.kind {
        ChannelType::Text => ChannelKind::Text,
        ChannelType::News => ChannelKind::News,
        ChannelType::Forum => ChannelKind::Forum,
        ChannelType::PublicThread => ChannelKind::PublicThread,
        ChannelType::PrivateThread => ChannelKind::PrivateThread,
        ChannelType::NewsThread => ChannelKind::NewsThread,
        other => {
            return Err(IndexError::Conversion {
                id: channel.id.to_string(),
                reason: format!("unsupported channel type {other:?}"),
            })
        }
    };

    // Forums tag solved posts; prefer an explicitly named tag as the
    // default solution marker until one is configured.
    let solution_tag_id = channel
        .available_tags
        .iter()
        .find(|tag| {
            let name = tag.name.to_lowercase();
            name == "solved" || name == "answered"
        })
        .map(|tag| tag.id.to_string());

    Ok(Channel {
        id: channel.id.to_string(),
        server_id: channel.guild_id.to_string(),
        name: channel.name.clone(),
        kind,
        parent_id: channel.parent_id.map(|id| id.to_string()),
        flags: Bitfield::default(),
        solution_tag_id,
    })
}

pub fn account_from_user(user: &User) -> DiscordAccount {
    DiscordAccount {
        id: user.id.to_string(),
        name: user.name.clone(),
        avatar: user.avatar.map(|hash| hash.to_string()),
    }
}

/// Converts a raw message. `server_id` is passed explicitly because
/// REST-fetched messages do not carry a guild id.
pub fn message_from_discord(
    message: &serenity::model::channel::Message,
    server_id: &str,
) -> Result<Message, IndexError> {
    if server_id.is_empty() {
        return Err(IndexError::Conversion {
            id: message.id.to_string(),
            reason: "message outside a guild".to_string(),
        });
    }

    let attachments = message
        .attachments
        .iter()
        .map(|a| Attachment {
            id: a.id.to_string(),
            filename: a.filename.clone(),
            url: a.url.clone(),
            content_type: a.content_type.clone(),
            size: a.size as u64,
        })
        .collect();

    Ok(Message {
        id: message.id.to_string(),
        channel_id: message.channel_id.to_string(),
        server_id: server_id.to_string(),
        author_id: message.author.id.to_string(),
        content: extract_message_text(message),
        attachments,
        reference_id: message
            .message_reference
            .as_ref()
            .and_then(|r| r.message_id)
            .map(|id| id.to_string()),
        question_id: None,
        solution_id: None,
        child_thread_id: None,
    })
}

/// Folds embed titles, descriptions and fields into the indexed text so
/// embed-only messages still show up in search.
pub fn extract_message_text(message: &serenity::model::channel::Message) -> String {
    let mut parts = Vec::new();

    let content = message.content.trim();
    if !content.is_empty() {
        parts.push(content.to_string());
    }

    for embed in &message.embeds {
        if let Some(title) = &embed.title {
            let title = title.trim();
            if !title.is_empty() {
                parts.push(title.to_string());
            }
        }

        if let Some(description) = &embed.description {
            let description = description.trim();
            if !description.is_empty() {
                parts.push(description.to_string());
            }
        }

        for field in &embed.fields {
            let name = field.name.trim();
            let value = field.value.trim();

            match (name.is_empty(), value.is_empty()) {
                (true, true) => {}
                (true, false) => parts.push(value.to_string()),
                (false, true) => parts.push(name.to_string()),
                (false, false) => parts.push(format!("{}: {}", name, value)),
            }
        }
    }

    parts.join("\n")
}

/// Collapses a converted batch to one record per id, keeping first-seen
/// order. Last write wins on mutable fields; a full re-index supersedes
/// stale names and avatars anyway.
pub fn dedupe_by_id<T>(items: Vec<T>, id_of: impl Fn(&T) -> &str) -> Vec<T> {
    let mut order: Vec<T> = Vec::with_capacity(items.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in items {
        match index.get(id_of(&item)) {
            Some(&at) => order[at] = item,
            None => {
                index.insert(id_of(&item).to_string(), order.len());
                order.push(item);
            }
        }
    }
    order
}

/// True for the human-authored message kinds we index. Joins, pins, boosts
/// and other system messages are not content.
pub fn is_human_message(message: &serenity::model::channel::Message) -> bool {
    !message.author.bot
        && matches!(message.kind, MessageType::Regular | MessageType::InlineReply)
}

/// Drops everything that must not be indexed: system messages, authors who
/// opted out, and the whole batch when the channel has indexing disabled.
/// Content itself is never inspected.
pub fn filter_indexable_messages(
    messages: Vec<serenity::model::channel::Message>,
    channel_flags: Bitfield,
    consent: &HashMap<String, Bitfield>,
) -> Vec<serenity::model::channel::Message> {
    use crate::settings::ChannelFlag;

    if !channel_flags.has(ChannelFlag::IndexingEnabled) {
        return Vec::new();
    }

    messages
        .into_iter()
        .filter(|message| {
            if !is_human_message(message) {
                return false;
            }
            let opted_out = consent
                .get(&message.author.id.to_string())
                .map_or(false, |flags| flags.has(UserServerFlag::MessageIndexingDisabled));
            !opted_out
        })
        .collect()
}

/// Output-time identity transform. With consent the account passes through
/// untouched; without it the author becomes a deterministic pseudonym with
/// no avatar. Same seed, same pseudonym.
pub fn to_public_account(
    account: &DiscordAccount,
    consent_granted: bool,
    seed: &str,
) -> DiscordAccount {
    if consent_granted {
        return account.clone();
    }
    DiscordAccount {
        id: pseudonym(seed),
        name: pseudonym(seed),
        avatar: None,
    }
}

/// Assembles a message for public output. `public` is recomputed from the
/// current flags on every call so a consent revocation takes effect at the
/// next read, regardless of what was true at write time.
pub fn to_public_message(
    message: Message,
    account: &DiscordAccount,
    server_flags: Bitfield,
    user_flags: Bitfield,
) -> PublicMessage {
    let public = user_flags.has(UserServerFlag::CanPubliclyDisplayMessages)
        || server_flags.has(ServerFlag::ConsiderAllMessagesPublic);
    let show_real_identity = public && !server_flags.has(ServerFlag::AnonymizeMessages);
    let author = to_public_account(account, show_real_identity, &account.id);

    PublicMessage {
        message,
        author,
        public,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ChannelFlag;
    use serenity::model::id::{MessageId, UserId};

    fn raw_message(id: u64, author_id: u64, content: &str) -> serenity::model::channel::Message {
        let mut msg = serenity::model::channel::Message::default();
        msg.id = MessageId::new(id);
        msg.author = User::default();
        msg.author.id = UserId::new(author_id);
        msg.author.name = format!("user-{author_id}");
        msg.content = content.to_string();
        msg
    }

    #[test]
    fn test_message_conversion() {
        let raw = raw_message(42, 7, "how do I index things?");
        let converted = message_from_discord(&raw, "999").unwrap();
        assert_eq!(converted.id, "42");
        assert_eq!(converted.server_id, "999");
        assert_eq!(converted.author_id, "7");
        assert_eq!(converted.content, "how do I index things?");
        assert!(converted.reference_id.is_none());
    }

    #[test]
    fn test_message_outside_guild_is_conversion_error() {
        let raw = raw_message(42, 7, "dm content");
        let err = message_from_discord(&raw, "").unwrap_err();
        assert!(matches!(err, IndexError::Conversion { .. }));
    }

    #[test]
    fn test_dedupe_last_write_wins() {
        let accounts = vec![
            DiscordAccount { id: "1".into(), name: "old-name".into(), avatar: None },
            DiscordAccount { id: "2".into(), name: "other".into(), avatar: None },
            DiscordAccount { id: "1".into(), name: "new-name".into(), avatar: Some("abc".into()) },
        ];
        let deduped = dedupe_by_id(accounts, |a| &a.id);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].id, "1");
        assert_eq!(deduped[0].name, "new-name");
        assert_eq!(deduped[0].avatar.as_deref(), Some("abc"));
    }

    #[test]
    fn test_filter_drops_system_and_opted_out() {
        let mut system = raw_message(1, 10, "");
        system.kind = MessageType::MemberJoin;
        let mut bot = raw_message(2, 11, "beep");
        bot.author.bot = true;
        let opted_out = raw_message(3, 12, "do not index me");
        let kept = raw_message(4, 13, "index me");

        let mut consent = HashMap::new();
        consent.insert(
            "12".to_string(),
            Bitfield::default().set(UserServerFlag::MessageIndexingDisabled),
        );

        let channel_flags = Bitfield::default().set(ChannelFlag::IndexingEnabled);
        let kept_messages =
            filter_indexable_messages(vec![system, bot, opted_out, kept], channel_flags, &consent);
        assert_eq!(kept_messages.len(), 1);
        assert_eq!(kept_messages[0].id.get(), 4);
    }

    #[test]
    fn test_filter_disabled_channel_drops_everything() {
        let messages = vec![raw_message(1, 10, "a"), raw_message(2, 11, "b")];
        let kept = filter_indexable_messages(messages, Bitfield::default(), &HashMap::new());
        assert!(kept.is_empty());
    }

    #[test]
    fn test_public_account_with_consent_is_unchanged() {
        let account = DiscordAccount {
            id: "123".into(),
            name: "Rhys".into(),
            avatar: Some("hash".into()),
        };
        assert_eq!(to_public_account(&account, true, "123"), account);
    }

    #[test]
    fn test_public_account_without_consent_is_anonymized() {
        let account = DiscordAccount {
            id: "123".into(),
            name: "Rhys".into(),
            avatar: Some("hash".into()),
        };
        let masked = to_public_account(&account, false, "123");
        assert_ne!(masked.name, account.name);
        assert_ne!(masked.id, account.id);
        assert!(masked.avatar.is_none());
        // Determinism: the same seed masks to the same identity.
        assert_eq!(masked, to_public_account(&account, false, "123"));
    }

    #[test]
    fn test_public_message_derives_public_from_current_flags() {
        let account = DiscordAccount { id: "5".into(), name: "a".into(), avatar: None };
        let message = Message { id: "1".into(), author_id: "5".into(), ..Message::default() };

        let private = to_public_message(
            message.clone(),
            &account,
            Bitfield::default(),
            Bitfield::default(),
        );
        assert!(!private.public);
        assert_ne!(private.author.name, "a");

        let consented = to_public_message(
            message.clone(),
            &account,
            Bitfield::default(),
            Bitfield::default().set(UserServerFlag::CanPubliclyDisplayMessages),
        );
        assert!(consented.public);
        assert_eq!(consented.author.name, "a");

        // Server-level override makes everything public.
        let forced = to_public_message(
            message,
            &account,
            Bitfield::default().set(ServerFlag::ConsiderAllMessagesPublic),
            Bitfield::default(),
        );
        assert!(forced.public);
    }

    #[test]
    fn test_anonymize_server_masks_even_consenting_authors() {
        let account = DiscordAccount { id: "5".into(), name: "a".into(), avatar: None };
        let message = Message { id: "1".into(), author_id: "5".into(), ..Message::default() };
        let out = to_public_message(
            message,
            &account,
            Bitfield::default()
                .set(ServerFlag::ConsiderAllMessagesPublic)
                .set(ServerFlag::AnonymizeMessages),
            Bitfield::default().set(UserServerFlag::CanPubliclyDisplayMessages),
        );
        assert!(out.public);
        assert_ne!(out.author.name, "a");
    }

    #[test]
    fn test_extract_message_text_includes_embeds() {
        let mut msg = raw_message(1, 2, "body");
        let mut embed = serenity::model::channel::Embed::default();
        embed.title = Some("Title".to_string());
        embed.description = Some("Description".to_string());
        msg.embeds.push(embed);

        let text = extract_message_text(&msg);
        assert_eq!(text, "body\nTitle\nDescription");
    }
}
