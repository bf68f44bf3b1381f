use crate::config::Config;
use crate::model::{Attachment, Channel, ChannelKind, DiscordAccount, Message, Server};
use crate::settings::Bitfield;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SQLITE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Cloneable handle over a single sqlite connection. All writes are keyed
/// upserts, so re-running an indexing pass converges on the same rows.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(&config.database_url)
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs a closure against this handle on the blocking pool, keeping
    /// rusqlite work off the async worker threads.
    pub async fn run_blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let sql = "
            CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                icon TEXT,
                kicked_at DATETIME,
                flags INTEGER NOT NULL DEFAULT 0,
                custom_domain TEXT
            );

            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                parent_id TEXT,
                flags INTEGER NOT NULL DEFAULT 0,
                solution_tag_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_channels_server ON channels (server_id);
            CREATE INDEX IF NOT EXISTS idx_channels_parent ON channels (parent_id);

            CREATE TABLE IF NOT EXISTS discord_accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                avatar TEXT
            );

            CREATE TABLE IF NOT EXISTS user_server_settings (
                user_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                flags INTEGER NOT NULL DEFAULT 0,
                api_key TEXT,
                api_calls_used INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, server_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                content TEXT NOT NULL,
                attachments TEXT NOT NULL DEFAULT '[]',
                reference_id TEXT,
                question_id TEXT,
                solution_id TEXT,
                child_thread_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages (channel_id);
            CREATE INDEX IF NOT EXISTS idx_messages_server ON messages (server_id);

            CREATE TABLE IF NOT EXISTS index_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at DATETIME NOT NULL,
                finished_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                servers_indexed INTEGER NOT NULL,
                servers_failed INTEGER NOT NULL,
                messages_indexed INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sitemap_cache (
                server_id TEXT PRIMARY KEY,
                question_ids TEXT NOT NULL,
                warmed_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
        ";
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    // --- Servers ---

    /// Upserts a server seen during indexing or on join. Mutable Discord
    /// fields are refreshed and `kicked_at` cleared; dashboard-owned fields
    /// (flags, custom domain) are left alone.
    pub fn upsert_server(&self, server: &Server) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO servers (id, name, icon, kicked_at, flags, custom_domain)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 icon = excluded.icon,
                 kicked_at = NULL",
            (
                &server.id,
                &server.name,
                &server.icon,
                server.flags.0 as i64,
                &server.custom_domain,
            ),
        )?;
        Ok(())
    }

    pub fn mark_server_kicked(&self, server_id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE servers SET kicked_at = ?2 WHERE id = ?1",
            (server_id, at.format(SQLITE_DATETIME_FORMAT).to_string()),
        )?;
        Ok(())
    }

    pub fn set_server_flags(&self, server_id: &str, flags: Bitfield) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE servers SET flags = ?2 WHERE id = ?1",
            (server_id, flags.0 as i64),
        )?;
        Ok(())
    }

    pub fn get_server(&self, server_id: &str) -> anyhow::Result<Option<Server>> {
        let conn = self.conn.lock().unwrap();
        let server = conn
            .query_row(
                "SELECT id, name, icon, kicked_at, flags, custom_domain FROM servers WHERE id = ?1",
                [server_id],
                row_to_server,
            )
            .optional()?;
        Ok(server)
    }

    pub fn list_active_servers(&self) -> anyhow::Result<Vec<Server>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, icon, kicked_at, flags, custom_domain
             FROM servers WHERE kicked_at IS NULL",
        )?;
        let rows = stmt.query_map([], row_to_server)?;
        let mut servers = Vec::new();
        for row in rows {
            servers.push(row?);
        }
        Ok(servers)
    }

    // --- Channels ---

    /// Upserts a channel or thread record. Flags are settings, owned by the
    /// settings surface, and are never clobbered by indexing; a detected
    /// solution tag only fills the column while it is unset.
    pub fn upsert_channel(&self, channel: &Channel) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO channels (id, server_id, name, kind, parent_id, flags, solution_tag_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 kind = excluded.kind,
                 parent_id = excluded.parent_id,
                 solution_tag_id = COALESCE(channels.solution_tag_id, excluded.solution_tag_id)",
            (
                &channel.id,
                &channel.server_id,
                &channel.name,
                channel.kind.as_str(),
                &channel.parent_id,
                channel.flags.0 as i64,
                &channel.solution_tag_id,
            ),
        )?;
        Ok(())
    }

    pub fn set_channel_flags(&self, channel_id: &str, flags: Bitfield) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE channels SET flags = ?2 WHERE id = ?1",
            (channel_id, flags.0 as i64),
        )?;
        Ok(())
    }

    pub fn channel_flags(&self, channel_id: &str) -> anyhow::Result<Option<Bitfield>> {
        let conn = self.conn.lock().unwrap();
        let flags = conn
            .query_row(
                "SELECT flags FROM channels WHERE id = ?1",
                [channel_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(flags.map(|raw| Bitfield(raw as u64)))
    }

    pub fn get_channel(&self, channel_id: &str) -> anyhow::Result<Option<Channel>> {
        let conn = self.conn.lock().unwrap();
        let channel = conn
            .query_row(
                "SELECT id, server_id, name, kind, parent_id, flags, solution_tag_id
                 FROM channels WHERE id = ?1",
                [channel_id],
                row_to_channel,
            )
            .optional()?;
        Ok(channel)
    }

    // --- Accounts & consent ---

    pub fn upsert_accounts(&self, accounts: &[DiscordAccount]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for account in accounts {
            tx.execute(
                "INSERT INTO discord_accounts (id, name, avatar) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, avatar = excluded.avatar",
                (&account.id, &account.name, &account.avatar),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_account(&self, account_id: &str) -> anyhow::Result<Option<DiscordAccount>> {
        let conn = self.conn.lock().unwrap();
        let account = conn
            .query_row(
                "SELECT id, name, avatar FROM discord_accounts WHERE id = ?1",
                [account_id],
                |row| {
                    Ok(DiscordAccount {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        avatar: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    pub fn set_user_server_flags(
        &self,
        user_id: &str,
        server_id: &str,
        flags: Bitfield,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user_server_settings (user_id, server_id, flags) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, server_id) DO UPDATE SET flags = excluded.flags",
            (user_id, server_id, flags.0 as i64),
        )?;
        Ok(())
    }

    pub fn user_server_flags(
        &self,
        user_id: &str,
        server_id: &str,
    ) -> anyhow::Result<Option<Bitfield>> {
        let conn = self.conn.lock().unwrap();
        let flags = conn
            .query_row(
                "SELECT flags FROM user_server_settings WHERE user_id = ?1 AND server_id = ?2",
                [user_id, server_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(flags.map(|raw| Bitfield(raw as u64)))
    }

    pub fn get_user_server_settings(
        &self,
        user_id: &str,
        server_id: &str,
    ) -> anyhow::Result<Option<crate::model::UserServerSettings>> {
        let conn = self.conn.lock().unwrap();
        let settings = conn
            .query_row(
                "SELECT user_id, server_id, flags, api_key, api_calls_used
                 FROM user_server_settings WHERE user_id = ?1 AND server_id = ?2",
                [user_id, server_id],
                |row| {
                    Ok(crate::model::UserServerSettings {
                        user_id: row.get(0)?,
                        server_id: row.get(1)?,
                        flags: Bitfield(row.get::<_, i64>(2)? as u64),
                        api_key: row.get(3)?,
                        api_calls_used: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(settings)
    }

    pub fn set_user_api_key(
        &self,
        user_id: &str,
        server_id: &str,
        api_key: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user_server_settings (user_id, server_id, api_key) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, server_id) DO UPDATE SET api_key = excluded.api_key",
            (user_id, server_id, api_key),
        )?;
        Ok(())
    }

    pub fn increment_api_calls(&self, user_id: &str, server_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE user_server_settings SET api_calls_used = api_calls_used + 1
             WHERE user_id = ?1 AND server_id = ?2",
            [user_id, server_id],
        )?;
        Ok(())
    }

    /// Consent flags for a batch of authors in one query. Users with no row
    /// are simply absent from the map.
    pub fn consent_map(
        &self,
        server_id: &str,
        user_ids: &[String],
    ) -> anyhow::Result<HashMap<String, Bitfield>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT user_id, flags FROM user_server_settings
             WHERE server_id = ? AND user_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;

        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&server_id];
        for id in user_ids {
            params.push(id);
        }

        let rows = stmt.query_map(&params[..], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (user_id, raw) = row?;
            map.insert(user_id, Bitfield(raw as u64));
        }
        Ok(map)
    }

    // --- Messages ---

    /// Upserts a batch of messages in one transaction, keyed by message id.
    /// Question/solution links survive re-indexing: an incoming NULL never
    /// wipes a stored link.
    pub fn upsert_many_messages(&self, messages: &[Message]) -> anyhow::Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for message in messages {
            let attachments = serde_json::to_string(&message.attachments)?;
            tx.execute(
                "INSERT INTO messages
                     (id, channel_id, server_id, author_id, content, attachments,
                      reference_id, question_id, solution_id, child_thread_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                     content = excluded.content,
                     attachments = excluded.attachments,
                     reference_id = excluded.reference_id,
                     question_id = COALESCE(excluded.question_id, messages.question_id),
                     solution_id = COALESCE(excluded.solution_id, messages.solution_id),
                     child_thread_id = COALESCE(excluded.child_thread_id, messages.child_thread_id)",
                (
                    &message.id,
                    &message.channel_id,
                    &message.server_id,
                    &message.author_id,
                    &message.content,
                    &attachments,
                    &message.reference_id,
                    &message.question_id,
                    &message.solution_id,
                    &message.child_thread_id,
                ),
            )?;
        }
        tx.commit()?;
        Ok(messages.len())
    }

    /// Newest indexed message in a channel, used as the incremental fetch
    /// cursor. Snowflakes are compared numerically; TEXT ordering would put
    /// "999..." after "1000...".
    pub fn latest_message_id(&self, channel_id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let id = conn
            .query_row(
                "SELECT id FROM messages WHERE channel_id = ?1
                 ORDER BY CAST(id AS INTEGER) DESC LIMIT 1",
                [channel_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn latest_messages(&self, channel_id: &str, limit: usize) -> anyhow::Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, channel_id, server_id, author_id, content, attachments,
                    reference_id, question_id, solution_id, child_thread_id
             FROM messages WHERE channel_id = ?1
             ORDER BY CAST(id AS INTEGER) DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map((channel_id, limit), row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Full channel contents, oldest first. Used for idempotence checks and
    /// read-path assembly.
    pub fn messages_for_channel(&self, channel_id: &str) -> anyhow::Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, channel_id, server_id, author_id, content, attachments,
                    reference_id, question_id, solution_id, child_thread_id
             FROM messages WHERE channel_id = ?1
             ORDER BY CAST(id AS INTEGER) ASC",
        )?;
        let rows = stmt.query_map([channel_id], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn count_server_messages(&self, server_id: &str) -> anyhow::Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE server_id = ?1",
            [server_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // --- Run markers & sitemap cache ---

    pub fn record_index_run(
        &self,
        started_at: DateTime<Utc>,
        servers_indexed: usize,
        servers_failed: usize,
        messages_indexed: u64,
    ) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO index_runs (started_at, servers_indexed, servers_failed, messages_indexed)
             VALUES (?1, ?2, ?3, ?4)",
            (
                started_at.format(SQLITE_DATETIME_FORMAT).to_string(),
                servers_indexed,
                servers_failed,
                messages_indexed as i64,
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn last_index_run(&self) -> anyhow::Result<Option<(usize, usize, u64)>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                "SELECT servers_indexed, servers_failed, messages_indexed
                 FROM index_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as usize,
                        row.get::<_, i64>(1)? as usize,
                        row.get::<_, i64>(2)? as u64,
                    ))
                },
            )
            .optional()?;
        Ok(run)
    }

    /// Thread-starter messages for a server, oldest first. A thread shares
    /// its id with the message that spawned it, so these are the site's
    /// "questions".
    pub fn question_ids_for_server(&self, server_id: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM messages
             WHERE server_id = ?1 AND child_thread_id IS NOT NULL
             ORDER BY CAST(id AS INTEGER) ASC",
        )?;
        let rows = stmt.query_map([server_id], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn save_sitemap_cache(
        &self,
        server_id: &str,
        question_ids: &[String],
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sitemap_cache (server_id, question_ids, warmed_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(server_id) DO UPDATE SET
                 question_ids = excluded.question_ids,
                 warmed_at = CURRENT_TIMESTAMP",
            (server_id, serde_json::to_string(question_ids)?),
        )?;
        Ok(())
    }

    pub fn sitemap_cache(&self, server_id: &str) -> anyhow::Result<Option<Vec<String>>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT question_ids FROM sitemap_cache WHERE server_id = ?1",
                [server_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

fn row_to_server(row: &rusqlite::Row<'_>) -> rusqlite::Result<Server> {
    let kicked_at: Option<String> = row.get(3)?;
    Ok(Server {
        id: row.get(0)?,
        name: row.get(1)?,
        icon: row.get(2)?,
        kicked_at: kicked_at.and_then(|ts| parse_sqlite_utc(&ts)),
        flags: Bitfield(row.get::<_, i64>(4)? as u64),
        custom_domain: row.get(5)?,
    })
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    let kind: String = row.get(3)?;
    Ok(Channel {
        id: row.get(0)?,
        server_id: row.get(1)?,
        name: row.get(2)?,
        kind: ChannelKind::parse(&kind).unwrap_or(ChannelKind::Text),
        parent_id: row.get(4)?,
        flags: Bitfield(row.get::<_, i64>(5)? as u64),
        solution_tag_id: row.get(6)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let attachments: String = row.get(5)?;
    let attachments: Vec<Attachment> = serde_json::from_str(&attachments).unwrap_or_default();
    Ok(Message {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        server_id: row.get(2)?,
        author_id: row.get(3)?,
        content: row.get(4)?,
        attachments,
        reference_id: row.get(6)?,
        question_id: row.get(7)?,
        solution_id: row.get(8)?,
        child_thread_id: row.get(9)?,
    })
}

pub(crate) fn parse_sqlite_utc(ts: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(ts, SQLITE_DATETIME_FORMAT).ok()?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}
