//! The indexing orchestrator.
//!
//! One run walks every server the bot belongs to: enumerate indexable root
//! channels, fetch their history and threads, convert and filter, then
//! batch-upsert. Work is bounded at both levels (servers in flight, channels
//! in flight per server) and every operational failure is contained to the
//! smallest scope that can make progress without it.

use crate::config::{Config, GuildOverride};
use crate::convert;
use crate::db::Database;
use crate::discord::DiscordReader;
use crate::events::{Event, EventBus};
use crate::fetcher::{fetch_all_channel_messages, FetchOptions};
use crate::model::{Channel, Message, Server};
use crate::settings::ChannelFlag;
use crate::snowflake;
use anyhow::anyhow;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// Attempts per message batch before the chunk is dropped for this run.
const PERSIST_RETRY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct IndexerOptions {
    pub disabled: bool,
    pub max_messages_per_channel: usize,
    pub max_archived_threads: usize,
    pub max_concurrent_servers: usize,
    pub max_concurrent_channels: usize,
    pub channel_fetch_timeout: Duration,
    pub message_batch_size: usize,
    pub overrides: Vec<GuildOverride>,
}

impl IndexerOptions {
    pub fn from_config(config: &Config) -> Self {
        IndexerOptions {
            disabled: config.indexing_disabled,
            max_messages_per_channel: config.max_messages_per_channel,
            max_archived_threads: config.max_archived_threads,
            max_concurrent_servers: config.max_concurrent_servers,
            max_concurrent_channels: config.max_concurrent_channels,
            channel_fetch_timeout: Duration::from_secs(config.channel_fetch_timeout_secs),
            message_batch_size: config.message_batch_size,
            overrides: config.indexing_overrides.clone(),
        }
    }

    fn override_for(&self, server_id: &str) -> Option<&GuildOverride> {
        self.overrides.iter().find(|o| o.guild_id == server_id)
    }

    fn server_disabled(&self, server_id: &str) -> bool {
        self.override_for(server_id).map_or(false, |o| o.disabled)
    }

    fn max_messages_for(&self, server_id: &str) -> usize {
        self.override_for(server_id)
            .and_then(|o| o.max_messages)
            .unwrap_or(self.max_messages_per_channel)
    }
}

/// Outcome of one full pass. `index_servers` reports failures here instead
/// of returning an error; its contract is best effort, always completes.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub servers_indexed: usize,
    pub servers_failed: Vec<(String, String)>,
    pub channels_indexed: usize,
    pub messages_indexed: u64,
}

#[derive(Debug, Default)]
struct ServerStats {
    channels: usize,
    messages: u64,
}

#[derive(Clone)]
pub struct Indexer {
    reader: Arc<dyn DiscordReader>,
    db: Database,
    events: EventBus,
    opts: IndexerOptions,
}

impl Indexer {
    pub fn new(
        reader: Arc<dyn DiscordReader>,
        db: Database,
        events: EventBus,
        opts: IndexerOptions,
    ) -> Self {
        Self {
            reader,
            db,
            events,
            opts,
        }
    }

    /// Indexes every eligible server the bot belongs to. Per-server errors
    /// are collected into the summary; only enumeration of the guild list
    /// itself can cut a run short, and even that is logged rather than
    /// propagated.
    pub async fn index_servers(&self) -> RunSummary {
        let started_at = Utc::now();
        let mut summary = RunSummary::default();

        if self.opts.disabled {
            info!("Indexer: disabled by kill switch, skipping run");
            return summary;
        }

        let servers = match self.reader.guilds().await {
            Ok(servers) => servers,
            Err(e) => {
                error!("Indexer: could not enumerate guilds, skipping run: {}", e);
                return summary;
            }
        };
        info!("Indexer: starting run over {} servers", servers.len());

        let semaphore = Arc::new(Semaphore::new(self.opts.max_concurrent_servers));
        let mut tasks = JoinSet::new();
        for server in servers {
            if self.opts.server_disabled(&server.id) {
                debug!("Indexer: server {} disabled by override, skipping", server.id);
                continue;
            }
            let indexer = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (server, Err(anyhow!("indexing semaphore closed"))),
                };
                let result = indexer.index_server(&server).await;
                (server, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((server, Ok(stats))) => {
                    summary.servers_indexed += 1;
                    summary.channels_indexed += stats.channels;
                    summary.messages_indexed += stats.messages;
                    self.events.publish(Event::ServerIndexed {
                        server_id: server.id,
                        messages: stats.messages,
                    });
                }
                Ok((server, Err(e))) => {
                    warn!("Indexer: server {} failed: {:#}", server.id, e);
                    summary.servers_failed.push((server.id, format!("{e:#}")));
                }
                Err(join_error) => {
                    error!("Indexer: server task aborted: {}", join_error);
                    summary
                        .servers_failed
                        .push(("<unknown>".to_string(), join_error.to_string()));
                }
            }
        }

        if let Err(e) = self.db.record_index_run(
            started_at,
            summary.servers_indexed,
            summary.servers_failed.len(),
            summary.messages_indexed,
        ) {
            error!("Indexer: failed to record run marker: {:#}", e);
        }
        self.events.publish(Event::IndexRunCompleted {
            servers_indexed: summary.servers_indexed,
            servers_failed: summary.servers_failed.len(),
            messages: summary.messages_indexed,
        });

        info!(
            "Indexer: run complete, {} servers indexed, {} failed, {} messages",
            summary.servers_indexed,
            summary.servers_failed.len(),
            summary.messages_indexed
        );
        for (server_id, reason) in &summary.servers_failed {
            warn!("Indexer: failure summary: server {}: {}", server_id, reason);
        }
        summary
    }

    async fn index_server(&self, server: &Server) -> anyhow::Result<ServerStats> {
        self.db.upsert_server(server)?;

        let channels = self.reader.root_channels(&server.id).await?;
        for channel in &channels {
            self.db.upsert_channel(channel)?;
        }

        // Threads are enumerated once per guild and handed to the channel
        // fetch they belong to.
        let mut threads_by_parent: HashMap<String, Vec<Channel>> = HashMap::new();
        match self.reader.active_threads(&server.id).await {
            Ok(threads) => {
                for thread in threads {
                    if let Some(parent) = thread.parent_id.clone() {
                        threads_by_parent.entry(parent).or_default().push(thread);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Indexer: listing active threads of {} failed, continuing without them: {}",
                    server.id, e
                );
            }
        }

        let mut enabled = Vec::new();
        for channel in channels {
            let flags = self.db.channel_flags(&channel.id)?.unwrap_or_default();
            if flags.has(ChannelFlag::IndexingEnabled) {
                enabled.push(Channel { flags, ..channel });
            }
        }
        debug!(
            "Indexer: server {} has {} indexable root channels",
            server.id,
            enabled.len()
        );

        let semaphore = Arc::new(Semaphore::new(self.opts.max_concurrent_channels));
        let mut tasks = JoinSet::new();
        for channel in enabled {
            let indexer = self.clone();
            let server = server.clone();
            let threads = threads_by_parent.remove(&channel.id).unwrap_or_default();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (channel.id, Err(anyhow!("channel semaphore closed"))),
                };
                // A stuck fetch must not stall the run; on expiry the
                // channel counts as failed for this cycle.
                let result = match timeout(
                    indexer.opts.channel_fetch_timeout,
                    indexer.index_channel(&server, &channel, threads),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!(
                        "timed out after {:?}",
                        indexer.opts.channel_fetch_timeout
                    )),
                };
                (channel.id, result)
            });
        }

        let mut stats = ServerStats::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(messages))) => {
                    stats.channels += 1;
                    stats.messages += messages;
                }
                Ok((channel_id, Err(e))) => {
                    // Zero messages contributed, move on; the next run picks
                    // the channel up again.
                    warn!("Indexer: channel {} failed: {:#}", channel_id, e);
                }
                Err(join_error) => {
                    error!("Indexer: channel task aborted: {}", join_error);
                }
            }
        }
        Ok(stats)
    }

    /// Fetch, convert, filter and persist one root channel (threads
    /// included). Returns the number of messages written.
    async fn index_channel(
        &self,
        server: &Server,
        channel: &Channel,
        active_threads: Vec<Channel>,
    ) -> anyhow::Result<u64> {
        let stop_at = match self.db.latest_message_id(&channel.id)? {
            Some(id) => Some(snowflake::parse(&id)?),
            None => None,
        };
        let fetch_opts = FetchOptions {
            max_messages: self.opts.max_messages_for(&server.id),
            include_threads: true,
            max_archived_threads: self.opts.max_archived_threads,
            stop_at,
        };

        let outcome =
            fetch_all_channel_messages(self.reader.as_ref(), channel, active_threads, &fetch_opts)
                .await?;
        for thread in &outcome.threads {
            self.db.upsert_channel(thread)?;
        }

        let author_ids: Vec<String> = outcome
            .messages
            .iter()
            .map(|m| m.author.id.to_string())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let consent = self.db.consent_map(&server.id, &author_ids)?;
        let kept = convert::filter_indexable_messages(outcome.messages, channel.flags, &consent);

        let mut accounts = Vec::new();
        let mut converted = Vec::new();
        for raw in &kept {
            match convert::message_from_discord(raw, &server.id) {
                Ok(message) => {
                    accounts.push(convert::account_from_user(&raw.author));
                    converted.push(message);
                }
                Err(e) => {
                    // One malformed entity never takes the batch down.
                    warn!("Indexer: skipping entity: {}", e);
                }
            }
        }

        let accounts = convert::dedupe_by_id(accounts, |a| a.id.as_str());
        let mut messages = convert::dedupe_by_id(converted, |m| m.id.as_str());
        link_thread_starters(&mut messages, &outcome.threads);
        let messages = snowflake::sort_by_recency(messages)?;

        self.db
            .run_blocking(move |db| db.upsert_accounts(&accounts))
            .await?;

        let mut written = 0u64;
        for chunk in messages.chunks(self.opts.message_batch_size) {
            match self.persist_chunk(chunk).await {
                Ok(count) => written += count as u64,
                Err(e) => {
                    warn!(
                        "Indexer: dropping chunk of {} messages in channel {} after {} attempts: {:#}",
                        chunk.len(),
                        channel.id,
                        PERSIST_RETRY_ATTEMPTS,
                        e
                    );
                }
            }
        }

        debug!(
            "Indexer: channel {} contributed {} messages",
            channel.id, written
        );
        Ok(written)
    }

    async fn persist_chunk(&self, chunk: &[Message]) -> anyhow::Result<usize> {
        let mut last_error = None;
        for attempt in 1..=PERSIST_RETRY_ATTEMPTS {
            let batch = chunk.to_vec();
            match self
                .db
                .run_blocking(move |db| db.upsert_many_messages(&batch))
                .await
            {
                Ok(count) => return Ok(count),
                Err(e) => {
                    debug!(
                        "Indexer: batch write attempt {}/{} failed: {:#}",
                        attempt, PERSIST_RETRY_ATTEMPTS, e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("batch write failed")))
    }
}

/// Stamps `child_thread_id` on messages that spawned a thread. A thread
/// shares its id with its starter message, so this is a pure id match.
fn link_thread_starters(messages: &mut [Message], threads: &[Channel]) {
    let thread_ids: HashSet<&str> = threads.iter().map(|t| t.id.as_str()).collect();
    for message in messages {
        if thread_ids.contains(message.id.as_str()) {
            message.child_thread_id = Some(message.id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::mock::{raw_message, MockReader};
    use crate::model::ChannelKind;
    use crate::settings::{Bitfield, UserServerFlag};
    use serenity::model::channel::MessageType;
    use std::sync::atomic::Ordering;

    fn test_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        db
    }

    fn test_opts() -> IndexerOptions {
        IndexerOptions {
            disabled: false,
            max_messages_per_channel: 1000,
            max_archived_threads: 10,
            max_concurrent_servers: 2,
            max_concurrent_channels: 2,
            channel_fetch_timeout: Duration::from_secs(5),
            message_batch_size: 50,
            overrides: Vec::new(),
        }
    }

    fn server(id: &str) -> Server {
        Server {
            id: id.to_string(),
            name: format!("guild-{id}"),
            ..Server::default()
        }
    }

    fn channel(id: &str, server_id: &str) -> Channel {
        Channel {
            id: id.to_string(),
            server_id: server_id.to_string(),
            name: format!("channel-{id}"),
            ..Channel::default()
        }
    }

    fn enable_indexing(db: &Database, ch: &Channel) {
        db.upsert_channel(ch).unwrap();
        db.set_channel_flags(
            &ch.id,
            Bitfield::default().set(ChannelFlag::IndexingEnabled),
        )
        .unwrap();
    }

    fn indexer(reader: Arc<MockReader>, db: &Database, opts: IndexerOptions) -> Indexer {
        Indexer::new(reader, db.clone(), EventBus::default(), opts)
    }

    #[tokio::test]
    async fn test_end_to_end_consent_scenario() {
        // One text channel with 3 human messages and 1 system message; one
        // author has indexing disabled. Exactly the 2 consenting human
        // messages land in storage.
        let mut reader = MockReader::default();
        reader.servers = vec![server("1")];
        reader
            .root_channels
            .insert("1".to_string(), vec![channel("10", "1")]);
        let mut joined = raw_message(104, 50, "");
        joined.kind = MessageType::MemberJoin;
        reader.add_messages(
            "10",
            vec![
                raw_message(101, 50, "how do I do the thing?"),
                raw_message(102, 51, "please do not index me"),
                raw_message(103, 50, "never mind, solved it"),
                joined,
            ],
        );

        let db = test_db();
        enable_indexing(&db, &channel("10", "1"));
        db.set_user_server_flags(
            "51",
            "1",
            Bitfield::default().set(UserServerFlag::MessageIndexingDisabled),
        )
        .unwrap();

        let summary = indexer(Arc::new(reader), &db, test_opts()).index_servers().await;

        assert_eq!(summary.servers_indexed, 1);
        assert!(summary.servers_failed.is_empty());
        assert_eq!(summary.messages_indexed, 2);

        let stored = db.messages_for_channel("10").unwrap();
        let ids: Vec<&str> = stored.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["101", "103"]);
    }

    #[tokio::test]
    async fn test_partial_failure_isolation() {
        // Server A's channel fetch throws, server B's succeeds. The run
        // completes, B's messages are present, A contributes nothing.
        let mut reader = MockReader::default();
        reader.servers = vec![server("1"), server("2")];
        reader
            .root_channels
            .insert("1".to_string(), vec![channel("10", "1")]);
        reader
            .root_channels
            .insert("2".to_string(), vec![channel("20", "2")]);
        reader.fail_channels.insert("10".to_string());
        reader.add_messages("20", vec![raw_message(201, 60, "b server message")]);

        let db = test_db();
        enable_indexing(&db, &channel("10", "1"));
        enable_indexing(&db, &channel("20", "2"));

        let summary = indexer(Arc::new(reader), &db, test_opts()).index_servers().await;

        // The channel failure is contained inside server A, which still
        // completes; the summary reflects both servers as indexed.
        assert_eq!(summary.servers_indexed, 2);
        assert!(summary.servers_failed.is_empty());
        assert_eq!(summary.messages_indexed, 1);
        assert_eq!(db.messages_for_channel("20").unwrap().len(), 1);
        assert!(db.messages_for_channel("10").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_level_failure_does_not_stop_the_run() {
        // Server 1 cannot even list its channels; server 2 still lands.
        let mut reader = MockReader::default();
        reader.servers = vec![server("1"), server("2")];
        reader.fail_servers.insert("1".to_string());
        reader
            .root_channels
            .insert("2".to_string(), vec![channel("20", "2")]);
        reader.add_messages("20", vec![raw_message(201, 60, "survivor")]);

        let db = test_db();
        enable_indexing(&db, &channel("20", "2"));

        let summary = indexer(Arc::new(reader), &db, test_opts()).index_servers().await;
        assert_eq!(summary.servers_indexed, 1);
        assert_eq!(summary.servers_failed.len(), 1);
        assert_eq!(summary.servers_failed[0].0, "1");
        assert_eq!(db.count_server_messages("2").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_indexing_is_idempotent() {
        let mut reader = MockReader::default();
        reader.servers = vec![server("1")];
        reader
            .root_channels
            .insert("1".to_string(), vec![channel("10", "1")]);
        reader.add_messages(
            "10",
            vec![raw_message(101, 50, "one"), raw_message(102, 50, "two")],
        );

        let db = test_db();
        enable_indexing(&db, &channel("10", "1"));
        let reader = Arc::new(reader);

        indexer(reader.clone(), &db, test_opts()).index_servers().await;
        let snapshot1 = db.messages_for_channel("10").unwrap();

        indexer(reader, &db, test_opts()).index_servers().await;
        let snapshot2 = db.messages_for_channel("10").unwrap();

        assert_eq!(snapshot1, snapshot2);
        assert_eq!(snapshot2.len(), 2);
    }

    #[tokio::test]
    async fn test_incremental_runs_skip_already_indexed_history() {
        let mut reader = MockReader::default();
        reader.servers = vec![server("1")];
        reader
            .root_channels
            .insert("1".to_string(), vec![channel("10", "1")]);
        reader.add_messages(
            "10",
            (1..=150).map(|i| raw_message(i, 50, "m")).collect(),
        );

        let db = test_db();
        enable_indexing(&db, &channel("10", "1"));
        let reader = Arc::new(reader);

        indexer(reader.clone(), &db, test_opts()).index_servers().await;
        let calls_first = reader.fetch_calls.load(Ordering::SeqCst);

        // Second run finds the cursor in the first page and stops there.
        indexer(reader.clone(), &db, test_opts()).index_servers().await;
        let calls_second = reader.fetch_calls.load(Ordering::SeqCst) - calls_first;
        assert!(calls_second < calls_first);
        assert_eq!(db.messages_for_channel("10").unwrap().len(), 150);
    }

    #[tokio::test]
    async fn test_channels_without_indexing_enabled_are_skipped() {
        let mut reader = MockReader::default();
        reader.servers = vec![server("1")];
        reader
            .root_channels
            .insert("1".to_string(), vec![channel("10", "1")]);
        reader.add_messages("10", vec![raw_message(101, 50, "hidden")]);

        let db = test_db();
        // Channel exists but indexing was never enabled.
        db.upsert_channel(&channel("10", "1")).unwrap();

        let summary = indexer(Arc::new(reader), &db, test_opts()).index_servers().await;
        assert_eq!(summary.messages_indexed, 0);
        assert!(db.messages_for_channel("10").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kill_switch_skips_run() {
        let mut reader = MockReader::default();
        reader.servers = vec![server("1")];
        let reader = Arc::new(reader);
        let db = test_db();

        let opts = IndexerOptions {
            disabled: true,
            ..test_opts()
        };
        let summary = indexer(reader.clone(), &db, opts).index_servers().await;
        assert_eq!(summary.servers_indexed, 0);
        assert_eq!(reader.fetch_calls.load(Ordering::SeqCst), 0);
        assert!(db.last_index_run().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_guild_override_disables_server() {
        let mut reader = MockReader::default();
        reader.servers = vec![server("1")];
        reader
            .root_channels
            .insert("1".to_string(), vec![channel("10", "1")]);
        reader.add_messages("10", vec![raw_message(101, 50, "skip me")]);

        let db = test_db();
        enable_indexing(&db, &channel("10", "1"));

        let opts = IndexerOptions {
            overrides: vec![GuildOverride {
                guild_id: "1".to_string(),
                disabled: true,
                max_messages: None,
            }],
            ..test_opts()
        };
        let summary = indexer(Arc::new(reader), &db, opts).index_servers().await;
        assert_eq!(summary.servers_indexed, 0);
        assert!(db.messages_for_channel("10").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_thread_starters_are_linked_and_threads_indexed() {
        let mut reader = MockReader::default();
        reader.servers = vec![server("1")];
        reader
            .root_channels
            .insert("1".to_string(), vec![channel("10", "1")]);
        // Message 101 spawned thread 101.
        reader.add_messages("10", vec![raw_message(101, 50, "question?")]);
        let thread = Channel {
            id: "101".to_string(),
            server_id: "1".to_string(),
            name: "question thread".to_string(),
            kind: ChannelKind::PublicThread,
            parent_id: Some("10".to_string()),
            ..Channel::default()
        };
        reader
            .active_threads
            .insert("1".to_string(), vec![thread]);
        reader.add_messages("101", vec![raw_message(102, 51, "an answer")]);

        let db = test_db();
        enable_indexing(&db, &channel("10", "1"));

        let summary = indexer(Arc::new(reader), &db, test_opts()).index_servers().await;
        assert_eq!(summary.messages_indexed, 2);

        let root_messages = db.messages_for_channel("10").unwrap();
        assert_eq!(root_messages[0].child_thread_id.as_deref(), Some("101"));
        assert_eq!(db.messages_for_channel("101").unwrap().len(), 1);
        assert_eq!(db.question_ids_for_server("1").unwrap(), vec!["101".to_string()]);
        // The thread itself got a channel record.
        assert!(db.get_channel("101").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_marker_and_completion_event() {
        let mut reader = MockReader::default();
        reader.servers = vec![server("1")];
        reader
            .root_channels
            .insert("1".to_string(), vec![channel("10", "1")]);
        reader.add_messages("10", vec![raw_message(101, 50, "hello")]);

        let db = test_db();
        enable_indexing(&db, &channel("10", "1"));

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let indexer = Indexer::new(Arc::new(reader), db.clone(), events, test_opts());
        indexer.index_servers().await;

        assert_eq!(db.last_index_run().unwrap(), Some((1, 0, 1)));

        let mut saw_completion = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::IndexRunCompleted { servers_indexed, .. } = event {
                assert_eq!(servers_indexed, 1);
                saw_completion = true;
            }
        }
        assert!(saw_completion);
    }
}
