//! Paginated retrieval of a root channel's messages and its threads.
//!
//! One fetch covers the root channel plus its active and a bounded number of
//! archived threads, all drawn from a single per-run message budget. Calls
//! are sequential within a channel; concurrency across channels is bounded
//! by the orchestrator.

use crate::discord::{DiscordReader, MESSAGE_PAGE_LIMIT};
use crate::error::IndexError;
use crate::model::Channel;
use serenity::model::channel::Message as DiscordMessage;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Hard cap on messages collected for this channel (root + threads) in
    /// one run. Channels that exceed it get a partial index up to the cap
    /// and are revisited next cycle.
    pub max_messages: usize,
    pub include_threads: bool,
    pub max_archived_threads: usize,
    /// Incremental cursor: the newest already-indexed message id. Backward
    /// pagination stops once it reaches this id.
    pub stop_at: Option<u64>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            max_messages: 20_000,
            include_threads: true,
            max_archived_threads: 100,
            stop_at: None,
        }
    }
}

/// Progress of one channel fetch. Terminal states are `Done` and `Failed`;
/// the orchestrator treats `Failed` as zero messages contributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    FetchingRoot,
    FetchingThreads,
    Done,
    Failed,
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Raw messages, unordered across pages. Callers sort by snowflake
    /// after conversion.
    pub messages: Vec<DiscordMessage>,
    /// Threads discovered under the root channel (active + archived).
    pub threads: Vec<Channel>,
    /// True when the budget ran out before the channel was exhausted.
    pub truncated: bool,
}

/// Collects messages for one root channel and, when enabled, its threads.
///
/// A failure on the root channel fails the whole fetch (there is nothing
/// meaningful to index without it); a failure on an individual thread or on
/// archived-thread enumeration is logged and skipped so sibling threads
/// still contribute.
pub async fn fetch_all_channel_messages(
    reader: &dyn DiscordReader,
    channel: &Channel,
    active_threads: Vec<Channel>,
    opts: &FetchOptions,
) -> Result<FetchOutcome, IndexError> {
    let mut state = FetchState::Pending;
    debug!("Fetcher: channel {} entering {:?}", channel.id, state);
    let mut outcome = FetchOutcome::default();

    state = FetchState::FetchingRoot;
    debug!("Fetcher: channel {} entering {:?}", channel.id, state);

    match paginate_backward(reader, &channel.id, opts.max_messages, opts.stop_at).await {
        Ok(page) => {
            outcome.truncated |= page.truncated;
            outcome.messages.extend(page.messages);
        }
        Err(err) => {
            state = FetchState::Failed;
            debug!("Fetcher: channel {} entering {:?}", channel.id, state);
            return Err(err);
        }
    }

    if opts.include_threads {
        state = FetchState::FetchingThreads;
        debug!("Fetcher: channel {} entering {:?}", channel.id, state);

        let mut threads = active_threads;
        match reader
            .archived_threads(&channel.id, opts.max_archived_threads)
            .await
        {
            Ok(archived) => threads.extend(archived),
            Err(err) => {
                warn!(
                    "Fetcher: listing archived threads of {} failed, continuing without them: {}",
                    channel.id, err
                );
            }
        }

        for thread in threads {
            let budget = opts.max_messages.saturating_sub(outcome.messages.len());
            if budget == 0 {
                outcome.truncated = true;
                break;
            }
            // Threads are re-fetched in full each run; the keyed upserts
            // make the overlap harmless.
            match paginate_backward(reader, &thread.id, budget, None).await {
                Ok(page) => {
                    outcome.truncated |= page.truncated;
                    outcome.messages.extend(page.messages);
                    outcome.threads.push(thread);
                }
                Err(err) => {
                    warn!(
                        "Fetcher: thread {} under {} failed, skipping it: {}",
                        thread.id, channel.id, err
                    );
                    outcome.threads.push(thread);
                }
            }
        }
    }

    state = FetchState::Done;
    debug!(
        "Fetcher: channel {} entering {:?} ({} messages, {} threads, truncated: {})",
        channel.id,
        state,
        outcome.messages.len(),
        outcome.threads.len(),
        outcome.truncated
    );
    Ok(outcome)
}

struct PageRun {
    messages: Vec<DiscordMessage>,
    truncated: bool,
}

/// Walks message history backward from the newest message, one page at a
/// time, until the channel is exhausted, the budget is spent, or the
/// incremental cursor is reached.
async fn paginate_backward(
    reader: &dyn DiscordReader,
    channel_id: &str,
    budget: usize,
    stop_at: Option<u64>,
) -> Result<PageRun, IndexError> {
    let mut messages: Vec<DiscordMessage> = Vec::new();
    let mut cursor: Option<String> = None;
    let mut truncated = false;

    loop {
        let remaining = budget - messages.len();
        if remaining == 0 {
            truncated = true;
            break;
        }

        let limit = remaining.min(MESSAGE_PAGE_LIMIT);
        let page = reader
            .messages_before(channel_id, cursor.as_deref(), limit)
            .await?;
        if page.is_empty() {
            break;
        }

        let full_page = page.len() == limit;
        // Pages arrive newest first; the last entry is the next cursor.
        cursor = page.last().map(|m| m.id.to_string());

        let mut reached_cursor = false;
        for message in page {
            if let Some(stop) = stop_at {
                if message.id.get() <= stop {
                    reached_cursor = true;
                    continue;
                }
            }
            messages.push(message);
        }

        if reached_cursor || !full_page {
            break;
        }
    }

    Ok(PageRun { messages, truncated })
}
