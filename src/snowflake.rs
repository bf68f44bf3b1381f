//! Discord snowflake helpers.
//!
//! Snowflakes encode their creation time in the high 42 bits, so sorting and
//! deduplicating by recency reduces to numeric comparison of the ids. The
//! comparison must be numeric: string comparison orders "999..." after
//! "1000..." and silently corrupts pagination.

use crate::error::InvalidSnowflake;
use crate::model::Message;
use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Ordering;

/// Milliseconds between the unix epoch and the Discord epoch (2015-01-01).
pub const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Parses a snowflake string into its numeric value.
pub fn parse(snowflake: &str) -> Result<u64, InvalidSnowflake> {
    snowflake
        .parse::<u64>()
        .map_err(|_| InvalidSnowflake(snowflake.to_string()))
}

/// Extracts the creation timestamp encoded in a snowflake.
pub fn timestamp_of(snowflake: &str) -> Result<DateTime<Utc>, InvalidSnowflake> {
    let raw = parse(snowflake)?;
    let unix_ms = (raw >> 22) + DISCORD_EPOCH_MS;
    Utc.timestamp_millis_opt(unix_ms as i64)
        .single()
        .ok_or_else(|| InvalidSnowflake(snowflake.to_string()))
}

/// Numeric comparison of two snowflake strings.
pub fn compare(a: &str, b: &str) -> Result<Ordering, InvalidSnowflake> {
    Ok(parse(a)?.cmp(&parse(b)?))
}

/// Stable ascending sort by snowflake, oldest first.
///
/// Fails on the first malformed id rather than guessing an order; canonical
/// messages carry ids that came from numeric Discord ids, so an error here
/// means a bug upstream.
pub fn sort_by_recency(messages: Vec<Message>) -> Result<Vec<Message>, InvalidSnowflake> {
    let mut keyed = messages
        .into_iter()
        .map(|m| Ok((parse(&m.id)?, m)))
        .collect::<Result<Vec<_>, InvalidSnowflake>>()?;
    keyed.sort_by_key(|(key, _)| *key);
    Ok(keyed.into_iter().map(|(_, m)| m).collect())
}
