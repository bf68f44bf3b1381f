use thiserror::Error;

/// Operational failures during an indexing run.
///
/// Every variant here is expected against real Discord data and is handled
/// by skipping the smallest affected scope (a channel, an entity, a write
/// batch). Programming errors use [`InvalidSnowflake`] / [`UnknownFlag`]
/// instead and propagate.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Transient fetch failure after the client's own retry/backoff gave up.
    #[error("fetch failed: {0}")]
    Fetch(#[source] serenity::Error),

    /// The bot lacks access to the channel. Not retried; the channel is
    /// skipped until permissions change.
    #[error("missing access to channel {channel_id}")]
    Permission { channel_id: String },

    /// A raw Discord entity did not have the shape we expect.
    #[error("cannot convert entity {id}: {reason}")]
    Conversion { id: String, reason: String },

    /// A storage write failed. Retried a bounded number of times at the
    /// batch level before the chunk is dropped.
    #[error("persistence failed: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl IndexError {
    /// Maps a serenity error onto the taxonomy: 403s become [`Permission`]
    /// (never retried), everything else is a transient [`Fetch`].
    ///
    /// [`Permission`]: IndexError::Permission
    /// [`Fetch`]: IndexError::Fetch
    pub fn from_discord(err: serenity::Error, channel_id: &str) -> Self {
        use serenity::http::HttpError;

        if let serenity::Error::Http(HttpError::UnsuccessfulRequest(ref resp)) = err {
            if resp.status_code.as_u16() == 403 {
                return IndexError::Permission {
                    channel_id: channel_id.to_string(),
                };
            }
        }
        IndexError::Fetch(err)
    }
}

/// A snowflake string that is not a decimal u64. Indicates a bug, not an
/// operational condition; callers do not catch this.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid snowflake {0:?}")]
pub struct InvalidSnowflake(pub String);

/// A settings flag name that does not belong to the flag set it was used
/// with. Fails fast rather than silently reading as unset.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown settings flag {0:?}")]
pub struct UnknownFlag(pub String);
