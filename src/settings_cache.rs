//! Read-through LRU cache for channel flags and user consent.
//!
//! The live gateway path looks settings up on every message; this keeps the
//! hot lookups off sqlite. Writes invalidate, so a settings change is
//! visible on the next message.

use crate::db::Database;
use crate::settings::Bitfield;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

pub struct SettingsCache {
    channel_flags: Mutex<LruCache<String, Option<Bitfield>>>,
    consent: Mutex<LruCache<(String, String), Option<Bitfield>>>,
}

impl SettingsCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(100).unwrap());
        Self {
            channel_flags: Mutex::new(LruCache::new(cap)),
            consent: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn channel_flags(&self, db: &Database, channel_id: &str) -> anyhow::Result<Option<Bitfield>> {
        if let Some(flags) = self.channel_flags.lock().unwrap().get(channel_id) {
            return Ok(*flags);
        }
        let flags = db.channel_flags(channel_id)?;
        self.channel_flags
            .lock()
            .unwrap()
            .put(channel_id.to_string(), flags);
        Ok(flags)
    }

    pub fn user_server_flags(
        &self,
        db: &Database,
        user_id: &str,
        server_id: &str,
    ) -> anyhow::Result<Option<Bitfield>> {
        let key = (user_id.to_string(), server_id.to_string());
        if let Some(flags) = self.consent.lock().unwrap().get(&key) {
            return Ok(*flags);
        }
        let flags = db.user_server_flags(user_id, server_id)?;
        self.consent.lock().unwrap().put(key, flags);
        Ok(flags)
    }

    pub fn invalidate_channel(&self, channel_id: &str) {
        self.channel_flags.lock().unwrap().pop(channel_id);
    }

    pub fn invalidate_user(&self, user_id: &str, server_id: &str) {
        self.consent
            .lock()
            .unwrap()
            .pop(&(user_id.to_string(), server_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ChannelFlag;

    fn test_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        db
    }

    #[test]
    fn test_read_through_and_invalidation() {
        let db = test_db();
        let cache = SettingsCache::new(10);

        // Unknown channel caches the miss.
        assert_eq!(cache.channel_flags(&db, "c1").unwrap(), None);

        let channel = crate::model::Channel {
            id: "c1".to_string(),
            server_id: "g1".to_string(),
            name: "help".to_string(),
            ..crate::model::Channel::default()
        };
        db.upsert_channel(&channel).unwrap();
        let enabled = Bitfield::default().set(ChannelFlag::IndexingEnabled);
        db.set_channel_flags("c1", enabled).unwrap();

        // Still the cached miss until invalidated.
        assert_eq!(cache.channel_flags(&db, "c1").unwrap(), None);
        cache.invalidate_channel("c1");
        assert_eq!(cache.channel_flags(&db, "c1").unwrap(), Some(enabled));
    }

    #[test]
    fn test_consent_lookup_is_cached() {
        let db = test_db();
        let cache = SettingsCache::new(10);

        assert_eq!(cache.user_server_flags(&db, "u1", "g1").unwrap(), None);

        let flags = Bitfield(0b10);
        db.set_user_server_flags("u1", "g1", flags).unwrap();
        assert_eq!(cache.user_server_flags(&db, "u1", "g1").unwrap(), None);

        cache.invalidate_user("u1", "g1");
        assert_eq!(cache.user_server_flags(&db, "u1", "g1").unwrap(), Some(flags));
    }
}
