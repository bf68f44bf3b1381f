//! Post-index sitemap warming.
//!
//! After an indexing pass, each active server's question list (thread
//! starters) is recomputed into `sitemap_cache` so sitemap rendering never
//! hits the message table cold. Runs at low priority with a deliberate
//! pause between servers, and may ping a revalidation endpoint when done.

use crate::config::Config;
use crate::db::Database;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

pub struct SitemapWarmer {
    db: Database,
    http: reqwest::Client,
    delay: Duration,
    ping_url: Option<String>,
}

impl SitemapWarmer {
    pub fn new(db: Database, http: reqwest::Client, config: &Config) -> Self {
        Self {
            db,
            http,
            delay: Duration::from_millis(config.sitemap_warm_delay_ms),
            ping_url: config.sitemap_ping_url.clone(),
        }
    }

    /// Warms the question cache for every active server. A failure on one
    /// server is logged and the rest still get warmed.
    pub async fn warm_all(&self) -> anyhow::Result<()> {
        let servers = self.db.run_blocking(|db| db.list_active_servers()).await?;
        debug!("Sitemap: warming question caches for {} servers", servers.len());

        for (i, server) in servers.iter().enumerate() {
            if i > 0 {
                // Pace the writes instead of hammering storage right after
                // an indexing pass.
                sleep(self.delay).await;
            }

            let server_id = server.id.clone();
            let result = self
                .db
                .run_blocking(move |db| {
                    let ids = db.question_ids_for_server(&server_id)?;
                    db.save_sitemap_cache(&server_id, &ids)?;
                    Ok(ids.len())
                })
                .await;
            match result {
                Ok(count) => debug!("Sitemap: cached {} questions for {}", count, server.id),
                Err(e) => warn!("Sitemap: warming {} failed: {:#}", server.id, e),
            }
        }

        if let Some(url) = &self.ping_url {
            match self.http.get(url).send().await {
                Ok(response) => {
                    debug!("Sitemap: revalidation ping returned {}", response.status())
                }
                Err(e) => warn!("Sitemap: revalidation ping failed: {}", e),
            }
        }

        Ok(())
    }
}
