//! The cron harness driving periodic indexing.
//!
//! A ticker fires a full indexing pass every N hours, plus one immediate
//! pass at startup outside production. The sitemap warm job runs after each
//! pass as an independent follow-up: its failure never marks the indexing
//! pass itself as failed.

use crate::indexer::Indexer;
use crate::sitemap::SitemapWarmer;
use tokio::time::{interval, Duration, Instant};
use tracing::{error, info};

pub struct IndexScheduler {
    indexer: Indexer,
    warmer: SitemapWarmer,
    interval: Duration,
    run_on_start: bool,
}

impl IndexScheduler {
    pub fn new(
        indexer: Indexer,
        warmer: SitemapWarmer,
        interval_hours: u64,
        run_on_start: bool,
    ) -> Self {
        Self {
            indexer,
            warmer,
            interval: Duration::from_secs(interval_hours * 3600),
            run_on_start,
        }
    }

    pub async fn run(self) {
        if self.run_on_start {
            info!("Scheduler: running startup indexing pass");
            self.cycle().await;
        }

        let mut ticker = interval(self.interval);
        // The first tick completes immediately; the startup pass above
        // already covers that case where it is wanted.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.cycle().await;
        }
    }

    async fn cycle(&self) {
        let started = Instant::now();
        let summary = self.indexer.index_servers().await;
        let elapsed = Duration::from_secs(started.elapsed().as_secs());
        info!(
            "Scheduler: indexing pass done in {} ({} servers, {} messages, {} failures)",
            humantime::format_duration(elapsed),
            summary.servers_indexed,
            summary.messages_indexed,
            summary.servers_failed.len()
        );

        if let Err(e) = self.warmer.warm_all().await {
            error!("Scheduler: sitemap warm job failed: {:#}", e);
        }
    }
}
