use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::db::Database;
use crate::error::SyncError;

#[derive(Debug)]
pub struct SweepOutcome {
    pub feed_id: String,
    pub title: String,
    pub result: Result<u64, SyncError>,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub outcomes: Vec<SweepOutcome>,
}

impl SweepReport {
    pub fn deleted(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .sum()
    }

    pub fn deleted_for(&self, feed_id: &str) -> Option<u64> {
        self.outcomes
            .iter()
            .find(|o| o.feed_id == feed_id)
            .and_then(|o| o.result.as_ref().ok().copied())
    }
}

/// Deletes articles published before their feed's watermark.
pub struct Sweeper {
    db: Arc<Database>,
}

impl Sweeper {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Sweep every feed that has a watermark. Feeds without one are skipped
    /// and do not appear in the report.
    pub async fn sweep(&self) -> anyhow::Result<SweepReport> {
        let feeds = self.db.get_all_feeds().await?;
        let mut report = SweepReport::default();

        for feed in feeds {
            let Some(watermark) = feed.oldest_watermark else {
                continue;
            };

            let result = self
                .db
                .delete_articles_published_before(&feed.id, watermark)
                .await
                .map_err(|e| SyncError::SweepFailure(e.to_string()));

            match &result {
                Ok(deleted) => info!(
                    "Deleted {} old articles for feed '{}'",
                    deleted, feed.title
                ),
                Err(e) => error!(
                    "Error deleting old articles for feed '{}' ({}): {}",
                    feed.title, feed.id, e
                ),
            }

            report.outcomes.push(SweepOutcome {
                feed_id: feed.id,
                title: feed.title,
                result,
            });
        }

        Ok(report)
    }
}

pub async fn start_background_sweep(sweeper: Arc<Sweeper>, interval_minutes: u64) {
    let interval = Duration::from_secs(interval_minutes.max(1).saturating_mul(60));

    loop {
        tokio::time::sleep(interval).await;
        info!("Starting scheduled retention sweep");
        match sweeper.sweep().await {
            Ok(report) => info!("Retention sweep removed {} articles", report.deleted()),
            Err(e) => error!("Scheduled retention sweep failed: {}", e),
        }
    }
}
