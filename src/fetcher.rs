use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use reqwest::{header::CONTENT_TYPE, Client};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{Database, Feed, FeedSelection};
use crate::error::SyncError;
use crate::parser::parse_document;
use crate::reconciler::{decode_entities, reconcile, ReconcileSummary};

pub const UNNAMED_FEED: &str = "Unnamed Feed";

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_concurrent: usize,
}

impl From<&Config> for FetcherOptions {
    fn from(config: &Config) -> Self {
        Self {
            user_agent: config.user_agent(),
            timeout: config.request_timeout(),
            max_concurrent: config.max_concurrent_fetches,
        }
    }
}

/// What happened to one feed during a sync.
#[derive(Debug)]
pub struct FeedOutcome {
    pub feed_id: String,
    pub title: String,
    pub result: Result<ReconcileSummary, SyncError>,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub outcomes: Vec<FeedOutcome>,
}

impl SyncReport {
    pub fn processed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    pub fn inserted(&self) -> usize {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(|summary| summary.inserted)
            .sum()
    }

    pub fn outcome(&self, feed_id: &str) -> Option<&FeedOutcome> {
        self.outcomes.iter().find(|o| o.feed_id == feed_id)
    }
}

/// One async mutex per feed id, so two syncs of the same feed never
/// reconcile at the same time. Entries nobody holds are dropped on the next
/// acquisition.
#[derive(Default)]
struct FeedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FeedLocks {
    fn for_feed(&self, feed_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(feed_id.to_string()).or_default().clone()
    }
}

struct FetchedBody {
    body: Vec<u8>,
    content_type: Option<String>,
}

/// Fetches a batch of feeds concurrently and runs each response through
/// parsing and reconciliation.
pub struct Fetcher {
    client: Client,
    db: Arc<Database>,
    timeout: Duration,
    max_concurrent: usize,
    /// Shared by every sync and title lookup, so overlapping batches still
    /// keep at most `max_concurrent` requests in flight.
    fetch_permits: Semaphore,
    locks: FeedLocks,
    active_syncs: AtomicUsize,
}

impl Fetcher {
    pub fn new(db: Arc<Database>, options: FetcherOptions) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .user_agent(options.user_agent)
            .build()?;

        let max_concurrent = options.max_concurrent.max(1);
        Ok(Self {
            client,
            db,
            timeout: options.timeout,
            max_concurrent,
            fetch_permits: Semaphore::new(max_concurrent),
            locks: FeedLocks::default(),
            active_syncs: AtomicUsize::new(0),
        })
    }

    pub fn is_refreshing(&self) -> bool {
        self.active_syncs.load(Ordering::Relaxed) > 0
    }

    /// Sync every feed in `selection`.
    ///
    /// Only failing to load the feed list is an error. Per-feed failures are
    /// logged and reported in the returned [`SyncReport`].
    pub async fn sync(&self, selection: &FeedSelection) -> anyhow::Result<SyncReport> {
        let feeds = self.db.get_feeds(selection).await?;
        info!("Refreshing {} feeds ({})", feeds.len(), selection);

        self.active_syncs.fetch_add(1, Ordering::Relaxed);

        let outcomes: Vec<FeedOutcome> = stream::iter(feeds)
            .map(|feed| async move {
                let result = self.sync_feed(&feed).await;
                if let Err(e) = &result {
                    error!(
                        "Failed to refresh feed '{}' ({}, user {}): {}",
                        feed.title, feed.id, feed.user_id, e
                    );
                }
                FeedOutcome {
                    feed_id: feed.id,
                    title: feed.title,
                    result,
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        self.active_syncs.fetch_sub(1, Ordering::Relaxed);

        let report = SyncReport { outcomes };
        info!(
            "Feed refresh complete: {} processed, {} failed, {} new articles",
            report.processed(),
            report.failed(),
            report.inserted()
        );
        Ok(report)
    }

    async fn sync_feed(&self, feed: &Feed) -> Result<ReconcileSummary, SyncError> {
        info!("Fetching feed: {} ({})", feed.title, feed.url);

        let fetched = self.fetch(&feed.url).await?;
        let document = parse_document(&fetched.body, fetched.content_type.as_deref())?;

        let lock = self.locks.for_feed(&feed.id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let summary = reconcile(&self.db, feed, document.articles, now).await?;

        info!(
            "Added {} and updated {} articles for feed '{}'",
            summary.inserted, summary.updated, feed.title
        );
        Ok(summary)
    }

    async fn fetch(&self, url: &str) -> Result<FetchedBody, SyncError> {
        let _permit = self
            .fetch_permits
            .acquire()
            .await
            .map_err(|e| SyncError::ConnectionFailure(e.to_string()))?;

        tokio::time::timeout(self.timeout, self.fetch_body(url))
            .await
            .map_err(|_| {
                SyncError::ConnectionFailure(format!(
                    "request timed out after {:?}",
                    self.timeout
                ))
            })?
    }

    async fn fetch_body(&self, url: &str) -> Result<FetchedBody, SyncError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::FetchFailure {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();

        Ok(FetchedBody { body, content_type })
    }

    /// Title for a new subscription: the one supplied, else the document's
    /// own title, else [`UNNAMED_FEED`].
    pub async fn resolve_title(&self, url: &str, supplied: Option<&str>) -> String {
        if let Some(title) = supplied.map(str::trim).filter(|t| !t.is_empty()) {
            return decode_entities(title);
        }

        let discovered = match self.fetch(url).await {
            Ok(fetched) => {
                match parse_document(&fetched.body, fetched.content_type.as_deref()) {
                    Ok(document) => document.title.filter(|t| !t.is_empty()),
                    Err(e) => {
                        warn!("Error extracting title from feed {}: {}", url, e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Error extracting title from feed {}: {}", url, e);
                None
            }
        };

        discovered
            .map(|title| decode_entities(&title))
            .unwrap_or_else(|| UNNAMED_FEED.to_string())
    }
}

pub async fn start_background_refresh(fetcher: Arc<Fetcher>, interval_minutes: u64) {
    let interval = Duration::from_secs(interval_minutes.max(1).saturating_mul(60));

    info!("Starting initial feed fetch");
    if let Err(e) = fetcher.sync(&FeedSelection::all()).await {
        error!("Initial feed fetch failed: {}", e);
    }

    loop {
        tokio::time::sleep(interval).await;
        info!("Starting scheduled feed refresh");
        if let Err(e) = fetcher.sync(&FeedSelection::all()).await {
            error!("Scheduled feed refresh failed: {}", e);
        }
    }
}
