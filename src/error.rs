use thiserror::Error;

use crate::parser::MalformedDocument;

/// Failures recorded at the per-feed boundary of a sync or sweep.
///
/// None of these abort a batch: the scheduler and sweeper log them and move
/// on to the next feed.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure reaching the feed URL (DNS, TLS, timeout...)
    #[error("Connection error: {0}")]
    ConnectionFailure(String),
    /// The server answered with a non-2xx status
    #[error("Failed to fetch feed: HTTP status {status}")]
    FetchFailure { status: u16 },
    #[error(transparent)]
    MalformedDocument(#[from] MalformedDocument),
    /// Storage error while applying inserts/updates for one feed
    #[error("Failed to store articles: {0}")]
    ReconciliationFailure(String),
    /// Storage error while deleting a feed's old articles
    #[error("Failed to delete old articles: {0}")]
    SweepFailure(String),
}

impl SyncError {
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, SyncError::MalformedDocument(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::ConnectionFailure(err.to_string())
    }
}
