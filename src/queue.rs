//! Sync jobs requested outside the periodic schedule, e.g. right after a
//! feed is subscribed. Producers never wait on the fetch itself; a full
//! queue is reported back instead.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info};

use crate::db::FeedSelection;
use crate::fetcher::Fetcher;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("sync queue is full")]
    Full,
    #[error("sync queue is closed")]
    Closed,
}

#[derive(Clone)]
pub struct SyncQueue {
    sender: mpsc::Sender<FeedSelection>,
}

impl SyncQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FeedSelection>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, selection: FeedSelection) -> Result<(), QueueError> {
        self.sender.try_send(selection).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

/// Consume queued jobs until every [`SyncQueue`] handle is dropped. Jobs run
/// one after another, so a busy worker leaves later jobs in the channel and
/// `enqueue` reports [`QueueError::Full`] once it holds `capacity` of them.
pub async fn run_sync_worker(fetcher: Arc<Fetcher>, mut receiver: mpsc::Receiver<FeedSelection>) {
    while let Some(selection) = receiver.recv().await {
        info!("Running queued sync for {}", selection);
        if let Err(e) = fetcher.sync(&selection).await {
            error!("Queued sync for {} failed: {}", selection, e);
        }
    }
    info!("Sync queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, NewFeed};
    use crate::fetcher::FetcherOptions;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_full_queue_rejects() {
        let (queue, _receiver) = SyncQueue::channel(1);
        queue.enqueue(FeedSelection::all()).unwrap();
        assert!(matches!(
            queue.enqueue(FeedSelection::all()),
            Err(QueueError::Full)
        ));
    }

    #[test]
    fn test_closed_queue_rejects() {
        let (queue, receiver) = SyncQueue::channel(4);
        drop(receiver);
        assert!(matches!(
            queue.enqueue(FeedSelection::all()),
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_busy_worker_applies_backpressure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<rss><channel></channel></rss>")
                    .set_delay(Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;

        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(db);
        db.create_feed(&NewFeed {
            user_id: 1,
            title: "Slow".to_string(),
            url: format!("{}/slow.xml", server.uri()),
            description: None,
        })
        .await
        .unwrap();

        let fetcher = Arc::new(
            Fetcher::new(
                db.clone(),
                FetcherOptions {
                    user_agent: "test".to_string(),
                    timeout: Duration::from_secs(5),
                    max_concurrent: 2,
                },
            )
            .unwrap(),
        );

        let (queue, receiver) = SyncQueue::channel(1);
        tokio::spawn(run_sync_worker(fetcher.clone(), receiver));

        queue.enqueue(FeedSelection::all()).unwrap();
        for _ in 0..50 {
            if fetcher.is_refreshing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fetcher.is_refreshing());

        // The first job is running; one more fits in the channel.
        queue.enqueue(FeedSelection::all()).unwrap();
        assert!(matches!(
            queue.enqueue(FeedSelection::all()),
            Err(QueueError::Full)
        ));
    }

    #[tokio::test]
    async fn test_worker_syncs_queued_feed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<rss><channel><item><guid>1</guid><title>Queued</title></item></channel></rss>",
            ))
            .mount(&server)
            .await;

        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(db);
        let feed = db
            .create_feed(&NewFeed {
                user_id: 1,
                title: "Queued".to_string(),
                url: format!("{}/feed.xml", server.uri()),
                description: None,
            })
            .await
            .unwrap();

        let fetcher = Arc::new(
            Fetcher::new(
                db.clone(),
                FetcherOptions {
                    user_agent: "test".to_string(),
                    timeout: Duration::from_secs(5),
                    max_concurrent: 2,
                },
            )
            .unwrap(),
        );

        let (queue, receiver) = SyncQueue::channel(4);
        let worker = tokio::spawn(run_sync_worker(fetcher, receiver));
        queue.enqueue(FeedSelection::for_feed(&feed.id)).unwrap();

        let mut count = 0;
        for _ in 0..50 {
            count = db.get_article_count_for_feed(&feed.id).await.unwrap();
            if count > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(count, 1);

        drop(queue);
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
