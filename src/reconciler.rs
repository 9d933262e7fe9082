//! Turning parsed articles into inserts and updates for one feed.
//!
//! Articles are keyed by `(feed, guid)`. A guid seen before updates the
//! stored article's mutable fields; an unseen guid becomes a new unread
//! article. While walking the recurring articles, the oldest publish time
//! among those the user had already read becomes the feed's retention
//! watermark.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::db::{Article, ArticleFields, ArticleUpdate, Database, Feed, NewArticle};
use crate::error::SyncError;
use crate::parser::ParsedArticle;

/// Stored descriptions are cut to this many characters.
pub const DESCRIPTION_LIMIT: usize = 1000;

/// Running minimum of `published_at` over articles that were already read
/// before the current sync touched them.
#[derive(Debug, Default, Clone, Copy)]
pub struct WatermarkTracker {
    oldest: Option<DateTime<Utc>>,
}

impl WatermarkTracker {
    pub fn observe(&mut self, was_read: bool, published_at: DateTime<Utc>) {
        if !was_read {
            return;
        }
        if self.oldest.map_or(true, |oldest| published_at < oldest) {
            self.oldest = Some(published_at);
        }
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.oldest
    }
}

#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub inserts: Vec<NewArticle>,
    pub updates: Vec<ArticleUpdate>,
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub updated: usize,
    pub watermark: Option<DateTime<Utc>>,
}

/// Collapse repeated external ids; the last occurrence wins but keeps the
/// position of the first.
pub fn dedupe_by_external_id(parsed: Vec<ParsedArticle>) -> Vec<ParsedArticle> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<ParsedArticle> = Vec::with_capacity(parsed.len());

    for article in parsed {
        match positions.get(&article.external_id) {
            Some(&index) => unique[index] = article,
            None => {
                positions.insert(article.external_id.clone(), unique.len());
                unique.push(article);
            }
        }
    }

    unique
}

pub fn decode_entities(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Storage form of a parsed article. Missing timestamps take `now`.
pub fn normalize(article: &ParsedArticle, now: DateTime<Utc>) -> ArticleFields {
    ArticleFields {
        title: decode_entities(&article.title),
        description: truncate_chars(&decode_entities(&article.description), DESCRIPTION_LIMIT),
        link: article.link.clone(),
        published_at: article.published_at.unwrap_or(now),
    }
}

/// Decide inserts, updates and the watermark candidate without touching storage.
///
/// `parsed` must already be deduplicated; `existing` holds the feed's stored
/// articles whose guid appears in `parsed`.
pub fn plan(parsed: &[ParsedArticle], existing: &[Article], now: DateTime<Utc>) -> ReconcilePlan {
    let existing: HashMap<&str, &Article> = existing
        .iter()
        .map(|article| (article.guid.as_str(), article))
        .collect();

    let mut plan = ReconcilePlan::default();
    let mut tracker = WatermarkTracker::default();

    for article in parsed {
        let fields = normalize(article, now);

        match existing.get(article.external_id.as_str()) {
            Some(stored) => {
                tracker.observe(stored.is_read, fields.published_at);
                plan.updates.push(ArticleUpdate {
                    id: stored.id.clone(),
                    fields,
                });
            }
            None => plan.inserts.push(NewArticle {
                id: Uuid::new_v4().to_string(),
                guid: article.external_id.clone(),
                fields,
            }),
        }
    }

    plan.watermark = tracker.oldest();
    plan
}

/// Reconcile one feed's freshly parsed articles against storage.
///
/// `now` is the snapshot taken once for this feed's sync; every article
/// without a timestamp gets exactly this value.
pub async fn reconcile(
    db: &Database,
    feed: &Feed,
    parsed: Vec<ParsedArticle>,
    now: DateTime<Utc>,
) -> Result<ReconcileSummary, SyncError> {
    if parsed.is_empty() {
        debug!("Feed '{}' returned no articles", feed.title);
        return Ok(ReconcileSummary::default());
    }

    let parsed = dedupe_by_external_id(parsed);
    let guids: Vec<&str> = parsed.iter().map(|a| a.external_id.as_str()).collect();

    let existing = db
        .get_articles_by_guids(&feed.id, &guids)
        .await
        .map_err(|e| SyncError::ReconciliationFailure(e.to_string()))?;

    let plan = plan(&parsed, &existing, now);

    db.apply_article_changes(&feed.id, &plan.inserts, &plan.updates, plan.watermark)
        .await
        .map_err(|e| SyncError::ReconciliationFailure(e.to_string()))?;

    Ok(ReconcileSummary {
        inserted: plan.inserts.len(),
        updated: plan.updates.len(),
        watermark: plan.watermark,
    })
}
