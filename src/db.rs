use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, QueryBuilder, Sqlite, SqlitePool,
};
use uuid::Uuid;

use crate::config::{canonical_feed_url, FeedConfig};

/// SQLite caps bound parameters per statement; stay well below it.
const GUID_LOOKUP_CHUNK: usize = 500;
const INSERT_CHUNK: usize = 100;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Feed {
    pub id: String,
    pub user_id: i64,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub position: i64,
    pub display_column: i64,
    pub oldest_watermark: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Article {
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub description: String,
    pub link: String,
    pub guid: String,
    pub published_at: DateTime<Utc>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The fields a sync is allowed to write on an article.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleFields {
    pub title: String,
    pub description: String,
    pub link: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewArticle {
    pub id: String,
    pub guid: String,
    pub fields: ArticleFields,
}

#[derive(Debug, Clone)]
pub struct ArticleUpdate {
    pub id: String,
    pub fields: ArticleFields,
}

#[derive(Debug, Clone)]
pub struct NewFeed {
    pub user_id: i64,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
}

/// Which feeds a sync covers. Both filters may be combined; with neither set
/// every feed is selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSelection {
    pub user_id: Option<i64>,
    pub feed_id: Option<String>,
}

impl FeedSelection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            feed_id: None,
        }
    }

    pub fn for_feed(feed_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            feed_id: Some(feed_id.into()),
        }
    }
}

impl std::fmt::Display for FeedSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.user_id, &self.feed_id) {
            (None, None) => write!(f, "all feeds"),
            (Some(user_id), None) => write!(f, "feeds of user {}", user_id),
            (None, Some(feed_id)) => write!(f, "feed {}", feed_id),
            (Some(user_id), Some(feed_id)) => write!(f, "feed {} of user {}", feed_id, user_id),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                description TEXT,
                position INTEGER NOT NULL DEFAULT 0,
                display_column INTEGER NOT NULL DEFAULT 0,
                oldest_watermark TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id TEXT PRIMARY KEY,
                feed_id TEXT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                link TEXT NOT NULL,
                guid TEXT NOT NULL,
                published_at TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(feed_id, guid)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_articles_feed_published
            ON articles(feed_id, published_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upsert the subscriptions listed in the config file, keyed by (user, url).
    pub async fn sync_feeds(&self, configs: &[FeedConfig]) -> anyhow::Result<()> {
        for config in configs {
            let url = canonical_feed_url(&config.url)?;
            sqlx::query(
                r#"
                INSERT INTO feeds (id, user_id, title, url, description, position, created_at)
                VALUES (?, ?, ?, ?, ?,
                    (SELECT COALESCE(MAX(position), 0) + 1 FROM feeds WHERE user_id = ?), ?)
                ON CONFLICT(user_id, url) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(config.user_id)
            .bind(&config.title)
            .bind(&url)
            .bind(&config.description)
            .bind(config.user_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Subscribe a user to a feed. The new feed goes to the end of the
    /// user's ordering.
    pub async fn create_feed(&self, new_feed: &NewFeed) -> anyhow::Result<Feed> {
        let url = canonical_feed_url(&new_feed.url)?;
        let feed = sqlx::query_as::<_, Feed>(
            r#"
            INSERT INTO feeds (id, user_id, title, url, description, position, created_at)
            VALUES (?, ?, ?, ?, ?,
                (SELECT COALESCE(MAX(position), 0) + 1 FROM feeds WHERE user_id = ?), ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(new_feed.user_id)
        .bind(&new_feed.title)
        .bind(&url)
        .bind(&new_feed.description)
        .bind(new_feed.user_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(feed)
    }

    /// Delete a feed together with its articles.
    pub async fn delete_feed(&self, feed_id: &str) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM articles WHERE feed_id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_all_feeds(&self) -> anyhow::Result<Vec<Feed>> {
        self.get_feeds(&FeedSelection::all()).await
    }

    pub async fn get_feeds(&self, selection: &FeedSelection) -> anyhow::Result<Vec<Feed>> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM feeds WHERE 1 = 1");
        if let Some(user_id) = selection.user_id {
            query.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(feed_id) = &selection.feed_id {
            query.push(" AND id = ").push_bind(feed_id);
        }
        query.push(" ORDER BY user_id, position, created_at");

        let feeds = query
            .build_query_as::<Feed>()
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    pub async fn get_feed(&self, feed_id: &str) -> anyhow::Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn get_article(&self, article_id: &str) -> anyhow::Result<Option<Article>> {
        let article = sqlx::query_as::<_, Article>("SELECT * FROM articles WHERE id = ?")
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(article)
    }

    /// Existing articles of a feed whose guid is one of `guids`.
    pub async fn get_articles_by_guids(
        &self,
        feed_id: &str,
        guids: &[&str],
    ) -> anyhow::Result<Vec<Article>> {
        let mut articles = Vec::new();

        for chunk in guids.chunks(GUID_LOOKUP_CHUNK) {
            let mut query =
                QueryBuilder::<Sqlite>::new("SELECT * FROM articles WHERE feed_id = ");
            query.push_bind(feed_id).push(" AND guid IN (");
            let mut separated = query.separated(", ");
            for guid in chunk {
                separated.push_bind(*guid);
            }
            separated.push_unseparated(")");

            let found = query
                .build_query_as::<Article>()
                .fetch_all(&self.pool)
                .await?;
            articles.extend(found);
        }

        Ok(articles)
    }

    /// Write one feed's sync result atomically: bulk insert new articles,
    /// update recurring ones, then move the watermark if one was found.
    ///
    /// `is_read` is never written here.
    pub async fn apply_article_changes(
        &self,
        feed_id: &str,
        inserts: &[NewArticle],
        updates: &[ArticleUpdate],
        watermark: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for update in updates {
            sqlx::query(
                r#"
                UPDATE articles
                SET title = ?, description = ?, link = ?, published_at = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&update.fields.title)
            .bind(&update.fields.description)
            .bind(&update.fields.link)
            .bind(update.fields.published_at)
            .bind(now)
            .bind(&update.id)
            .execute(&mut *tx)
            .await?;
        }

        for chunk in inserts.chunks(INSERT_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "INSERT INTO articles \
                 (id, feed_id, title, description, link, guid, published_at, is_read, created_at, updated_at) ",
            );
            query.push_values(chunk, |mut row, article| {
                row.push_bind(&article.id)
                    .push_bind(feed_id)
                    .push_bind(&article.fields.title)
                    .push_bind(&article.fields.description)
                    .push_bind(&article.fields.link)
                    .push_bind(&article.guid)
                    .push_bind(article.fields.published_at)
                    .push_bind(false)
                    .push_bind(now)
                    .push_bind(now);
            });
            query.build().execute(&mut *tx).await?;
        }

        if let Some(watermark) = watermark {
            sqlx::query("UPDATE feeds SET oldest_watermark = ? WHERE id = ?")
                .bind(watermark)
                .bind(feed_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a feed's articles published strictly before `cutoff`.
    pub async fn delete_articles_published_before(
        &self,
        feed_id: &str,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM articles WHERE feed_id = ? AND published_at < ?")
            .bind(feed_id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_articles_for_feed(
        &self,
        feed_id: &str,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<Article>> {
        let articles = sqlx::query_as::<_, Article>(
            r#"
            SELECT * FROM articles
            WHERE feed_id = ?
            ORDER BY published_at DESC, created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(feed_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }

    pub async fn get_article_count_for_feed(&self, feed_id: &str) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    pub async fn get_unread_count_for_feed(&self, feed_id: &str) -> anyhow::Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM articles WHERE feed_id = ? AND is_read = 0")
                .bind(feed_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    /// Returns false when the article doesn't exist or was already read.
    pub async fn mark_article_read(&self, article_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE articles SET is_read = 1 WHERE id = ? AND is_read = 0")
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark every unread article of a feed published at or before `up_to` as read.
    pub async fn mark_all_read(
        &self,
        feed_id: &str,
        up_to: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE articles SET is_read = 1
            WHERE feed_id = ? AND is_read = 0 AND published_at <= ?
            "#,
        )
        .bind(feed_id)
        .bind(up_to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
