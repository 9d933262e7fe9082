use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::canonical_feed_url;
use crate::db::{Article, Database, Feed, FeedSelection, NewFeed};
use crate::fetcher::Fetcher;
use crate::queue::SyncQueue;
use crate::sweeper::Sweeper;

const DEFAULT_PAGE_SIZE: i64 = 30;

pub struct AppState {
    pub db: Arc<Database>,
    pub fetcher: Arc<Fetcher>,
    pub sweeper: Arc<Sweeper>,
    pub queue: SyncQueue,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/refresh", post(refresh))
        .route("/refresh/status", get(refresh_status))
        .route("/sweep", post(sweep))
        .route("/feeds", post(create_feed))
        .route("/feeds/:id", delete(delete_feed))
        .route("/feeds/:id/refresh", post(refresh_feed))
        .route("/feeds/:id/articles", get(feed_articles))
        .route("/feeds/:id/read", post(mark_feed_read))
        .route("/articles/:id/read", post(mark_article_read))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub enum AppError {
    NotFound(&'static str),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(what) => {
                (StatusCode::NOT_FOUND, format!("{} not found", what)).into_response()
            }
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            AppError::Conflict(message) => (StatusCode::CONFLICT, message).into_response(),
            AppError::Unavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, message).into_response()
            }
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error: {}", err),
            )
                .into_response(),
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError::Internal(err.into())
    }
}

#[derive(Debug, Serialize)]
pub struct Queued {
    pub queued: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshQuery {
    pub user_id: Option<i64>,
}

fn enqueue(state: &AppState, selection: FeedSelection) -> Result<impl IntoResponse, AppError> {
    state
        .queue
        .enqueue(selection.clone())
        .map_err(|e| AppError::Unavailable(e.to_string()))?;
    info!("Queued sync for {}", selection);

    Ok((
        StatusCode::ACCEPTED,
        Json(Queued {
            queued: selection.to_string(),
        }),
    ))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RefreshQuery>,
) -> Result<impl IntoResponse, AppError> {
    let selection = match query.user_id {
        Some(user_id) => FeedSelection::for_user(user_id),
        None => FeedSelection::all(),
    };
    enqueue(&state, selection)
}

pub async fn refresh_feed(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state
        .db
        .get_feed(&feed_id)
        .await?
        .ok_or(AppError::NotFound("Feed"))?;
    enqueue(&state, FeedSelection::for_feed(feed_id))
}

#[derive(Debug, Serialize)]
pub struct RefreshStatus {
    pub refreshing: bool,
}

pub async fn refresh_status(State(state): State<Arc<AppState>>) -> Json<RefreshStatus> {
    Json(RefreshStatus {
        refreshing: state.fetcher.is_refreshing(),
    })
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub feeds: usize,
    pub deleted: u64,
}

pub async fn sweep(State(state): State<Arc<AppState>>) -> Result<Json<SweepResponse>, AppError> {
    let report = state.sweeper.sweep().await?;
    Ok(Json(SweepResponse {
        feeds: report.outcomes.len(),
        deleted: report.deleted(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateFeedRequest {
    pub user_id: i64,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

pub async fn create_feed(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateFeedRequest>,
) -> Result<impl IntoResponse, AppError> {
    let url =
        canonical_feed_url(&request.url).map_err(|e| AppError::BadRequest(format!("{:#}", e)))?;

    let title = state
        .fetcher
        .resolve_title(&url, request.title.as_deref())
        .await;

    let feed = state
        .db
        .create_feed(&NewFeed {
            user_id: request.user_id,
            title,
            url: url.clone(),
            description: request
                .description
                .as_deref()
                .map(crate::reconciler::decode_entities),
        })
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(format!("Already subscribed to {}", url))
            } else {
                AppError::Internal(e)
            }
        })?;
    info!("User {} subscribed to '{}' ({})", feed.user_id, feed.title, feed.url);

    // The subscription exists either way; a full queue only delays its first sync.
    if let Err(e) = state.queue.enqueue(FeedSelection::for_feed(&feed.id)) {
        warn!("Could not queue first sync for feed {}: {}", feed.id, e);
    }

    Ok((StatusCode::CREATED, Json(feed)))
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|e| e.is_unique_violation())
}

pub async fn delete_feed(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.db.delete_feed(&feed_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Feed"))
    }
}

#[derive(Debug, Deserialize)]
pub struct ArticlesQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_page_size")]
    pub limit: i64,
}

fn default_page_size() -> i64 {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Serialize)]
pub struct FeedArticles {
    pub feed: Feed,
    pub articles: Vec<Article>,
    pub unread_count: i64,
    pub has_more: bool,
}

pub async fn feed_articles(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<String>,
    Query(query): Query<ArticlesQuery>,
) -> Result<Json<FeedArticles>, AppError> {
    let feed = state
        .db
        .get_feed(&feed_id)
        .await?
        .ok_or(AppError::NotFound("Feed"))?;

    let limit = query.limit.clamp(1, 200);
    let offset = query.offset.max(0);
    let articles = state
        .db
        .get_articles_for_feed(&feed_id, limit, offset)
        .await?;
    let total = state.db.get_article_count_for_feed(&feed_id).await?;
    let unread_count = state.db.get_unread_count_for_feed(&feed_id).await?;

    Ok(Json(FeedArticles {
        feed,
        articles,
        unread_count,
        has_more: offset.saturating_add(limit) < total,
    }))
}

#[derive(Debug, Serialize)]
pub struct Marked {
    pub marked: u64,
}

pub async fn mark_article_read(
    State(state): State<Arc<AppState>>,
    Path(article_id): Path<String>,
) -> Result<Json<Marked>, AppError> {
    state
        .db
        .get_article(&article_id)
        .await?
        .ok_or(AppError::NotFound("Article"))?;

    let changed = state.db.mark_article_read(&article_id).await?;
    Ok(Json(Marked {
        marked: u64::from(changed),
    }))
}

#[derive(Debug, Deserialize)]
pub struct MarkFeedReadRequest {
    pub published_at: DateTime<Utc>,
}

pub async fn mark_feed_read(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<String>,
    Json(request): Json<MarkFeedReadRequest>,
) -> Result<Json<Marked>, AppError> {
    state
        .db
        .get_feed(&feed_id)
        .await?
        .ok_or(AppError::NotFound("Feed"))?;

    let marked = state.db.mark_all_read(&feed_id, request.published_at).await?;
    Ok(Json(Marked { marked }))
}

pub async fn health() -> &'static str {
    "OK"
}
