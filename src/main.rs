use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedsync::config::Config;
use feedsync::db::Database;
use feedsync::fetcher::{start_background_refresh, Fetcher, FetcherOptions};
use feedsync::queue::{run_sync_worker, SyncQueue};
use feedsync::routes::{self, AppState};
use feedsync::sweeper::{start_background_sweep, Sweeper};

const DEFAULT_CONFIG_PATH: &str = "feedsync.toml";

fn load_config() -> anyhow::Result<Config> {
    let path = std::env::var("FEEDSYNC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = if Path::new(&path).exists() {
        Config::load(&path)?
    } else {
        warn!("No config file at {}, using defaults", path);
        Config::default()
    };

    if let Ok(database_url) = std::env::var("DATABASE_URL") {
        config.database_url = database_url;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedsync=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;
    info!("Loaded {} feeds from configuration", config.feeds.len());

    let db = Database::new(&config.database_url).await?;
    db.initialize().await?;
    db.sync_feeds(&config.feeds).await?;
    info!("Database initialized");

    let db = Arc::new(db);
    let fetcher = Arc::new(Fetcher::new(db.clone(), FetcherOptions::from(&config))?);
    let sweeper = Arc::new(Sweeper::new(db.clone()));

    let (queue, jobs) = SyncQueue::channel(config.queue_capacity);
    tokio::spawn(run_sync_worker(fetcher.clone(), jobs));
    tokio::spawn(start_background_refresh(
        fetcher.clone(),
        config.refresh_interval,
    ));
    tokio::spawn(start_background_sweep(sweeper.clone(), config.sweep_interval));

    let state = Arc::new(AppState {
        db,
        fetcher,
        sweeper,
        queue,
    });
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Server starting on http://{}", config.bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
