use anyhow::{bail, Context};
use reqwest::Url;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_app_url")]
    pub app_url: String,
    /// Refresh interval in minutes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Retention sweep interval in minutes
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    /// Per-feed request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

fn default_app_name() -> String {
    "FeedSync".to_string()
}

fn default_app_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_refresh_interval() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    12 * 60
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_concurrent_fetches() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    64
}

fn default_database_url() -> String {
    "sqlite:feedsync.db?mode=rwc".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

/// A subscription seeded from the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub title: String,
    pub url: String,
    #[serde(default = "default_user_id")]
    pub user_id: i64,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_user_id() -> i64 {
    1
}

/// The single stored form of a feed URL, so `https://example.com` and
/// `https://example.com/` are one subscription. Only http(s) is accepted.
pub fn canonical_feed_url(raw: &str) -> anyhow::Result<String> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid feed URL '{}'", raw))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("feed URL must use http or https: {}", raw);
    }
    Ok(url.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_url: default_app_url(),
            refresh_interval: default_refresh_interval(),
            sweep_interval: default_sweep_interval(),
            request_timeout: default_request_timeout(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            queue_capacity: default_queue_capacity(),
            database_url: default_database_url(),
            bind_address: default_bind_address(),
            feeds: Vec::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.refresh_interval == 0 {
            bail!("refresh_interval must be at least 1 minute");
        }
        if self.sweep_interval == 0 {
            bail!("sweep_interval must be at least 1 minute");
        }
        if self.request_timeout == 0 {
            bail!("request_timeout must be at least 1 second");
        }
        for feed in &self.feeds {
            canonical_feed_url(&feed.url)
                .with_context(|| format!("feed '{}' has an invalid url", feed.title))?;
        }
        Ok(())
    }

    /// The User-Agent sent with every feed request.
    pub fn user_agent(&self) -> String {
        format!("{} RSS Reader/1.0 ({})", self.app_name, self.app_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}
