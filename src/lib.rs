//! FeedSync - keeps per-user feed subscriptions in step with their sources.
//!
//! Feeds are fetched on a schedule, parsed as RSS or Atom, and reconciled
//! into stored articles without ever touching read state. Articles older
//! than a feed's read watermark are removed by a separate retention sweep.

pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod parser;
pub mod queue;
pub mod reconciler;
pub mod routes;
pub mod sweeper;
