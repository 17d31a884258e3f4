//! bangumid: an anime acquisition and library-curation daemon.
//!
//! Periodic workers carry a torrent from "a new RSS item was observed" to
//! "a media file sits in the library with embedded subtitle fonts and
//! up-to-date metadata":
//!
//! - the subscriber polls per-show RSS feeds, filters and dedupes items and
//!   dispatches downloads,
//! - the download manager reconciles external-client state into the store,
//! - the magnet workflow handles user-driven one-off magnet ingestion,
//! - the transfer engine links finished media into the library, resolving
//!   release-group priority collisions and embedding subtitle fonts,
//! - the scraper back-fills NFO metadata after the media server scans.
//!
//! All state lives in one embedded SQLite database; the HTTP API under
//! `/apis/v1` drives everything interactively.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod magnet;
pub mod meta;
pub mod notify;
pub mod scraper;
pub mod subscriber;
pub mod subtitle;
pub mod transfer;
pub mod util;
