//! Podcast subscription catalog and download queue.
//!
//! - [`feed`]: RSS tag parsing, feed building, fetching
//! - [`reconcile`]: merging parsed feeds into the catalog
//! - [`storage`]: the SQLite catalog
//! - [`download`]: the download queue manager
//! - [`search`]: directory lookups

pub mod config;
pub mod download;
pub mod feed;
pub mod reconcile;
pub mod search;
pub mod storage;
