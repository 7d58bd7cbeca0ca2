//! Catalog seams consumed by reconciliation and the download queue.
//!
//! Both traits are implemented by [`Database`]; tests can substitute their
//! own implementations.

use async_trait::async_trait;

use super::schema::Database;
use super::types::{DatabaseError, DownloadState, QueuedEpisode};
use crate::feed::{Episode, Feed};

/// Catalog operations needed to reconcile parsed feeds.
#[async_trait]
pub trait FeedCatalog: Send + Sync {
    async fn find_feed_by_url(&self, url: &str) -> Result<Option<i64>, DatabaseError>;

    /// Creates the feed row only; episodes are inserted separately.
    async fn create_feed(&self, feed: &Feed) -> Result<i64, DatabaseError>;

    /// Ids of all episodes with this GUID, in any feed.
    async fn find_episodes_by_guid(&self, guid: &str) -> Result<Vec<i64>, DatabaseError>;

    async fn episode_feed_url(&self, episode_id: i64) -> Result<Option<String>, DatabaseError>;

    async fn create_episode(&self, feed_id: i64, episode: &Episode) -> Result<i64, DatabaseError>;

    async fn set_episode_new(&self, episode_id: i64, is_new: bool) -> Result<(), DatabaseError>;

    async fn set_feed_etag(&self, feed_id: i64, etag: &str) -> Result<(), DatabaseError>;
}

/// Catalog operations needed to drive downloads.
#[async_trait]
pub trait DownloadCatalog: Send + Sync {
    /// Queue entries in position order.
    async fn queued_episodes(&self) -> Result<Vec<QueuedEpisode>, DatabaseError>;

    async fn download_status(
        &self,
        episode_id: i64,
    ) -> Result<Option<QueuedEpisode>, DatabaseError>;

    async fn set_download_state(
        &self,
        episode_id: i64,
        state: DownloadState,
    ) -> Result<(), DatabaseError>;

    async fn set_download_progress(
        &self,
        episode_id: i64,
        downloaded: i64,
        total: i64,
    ) -> Result<(), DatabaseError>;

    /// `Finished` with both counters set to `size`, atomically.
    async fn finish_download(&self, episode_id: i64, size: i64) -> Result<(), DatabaseError>;

    /// `None` with zeroed counters, atomically.
    async fn reset_download(&self, episode_id: i64) -> Result<(), DatabaseError>;
}

#[async_trait]
impl FeedCatalog for Database {
    async fn find_feed_by_url(&self, url: &str) -> Result<Option<i64>, DatabaseError> {
        Database::find_feed_by_url(self, url).await
    }

    async fn create_feed(&self, feed: &Feed) -> Result<i64, DatabaseError> {
        Database::create_feed(self, feed).await
    }

    async fn find_episodes_by_guid(&self, guid: &str) -> Result<Vec<i64>, DatabaseError> {
        Database::find_episodes_by_guid(self, guid).await
    }

    async fn episode_feed_url(&self, episode_id: i64) -> Result<Option<String>, DatabaseError> {
        Database::episode_feed_url(self, episode_id).await
    }

    async fn create_episode(&self, feed_id: i64, episode: &Episode) -> Result<i64, DatabaseError> {
        Database::create_episode(self, feed_id, episode).await
    }

    async fn set_episode_new(&self, episode_id: i64, is_new: bool) -> Result<(), DatabaseError> {
        Database::set_episode_new(self, episode_id, is_new).await
    }

    async fn set_feed_etag(&self, feed_id: i64, etag: &str) -> Result<(), DatabaseError> {
        Database::set_feed_etag(self, feed_id, etag).await
    }
}

#[async_trait]
impl DownloadCatalog for Database {
    async fn queued_episodes(&self) -> Result<Vec<QueuedEpisode>, DatabaseError> {
        Database::queued_episodes(self).await
    }

    async fn download_status(
        &self,
        episode_id: i64,
    ) -> Result<Option<QueuedEpisode>, DatabaseError> {
        Database::download_status(self, episode_id).await
    }

    async fn set_download_state(
        &self,
        episode_id: i64,
        state: DownloadState,
    ) -> Result<(), DatabaseError> {
        Database::set_download_state(self, episode_id, state).await
    }

    async fn set_download_progress(
        &self,
        episode_id: i64,
        downloaded: i64,
        total: i64,
    ) -> Result<(), DatabaseError> {
        Database::set_download_progress(self, episode_id, downloaded, total).await
    }

    async fn finish_download(&self, episode_id: i64, size: i64) -> Result<(), DatabaseError> {
        Database::finish_download(self, episode_id, size).await
    }

    async fn reset_download(&self, episode_id: i64) -> Result<(), DatabaseError> {
        Database::reset_download(self, episode_id).await
    }
}
