//! Merging freshly parsed feeds into the catalog.
//!
//! Identity is the feed URL for feeds and `(feed URL, GUID)` for episodes.
//! Episodes are always inserted oldest first, so catalog insertion order
//! matches arrival order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::feed::{Episode, Feed, FeedPostProcessor, NormalizingPostProcessor};
use crate::storage::{DatabaseError, FeedCatalog};

/// What reconciliation did with one parsed feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedOutcome {
    pub feed_url: String,
    pub feed_id: i64,
    /// The feed row was created by this call.
    pub created: bool,
    /// Episodes inserted by this call.
    pub inserted: usize,
    /// Of those, how many were flagged new.
    pub new_episodes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Add,
    Merge,
}

/// Reconciliation engine over an injected catalog.
///
/// Calls for the same feed URL are serialized, so concurrent Add/Merge of
/// one feed cannot create it twice.
pub struct Reconciler {
    catalog: Arc<dyn FeedCatalog>,
    post_processor: Arc<dyn FeedPostProcessor>,
    feed_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(catalog: Arc<dyn FeedCatalog>, post_processor: Arc<dyn FeedPostProcessor>) -> Self {
        Self {
            catalog,
            post_processor,
            feed_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciler with the [`NormalizingPostProcessor`].
    pub fn with_default_processing(catalog: Arc<dyn FeedCatalog>) -> Self {
        Self::new(catalog, Arc::new(NormalizingPostProcessor))
    }

    /// Initial population. Feeds already in the catalog are left untouched;
    /// new feeds get all their episodes, marked not new.
    pub async fn add_feeds(&self, feeds: Vec<Feed>) -> Result<Vec<FeedOutcome>, DatabaseError> {
        self.reconcile(feeds, Mode::Add).await
    }

    /// Incremental refresh. Unknown feeds are created as in [`add_feeds`];
    /// known feeds get their unseen episodes, marked new, and a refreshed
    /// eTag when the document carried one.
    ///
    /// [`add_feeds`]: Reconciler::add_feeds
    pub async fn merge_feeds(&self, feeds: Vec<Feed>) -> Result<Vec<FeedOutcome>, DatabaseError> {
        self.reconcile(feeds, Mode::Merge).await
    }

    async fn reconcile(
        &self,
        mut feeds: Vec<Feed>,
        mode: Mode,
    ) -> Result<Vec<FeedOutcome>, DatabaseError> {
        self.post_processor.process(&mut feeds);

        let mut outcomes = Vec::with_capacity(feeds.len());
        for feed in &feeds {
            let lock = self.feed_lock(&feed.feed_url);
            let outcome = {
                let _guard = lock.lock().await;
                self.reconcile_feed(feed, mode).await
            };
            drop(lock);
            self.release_feed_lock(&feed.feed_url);
            let outcome = outcome?;
            tracing::debug!(
                feed = %outcome.feed_url,
                created = outcome.created,
                inserted = outcome.inserted,
                new = outcome.new_episodes,
                ?mode,
                "Feed reconciled"
            );
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn reconcile_feed(&self, feed: &Feed, mode: Mode) -> Result<FeedOutcome, DatabaseError> {
        let Some(feed_id) = self.catalog.find_feed_by_url(&feed.feed_url).await? else {
            let feed_id = self.catalog.create_feed(feed).await?;
            let fresh: Vec<&Episode> = feed.episodes.iter().collect();
            let inserted = self.insert_episodes(feed_id, &fresh, false).await?;
            return Ok(FeedOutcome {
                feed_url: feed.feed_url.clone(),
                feed_id,
                created: true,
                inserted,
                new_episodes: 0,
            });
        };

        if mode == Mode::Add {
            return Ok(FeedOutcome {
                feed_url: feed.feed_url.clone(),
                feed_id,
                created: false,
                inserted: 0,
                new_episodes: 0,
            });
        }

        if let Some(etag) = &feed.etag {
            self.catalog.set_feed_etag(feed_id, etag).await?;
        }

        let mut unseen = Vec::new();
        let mut batch_guids = HashSet::new();
        for episode in &feed.episodes {
            match &episode.guid {
                None => unseen.push(episode),
                Some(guid) => {
                    if !batch_guids.insert(guid.as_str()) {
                        continue;
                    }
                    if !self.is_known(guid, &feed.feed_url).await? {
                        unseen.push(episode);
                    }
                }
            }
        }

        let inserted = self.insert_episodes(feed_id, &unseen, true).await?;
        Ok(FeedOutcome {
            feed_url: feed.feed_url.clone(),
            feed_id,
            created: false,
            inserted,
            new_episodes: inserted,
        })
    }

    /// Whether an episode with this GUID already exists under this feed URL.
    async fn is_known(&self, guid: &str, feed_url: &str) -> Result<bool, DatabaseError> {
        for episode_id in self.catalog.find_episodes_by_guid(guid).await? {
            let owner = self.catalog.episode_feed_url(episode_id).await?;
            if owner.as_deref() == Some(feed_url) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Inserts in reverse document order so the newest episode lands last.
    async fn insert_episodes(
        &self,
        feed_id: i64,
        episodes: &[&Episode],
        is_new: bool,
    ) -> Result<usize, DatabaseError> {
        for episode in episodes.iter().rev() {
            let episode_id = self.catalog.create_episode(feed_id, episode).await?;
            self.catalog.set_episode_new(episode_id, is_new).await?;
        }
        Ok(episodes.len())
    }

    fn feed_lock(&self, feed_url: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .feed_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(feed_url.to_string()).or_default())
    }

    /// Drops the URL's lock once no other call holds or awaits it.
    fn release_feed_lock(&self, feed_url: &str) {
        let mut locks = self
            .feed_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(feed_url)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(feed_url);
        }
    }
}

#[cfg(test)]
impl Reconciler {
    fn tracked_locks(&self) -> usize {
        self.feed_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
