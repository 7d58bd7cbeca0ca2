/// Values supplied by whoever fetched the document: the URL that identifies
/// the feed, when it was fetched (epoch millis), and the server's cache
/// validator, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchInfo {
    pub feed_url: String,
    pub fetched_at: i64,
    pub etag: Option<String>,
}

impl FetchInfo {
    pub fn new(feed_url: impl Into<String>, fetched_at: i64, etag: Option<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
            fetched_at,
            etag,
        }
    }
}

/// A podcast channel as parsed from one feed document.
///
/// Identified by `feed_url`, which comes from [`FetchInfo`] rather than the
/// document itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Feed {
    pub feed_url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub encoding: String,
    pub last_updated: i64,
    pub etag: Option<String>,
    /// Episodes in document order (conventionally newest first).
    pub episodes: Vec<Episode>,
}

/// A single item of a feed.
///
/// Download bookkeeping is not part of the parsed value; it lives in the
/// catalog (see [`crate::storage::QueuedEpisode`]).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Episode {
    pub feed_url: String,
    pub guid: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub data_url: Option<String>,
    pub image_url: Option<String>,
    pub payment_url: Option<String>,
}
