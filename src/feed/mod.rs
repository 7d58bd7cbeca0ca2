//! Podcast feed parsing and fetching.
//!
//! - **Tags**: streaming tag events over `quick-xml` with a tag stack for
//!   parent lookup
//! - **Builder**: turns tag events into [`Feed`]/[`Episode`] values
//! - **Post-processing**: normalization run before reconciliation
//! - **Fetching**: conditional HTTP retrieval with retry, plus subscribe and
//!   refresh flows
//!
//! # Example
//!
//! ```ignore
//! use podqueue::feed::{parse_feed_bytes, FetchInfo};
//!
//! let info = FetchInfo::new("http://example.com/feed.xml", now_millis, None);
//! let doc = parse_feed_bytes(&body, &info)?;
//! ```

mod builder;
mod fetcher;
mod model;
mod post_process;
mod tags;

pub use builder::{parse_feed, parse_feed_bytes, FeedBuilder, ParsedDocument, PAYMENT_PROVIDER_MARKER};
pub use fetcher::{
    fetch_feed, normalize_feed_url, refresh_all, subscribe, FetchError, FetchOutcome, FetchResult,
};
pub use model::{Episode, Feed, FetchInfo};
pub use post_process::{FeedPostProcessor, NormalizingPostProcessor};
pub use tags::{parse_tags, Attributes, ParseError, TagContext, TagHandler, TagStack, MAX_TAG_DEPTH};
