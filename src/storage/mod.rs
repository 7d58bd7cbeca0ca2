mod catalog;
mod episodes;
mod feeds;
mod queue;
mod schema;
mod types;

pub use catalog::{DownloadCatalog, FeedCatalog};
pub use schema::Database;
pub use types::{DatabaseError, DownloadState, QueuedEpisode, StoredEpisode, StoredFeed};
