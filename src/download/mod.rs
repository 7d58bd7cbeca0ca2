//! Episode download queue.
//!
//! - [`QueueDownloader`]: restart scan, delete, and the per-episode state
//!   machine
//! - [`Transport`] / [`HttpTransport`]: fetching media with resume
//! - [`NetworkMonitor`] / [`DownloadPolicy`]: gating on network conditions
//! - [`enqueue_episode`]: queue membership and file locations

mod location;
mod manager;
mod network;
mod transport;

use thiserror::Error;

use crate::storage::DatabaseError;

pub use location::{enqueue_episode, episode_file_location, media_extension};
pub use manager::QueueDownloader;
pub use network::{DownloadPolicy, NetworkMonitor, StaticNetwork};
pub use transport::{media_client, HttpTransport, Progress, Transport, TransportError};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Episode {0} not found")]
    EpisodeNotFound(i64),

    #[error("Episode {0} has no media URL")]
    NoMediaUrl(i64),
}
