use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

use super::DownloadError;
use crate::storage::Database;

const DEFAULT_EXTENSION: &str = "mp3";
const MAX_EXTENSION_LEN: usize = 5;

/// `<dir>/<sha256(feed url)>/<sha256(data url)>.<ext>`
pub fn episode_file_location(download_dir: &Path, feed_url: &str, data_url: &str) -> PathBuf {
    let file_name = format!("{}.{}", hex_digest(data_url), media_extension(data_url));
    download_dir.join(hex_digest(feed_url)).join(file_name)
}

/// Lowercased extension of the URL's last path segment, or `mp3`.
pub fn media_extension(data_url: &str) -> String {
    Url::parse(data_url)
        .ok()
        .and_then(|url| {
            let segment = url.path_segments()?.last()?.to_string();
            let (_, ext) = segment.rsplit_once('.')?;
            let valid = !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric());
            valid.then(|| ext.to_ascii_lowercase())
        })
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

fn hex_digest(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Queues an episode for download, assigning its file location.
///
/// Idempotent: re-enqueueing keeps the queue position and recomputes the
/// same location.
pub async fn enqueue_episode(
    db: &Database,
    episode_id: i64,
    download_dir: &Path,
) -> Result<PathBuf, DownloadError> {
    let episode = db
        .get_episode(episode_id)
        .await?
        .ok_or(DownloadError::EpisodeNotFound(episode_id))?;
    let data_url = episode
        .data_url
        .ok_or(DownloadError::NoMediaUrl(episode_id))?;
    let feed_url = db
        .episode_feed_url(episode_id)
        .await?
        .ok_or(DownloadError::EpisodeNotFound(episode_id))?;

    let location = episode_file_location(download_dir, &feed_url, &data_url);
    let added = db
        .enqueue(episode_id, &location.to_string_lossy())
        .await?;
    tracing::info!(episode_id, added, path = %location.display(), "Episode queued");
    Ok(location)
}
