use std::fmt;
use std::str::FromStr;

use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of podqueue appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface as
/// one of these messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Download State
// ============================================================================

/// Per-episode download lifecycle.
///
/// `None -> Downloading -> Finished`, `Downloading -> Error`, and
/// `Error | Finished | None -> Downloading` on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DownloadState {
    #[default]
    None,
    Downloading,
    Finished,
    Error,
}

impl DownloadState {
    /// Returns the database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Downloading => "downloading",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }

    /// Whether a restart scan may move this state to `Downloading`.
    pub fn can_restart(&self) -> bool {
        !matches!(self, Self::Finished | Self::Downloading)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DownloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "downloading" => Ok(Self::Downloading),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid download state: {s}")),
        }
    }
}

fn parse_state(raw: &str) -> DownloadState {
    raw.parse().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Unknown download state in catalog, treating as none");
        DownloadState::None
    })
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for feed listings (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub encoding: String,
    pub last_updated: i64,
    pub etag: Option<String>,
    pub episode_count: i64,
    pub new_count: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> StoredFeed {
        StoredFeed {
            id: self.id,
            url: self.url,
            title: self.title,
            description: self.description,
            image_url: self.image_url,
            encoding: self.encoding,
            last_updated: self.last_updated,
            etag: self.etag,
            episode_count: self.episode_count,
            new_count: self.new_count,
        }
    }
}

/// Internal row type for episode queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EpisodeDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub guid: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub data_url: Option<String>,
    pub image_url: Option<String>,
    pub payment_url: Option<String>,
    pub is_new: bool,
    pub download_state: String,
    pub downloaded_bytes: i64,
    pub total_bytes: i64,
    pub file_location: Option<String>,
}

impl EpisodeDbRow {
    pub(crate) fn into_episode(self) -> StoredEpisode {
        StoredEpisode {
            id: self.id,
            feed_id: self.feed_id,
            guid: self.guid,
            title: self.title,
            description: self.description,
            content: self.content,
            data_url: self.data_url,
            image_url: self.image_url,
            payment_url: self.payment_url,
            is_new: self.is_new,
            download_state: parse_state(&self.download_state),
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
            file_location: self.file_location,
        }
    }
}

/// Internal row type for the download queue view
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct QueueDbRow {
    pub episode_id: i64,
    pub position: Option<i64>,
    pub title: Option<String>,
    pub data_url: Option<String>,
    pub file_location: Option<String>,
    pub download_state: String,
    pub downloaded_bytes: i64,
    pub total_bytes: i64,
}

impl QueueDbRow {
    pub(crate) fn into_queued(self) -> QueuedEpisode {
        QueuedEpisode {
            episode_id: self.episode_id,
            position: self.position,
            title: self.title,
            data_url: self.data_url,
            file_location: self.file_location,
            state: parse_state(&self.download_state),
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed data from database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFeed {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub encoding: String,
    /// Epoch millis of the fetch that created the row
    pub last_updated: i64,
    pub etag: Option<String>,
    pub episode_count: i64,
    pub new_count: i64,
}

/// Episode data from database, including download bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEpisode {
    pub id: i64,
    pub feed_id: i64,
    pub guid: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub data_url: Option<String>,
    pub image_url: Option<String>,
    pub payment_url: Option<String>,
    pub is_new: bool,
    pub download_state: DownloadState,
    pub downloaded_bytes: i64,
    pub total_bytes: i64,
    pub file_location: Option<String>,
}

/// Download-queue view of an episode.
///
/// `position` is `None` for an episode that is not (or no longer) queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEpisode {
    pub episode_id: i64,
    pub position: Option<i64>,
    pub title: Option<String>,
    pub data_url: Option<String>,
    pub file_location: Option<String>,
    pub state: DownloadState,
    pub downloaded_bytes: i64,
    pub total_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_text() {
        for state in [
            DownloadState::None,
            DownloadState::Downloading,
            DownloadState::Finished,
            DownloadState::Error,
        ] {
            assert_eq!(state.as_str().parse::<DownloadState>(), Ok(state));
        }
        assert!("paused".parse::<DownloadState>().is_err());
    }

    #[test]
    fn test_restart_eligibility() {
        assert!(DownloadState::None.can_restart());
        assert!(DownloadState::Error.can_restart());
        assert!(!DownloadState::Downloading.can_restart());
        assert!(!DownloadState::Finished.can_restart());
    }

    #[test]
    fn test_lock_messages_detected() {
        assert!(is_lock_message("error returned from database: database is locked"));
        assert!(is_lock_message("SQLITE_BUSY"));
        assert!(!is_lock_message("no such table: feeds"));
    }
}
