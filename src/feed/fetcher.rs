use futures::stream::{self, StreamExt};
use std::time::Duration;
use thiserror::Error;

use super::builder::{parse_feed_bytes, ParsedDocument};
use super::model::FetchInfo;
use super::tags::ParseError;
use crate::reconcile::{FeedOutcome, Reconciler};
use crate::storage::{Database, DatabaseError};

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_CONCURRENT_REFRESHES: usize = 10;

/// Errors that can occur during feed fetching operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the client timeout
    #[error("Request timed out")]
    Timeout,
    /// Body was not a well-formed feed document
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    /// Catalog operation failed while reconciling
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Outcome of a conditional fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Server answered 304 for the supplied eTag.
    NotModified,
    /// A freshly parsed document.
    Feeds(ParsedDocument),
}

/// Result of refreshing one stored feed.
#[derive(Debug)]
pub struct FetchResult {
    pub feed_id: i64,
    pub feed_url: String,
    /// Number of new episodes, or the error that occurred
    pub result: Result<usize, FetchError>,
}

/// Prefixes `http://` to anything that is not already an http(s) URL.
pub fn normalize_feed_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Fetches and parses one feed document.
///
/// Sends `If-None-Match` when `etag` is given. Rate limiting (429) and
/// server errors (5xx) are retried with exponential backoff up to 3 times;
/// other non-2xx statuses fail immediately. The response `ETag` header is
/// carried into the parsed feeds.
pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &str,
    etag: Option<&str>,
) -> Result<FetchOutcome, FetchError> {
    let mut retry_count = 0;

    let (bytes, response_etag) = loop {
        let mut request = client.get(url);
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        let response = request.send().await.map_err(map_request_error)?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if retry_count >= MAX_RETRIES {
                return Err(FetchError::RateLimited(MAX_RETRIES));
            }
            let delay_secs = 2u64.pow(retry_count); // 1s, 2s, 4s
            tracing::warn!(feed = %url, retry = retry_count, delay_secs, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            retry_count += 1;
            continue;
        }

        if status.is_server_error() {
            if retry_count >= MAX_RETRIES {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }
            let delay_secs = 2u64.pow(retry_count);
            tracing::warn!(
                feed = %url,
                status = %status,
                retry = retry_count,
                delay_secs,
                "Server error, retrying after delay"
            );
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            retry_count += 1;
            continue;
        }

        if status == reqwest::StatusCode::NOT_MODIFIED {
            tracing::debug!(feed = %url, "Feed not modified");
            return Ok(FetchOutcome::NotModified);
        }

        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let response_etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match read_limited_bytes(response, MAX_FEED_SIZE).await {
            Ok(bytes) => break (bytes, response_etag),
            Err(FetchError::IncompleteResponse { expected, received }) => {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::IncompleteResponse { expected, received });
                }
                let delay_secs = 2u64.pow(retry_count);
                tracing::debug!(
                    feed = %url,
                    expected,
                    received,
                    attempt = retry_count + 1,
                    delay_secs,
                    "Retrying incomplete download"
                );
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                retry_count += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
    };

    let info = FetchInfo::new(url, chrono::Utc::now().timestamp_millis(), response_etag);
    let document = parse_feed_bytes(&bytes, &info)?;
    Ok(FetchOutcome::Feeds(document))
}

/// Subscribes to a feed: fetch, then reconcile in Add mode.
///
/// The URL is normalized first; the normalized form becomes the feed's
/// identity.
pub async fn subscribe(
    reconciler: &Reconciler,
    client: &reqwest::Client,
    url: &str,
) -> Result<Vec<FeedOutcome>, FetchError> {
    let url = normalize_feed_url(url);
    match fetch_feed(client, &url, None).await? {
        FetchOutcome::Feeds(document) => {
            if document.feeds.is_empty() {
                tracing::warn!(feed = %url, "Document contains no channel");
            }
            Ok(reconciler.add_feeds(document.feeds).await?)
        }
        FetchOutcome::NotModified => Ok(Vec::new()),
    }
}

/// Refreshes every stored feed and merges new episodes.
///
/// Up to 10 feeds are fetched concurrently, each with its stored eTag.
/// Results are returned in completion order. A 304 counts as success with
/// zero new episodes.
pub async fn refresh_all(
    db: &Database,
    reconciler: &Reconciler,
    client: &reqwest::Client,
) -> Result<Vec<FetchResult>, DatabaseError> {
    let feeds = db.get_feeds().await?;
    if feeds.is_empty() {
        return Ok(Vec::new());
    }

    let results: Vec<FetchResult> = stream::iter(feeds)
        .map(|feed| async move {
            let result = refresh_one(reconciler, client, &feed.url, feed.etag.as_deref()).await;
            if let Err(e) = &result {
                tracing::warn!(feed = %feed.url, error = %e, "Feed refresh failed");
            }
            FetchResult {
                feed_id: feed.id,
                feed_url: feed.url,
                result,
            }
        })
        .buffer_unordered(MAX_CONCURRENT_REFRESHES)
        .collect()
        .await;

    Ok(results)
}

async fn refresh_one(
    reconciler: &Reconciler,
    client: &reqwest::Client,
    url: &str,
    etag: Option<&str>,
) -> Result<usize, FetchError> {
    match fetch_feed(client, url, etag).await? {
        FetchOutcome::NotModified => Ok(0),
        FetchOutcome::Feeds(document) => {
            let outcomes = reconciler.merge_feeds(document.feeds).await?;
            Ok(outcomes.iter().map(|o| o.new_episodes).sum())
        }
    }
}

fn map_request_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err)
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_request_error)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
