//! Podcast directory lookups (gpodder.net search, iTunes lookup).
//!
//! Both directories are mapped onto one [`SearchResult`] shape. Missing
//! fields come back as empty strings.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

pub const GPODDER_BASE_URL: &str = "https://gpodder.net";
pub const ITUNES_BASE_URL: &str = "https://itunes.apple.com";

const SEARCH_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Invalid JSON response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchResult {
    pub title: String,
    pub feed_url: String,
    pub website: String,
    pub description: String,
    pub image_url: String,
}

/// Directories send `null` for absent values.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GpodderPodcast {
    title: Option<String>,
    url: Option<String>,
    website: Option<String>,
    description: Option<String>,
    scaled_logo_url: Option<String>,
}

impl From<GpodderPodcast> for SearchResult {
    fn from(p: GpodderPodcast) -> Self {
        Self {
            title: p.title.unwrap_or_default(),
            feed_url: p.url.unwrap_or_default(),
            website: p.website.unwrap_or_default(),
            description: p.description.unwrap_or_default(),
            image_url: p.scaled_logo_url.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ItunesResponse {
    results: Vec<ItunesPodcast>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ItunesPodcast {
    collection_name: Option<String>,
    feed_url: Option<String>,
    collection_view_url: Option<String>,
    artist_name: Option<String>,
    #[serde(rename = "artworkUrl60")]
    artwork_url_60: Option<String>,
}

impl From<ItunesPodcast> for SearchResult {
    fn from(p: ItunesPodcast) -> Self {
        Self {
            title: p.collection_name.unwrap_or_default(),
            feed_url: p.feed_url.unwrap_or_default(),
            website: p.collection_view_url.unwrap_or_default(),
            description: p.artist_name.unwrap_or_default(),
            image_url: p.artwork_url_60.unwrap_or_default(),
        }
    }
}

/// Full-text search on a gpodder.net-compatible directory.
pub async fn search_gpodder(
    client: &reqwest::Client,
    base_url: &str,
    query: &str,
) -> Result<Vec<SearchResult>, SearchError> {
    let url = endpoint(base_url, "search.json", "q", query)?;
    let body = get_json_body(client, url).await?;
    let podcasts: Vec<GpodderPodcast> = serde_json::from_slice(&body)?;
    tracing::debug!(query, results = podcasts.len(), "gpodder search complete");
    Ok(podcasts.into_iter().map(SearchResult::from).collect())
}

/// Looks up a podcast by iTunes collection id.
pub async fn lookup_itunes(
    client: &reqwest::Client,
    base_url: &str,
    id: &str,
) -> Result<Vec<SearchResult>, SearchError> {
    let url = endpoint(base_url, "lookup", "id", id)?;
    let body = get_json_body(client, url).await?;
    let response: ItunesResponse = serde_json::from_slice(&body)?;
    tracing::debug!(id, results = response.results.len(), "iTunes lookup complete");
    Ok(response.results.into_iter().map(SearchResult::from).collect())
}

fn endpoint(base_url: &str, path: &str, key: &str, value: &str) -> Result<url::Url, SearchError> {
    let base = format!("{}/{}", base_url.trim_end_matches('/'), path);
    let mut url = url::Url::parse(&base).map_err(|_| SearchError::InvalidUrl(base.clone()))?;
    url.query_pairs_mut().append_pair(key, value);
    Ok(url)
}

async fn get_json_body(client: &reqwest::Client, url: url::Url) -> Result<Vec<u8>, SearchError> {
    let response = client.get(url).timeout(SEARCH_TIMEOUT).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(SearchError::HttpStatus(status.as_u16()));
    }
    Ok(response.bytes().await?.to_vec())
}
