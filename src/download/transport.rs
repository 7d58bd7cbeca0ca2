//! Media transport: fetches an episode's data URL into its file location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use url::Url;

/// Transfer progress as absolute offsets into the destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    /// `None` until the server announces a length.
    pub total: Option<u64>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Size mismatch: expected {expected} bytes, have {actual}")]
    Integrity { expected: u64, actual: u64 },
}

impl TransportError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Fetches a URL into a local file.
///
/// Progress is sent on `progress` while the transfer runs; the channel is
/// closed when the returned future completes. Dropping the future cancels
/// the transfer and leaves any partial file in place.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the final size of the file.
    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: mpsc::Sender<Progress>,
    ) -> Result<u64, TransportError>;
}

/// Builds a client suited to media transfers.
///
/// There is no whole-request timeout: a transfer may run as long as bytes
/// keep arriving. `connect_timeout` bounds connection setup and
/// `read_timeout` bounds each wait for the next chunk.
pub fn media_client(
    user_agent: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<reqwest::Client, TransportError> {
    Ok(reqwest::Client::builder()
        .user_agent(user_agent)
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .build()?)
}

/// HTTP transport with `Range` resume of partial files.
///
/// Use a client from [`media_client`]; a client-wide `timeout` would cut off
/// long transfers.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn request(&self, url: &str, offset: u64) -> Result<reqwest::Response, TransportError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        Ok(request.send().await?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: mpsc::Sender<Progress>,
    ) -> Result<u64, TransportError> {
        Url::parse(url).map_err(|_| TransportError::InvalidUrl(url.to_string()))?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::io(parent, e))?;
        }

        let mut existing = tokio::fs::metadata(destination)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        let mut response = self.request(url, existing).await?;
        if existing > 0
            && response.status() == StatusCode::PARTIAL_CONTENT
            && range_start(&response) != Some(existing)
        {
            tracing::warn!(
                url = %url,
                requested = existing,
                content_range = ?response.headers().get(CONTENT_RANGE),
                "Server resumed at a different offset, restarting from zero"
            );
            existing = 0;
            response = self.request(url, 0).await?;
        }
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            // The partial file already covers the whole resource.
            if range_total(&response) == Some(existing) {
                tracing::debug!(url = %url, bytes = existing, "Download already complete");
                let _ = progress
                    .send(Progress {
                        downloaded: existing,
                        total: Some(existing),
                    })
                    .await;
                return Ok(existing);
            }
        }
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }

        let resumed = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
        let offset = if resumed { existing } else { 0 };
        let total = response.content_length().map(|len| offset.saturating_add(len));

        let file = if resumed {
            OpenOptions::new()
                .append(true)
                .open(destination)
                .await
                .map_err(|e| TransportError::io(destination, e))?
        } else {
            File::create(destination)
                .await
                .map_err(|e| TransportError::io(destination, e))?
        };

        tracing::debug!(url = %url, resumed, offset, ?total, "Download started");
        let size = stream_to_file(file, response, destination, offset, total, &progress).await?;

        if let Some(expected) = total {
            if expected != size {
                return Err(TransportError::Integrity {
                    expected,
                    actual: size,
                });
            }
        }
        Ok(size)
    }
}

async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    path: &Path,
    mut offset: u64,
    total: Option<u64>,
    progress: &mpsc::Sender<Progress>,
) -> Result<u64, TransportError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();

    // A closed receiver only means nobody is watching.
    let _ = progress
        .send(Progress {
            downloaded: offset,
            total,
        })
        .await;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| TransportError::io(path, e))?;
        offset += chunk.len() as u64;
        let _ = progress
            .send(Progress {
                downloaded: offset,
                total,
            })
            .await;
    }

    writer.flush().await.map_err(|e| TransportError::io(path, e))?;
    Ok(offset)
}

/// First byte offset from a `Content-Range: bytes <start>-<end>/<len>` header.
fn range_start(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes "))
        .and_then(|v| v.split_once('-'))
        .and_then(|(start, _)| start.trim().parse().ok())
}

/// Complete length from a `Content-Range: bytes */<len>` header.
fn range_total(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit_once('/'))
        .and_then(|(_, len)| len.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn collect() -> (mpsc::Sender<Progress>, mpsc::Receiver<Progress>) {
        mpsc::channel(1024)
    }

    fn drain(mut rx: mpsc::Receiver<Progress>) -> Vec<Progress> {
        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p);
        }
        seen
    }

    #[tokio::test]
    async fn test_fresh_download_writes_file_and_reports_progress() {
        let server = MockServer::start().await;
        let body = vec![7u8; 4096];
        Mock::given(method("GET"))
            .and(path("/ep.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested").join("ep.mp3");
        let (tx, rx) = collect();
        let transport = HttpTransport::new(reqwest::Client::new());

        let size = transport
            .fetch(&format!("{}/ep.mp3", server.uri()), &dest, tx)
            .await
            .unwrap();
        assert_eq!(size, 4096);
        assert_eq!(std::fs::read(&dest).unwrap(), body);

        let seen = drain(rx);
        assert_eq!(seen.first().map(|p| p.downloaded), Some(0));
        assert_eq!(
            seen.last().copied(),
            Some(Progress {
                downloaded: 4096,
                total: Some(4096)
            })
        );
        assert!(seen.windows(2).all(|w| w[0].downloaded <= w[1].downloaded));
    }

    #[tokio::test]
    async fn test_partial_file_resumed_with_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=3-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 3-7/8")
                    .set_body_bytes(b"defgh".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("ep.mp3");
        std::fs::write(&dest, b"abc").unwrap();
        let (tx, rx) = collect();

        let size = HttpTransport::new(reqwest::Client::new())
            .fetch(&format!("{}/ep.mp3", server.uri()), &dest, tx)
            .await
            .unwrap();
        assert_eq!(size, 8);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdefgh");
        assert_eq!(drain(rx).first().map(|p| p.downloaded), Some(3));
    }

    #[tokio::test]
    async fn test_resume_at_wrong_offset_restarts_from_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=3-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-7/8")
                    .set_body_bytes(b"abcdefgh".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abcdefgh".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("ep.mp3");
        std::fs::write(&dest, b"abc").unwrap();
        let (tx, _rx) = collect();

        let size = HttpTransport::new(reqwest::Client::new())
            .fetch(&format!("{}/ep.mp3", server.uri()), &dest, tx)
            .await
            .unwrap();
        assert_eq!(size, 8);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdefgh");
    }

    /// Serves one response whose body arrives a byte at a time.
    async fn trickle_server(body: Vec<u8>, interval: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await.unwrap();
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            for byte in body {
                tokio::time::sleep(interval).await;
                socket.write_all(&[byte]).await.unwrap();
                socket.flush().await.unwrap();
            }
        });
        format!("http://{addr}/slow.mp3")
    }

    #[tokio::test]
    async fn test_slow_transfer_outlives_read_timeout() {
        let url = trickle_server(vec![9u8; 30], Duration::from_millis(100)).await;
        let client = media_client("test", Duration::from_secs(1), Duration::from_secs(1)).unwrap();

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("slow.mp3");
        let (tx, _rx) = collect();

        let started = std::time::Instant::now();
        let size = HttpTransport::new(client)
            .fetch(&url, &dest, tx)
            .await
            .unwrap();
        assert!(started.elapsed() > Duration::from_secs(1));
        assert_eq!(size, 30);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![9u8; 30]);
    }

    #[tokio::test]
    async fn test_full_response_to_range_request_truncates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("ep.mp3");
        std::fs::write(&dest, b"stale-partial-content").unwrap();
        let (tx, _rx) = collect();

        let size = HttpTransport::new(reqwest::Client::new())
            .fetch(&format!("{}/ep.mp3", server.uri()), &dest, tx)
            .await
            .unwrap();
        assert_eq!(size, 5);
        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_range_not_satisfiable_on_complete_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416).insert_header("Content-Range", "bytes */3"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("ep.mp3");
        std::fs::write(&dest, b"abc").unwrap();
        let (tx, _rx) = collect();

        let size = HttpTransport::new(reqwest::Client::new())
            .fetch(&format!("{}/ep.mp3", server.uri()), &dest, tx)
            .await
            .unwrap();
        assert_eq!(size, 3);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (tx, _rx) = collect();
        let result = HttpTransport::new(reqwest::Client::new())
            .fetch(&format!("{}/gone.mp3", server.uri()), &dir.path().join("x"), tx)
            .await;
        assert!(matches!(result, Err(TransportError::HttpStatus(404))));
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = collect();
        let result = HttpTransport::new(reqwest::Client::new())
            .fetch("not a url", &dir.path().join("x"), tx)
            .await;
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }
}
