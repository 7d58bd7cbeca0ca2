//! Integration tests for the download queue: enqueue, download over HTTP,
//! delete, and network gating.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use podqueue::download::{
    enqueue_episode, media_client, DownloadPolicy, HttpTransport, QueueDownloader, StaticNetwork,
};
use podqueue::feed::{parse_feed_bytes, FetchInfo};
use podqueue::reconcile::Reconciler;
use podqueue::storage::{Database, DownloadState};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FEED_URL: &str = "http://example.com/show.xml";

/// Subscribes to a two-episode show whose media lives on `server`.
async fn seeded_catalog(server: &MockServer) -> (Database, Vec<i64>) {
    let db = Database::open(":memory:").await.unwrap();
    let document = format!(
        "<rss><channel><title>Show</title>\
         <item><guid>1</guid><title>One</title><enclosure url=\"{0}/one.mp3\"/></item>\
         <item><guid>2</guid><title>Two</title><enclosure url=\"{0}/two.ogg\"/></item>\
         </channel></rss>",
        server.uri()
    );
    let feeds = parse_feed_bytes(document.as_bytes(), &FetchInfo::new(FEED_URL, 0, None))
        .unwrap()
        .feeds;
    let outcomes = Reconciler::with_default_processing(Arc::new(db.clone()))
        .add_feeds(feeds)
        .await
        .unwrap();
    let ids = db
        .get_episodes_for_feed(outcomes[0].feed_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    (db, ids)
}

fn downloader(db: &Database, network: StaticNetwork) -> QueueDownloader {
    QueueDownloader::new(
        Arc::new(db.clone()),
        Arc::new(HttpTransport::new(
            media_client("podqueue-test", Duration::from_secs(5), Duration::from_secs(5)).unwrap(),
        )),
        Arc::new(network),
        DownloadPolicy::UnmeteredOnly,
        2,
    )
}

async fn mount_media(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/one.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 2048]))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/two.ogg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![2u8; 100]))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_queue_downloads_to_assigned_locations() {
    let server = MockServer::start().await;
    mount_media(&server).await;
    let (db, ids) = seeded_catalog(&server).await;
    let dir = TempDir::new().unwrap();

    let mut locations = Vec::new();
    for id in &ids {
        locations.push(enqueue_episode(&db, *id, dir.path()).await.unwrap());
    }
    assert!(locations.iter().any(|p| p.extension().unwrap() == "ogg"));
    assert!(locations.iter().all(|p| p.starts_with(dir.path())));

    let manager = downloader(&db, StaticNetwork::unmetered());
    assert_eq!(manager.restart_downloads().await.unwrap(), 2);
    manager.wait().await;

    for entry in db.queued_episodes().await.unwrap() {
        assert_eq!(entry.state, DownloadState::Finished);
        assert_eq!(entry.downloaded_bytes, entry.total_bytes);
        let location = entry.file_location.unwrap();
        let on_disk = std::fs::metadata(&location).unwrap().len();
        assert_eq!(on_disk as i64, entry.total_bytes);
    }

    // Finished episodes are not picked up again.
    assert_eq!(manager.restart_downloads().await.unwrap(), 0);
}

#[tokio::test]
async fn test_metered_network_defers_until_unmetered() {
    let server = MockServer::start().await;
    mount_media(&server).await;
    let (db, ids) = seeded_catalog(&server).await;
    let dir = TempDir::new().unwrap();
    enqueue_episode(&db, ids[0], dir.path()).await.unwrap();

    let metered = downloader(&db, StaticNetwork::metered());
    assert_eq!(metered.restart_downloads().await.unwrap(), 0);
    assert_eq!(
        db.queued_episodes().await.unwrap()[0].state,
        DownloadState::None
    );

    let unmetered = downloader(&db, StaticNetwork::unmetered());
    assert_eq!(unmetered.restart_downloads().await.unwrap(), 1);
    unmetered.wait().await;
    assert_eq!(
        db.queued_episodes().await.unwrap()[0].state,
        DownloadState::Finished
    );
}

#[tokio::test]
async fn test_failed_download_is_retried_on_next_scan() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/one.mp3"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_media(&server).await;
    let (db, ids) = seeded_catalog(&server).await;
    let dir = TempDir::new().unwrap();
    for id in &ids {
        enqueue_episode(&db, *id, dir.path()).await.unwrap();
    }

    let manager = downloader(&db, StaticNetwork::unmetered());
    manager.restart_downloads().await.unwrap();
    manager.wait().await;

    let states: Vec<_> = db
        .queued_episodes()
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.data_url.unwrap(), e.state))
        .collect();
    for (url, state) in &states {
        if url.ends_with("one.mp3") {
            assert_eq!(*state, DownloadState::Error);
        } else {
            assert_eq!(*state, DownloadState::Finished);
        }
    }

    assert_eq!(manager.restart_downloads().await.unwrap(), 1);
    manager.wait().await;
    assert!(db
        .queued_episodes()
        .await
        .unwrap()
        .iter()
        .all(|e| e.state == DownloadState::Finished));
}

#[tokio::test]
async fn test_delete_download_removes_file_and_resets() {
    let server = MockServer::start().await;
    mount_media(&server).await;
    let (db, ids) = seeded_catalog(&server).await;
    let dir = TempDir::new().unwrap();
    let location = enqueue_episode(&db, ids[0], dir.path()).await.unwrap();

    let manager = downloader(&db, StaticNetwork::unmetered());
    manager.restart_downloads().await.unwrap();
    manager.wait().await;
    assert!(Path::new(&location).exists());

    manager.delete_download(ids[0]).await.unwrap();
    assert!(!location.exists());

    let status = db.download_status(ids[0]).await.unwrap().unwrap();
    assert_eq!(status.state, DownloadState::None);
    assert_eq!(status.downloaded_bytes, 0);
    assert_eq!(status.total_bytes, 0);
    // Still queued; the next scan fetches it again.
    assert!(status.position.is_some());

    assert_eq!(manager.restart_downloads().await.unwrap(), 1);
    manager.wait().await;
    assert!(location.exists());

    assert!(db.dequeue(ids[0]).await.unwrap());
    assert!(db.queued_episodes().await.unwrap().is_empty());
}
