use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use podqueue::config::Config;
use podqueue::download::{
    enqueue_episode, media_client, DownloadPolicy, HttpTransport, QueueDownloader, StaticNetwork,
};
use podqueue::feed::{refresh_all, subscribe};
use podqueue::reconcile::Reconciler;
use podqueue::search::{lookup_itunes, search_gpodder, GPODDER_BASE_URL, ITUNES_BASE_URL};
use podqueue::storage::{Database, DatabaseError};

/// Get the config directory path (~/.config/podqueue/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("podqueue"))
}

#[derive(Parser, Debug)]
#[command(name = "podqueue", version, about = "Podcast subscriptions and download queue")]
struct Args {
    /// Config file (default: ~/.config/podqueue/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Catalog database (default: ~/.config/podqueue/podqueue.db)
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a feed and add it to the catalog
    Subscribe { url: String },
    /// Re-fetch every feed and merge new episodes
    Refresh,
    /// List subscribed feeds
    Feeds,
    /// List a feed's episodes
    Episodes { feed_id: i64 },
    /// Clear the new flag on a feed's episodes
    Seen { feed_id: i64 },
    /// Remove a feed and its episodes
    Unsubscribe { feed_id: i64 },
    /// Add an episode to the download queue
    Enqueue { episode_id: i64 },
    /// Remove an episode from the download queue
    Dequeue { episode_id: i64 },
    /// Show the download queue
    Queue,
    /// Download every queued episode and wait for completion
    Download {
        /// Treat the connection as metered
        #[arg(long, conflicts_with = "unmetered")]
        metered: bool,
        /// Treat the connection as unmetered
        #[arg(long)]
        unmetered: bool,
    },
    /// Delete a downloaded file and reset its state
    DeleteDownload { episode_id: i64 },
    /// Search the gpodder.net directory
    Search { query: String },
    /// Look up a podcast by iTunes id
    Itunes { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let client = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(Duration::from_secs(config.feed_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    // Directory commands don't touch the catalog.
    match &args.command {
        Command::Search { query } => {
            let results = search_gpodder(&client, GPODDER_BASE_URL, query).await?;
            print_search_results(&results);
            return Ok(());
        }
        Command::Itunes { id } => {
            let results = lookup_itunes(&client, ITUNES_BASE_URL, id).await?;
            print_search_results(&results);
            return Ok(());
        }
        _ => {}
    }

    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| config_dir.join("podqueue.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of podqueue appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };
    let catalog = Arc::new(db.clone());

    match args.command {
        Command::Subscribe { url } => {
            let reconciler = Reconciler::with_default_processing(catalog);
            let outcomes = subscribe(&reconciler, &client, &url).await?;
            if outcomes.is_empty() {
                println!("No feeds found at {}", url);
            }
            for outcome in outcomes {
                if outcome.created {
                    println!(
                        "Subscribed to {} ({} episodes)",
                        outcome.feed_url, outcome.inserted
                    );
                } else {
                    println!("Already subscribed to {}", outcome.feed_url);
                }
            }
        }
        Command::Refresh => {
            let reconciler = Reconciler::with_default_processing(catalog);
            let results = refresh_all(&db, &reconciler, &client)
                .await
                .context("Failed to refresh feeds")?;
            let mut failed = 0;
            for result in &results {
                match &result.result {
                    Ok(0) => {}
                    Ok(n) => println!("{}: {} new", result.feed_url, n),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}: {}", result.feed_url, e);
                    }
                }
            }
            println!("Refreshed {} feeds ({} failed)", results.len(), failed);
        }
        Command::Feeds => {
            for feed in db.get_feeds().await? {
                println!(
                    "{:>5}  {}  [{} episodes, {} new]  {}",
                    feed.id,
                    feed.title.as_deref().unwrap_or("(untitled)"),
                    feed.episode_count,
                    feed.new_count,
                    feed.url
                );
            }
        }
        Command::Episodes { feed_id } => {
            for episode in db.get_episodes_for_feed(feed_id).await? {
                println!(
                    "{:>6} {} {:<11} {}",
                    episode.id,
                    if episode.is_new { "*" } else { " " },
                    episode.download_state,
                    episode.title.as_deref().unwrap_or("(untitled)")
                );
            }
        }
        Command::Seen { feed_id } => {
            let cleared = db.mark_feed_seen(feed_id).await?;
            println!("Marked {} episodes seen", cleared);
        }
        Command::Unsubscribe { feed_id } => {
            if db.delete_feed(feed_id).await? {
                println!("Unsubscribed from feed {}", feed_id);
            } else {
                println!("No feed with id {}", feed_id);
            }
        }
        Command::Enqueue { episode_id } => {
            let download_dir = config.download_dir(&config_dir);
            let location = enqueue_episode(&db, episode_id, &download_dir).await?;
            println!("Queued episode {} -> {}", episode_id, location.display());
        }
        Command::Dequeue { episode_id } => {
            if db.dequeue(episode_id).await? {
                println!("Removed episode {} from the queue", episode_id);
            } else {
                println!("Episode {} is not queued", episode_id);
            }
        }
        Command::Queue => {
            for entry in db.queued_episodes().await? {
                println!(
                    "{:>4}. {:>6} {:<11} {:>10}/{:<10} {}",
                    entry.position.unwrap_or_default(),
                    entry.episode_id,
                    entry.state,
                    entry.downloaded_bytes,
                    entry.total_bytes,
                    entry.title.as_deref().unwrap_or("(untitled)")
                );
            }
        }
        Command::Download { metered, unmetered } => {
            let timeout = Duration::from_secs(config.feed_timeout_secs);
            let media = media_client(&config.user_agent, timeout, timeout)
                .context("Failed to build media HTTP client")?;
            // Without a flag, assume the connection satisfies the policy.
            let network = if metered && !unmetered {
                StaticNetwork::metered()
            } else {
                StaticNetwork::unmetered()
            };
            let downloader = QueueDownloader::new(
                catalog,
                Arc::new(HttpTransport::new(media)),
                Arc::new(network),
                DownloadPolicy::from_needs_wifi(config.download_needs_wifi),
                config.max_concurrent_downloads,
            );
            downloader.recover_interrupted().await?;
            let started = downloader.restart_downloads().await?;
            println!("Started {} downloads", started);
            downloader.wait().await;

            let queue = db.queued_episodes().await?;
            let finished = queue
                .iter()
                .filter(|e| e.state == podqueue::storage::DownloadState::Finished)
                .count();
            println!("{} of {} queued episodes downloaded", finished, queue.len());
        }
        Command::DeleteDownload { episode_id } => {
            let downloader = QueueDownloader::new(
                catalog,
                Arc::new(HttpTransport::new(client.clone())),
                Arc::new(StaticNetwork::unmetered()),
                DownloadPolicy::Unrestricted,
                1,
            );
            downloader.delete_download(episode_id).await?;
            println!("Deleted download for episode {}", episode_id);
        }
        Command::Search { .. } | Command::Itunes { .. } => {}
    }

    Ok(())
}

fn print_search_results(results: &[podqueue::search::SearchResult]) {
    if results.is_empty() {
        println!("No results");
    }
    for result in results {
        println!("{}\n    {}", result.title, result.feed_url);
        if !result.description.is_empty() {
            println!("    {}", result.description);
        }
    }
}
