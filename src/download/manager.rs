//! Drives queued episodes through `none -> downloading -> finished | error`.
//!
//! Every episode has a slot holding an async mutex and a generation
//! counter. Starting and deleting a download both bump the generation while
//! holding the slot lock; a transfer task re-checks its generation under the
//! same lock before each catalog write and drops the write if it is stale,
//! so a late completion never overwrites a reset.
//!
//! Generations come from one counter shared by all slots, so an idle slot can
//! be dropped from the map and recreated later without a stale task ever
//! matching the new slot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, JoinSet};

use super::network::{DownloadPolicy, NetworkMonitor};
use super::transport::{Progress, Transport, TransportError};
use super::DownloadError;
use crate::storage::{DownloadCatalog, DownloadState};

/// Minimum advance between two persisted progress writes.
const PROGRESS_WRITE_STEP: u64 = 64 * 1024;
const PROGRESS_CHANNEL_CAPACITY: usize = 32;

#[derive(Default)]
struct SlotState {
    generation: u64,
    task: Option<AbortHandle>,
}

#[derive(Default)]
struct EpisodeSlot {
    state: tokio::sync::Mutex<SlotState>,
}

struct Shared {
    catalog: Arc<dyn DownloadCatalog>,
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    slots: Mutex<HashMap<i64, Arc<EpisodeSlot>>>,
    generations: AtomicU64,
}

impl Shared {
    fn slot(&self, episode_id: i64) -> Arc<EpisodeSlot> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(episode_id).or_default())
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drops the episode's slot if nothing references it and no transfer
    /// is attached. Callers must have released their own `Arc` first.
    fn release(&self, episode_id: i64) {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let idle = slots.get(&episode_id).is_some_and(|slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .state
                    .try_lock()
                    .is_ok_and(|state| state.task.is_none())
        });
        if idle {
            slots.remove(&episode_id);
        }
    }
}

/// Download queue manager.
///
/// Collaborators are injected; see [`QueueDownloader::new`]. Dropping the
/// manager aborts all in-flight transfers.
pub struct QueueDownloader {
    shared: Arc<Shared>,
    network: Arc<dyn NetworkMonitor>,
    policy: DownloadPolicy,
    tasks: Mutex<JoinSet<()>>,
}

impl QueueDownloader {
    /// `max_concurrent` is clamped to at least 1.
    pub fn new(
        catalog: Arc<dyn DownloadCatalog>,
        transport: Arc<dyn Transport>,
        network: Arc<dyn NetworkMonitor>,
        policy: DownloadPolicy,
        max_concurrent: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                catalog,
                transport,
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                slots: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
            network,
            policy,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Starts every queued episode that is neither finished nor already
    /// downloading, if the network policy allows it right now.
    ///
    /// Returns how many downloads were started. Re-entrant: an episode that
    /// is already downloading is never started twice.
    pub async fn restart_downloads(&self) -> Result<usize, DownloadError> {
        if !self.policy.permits(self.network.as_ref()) {
            tracing::info!(policy = ?self.policy, "Network policy forbids downloads, skipping");
            return Ok(0);
        }

        let queue = self.shared.catalog.queued_episodes().await?;
        let mut started = 0;
        for entry in queue.iter().filter(|e| e.state.can_restart()) {
            if self.start(entry.episode_id).await? {
                started += 1;
            }
        }
        tracing::debug!(queued = queue.len(), started, "Restart scan complete");
        Ok(started)
    }

    async fn start(&self, episode_id: i64) -> Result<bool, DownloadError> {
        let slot = self.shared.slot(episode_id);
        let started = self.start_in_slot(episode_id, &slot).await;
        drop(slot);
        self.shared.release(episode_id);
        started
    }

    async fn start_in_slot(
        &self,
        episode_id: i64,
        slot: &EpisodeSlot,
    ) -> Result<bool, DownloadError> {
        let mut state = slot.state.lock().await;

        // Re-read under the lock; a concurrent scan may have started it.
        let Some(current) = self.shared.catalog.download_status(episode_id).await? else {
            return Ok(false);
        };
        if !current.state.can_restart() {
            return Ok(false);
        }
        let (Some(url), Some(location)) = (current.data_url, current.file_location) else {
            tracing::warn!(episode_id, "Queued episode lacks media URL or file location");
            return Ok(false);
        };

        let generation = self.shared.next_generation();
        state.generation = generation;
        self.shared
            .catalog
            .set_download_state(episode_id, DownloadState::Downloading)
            .await?;

        let task = run_download(
            Arc::clone(&self.shared),
            episode_id,
            generation,
            url,
            PathBuf::from(location),
        );
        let handle = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            reap_finished(&mut tasks);
            tasks.spawn(task)
        };
        state.task = Some(handle);

        tracing::info!(episode_id, generation, "Download started");
        Ok(true)
    }

    /// Moves queue entries left `downloading` by an earlier process, with no
    /// transfer running here, to `error` so the next scan picks them up.
    pub async fn recover_interrupted(&self) -> Result<usize, DownloadError> {
        let queue = self.shared.catalog.queued_episodes().await?;
        let mut recovered = 0;
        for entry in queue
            .iter()
            .filter(|e| e.state == DownloadState::Downloading)
        {
            let slot = self.shared.slot(entry.episode_id);
            let marked = async {
                let state = slot.state.lock().await;
                if state.task.is_some() {
                    return Ok(false);
                }
                self.shared
                    .catalog
                    .set_download_state(entry.episode_id, DownloadState::Error)
                    .await
                    .map(|()| true)
            }
            .await;
            drop(slot);
            self.shared.release(entry.episode_id);
            if marked? {
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "Recovered interrupted downloads");
        }
        Ok(recovered)
    }

    /// Removes the episode's file and resets it to `none` with zero
    /// progress, whatever its current state.
    ///
    /// An in-flight transfer is aborted and any callback it still delivers
    /// is discarded. A missing or undeletable file is logged, not raised.
    pub async fn delete_download(&self, episode_id: i64) -> Result<(), DownloadError> {
        let slot = self.shared.slot(episode_id);
        let deleted = self.delete_in_slot(episode_id, &slot).await;
        drop(slot);
        self.shared.release(episode_id);
        deleted
    }

    async fn delete_in_slot(
        &self,
        episode_id: i64,
        slot: &EpisodeSlot,
    ) -> Result<(), DownloadError> {
        let mut state = slot.state.lock().await;

        state.generation = self.shared.next_generation();
        if let Some(task) = state.task.take() {
            task.abort();
        }

        let status = self
            .shared
            .catalog
            .download_status(episode_id)
            .await?
            .ok_or(DownloadError::EpisodeNotFound(episode_id))?;

        if let Some(location) = status.file_location.as_deref() {
            match tokio::fs::remove_file(location).await {
                Ok(()) => tracing::debug!(episode_id, path = %location, "Download file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(episode_id, path = %location, error = %e, "Could not delete download file");
                }
            }
        }

        self.shared.catalog.reset_download(episode_id).await?;
        tracing::info!(episode_id, "Download deleted");
        Ok(())
    }

    /// Number of transfers still running.
    pub fn active_tasks(&self) -> usize {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reap_finished(&mut tasks);
        tasks.len()
    }

    #[cfg(test)]
    fn tracked_slots(&self) -> usize {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Waits until every started transfer has ended.
    pub async fn wait(&self) {
        loop {
            let mut set = std::mem::take(
                &mut *self
                    .tasks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
            if set.is_empty() {
                return;
            }
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Download task panicked");
                    }
                }
            }
        }
    }
}

/// One transfer. Holds a concurrency permit for its whole duration.
async fn run_download(
    shared: Arc<Shared>,
    episode_id: i64,
    generation: u64,
    url: String,
    destination: PathBuf,
) {
    let Ok(_permit) = Arc::clone(&shared.permits).acquire_owned().await else {
        return;
    };

    let (tx, mut rx) = mpsc::channel::<Progress>(PROGRESS_CHANNEL_CAPACITY);
    let fetch = shared.transport.fetch(&url, &destination, tx);
    let persist = async {
        // Monotonic within this run; offsets below the high-water mark are ignored.
        let mut high_water: Option<u64> = None;
        let mut written: Option<u64> = None;
        while let Some(progress) = rx.recv().await {
            if high_water.is_some_and(|h| progress.downloaded < h) {
                continue;
            }
            high_water = Some(progress.downloaded);
            let due = match written {
                None => true,
                Some(w) => {
                    progress.downloaded - w >= PROGRESS_WRITE_STEP
                        || Some(progress.downloaded) == progress.total
                }
            };
            if due && write_progress(&shared, episode_id, generation, progress).await {
                written = Some(progress.downloaded);
            }
        }
    };
    let (result, ()) = tokio::join!(fetch, persist);

    let slot = shared.slot(episode_id);
    record_result(&shared, &slot, episode_id, generation, &url, result).await;
    drop(slot);
    shared.release(episode_id);
}

async fn record_result(
    shared: &Shared,
    slot: &EpisodeSlot,
    episode_id: i64,
    generation: u64,
    url: &str,
    result: Result<u64, TransportError>,
) {
    let mut state = slot.state.lock().await;
    if state.generation != generation {
        tracing::debug!(episode_id, generation, "Discarding result of superseded download");
        return;
    }
    state.task = None;

    let write = match result {
        Ok(size) => {
            tracing::info!(episode_id, bytes = size, "Download finished");
            shared.catalog.finish_download(episode_id, to_i64(size)).await
        }
        Err(e) => {
            tracing::warn!(episode_id, url = %url, error = %e, "Download failed");
            shared
                .catalog
                .set_download_state(episode_id, DownloadState::Error)
                .await
        }
    };
    if let Err(e) = write {
        tracing::warn!(episode_id, error = %e, "Failed to record download result");
    }
}

/// Returns `false` when the write was skipped or failed.
async fn write_progress(
    shared: &Shared,
    episode_id: i64,
    generation: u64,
    progress: Progress,
) -> bool {
    let slot = shared.slot(episode_id);
    let written = async {
        let state = slot.state.lock().await;
        if state.generation != generation {
            return false;
        }
        let total = progress.total.map(to_i64).unwrap_or(0);
        match shared
            .catalog
            .set_download_progress(episode_id, to_i64(progress.downloaded), total)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(episode_id, error = %e, "Failed to record download progress");
                false
            }
        }
    }
    .await;
    drop(slot);
    shared.release(episode_id);
    written
}

/// Collects transfers that already ended so the set does not grow unbounded.
fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!(error = %e, "Download task panicked");
            }
        }
    }
}

fn to_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
