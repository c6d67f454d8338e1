//! Upload Engine
//!
//! Turns files into erasure-coded, encrypted sectors spread across storage
//! hosts, under a fixed memory budget.
//!
//! # Architecture
//!
//! ```text
//! upload_file ──▶ UploadHeap ──▶ run loop ──▶ lifecycle task
//!                  (queued)      (memory,      retrieve → encode →
//!                                 permit)      encrypt → dispatch
//!                                                     │
//!                    ┌────────────────────────────────┘
//!                    ▼
//!               Worker × hosts ──▶ HostSession::upload_sector
//!                    │
//!                    ▼
//!               cleanup ──▶ trim, return memory, release, stuck flag
//! ```
//!
//! All shared state lives in [`UploadContext`]. Dispatch, lifecycle and
//! cleanup are implemented as methods on it in their own modules.

pub mod cleanup;
pub mod dispatch;
pub mod download;
pub mod heap;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod segment;
pub mod task;
pub mod worker;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::UploadConfig;
use crate::domain::ports::{Downloader, FileStore, HostId, HostSession, StoragePath};
use crate::error::{Error, Result};

pub use download::{Download, DownloadBuffer, DownloadParams};
pub use heap::UploadHeap;
pub use memory::MemoryManager;
pub use metrics::{UploadMetrics, UploadStats};
pub use segment::{SegmentId, SegmentPhase, UnfinishedSegment};
pub use task::{TaskGuard, TaskManager};
pub use worker::{Worker, WorkerPool};

// =============================================================================
// Shared State
// =============================================================================

/// State shared by every component of the upload engine.
pub struct UploadContext {
    pub config: UploadConfig,
    pub memory: Arc<MemoryManager>,
    pub heap: Arc<UploadHeap>,
    pub workers: Arc<WorkerPool>,
    pub file_store: Arc<dyn FileStore>,
    pub downloader: Arc<dyn Downloader>,
    pub tasks: TaskManager,
    pub metrics: Arc<UploadMetrics>,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for UploadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadContext")
            .field("memory", &self.memory)
            .field("heap", &self.heap)
            .field("workers", &self.workers)
            .field("active_tasks", &self.tasks.active())
            .finish()
    }
}

impl UploadContext {
    pub fn new(
        config: UploadConfig,
        file_store: Arc<dyn FileStore>,
        downloader: Arc<dyn Downloader>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(Arc::new(Self {
            memory: Arc::new(MemoryManager::new(config.memory_limit_bytes)),
            heap: Arc::new(UploadHeap::new(config.stuck_success_capacity)),
            workers: Arc::new(WorkerPool::new()),
            file_store,
            downloader,
            tasks: TaskManager::new(),
            metrics: Arc::new(UploadMetrics::new()),
            rng: Mutex::new(rng),
            config,
        }))
    }

    /// `count` independent offsets in `0..bound`.
    pub(crate) fn random_offsets(&self, bound: usize, count: usize) -> Vec<usize> {
        if bound == 0 {
            return vec![0; count];
        }
        let mut rng = self.rng.lock();
        (0..count).map(|_| rng.random_range(0..bound)).collect()
    }

    /// Hosts with a worker in the pool.
    pub fn online_hosts(&self) -> HashSet<HostId> {
        self.workers.host_ids()
    }

    /// Start a worker for `session`'s host.
    pub fn add_host(self: &Arc<Self>, session: Arc<dyn HostSession>) -> Result<Arc<Worker>> {
        let guard = self.tasks.add()?;
        let worker = Worker::new(session);
        self.workers.insert(Arc::clone(&worker))?;
        tokio::spawn(Arc::clone(&worker).run(Arc::clone(self), guard));
        info!(host = %worker.host_id(), workers = self.workers.len(), "host added");
        Ok(worker)
    }

    /// Stop a host's worker and hand its queued sectors back to their
    /// segments. Returns false if the host had no worker.
    pub async fn remove_host(&self, host: &HostId) -> bool {
        let Some(worker) = self.workers.remove(host) else {
            return false;
        };
        let jobs = worker.terminate();
        info!(host = %host, abandoned = jobs.len(), "host removed");
        for (segment, sector) in jobs {
            worker.abandon_job(self, &segment, sector).await;
        }
        true
    }
}

// =============================================================================
// Upload Manager
// =============================================================================

/// Driver of the upload engine: queues file segments and feeds them to
/// lifecycle tasks as memory and concurrency allow.
#[derive(Debug, Clone)]
pub struct UploadManager {
    ctx: Arc<UploadContext>,
    limiter: Arc<Semaphore>,
}

impl UploadManager {
    pub fn new(
        config: UploadConfig,
        file_store: Arc<dyn FileStore>,
        downloader: Arc<dyn Downloader>,
    ) -> Result<Self> {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_segments));
        let ctx = UploadContext::new(config, file_store, downloader)?;
        Ok(Self { ctx, limiter })
    }

    pub fn context(&self) -> &Arc<UploadContext> {
        &self.ctx
    }

    pub fn add_host(&self, session: Arc<dyn HostSession>) -> Result<Arc<Worker>> {
        self.ctx.add_host(session)
    }

    pub async fn remove_host(&self, host: &HostId) -> bool {
        self.ctx.remove_host(host).await
    }

    pub fn stats(&self) -> UploadStats {
        self.ctx.metrics.stats()
    }

    /// Queue every segment of `path` that is missing sectors. Returns the
    /// number of segments queued.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn upload_file(&self, path: &StoragePath, stuck_repair: bool) -> Result<usize> {
        let entry = self.ctx.file_store.open(path).await?;
        let num_segments = entry.num_segments();
        if let Err(e) = entry.close() {
            debug!(error = %e, "file not closed after reading its geometry");
        }

        let online = self.ctx.online_hosts();
        let mut queued = 0;
        for index in 0..num_segments {
            let handle = self.ctx.file_store.open(path).await?;
            let segment = UnfinishedSegment::new(handle, index, stuck_repair, &online);

            if segment.memory_needed > self.ctx.memory.limit() {
                close_unqueued(&segment);
                return Err(Error::MemoryRequestTooLarge {
                    requested: segment.memory_needed,
                    limit: self.ctx.memory.limit(),
                });
            }
            if segment.completed() >= segment.total_sectors {
                debug!(segment = %segment.id, "segment fully uploaded, skipping");
                close_unqueued(&segment);
                continue;
            }
            if !self.ctx.heap.push(Arc::clone(&segment)) {
                close_unqueued(&segment);
                continue;
            }
            queued += 1;
        }

        info!(segments = num_segments, queued, "file queued for upload");
        Ok(queued)
    }

    /// Feed queued segments to lifecycle tasks until shutdown.
    pub async fn run(&self) {
        let stop = self.ctx.tasks.stop_token().clone();
        info!("upload loop started");

        while let Some(segment) = self.ctx.heap.pop_wait(&stop).await {
            if let Err(e) = self.ctx.memory.acquire(segment.memory_needed, &stop).await {
                debug!(segment = %segment.id, error = %e, "segment not started");
                self.give_back(&segment);
                continue;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.limiter).acquire_owned() => permit.ok(),
                _ = stop.cancelled() => None,
            };
            let guard = permit
                .as_ref()
                .and_then(|_| self.ctx.tasks.add().ok());
            let (Some(permit), Some(guard)) = (permit, guard) else {
                self.ctx.memory.return_memory(segment.memory_needed);
                self.give_back(&segment);
                continue;
            };

            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                ctx.retrieve_and_dispatch_segment(&segment).await;
            });
        }

        info!("upload loop stopped");
    }

    /// Spawn [`UploadManager::run`] on the runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run().await })
    }

    /// Wait until nothing is queued, being prepared, or uploading.
    pub async fn wait_idle(&self) {
        self.ctx.heap.wait_idle().await;
    }

    /// Stop the engine: cancel every wait and let admitted tasks finish.
    pub async fn shutdown(&self) {
        info!("upload engine shutting down");
        self.ctx.tasks.close().await;
    }

    fn give_back(&self, segment: &Arc<UnfinishedSegment>) {
        self.ctx.heap.release_claim(&segment.id);
        if let Err(e) = segment.file.close() {
            warn!(segment = %segment.id, error = %e, "file not closed after abandoning segment");
        }
    }
}

/// Close the handle of a segment that never entered the heap.
fn close_unqueued(segment: &UnfinishedSegment) {
    if let Err(e) = segment.file.close() {
        debug!(segment = %segment.id, error = %e, "file not closed after skipping segment");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{HostDownloader, MemoryFileStore, MemoryHost};
    use assert_matches::assert_matches;

    fn manager(memory_limit_bytes: u64) -> (UploadManager, Arc<MemoryFileStore>) {
        let store = Arc::new(MemoryFileStore::new());
        let config = UploadConfig {
            memory_limit_bytes,
            rng_seed: Some(5),
            ..Default::default()
        };
        let manager =
            UploadManager::new(config, store.clone(), Arc::new(HostDownloader::new())).unwrap();
        (manager, store)
    }

    #[test]
    fn test_random_offsets_in_bounds() {
        let (manager, _) = manager(1 << 20);
        let offsets = manager.context().random_offsets(3, 100);
        assert_eq!(offsets.len(), 100);
        assert!(offsets.iter().all(|o| *o < 3));
        assert_eq!(manager.context().random_offsets(0, 2), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_add_and_remove_host() {
        let (manager, _) = manager(1 << 20);
        manager.add_host(MemoryHost::new("h1")).unwrap();
        assert_matches!(manager.add_host(MemoryHost::new("h1")), Err(Error::Internal(_)));
        assert_eq!(manager.context().online_hosts().len(), 1);

        assert!(manager.remove_host(&HostId::from("h1")).await);
        assert!(!manager.remove_host(&HostId::from("h1")).await);
        manager.shutdown().await;
        assert_eq!(manager.context().tasks.active(), 0);
    }

    #[tokio::test]
    async fn test_upload_file_rejects_oversized_segments() {
        let (manager, store) = manager(1024);
        store
            .create_file("big", 4096, 256, 4, 6, None)
            .unwrap();

        let result = manager.upload_file(&StoragePath::new("big"), false).await;
        assert_matches!(result, Err(Error::MemoryRequestTooLarge { .. }));
        assert!(manager.context().heap.is_idle());
        let entry = store.get(&StoragePath::new("big")).unwrap();
        assert_eq!(entry.open_count(), entry.close_count());
    }

    #[tokio::test]
    async fn test_upload_file_queues_each_segment_once() {
        let (manager, store) = manager(1 << 20);
        store.create_file("f", 2500, 256, 4, 6, None).unwrap();
        let path = StoragePath::new("f");

        assert_eq!(manager.upload_file(&path, false).await.unwrap(), 3);
        assert_eq!(manager.upload_file(&path, false).await.unwrap(), 0);
        assert_eq!(manager.context().heap.len(), 3);

        // Only the queued segments keep their handles open
        let entry = store.get(&path).unwrap();
        assert_eq!(entry.open_count(), entry.close_count() + 3);
    }
}
