//! Workers
//!
//! One [`Worker`] per storage host. The dispatcher fills a worker's
//! per-segment sector lists and signals it; the worker's task drains the
//! lists, uploads each sector through the host session and reports the
//! outcome back into the segment before running cleanup.
//!
//! Lock order: a worker never holds its own lock while taking a segment
//! lock, and segment code never calls into a worker while holding the
//! segment lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::UploadConfig;
use crate::domain::ports::{HostId, HostSession, SectorLocation};
use crate::error::{Error, Result};
use crate::upload::segment::{SegmentId, UnfinishedSegment};
use crate::upload::task::TaskGuard;
use crate::upload::UploadContext;

// =============================================================================
// Worker
// =============================================================================

struct SegmentJobs {
    segment: Arc<UnfinishedSegment>,
    sectors: VecDeque<usize>,
}

#[derive(Default)]
struct WorkerState {
    /// Sector indices this worker was asked to upload, per segment
    sector_index_map: HashMap<SegmentId, SegmentJobs>,
    /// Segments in the order their work arrived
    order: VecDeque<SegmentId>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    terminated: bool,
}

/// Upload agent bound to one host.
pub struct Worker {
    host: HostId,
    session: Arc<dyn HostSession>,
    state: Mutex<WorkerState>,
    signal: Notify,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Worker")
            .field("host", &self.host)
            .field("segments", &state.sector_index_map.len())
            .field("consecutive_failures", &state.consecutive_failures)
            .field("terminated", &state.terminated)
            .finish()
    }
}

impl Worker {
    pub fn new(session: Arc<dyn HostSession>) -> Arc<Self> {
        Arc::new(Self {
            host: session.host_id().clone(),
            session,
            state: Mutex::new(WorkerState::default()),
            signal: Notify::new(),
        })
    }

    pub fn host_id(&self) -> &HostId {
        &self.host
    }

    pub fn session(&self) -> Arc<dyn HostSession> {
        Arc::clone(&self.session)
    }

    /// Not terminated and not cooling down after failures.
    pub fn is_available(&self) -> bool {
        let state = self.state.lock();
        if state.terminated {
            return false;
        }
        match state.cooldown_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Queue `sectors` of `segment` for upload. Call [`Worker::signal`]
    /// afterwards to wake the worker. Returns false, queueing nothing, once
    /// the worker has stopped.
    pub fn assign(&self, segment: &Arc<UnfinishedSegment>, sectors: &[usize]) -> bool {
        if sectors.is_empty() {
            return true;
        }
        let mut state = self.state.lock();
        if state.terminated {
            return false;
        }
        let id = segment.id;
        if !state.sector_index_map.contains_key(&id) {
            state.order.push_back(id);
        }
        state
            .sector_index_map
            .entry(id)
            .or_insert_with(|| SegmentJobs {
                segment: Arc::clone(segment),
                sectors: VecDeque::new(),
            })
            .sectors
            .extend(sectors.iter().copied());
        true
    }

    /// Sector indices still queued for a segment.
    pub fn sector_indices(&self, id: &SegmentId) -> Vec<usize> {
        self.state
            .lock()
            .sector_index_map
            .get(id)
            .map(|jobs| jobs.sectors.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of queued sector uploads across all segments.
    pub fn queued_jobs(&self) -> usize {
        self.state
            .lock()
            .sector_index_map
            .values()
            .map(|jobs| jobs.sectors.len())
            .sum()
    }

    /// Wake the worker's task.
    pub fn signal(&self) {
        self.signal.notify_one();
    }

    fn next_job(&self) -> Option<(Arc<UnfinishedSegment>, usize)> {
        let mut state = self.state.lock();
        while let Some(id) = state.order.front().copied() {
            let next = state
                .sector_index_map
                .get_mut(&id)
                .and_then(|jobs| jobs.sectors.pop_front().map(|s| (Arc::clone(&jobs.segment), s)));
            match next {
                Some(job) => return Some(job),
                None => {
                    state.order.pop_front();
                    state.sector_index_map.remove(&id);
                }
            }
        }
        None
    }

    fn drain_jobs(&self) -> Vec<(Arc<UnfinishedSegment>, usize)> {
        let mut state = self.state.lock();
        state.order.clear();
        state
            .sector_index_map
            .drain()
            .flat_map(|(_, jobs)| {
                let segment = jobs.segment;
                jobs.sectors
                    .into_iter()
                    .map(move |sector| (Arc::clone(&segment), sector))
            })
            .collect()
    }

    /// Stop accepting work. Returns the jobs that were still queued.
    pub fn terminate(&self) -> Vec<(Arc<UnfinishedSegment>, usize)> {
        self.state.lock().terminated = true;
        self.signal.notify_one();
        self.drain_jobs()
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.cooldown_until = None;
    }

    fn record_failure(&self, config: &UploadConfig) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let cooldown = config.cooldown_for(state.consecutive_failures);
        state.cooldown_until = Some(Instant::now() + cooldown);
        debug!(
            host = %self.host,
            failures = state.consecutive_failures,
            cooldown_ms = cooldown.as_millis() as u64,
            "worker cooling down"
        );
    }

    /// Worker loop. Runs until shutdown or termination.
    pub async fn run(self: Arc<Self>, ctx: Arc<UploadContext>, _guard: TaskGuard) {
        let stop = ctx.tasks.stop_token().clone();
        info!(host = %self.host, "worker started");

        loop {
            while let Some((segment, sector)) = self.next_job() {
                if stop.is_cancelled() {
                    self.abandon_job(&ctx, &segment, sector).await;
                    continue;
                }
                self.upload(&ctx, segment, sector).await;
            }

            if self.is_terminated() {
                break;
            }
            tokio::select! {
                _ = self.signal.notified() => {}
                _ = stop.cancelled() => break,
            }
        }

        // Jobs assigned from here on are refused and handed back by the
        // dispatcher
        self.state.lock().terminated = true;
        for (segment, sector) in self.drain_jobs() {
            self.abandon_job(&ctx, &segment, sector).await;
        }
        info!(host = %self.host, "worker stopped");
    }

    /// Hand a queued sector back to its segment without uploading it.
    pub async fn abandon_job(
        &self,
        ctx: &UploadContext,
        segment: &Arc<UnfinishedSegment>,
        sector: usize,
    ) {
        {
            let mut state = segment.lock();
            if let Some(slot) = state.sector_slots.get_mut(sector) {
                *slot = false;
            }
            state.workers_remaining = state.workers_remaining.saturating_sub(1);
        }
        debug!(host = %self.host, segment = %segment.id, sector, "sector handed back");
        ctx.cleanup_segment(segment).await;
    }

    #[instrument(skip(self, ctx, segment), fields(host = %self.host, segment = %segment.id))]
    async fn upload(&self, ctx: &UploadContext, segment: Arc<UnfinishedSegment>, sector: usize) {
        // Readiness may have changed since the sector was assigned
        if !self.is_available() {
            self.abandon_job(ctx, &segment, sector).await;
            return;
        }

        let data = {
            let mut state = segment.lock();
            let data = state.physical_data.get(sector).cloned().flatten();
            if data.is_some() {
                state.uploading += 1;
            }
            data
        };
        let Some(data) = data else {
            warn!(sector, "no sector data to upload");
            self.abandon_job(ctx, &segment, sector).await;
            return;
        };

        let stop = ctx.tasks.stop_token();
        let result: Result<()> = tokio::select! {
            uploaded = self.session.upload_sector(data) => uploaded.and_then(|root| {
                segment.file.add_sector(
                    segment.id.index,
                    sector,
                    SectorLocation {
                        host: self.host.clone(),
                        root,
                    },
                )
            }),
            _ = stop.cancelled() => Err(Error::Interrupted("sector upload interrupted by stop call".to_string())),
        };

        match result {
            Ok(()) => {
                {
                    let mut state = segment.lock();
                    state.uploading -= 1;
                    state.completed += 1;
                    state.physical_data[sector] = None;
                    state.memory_released += segment.sector_size;
                    state.workers_remaining = state.workers_remaining.saturating_sub(1);
                }
                ctx.memory.return_memory(segment.sector_size);
                self.record_success();
                ctx.metrics.sector_uploaded();
                debug!(sector, "sector uploaded");
            }
            Err(e) => {
                {
                    let mut state = segment.lock();
                    state.uploading -= 1;
                    state.sector_slots[sector] = false;
                    state.workers_remaining = state.workers_remaining.saturating_sub(1);
                }
                if !matches!(e, Error::Interrupted(_)) {
                    self.record_failure(&ctx.config);
                }
                ctx.metrics.sector_failed();
                warn!(sector, error = %e, "sector upload failed");
            }
        }

        ctx.cleanup_segment(&segment).await;
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// The set of workers, one per online host.
#[derive(Default)]
pub struct WorkerPool {
    workers: DashMap<HostId, Arc<Worker>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. Fails if its host already has one.
    pub fn insert(&self, worker: Arc<Worker>) -> Result<()> {
        match self.workers.entry(worker.host_id().clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Internal(format!(
                "host {} already has a worker",
                worker.host_id()
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(worker);
                Ok(())
            }
        }
    }

    pub fn remove(&self, host: &HostId) -> Option<Arc<Worker>> {
        self.workers.remove(host).map(|(_, worker)| worker)
    }

    pub fn get(&self, host: &HostId) -> Option<Arc<Worker>> {
        self.workers.get(host).map(|w| Arc::clone(w.value()))
    }

    /// Every worker, ordered by host id.
    pub fn snapshot(&self) -> Vec<Arc<Worker>> {
        let mut workers: Vec<_> = self.workers.iter().map(|w| Arc::clone(w.value())).collect();
        workers.sort_by(|a, b| a.host_id().cmp(b.host_id()));
        workers
    }

    pub fn host_ids(&self) -> HashSet<HostId> {
        self.workers.iter().map(|w| w.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryFileEntry, MemoryHost};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn segment(index: u64) -> Arc<UnfinishedSegment> {
        let file = MemoryFileEntry::builder("w/file")
            .file_size(4096)
            .sector_size(64)
            .erasure(2, 4)
            .build()
            .unwrap();
        UnfinishedSegment::new(file, index, false, &HashSet::new())
    }

    #[test]
    fn test_assign_and_drain_in_order() {
        let worker = Worker::new(MemoryHost::new("h1"));
        let a = segment(0);
        let b = segment(1);

        worker.assign(&a, &[1]);
        worker.assign(&b, &[0]);
        worker.assign(&a, &[3]);
        assert_eq!(worker.sector_indices(&a.id), vec![1, 3]);
        assert_eq!(worker.queued_jobs(), 3);

        let (seg, sector) = worker.next_job().unwrap();
        assert_eq!((seg.id, sector), (a.id, 1));
        let (seg, sector) = worker.next_job().unwrap();
        assert_eq!((seg.id, sector), (a.id, 3));
        let (seg, sector) = worker.next_job().unwrap();
        assert_eq!((seg.id, sector), (b.id, 0));
        assert!(worker.next_job().is_none());
    }

    #[test]
    fn test_terminate_returns_queued_jobs() {
        let worker = Worker::new(MemoryHost::new("h1"));
        let seg = segment(0);
        worker.assign(&seg, &[0, 2]);

        let jobs = worker.terminate();
        assert_eq!(jobs.len(), 2);
        assert!(worker.is_terminated());
        assert!(!worker.is_available());
        assert_eq!(worker.queued_jobs(), 0);

        assert!(!worker.assign(&seg, &[1]));
        assert_eq!(worker.queued_jobs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cooldown_and_reset() {
        let config = UploadConfig {
            worker_base_cooldown: Duration::from_secs(1),
            worker_max_cooldown: Duration::from_secs(8),
            ..Default::default()
        };
        let worker = Worker::new(MemoryHost::new("h1"));

        worker.record_failure(&config);
        worker.record_failure(&config);
        assert_eq!(worker.consecutive_failures(), 2);
        assert!(!worker.is_available());

        tokio::time::advance(Duration::from_millis(2001)).await;
        assert!(worker.is_available());

        worker.record_success();
        assert_eq!(worker.consecutive_failures(), 0);
    }

    #[test]
    fn test_pool_rejects_duplicate_hosts() {
        let pool = WorkerPool::new();
        pool.insert(Worker::new(MemoryHost::new("h2"))).unwrap();
        pool.insert(Worker::new(MemoryHost::new("h1"))).unwrap();
        assert_matches!(
            pool.insert(Worker::new(MemoryHost::new("h1"))),
            Err(Error::Internal(_))
        );

        let hosts: Vec<_> = pool
            .snapshot()
            .iter()
            .map(|w| w.host_id().to_string())
            .collect();
        assert_eq!(hosts, vec!["h1", "h2"]);

        assert!(pool.remove(&HostId::from("h1")).is_some());
        assert_eq!(pool.len(), 1);
        assert!(pool.get(&HostId::from("h1")).is_none());
    }
}
