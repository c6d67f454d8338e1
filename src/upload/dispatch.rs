//! Sector dispatch
//!
//! Hands a segment's free sector slots to workers. Every free slot draws a
//! random starting worker and goes to the first ready worker from there.
//! A worker is ready for a segment when it is available and its host does
//! not already hold or upload a sector of that segment, so one round never
//! gives a worker two sectors of the same segment.
//!
//! Workers left without a sector either wait as backups (still ready) or
//! leave the segment. Backups are re-offered sectors whenever cleanup sees
//! free slots again.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::upload::segment::{SegmentPhase, UnfinishedSegment};
use crate::upload::worker::Worker;
use crate::upload::UploadContext;

impl UploadContext {
    /// Register `segment` as pending and fan its free sectors out across the
    /// worker pool.
    #[instrument(skip_all, fields(segment = %segment.id))]
    pub fn dispatch_segment(&self, segment: &Arc<UnfinishedSegment>) {
        if !self.heap.add_pending(segment.id) {
            debug!("segment already pending");
        }

        let workers = self.workers.snapshot();
        {
            let mut state = segment.lock();
            state.workers_remaining += workers.len();
            state.transition(&segment.id, SegmentPhase::Dispatched);
        }

        // Refused sectors are picked up by the lifecycle's closing cleanup
        let (assigned, refused) = self.assign_sectors(segment, &workers);
        self.metrics.segment_dispatched();
        debug!(
            workers = workers.len(),
            assigned = assigned.len(),
            refused,
            "segment dispatched"
        );
        for worker in assigned {
            worker.signal();
        }
    }

    /// Re-offer the segment's free sectors to its parked backup workers.
    /// Returns true if a backup had stopped and handed its sectors back, in
    /// which case the caller must run cleanup again.
    pub fn notify_backup_workers(&self, segment: &Arc<UnfinishedSegment>) -> bool {
        let backups = std::mem::take(&mut segment.lock().backup_workers);
        if backups.is_empty() {
            return false;
        }

        let (assigned, refused) = self.assign_sectors(segment, &backups);
        debug!(
            segment = %segment.id,
            backups = backups.len(),
            assigned = assigned.len(),
            refused,
            "backup workers notified"
        );
        for worker in assigned {
            worker.signal();
        }
        refused > 0
    }

    /// Claim free slots for `workers` and queue them on the workers. Returns
    /// the workers that received at least one sector, which the caller
    /// signals, and the number of sectors refused by workers that stopped
    /// in the meantime. Refused slots are freed again and their workers
    /// leave the segment.
    pub(crate) fn assign_sectors(
        &self,
        segment: &Arc<UnfinishedSegment>,
        workers: &[Arc<Worker>],
    ) -> (Vec<Arc<Worker>>, usize) {
        if workers.is_empty() {
            return (Vec::new(), 0);
        }

        // Worker locks are never taken under the segment lock
        let available: Vec<bool> = workers.iter().map(|w| w.is_available()).collect();
        let starts = self.random_offsets(workers.len(), segment.total_sectors);
        let mut assignments: Vec<Vec<usize>> = vec![Vec::new(); workers.len()];

        {
            let mut state = segment.lock();
            if state.released {
                return (Vec::new(), 0);
            }

            for (sector, start) in starts.into_iter().enumerate() {
                if state.sector_slots.get(sector).copied().unwrap_or(true) {
                    continue;
                }
                for step in 0..workers.len() {
                    let idx = (start + step) % workers.len();
                    let host = workers[idx].host_id();
                    if available[idx] && state.unused_hosts.contains(host) {
                        state.unused_hosts.remove(host);
                        state.sector_slots[sector] = true;
                        assignments[idx].push(sector);
                        break;
                    }
                }
            }

            for (idx, worker) in workers.iter().enumerate() {
                if !assignments[idx].is_empty() {
                    continue;
                }
                if available[idx] && state.unused_hosts.contains(worker.host_id()) {
                    state.backup_workers.push(Arc::clone(worker));
                } else {
                    state.workers_remaining = state.workers_remaining.saturating_sub(1);
                }
            }
        }

        let mut assigned = Vec::new();
        let mut refused: Vec<Vec<usize>> = Vec::new();
        for (worker, sectors) in workers.iter().zip(assignments) {
            if sectors.is_empty() {
                continue;
            }
            if worker.assign(segment, &sectors) {
                assigned.push(Arc::clone(worker));
            } else {
                refused.push(sectors);
            }
        }

        let refused_sectors = refused.iter().map(Vec::len).sum();
        if !refused.is_empty() {
            let mut state = segment.lock();
            for sectors in &refused {
                for sector in sectors {
                    state.sector_slots[*sector] = false;
                }
                state.workers_remaining = state.workers_remaining.saturating_sub(1);
            }
        }
        (assigned, refused_sectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{HostDownloader, MemoryFileEntry, MemoryFileStore, MemoryHost};
    use crate::config::UploadConfig;
    use crate::domain::ports::HostId;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn context(hosts: usize, seed: u64) -> Arc<UploadContext> {
        let config = UploadConfig {
            rng_seed: Some(seed),
            ..Default::default()
        };
        let ctx = UploadContext::new(
            config,
            Arc::new(MemoryFileStore::new()),
            Arc::new(HostDownloader::new()),
        )
        .unwrap();
        for i in 0..hosts {
            ctx.workers
                .insert(Worker::new(MemoryHost::new(format!("h{i}").as_str())))
                .unwrap();
        }
        ctx
    }

    fn segment(ctx: &UploadContext, min: usize, total: usize) -> Arc<UnfinishedSegment> {
        let file = MemoryFileEntry::builder("d/file")
            .file_size(1024)
            .sector_size(64)
            .erasure(min, total)
            .build()
            .unwrap();
        UnfinishedSegment::new(file, 0, false, &ctx.workers.host_ids())
    }

    #[test]
    fn test_dispatch_fans_out_to_ready_workers() {
        let ctx = context(8, 7);
        let seg = segment(&ctx, 4, 6);

        ctx.dispatch_segment(&seg);

        let workers = ctx.workers.snapshot();
        let assigned: Vec<_> = workers
            .iter()
            .filter(|w| !w.sector_indices(&seg.id).is_empty())
            .collect();
        assert_eq!(assigned.len(), 6);
        for worker in &assigned {
            assert_eq!(worker.sector_indices(&seg.id).len(), 1);
        }

        let state = seg.lock();
        assert!(state.sector_slots.iter().all(|claimed| *claimed));
        assert_eq!(state.backup_workers.len(), 2);
        assert_eq!(state.workers_remaining, 8);
        assert_eq!(state.phase, SegmentPhase::Dispatched);
        assert!(ctx.heap.is_pending(&seg.id));
    }

    #[test]
    fn test_dispatch_with_fewer_workers_than_sectors() {
        let ctx = context(3, 1);
        let seg = segment(&ctx, 4, 6);

        ctx.dispatch_segment(&seg);

        let state = seg.lock();
        assert_eq!(state.free_slots(), 3);
        assert!(state.backup_workers.is_empty());
        assert_eq!(state.workers_remaining, 3);
    }

    #[test]
    fn test_unready_workers_leave_segment() {
        let ctx = context(4, 3);
        let seg = segment(&ctx, 2, 4);
        let removed = ctx.workers.get(&HostId::from("h0")).unwrap();
        removed.terminate();

        ctx.dispatch_segment(&seg);

        assert!(removed.sector_indices(&seg.id).is_empty());
        let state = seg.lock();
        assert_eq!(state.workers_remaining, 3);
        assert_eq!(state.free_slots(), 1);
    }

    #[test]
    fn test_backups_take_freed_slot() {
        let ctx = context(6, 11);
        let seg = segment(&ctx, 2, 4);
        ctx.dispatch_segment(&seg);
        assert_eq!(seg.lock().backup_workers.len(), 2);

        // A primary gives its sector back
        let freed = {
            let mut state = seg.lock();
            state.sector_slots[2] = false;
            state.workers_remaining -= 1;
            2
        };
        ctx.notify_backup_workers(&seg);

        let state = seg.lock();
        assert!(state.sector_slots[freed]);
        assert_eq!(state.backup_workers.len(), 1);
        assert_eq!(state.workers_remaining, 5);
    }

    #[test]
    fn test_same_seed_gives_same_assignment() {
        let assignment = |seed| {
            let ctx = context(10, seed);
            let seg = segment(&ctx, 4, 6);
            ctx.dispatch_segment(&seg);
            ctx.workers
                .snapshot()
                .iter()
                .map(|w| w.sector_indices(&seg.id))
                .collect::<Vec<_>>()
        };
        assert_eq!(assignment(42), assignment(42));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// No slot is handed to two workers, no worker gets two sectors of a
        /// segment, and pre-claimed slots are never reassigned.
        #[test]
        fn prop_assignment_is_exclusive(
            hosts in 1usize..12,
            seed in any::<u64>(),
            claimed in prop::collection::vec(any::<bool>(), 6),
            rounds in 1usize..4,
        ) {
            let ctx = context(hosts, seed);
            let seg = segment(&ctx, 4, 6);
            {
                let mut state = seg.lock();
                for (slot, pre) in state.sector_slots.iter_mut().zip(&claimed) {
                    *slot = *pre;
                }
            }

            ctx.dispatch_segment(&seg);
            for _ in 1..rounds {
                ctx.notify_backup_workers(&seg);
            }

            let mut seen = HashSet::new();
            for worker in ctx.workers.snapshot() {
                let sectors = worker.sector_indices(&seg.id);
                prop_assert!(sectors.len() <= 1);
                for sector in sectors {
                    prop_assert!(!claimed[sector]);
                    prop_assert!(seen.insert(sector));
                }
            }
            let state = seg.lock();
            let claimed_now = state.sector_slots.iter().filter(|c| **c).count();
            prop_assert!(claimed_now <= state.total_sectors());
            prop_assert_eq!(
                claimed_now,
                claimed.iter().filter(|c| **c).count() + seen.len()
            );
            prop_assert!(state.workers_remaining <= hosts);
        }
    }
}
