//! Segment cleanup and stuck bookkeeping
//!
//! Cleanup runs after every sector-level event and at the end of the
//! lifecycle. It is idempotent: once a segment is released, further calls
//! change nothing.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::upload::segment::{repair_successful, SegmentPhase, UnfinishedSegment};
use crate::upload::UploadContext;

impl UploadContext {
    /// Trim sectors no worker can still take, return freed memory and
    /// release the segment once its upload is complete.
    pub async fn cleanup_segment(&self, segment: &Arc<UnfinishedSegment>) {
        // Another pass is needed only when a stopped backup refused the
        // sectors it was offered
        while self.cleanup_pass(segment).await {
            debug!(segment = %segment.id, "sectors handed back, cleaning up again");
        }
    }

    async fn cleanup_pass(&self, segment: &Arc<UnfinishedSegment>) -> bool {
        let mut sectors_available = 0usize;
        let mut trimmed = 0u64;
        let (complete, newly_released, total_released) = {
            let mut state = segment.lock();

            // Later sectors are dropped first; they are the cheapest to
            // recompute
            for i in 0..state.sector_slots.len() {
                if state.sector_slots[i] {
                    continue;
                }
                if sectors_available >= state.workers_remaining {
                    state.physical_data[i] = None;
                    state.sector_slots[i] = true;
                    trimmed += 1;
                } else {
                    sectors_available += 1;
                }
            }

            // With nothing free and no worker holding a sector, parked
            // backups can never be used
            if sectors_available == 0
                && !state.backup_workers.is_empty()
                && state.workers_remaining == state.backup_workers.len()
            {
                let parked = state.backup_workers.len();
                state.backup_workers.clear();
                state.workers_remaining -= parked;
                debug!(segment = %segment.id, parked, "released backup workers");
            }

            let complete = state.is_upload_complete();
            let newly_released = complete && !state.released;
            if newly_released {
                state.released = true;
                state.backup_workers.clear();
                state.logical_data = None;
            }
            state.memory_released += trimmed * segment.sector_size;
            (complete, newly_released, state.memory_released)
        };

        let handed_back = sectors_available > 0 && self.notify_backup_workers(segment);
        if trimmed > 0 {
            self.metrics.sectors_trimmed(trimmed);
            self.memory.return_memory(trimmed * segment.sector_size);
        }

        if newly_released {
            self.update_stuck_status(segment).await;
            if let Err(e) = segment.file.close() {
                debug!(path = %segment.file.path(), error = %e, "file not closed after segment upload complete");
            }
            segment.lock().transition(&segment.id, SegmentPhase::Released);
            self.heap.remove_pending(&segment.id);
            info!(segment = %segment.id, completed = segment.completed(), "segment released");
        }

        if complete && total_released != segment.memory_needed {
            self.metrics.accounting_violation();
            let state = segment.lock();
            warn!(
                segment = %segment.id,
                workers_remaining = state.workers_remaining,
                uploading = state.uploading,
                released = total_released,
                needed = segment.memory_needed,
                "segment complete but memory does not balance"
            );
        }
        handed_back
    }

    /// Record whether the finished attempt left the segment stuck.
    pub async fn update_stuck_status(&self, segment: &Arc<UnfinishedSegment>) {
        let completed = segment.completed();
        let success = repair_successful(
            segment.total_sectors,
            completed,
            self.config.repair_download_threshold,
        );

        let phase = if success {
            self.metrics.segment_completed();
            SegmentPhase::Completed
        } else {
            self.metrics.segment_stuck();
            SegmentPhase::Stuck
        };
        segment.lock().transition(&segment.id, phase);

        // Failures during shutdown say nothing about the file
        if !success && self.tasks.is_stopped() {
            debug!(segment = %segment.id, "repair unsuccessful while stopping, stuck flag left as is");
            return;
        }

        let path = segment.file.path();
        if let Err(e) = segment.file.set_stuck(segment.id.index, !success) {
            error!(path = %path, error = %e, "unable to update segment stuck status");
            return;
        }
        debug!(segment = %segment.id, stuck = !success, completed, "stuck status updated");

        let store = Arc::clone(&self.file_store);
        let dir_path = path.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_dir_metadata(&dir_path).await {
                warn!(path = %dir_path, error = %e, "directory metadata update failed");
            }
        });

        if segment.stuck && success && segment.stuck_repair {
            let tx = self.heap.stuck_success_sender();
            tokio::select! {
                sent = tx.send(path) => {
                    if sent.is_err() {
                        debug!(segment = %segment.id, "no listener for stuck repair success");
                    }
                }
                _ = self.tasks.stop_token().cancelled() => {}
            }
        }
    }
}
