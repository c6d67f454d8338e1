//! Upload engine counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of [`UploadMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    /// Segments handed to workers
    pub segments_dispatched: u64,
    /// Segments released at or above the repair threshold
    pub segments_completed: u64,
    /// Segments released below the repair threshold
    pub segments_stuck: u64,
    /// Segments abandoned during retrieval or encoding
    pub segments_aborted: u64,
    pub sectors_uploaded: u64,
    pub sectors_failed: u64,
    /// Redundant sectors dropped because too few workers remained
    pub sectors_trimmed: u64,
    pub encryption_failures: u64,
    pub disk_retrievals: u64,
    pub network_retrievals: u64,
    /// Released segments whose memory did not balance
    pub accounting_violations: u64,
}

/// Lock-free counters shared by every component of the engine.
#[derive(Debug, Default)]
pub struct UploadMetrics {
    segments_dispatched: AtomicU64,
    segments_completed: AtomicU64,
    segments_stuck: AtomicU64,
    segments_aborted: AtomicU64,
    sectors_uploaded: AtomicU64,
    sectors_failed: AtomicU64,
    sectors_trimmed: AtomicU64,
    encryption_failures: AtomicU64,
    disk_retrievals: AtomicU64,
    network_retrievals: AtomicU64,
    accounting_violations: AtomicU64,
}

impl UploadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment_dispatched(&self) {
        self.segments_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn segment_completed(&self) {
        self.segments_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn segment_stuck(&self) {
        self.segments_stuck.fetch_add(1, Ordering::Relaxed);
    }

    pub fn segment_aborted(&self) {
        self.segments_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sector_uploaded(&self) {
        self.sectors_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sector_failed(&self) {
        self.sectors_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sectors_trimmed(&self, count: u64) {
        self.sectors_trimmed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn encryption_failure(&self) {
        self.encryption_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn disk_retrieval(&self) {
        self.disk_retrievals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn network_retrieval(&self) {
        self.network_retrievals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accounting_violation(&self) {
        self.accounting_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> UploadStats {
        UploadStats {
            segments_dispatched: self.segments_dispatched.load(Ordering::Relaxed),
            segments_completed: self.segments_completed.load(Ordering::Relaxed),
            segments_stuck: self.segments_stuck.load(Ordering::Relaxed),
            segments_aborted: self.segments_aborted.load(Ordering::Relaxed),
            sectors_uploaded: self.sectors_uploaded.load(Ordering::Relaxed),
            sectors_failed: self.sectors_failed.load(Ordering::Relaxed),
            sectors_trimmed: self.sectors_trimmed.load(Ordering::Relaxed),
            encryption_failures: self.encryption_failures.load(Ordering::Relaxed),
            disk_retrievals: self.disk_retrievals.load(Ordering::Relaxed),
            network_retrievals: self.network_retrievals.load(Ordering::Relaxed),
            accounting_violations: self.accounting_violations.load(Ordering::Relaxed),
        }
    }
}
