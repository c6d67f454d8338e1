//! Unfinished upload segments
//!
//! A segment is a fixed-size slice of a file, erasure coded into sectors
//! independently of its neighbours. [`UnfinishedSegment`] carries everything
//! needed while the segment is being worked on: immutable geometry, and a
//! lock-protected [`SegmentState`] holding slots, counters, buffers and the
//! standby workers.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::domain::ports::{FileEntry, FileId, HostId};
use crate::upload::worker::Worker;

// =============================================================================
// Identity
// =============================================================================

/// Identifies a segment by file and index within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId {
    pub file: FileId,
    pub index: u64,
}

impl SegmentId {
    pub fn new(file: FileId, index: u64) -> Self {
        Self { file, index }
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.file, self.index)
    }
}

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPhase {
    Created,
    RetrievingData,
    Encoding,
    Encrypting,
    Dispatched,
    /// Finished with enough sectors stored
    Completed,
    /// Finished below the redundancy threshold
    Stuck,
    Released,
}

impl SegmentPhase {
    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: SegmentPhase) -> bool {
        use SegmentPhase::*;
        match (self, next) {
            (Released, _) => false,
            (_, Released) => true,
            (Created, RetrievingData) => true,
            (RetrievingData, Encoding) => true,
            (Encoding, Encrypting) => true,
            (Encrypting, Dispatched) => true,
            // Aborts and normal completion both land here
            (RetrievingData | Encoding | Encrypting | Dispatched, Completed | Stuck) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SegmentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentPhase::Created => write!(f, "Created"),
            SegmentPhase::RetrievingData => write!(f, "RetrievingData"),
            SegmentPhase::Encoding => write!(f, "Encoding"),
            SegmentPhase::Encrypting => write!(f, "Encrypting"),
            SegmentPhase::Dispatched => write!(f, "Dispatched"),
            SegmentPhase::Completed => write!(f, "Completed"),
            SegmentPhase::Stuck => write!(f, "Stuck"),
            SegmentPhase::Released => write!(f, "Released"),
        }
    }
}

// =============================================================================
// Predicates
// =============================================================================

/// Whether a finished attempt stored enough sectors to count as repaired.
pub fn repair_successful(total_sectors: usize, completed: usize, threshold: f64) -> bool {
    (1.0 - threshold) * total_sectors as f64 <= completed as f64
}

/// Whether too few sectors remain on hosts to skip fetching the data.
pub fn needs_download(
    completed: usize,
    min_sectors: usize,
    total_sectors: usize,
    threshold: f64,
) -> bool {
    let redundant = total_sectors.saturating_sub(min_sectors) as f64;
    let min_missing = (redundant * threshold) as usize;
    completed + min_missing < total_sectors
}

// =============================================================================
// Mutable State
// =============================================================================

/// Everything about a segment that changes while it is worked on.
pub struct SegmentState {
    pub phase: SegmentPhase,
    /// `true` once a sector is uploaded, being uploaded, or abandoned
    pub sector_slots: Vec<bool>,
    pub completed: usize,
    pub uploading: usize,
    pub released: bool,
    /// Workers that may still pick up a sector of this segment
    pub workers_remaining: usize,
    /// Ready workers held in reserve until a sector frees up
    pub backup_workers: Vec<Arc<Worker>>,
    /// Hosts not yet storing or uploading a sector of this segment
    pub unused_hosts: HashSet<HostId>,
    pub logical_data: Option<Vec<u8>>,
    /// One entry per sector; `None` once it is no longer needed
    pub physical_data: Vec<Option<Bytes>>,
    pub memory_released: u64,
}

impl SegmentState {
    pub fn total_sectors(&self) -> usize {
        self.sector_slots.len()
    }

    /// Fully stored, or every worker is done and nothing is in flight.
    pub fn is_upload_complete(&self) -> bool {
        if self.completed == self.total_sectors() && self.uploading == 0 {
            return true;
        }
        self.workers_remaining == 0 && self.uploading == 0
    }

    pub fn free_slots(&self) -> usize {
        self.sector_slots.iter().filter(|claimed| !**claimed).count()
    }

    /// Move to `next`, ignoring illegal transitions. Returns whether the
    /// phase changed.
    pub fn transition(&mut self, id: &SegmentId, next: SegmentPhase) -> bool {
        if !self.phase.can_transition_to(next) {
            debug!(segment = %id, from = %self.phase, to = %next, "ignoring phase transition");
            return false;
        }
        debug!(segment = %id, from = %self.phase, to = %next, "segment phase");
        self.phase = next;
        true
    }
}

// =============================================================================
// Unfinished Segment
// =============================================================================

/// A segment that still has sectors to place on hosts.
pub struct UnfinishedSegment {
    pub id: SegmentId,
    pub file: Arc<dyn FileEntry>,
    /// Byte offset of the segment within the file
    pub offset: u64,
    /// Segment length in bytes
    pub length: u64,
    pub sector_size: u64,
    pub min_sectors: usize,
    pub total_sectors: usize,
    pub memory_needed: u64,
    /// The file was marked stuck when this attempt started
    pub stuck: bool,
    /// This attempt was scheduled by the stuck-repair loop
    pub stuck_repair: bool,
    state: Mutex<SegmentState>,
}

impl std::fmt::Debug for UnfinishedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnfinishedSegment")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("min_sectors", &self.min_sectors)
            .field("total_sectors", &self.total_sectors)
            .field("stuck", &self.stuck)
            .finish()
    }
}

impl UnfinishedSegment {
    /// Build the segment at `index` of `file`.
    ///
    /// Sectors already stored on one of `online_hosts` start out claimed and
    /// completed; their hosts are not offered the segment again.
    pub fn new(
        file: Arc<dyn FileEntry>,
        index: u64,
        stuck_repair: bool,
        online_hosts: &HashSet<HostId>,
    ) -> Arc<Self> {
        let coder = file.erasure_coder();
        let min_sectors = coder.min_sectors();
        let total_sectors = coder.num_sectors();
        let sector_size = file.sector_size();
        let segment_size = sector_size * min_sectors as u64;

        let mut sector_slots = vec![false; total_sectors];
        let mut completed = 0;
        let mut used_hosts = HashSet::new();
        for (i, copies) in file
            .sector_locations(index)
            .iter()
            .enumerate()
            .take(total_sectors)
        {
            let mut stored = false;
            for location in copies {
                if online_hosts.contains(&location.host) {
                    used_hosts.insert(location.host.clone());
                    stored = true;
                }
            }
            if stored {
                sector_slots[i] = true;
                completed += 1;
            }
        }

        let unused_hosts = online_hosts.difference(&used_hosts).cloned().collect();

        Arc::new(Self {
            id: SegmentId::new(file.id(), index),
            offset: index * segment_size,
            length: segment_size,
            sector_size,
            min_sectors,
            total_sectors,
            memory_needed: sector_size * (min_sectors + total_sectors) as u64,
            stuck: file.is_stuck(index),
            stuck_repair,
            file,
            state: Mutex::new(SegmentState {
                phase: SegmentPhase::Created,
                sector_slots,
                completed,
                uploading: 0,
                released: false,
                workers_remaining: 0,
                backup_workers: Vec::new(),
                unused_hosts,
                logical_data: None,
                physical_data: vec![None; total_sectors],
                memory_released: 0,
            }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, SegmentState> {
        self.state.lock()
    }

    /// Memory for the erasure-coding pass, released once sectors exist.
    pub fn erasure_coding_memory(&self) -> u64 {
        self.sector_size * self.min_sectors as u64
    }

    pub fn phase(&self) -> SegmentPhase {
        self.state.lock().phase
    }

    pub fn completed(&self) -> usize {
        self.state.lock().completed
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}
