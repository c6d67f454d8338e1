//! Upload Heap
//!
//! Tracks every segment the engine knows about, in one of three places:
//!
//! - **queued**: waiting for memory and a lifecycle slot, ordered by urgency
//! - **claimed**: popped by the driver, not yet dispatched
//! - **pending**: dispatched to workers and not yet cleaned up
//!
//! A segment id is in at most one of these at a time, and `push` refuses an
//! id that is already tracked. The heap also owns the channel on which
//! successful stuck repairs are reported.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::ports::StoragePath;
use crate::upload::segment::{SegmentId, UnfinishedSegment};

struct QueuedSegment {
    stuck: bool,
    completed: usize,
    seq: u64,
    segment: Arc<UnfinishedSegment>,
}

impl PartialEq for QueuedSegment {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedSegment {}

impl PartialOrd for QueuedSegment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedSegment {
    /// Greatest is most urgent: stuck first, then least complete, then
    /// oldest.
    fn cmp(&self, other: &Self) -> Ordering {
        self.stuck
            .cmp(&other.stuck)
            .then_with(|| other.completed.cmp(&self.completed))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct HeapState {
    queue: BinaryHeap<QueuedSegment>,
    queued: HashSet<SegmentId>,
    claimed: HashSet<SegmentId>,
    pending: HashSet<SegmentId>,
    next_seq: u64,
}

impl HeapState {
    fn tracks(&self, id: &SegmentId) -> bool {
        self.queued.contains(id) || self.claimed.contains(id) || self.pending.contains(id)
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.claimed.is_empty() && self.pending.is_empty()
    }
}

/// Priority queue and pending set of segments.
pub struct UploadHeap {
    state: Mutex<HeapState>,
    pushed: Notify,
    idle: Notify,
    stuck_success_tx: mpsc::Sender<StoragePath>,
    stuck_success_rx: Mutex<Option<mpsc::Receiver<StoragePath>>>,
}

impl std::fmt::Debug for UploadHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UploadHeap")
            .field("queued", &state.queued.len())
            .field("claimed", &state.claimed.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl UploadHeap {
    pub fn new(stuck_success_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(stuck_success_capacity.max(1));
        Self {
            state: Mutex::new(HeapState::default()),
            pushed: Notify::new(),
            idle: Notify::new(),
            stuck_success_tx: tx,
            stuck_success_rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue a segment. Returns false if it is already queued, claimed or
    /// pending.
    pub fn push(&self, segment: Arc<UnfinishedSegment>) -> bool {
        let mut state = self.state.lock();
        if state.tracks(&segment.id) {
            debug!(segment = %segment.id, "segment already tracked, not queueing");
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queued.insert(segment.id);
        state.queue.push(QueuedSegment {
            stuck: segment.stuck,
            completed: segment.completed(),
            seq,
            segment,
        });
        drop(state);
        self.pushed.notify_one();
        true
    }

    /// Take the most urgent segment. It stays claimed until it is either
    /// dispatched or handed back through [`UploadHeap::release_claim`].
    pub fn pop(&self) -> Option<Arc<UnfinishedSegment>> {
        let mut state = self.state.lock();
        let next = state.queue.pop()?;
        state.queued.remove(&next.segment.id);
        state.claimed.insert(next.segment.id);
        Some(next.segment)
    }

    /// Pop, waiting for a push if the queue is empty. Returns `None` once
    /// `stop` fires.
    pub async fn pop_wait(&self, stop: &CancellationToken) -> Option<Arc<UnfinishedSegment>> {
        loop {
            if stop.is_cancelled() {
                return None;
            }
            if let Some(segment) = self.pop() {
                return Some(segment);
            }
            tokio::select! {
                _ = self.pushed.notified() => {}
                _ = stop.cancelled() => return None,
            }
        }
    }

    /// Register a segment as pending. Idempotent: returns false if it was
    /// already pending.
    pub fn add_pending(&self, id: SegmentId) -> bool {
        let mut state = self.state.lock();
        state.claimed.remove(&id);
        state.pending.insert(id)
    }

    /// Remove a segment from the pending set. Returns false if it was not
    /// there.
    pub fn remove_pending(&self, id: &SegmentId) -> bool {
        let mut state = self.state.lock();
        let removed = state.pending.remove(id);
        // Segments aborted before dispatch never left the claimed set
        let unclaimed = state.claimed.remove(id);
        let idle = state.is_idle();
        drop(state);
        if idle {
            self.idle.notify_waiters();
        }
        removed || unclaimed
    }

    /// Give up a claim without dispatching.
    pub fn release_claim(&self, id: &SegmentId) {
        let mut state = self.state.lock();
        state.claimed.remove(id);
        let idle = state.is_idle();
        drop(state);
        if idle {
            self.idle.notify_waiters();
        }
    }

    pub fn is_pending(&self, id: &SegmentId) -> bool {
        self.state.lock().pending.contains(id)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of queued segments.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Nothing queued, claimed or pending.
    pub fn is_idle(&self) -> bool {
        self.state.lock().is_idle()
    }

    /// Wait until the heap is idle.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Sender side of the stuck-repair success channel.
    pub fn stuck_success_sender(&self) -> mpsc::Sender<StoragePath> {
        self.stuck_success_tx.clone()
    }

    /// Receiver of paths whose stuck segments were repaired. Can be taken
    /// once.
    pub fn take_stuck_success_receiver(&self) -> Option<mpsc::Receiver<StoragePath>> {
        self.stuck_success_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryFileEntry;
    use crate::domain::ports::{FileEntry, HostId};
    use std::time::Duration;

    fn segment(path: &str, index: u64, stuck: bool) -> Arc<UnfinishedSegment> {
        let file = MemoryFileEntry::builder(path)
            .file_size(1 << 16)
            .sector_size(64)
            .erasure(2, 4)
            .build()
            .unwrap();
        file.set_stuck(index, stuck).unwrap();
        let hosts: HashSet<HostId> = HashSet::new();
        UnfinishedSegment::new(file, index, false, &hosts)
    }

    #[test]
    fn test_push_refuses_duplicates() {
        let heap = UploadHeap::new(4);
        let seg = segment("a", 0, false);

        assert!(heap.push(seg.clone()));
        assert!(!heap.push(seg.clone()));
        assert_eq!(heap.len(), 1);

        let popped = heap.pop().unwrap();
        assert_eq!(popped.id, seg.id);
        // Claimed segments are still tracked
        assert!(!heap.push(seg.clone()));

        assert!(heap.add_pending(seg.id));
        assert!(!heap.add_pending(seg.id));
        assert!(!heap.push(seg.clone()));

        assert!(heap.remove_pending(&seg.id));
        assert!(!heap.remove_pending(&seg.id));
        assert!(heap.push(seg));
    }

    #[test]
    fn test_stuck_segments_pop_first() {
        let heap = UploadHeap::new(4);
        let healthy = segment("a", 0, false);
        let stuck = segment("b", 1, true);

        heap.push(healthy.clone());
        heap.push(stuck.clone());

        assert_eq!(heap.pop().unwrap().id, stuck.id);
        assert_eq!(heap.pop().unwrap().id, healthy.id);
        assert!(heap.pop().is_none());
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let heap = UploadHeap::new(4);
        let first = segment("a", 0, false);
        let second = segment("a", 1, false);
        heap.push(first.clone());
        heap.push(second.clone());

        assert_eq!(heap.pop().unwrap().id, first.id);
        assert_eq!(heap.pop().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_wait_idle_after_cleanup() {
        let heap = Arc::new(UploadHeap::new(4));
        let seg = segment("a", 0, false);
        heap.push(seg.clone());
        let popped = heap.pop().unwrap();
        heap.add_pending(popped.id);

        let waiter = {
            let heap = heap.clone();
            tokio::spawn(async move { heap.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        heap.remove_pending(&seg.id);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pop_wait_observes_stop() {
        let heap = Arc::new(UploadHeap::new(4));
        let stop = CancellationToken::new();

        let waiter = {
            let (heap, stop) = (heap.clone(), stop.clone());
            tokio::spawn(async move { heap.pop_wait(&stop).await })
        };
        stop.cancel();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_wait_wakes_on_push() {
        let heap = Arc::new(UploadHeap::new(4));
        let stop = CancellationToken::new();

        let waiter = {
            let (heap, stop) = (heap.clone(), stop.clone());
            tokio::spawn(async move { heap.pop_wait(&stop).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let seg = segment("a", 3, false);
        heap.push(seg.clone());

        assert_eq!(waiter.await.unwrap().unwrap().id, seg.id);
    }

    #[test]
    fn test_stuck_success_receiver_taken_once() {
        let heap = UploadHeap::new(4);
        assert!(heap.take_stuck_success_receiver().is_some());
        assert!(heap.take_stuck_success_receiver().is_none());
    }
}
