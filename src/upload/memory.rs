//! Memory Manager
//!
//! Bounded byte budget shared by every in-flight segment. Requests are
//! served strictly in arrival order: a request that does not fit blocks every
//! request behind it, so large segments cannot be starved by a stream of
//! small ones.
//!
//! # Invariants
//!
//! - Outstanding bytes never exceed the configured limit.
//! - A grant is handed out at most once. If the requesting future is
//!   cancelled or dropped after the grant was made, the bytes are returned.
//! - Returning more than is outstanding is logged and clamped, never applied.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

struct Waiter {
    id: u64,
    bytes: u64,
    grant: oneshot::Sender<()>,
}

struct MemoryState {
    available: u64,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
}

impl MemoryState {
    /// Hand out memory to the head of the queue while it fits.
    fn grant_waiters(&mut self) {
        while let Some(front) = self.waiters.front() {
            if front.bytes > self.available {
                break;
            }
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.available -= waiter.bytes;
            if waiter.grant.send(()).is_err() {
                // Receiver already gone
                self.available += waiter.bytes;
            }
        }
    }
}

/// Process-wide memory budget for segment work.
pub struct MemoryManager {
    limit: u64,
    state: Mutex<MemoryState>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryManager")
            .field("limit", &self.limit)
            .field("available", &state.available)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl MemoryManager {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            state: Mutex::new(MemoryState {
                available: limit,
                next_waiter_id: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn available(&self) -> u64 {
        self.state.lock().available
    }

    /// Bytes currently granted and not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.limit - self.available()
    }

    /// Number of blocked requests.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Grant `bytes` without waiting. Fails if the request would have to
    /// queue.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        let mut state = self.state.lock();
        if state.waiters.is_empty() && state.available >= bytes {
            state.available -= bytes;
            return true;
        }
        false
    }

    /// Acquire `bytes`, waiting until the budget allows it.
    ///
    /// Returns [`Error::Interrupted`] if `cancel` fires first and
    /// [`Error::MemoryRequestTooLarge`] if the request can never fit.
    pub async fn acquire(&self, bytes: u64, cancel: &CancellationToken) -> Result<()> {
        if bytes > self.limit {
            return Err(Error::MemoryRequestTooLarge {
                requested: bytes,
                limit: self.limit,
            });
        }

        let mut pending = {
            let mut state = self.state.lock();
            if state.waiters.is_empty() && state.available >= bytes {
                state.available -= bytes;
                return Ok(());
            }

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id,
                bytes,
                grant: tx,
            });
            debug!(bytes, queued = state.waiters.len(), "memory request queued");

            PendingGrant {
                manager: self,
                id,
                bytes,
                rx,
                settled: false,
            }
        };

        tokio::select! {
            biased;
            granted = &mut pending.rx => {
                pending.settled = true;
                granted.map_err(|_| Error::Internal("memory waiter dropped without a grant".to_string()))
            }
            _ = cancel.cancelled() => {
                Err(Error::Interrupted("memory acquisition cancelled".to_string()))
            }
        }
    }

    /// Give `bytes` back to the budget and wake queued requests.
    pub fn return_memory(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock();
        let outstanding = self.limit - state.available;
        let bytes = if bytes > outstanding {
            warn!(
                returned = bytes,
                outstanding, "returning more memory than was granted; clamping"
            );
            outstanding
        } else {
            bytes
        };
        state.available += bytes;
        state.grant_waiters();
    }

    /// Remove a queued waiter. Returns false if it already left the queue.
    fn withdraw(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        match state.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                state.waiters.remove(pos);
                // The head may have been the only thing blocking the rest
                state.grant_waiters();
                true
            }
            None => false,
        }
    }
}

/// Queue slot of a blocked request. Dropping it unsettled withdraws the
/// request, or hands the memory back if the grant raced the drop.
struct PendingGrant<'a> {
    manager: &'a MemoryManager,
    id: u64,
    bytes: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if !self.manager.withdraw(self.id) && self.rx.try_recv().is_ok() {
            self.manager.return_memory(self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_return() {
        let mm = MemoryManager::new(100);
        let cancel = CancellationToken::new();

        mm.acquire(60, &cancel).await.unwrap();
        assert_eq!(mm.available(), 40);
        assert_eq!(mm.outstanding(), 60);

        mm.return_memory(60);
        assert_eq!(mm.available(), 100);
    }

    #[tokio::test]
    async fn test_too_large_request_rejected() {
        let mm = MemoryManager::new(100);
        let result = mm.acquire(101, &CancellationToken::new()).await;
        assert_matches!(
            result,
            Err(Error::MemoryRequestTooLarge {
                requested: 101,
                limit: 100
            })
        );
        assert_eq!(mm.available(), 100);
    }

    #[tokio::test]
    async fn test_blocked_request_resumes_on_return() {
        let mm = Arc::new(MemoryManager::new(100));
        let cancel = CancellationToken::new();
        mm.acquire(80, &cancel).await.unwrap();

        let waiter = {
            let mm = mm.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { mm.acquire(50, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mm.waiting(), 1);
        assert!(!waiter.is_finished());

        mm.return_memory(80);
        waiter.await.unwrap().unwrap();
        assert_eq!(mm.available(), 50);
        assert_eq!(mm.waiting(), 0);
    }

    #[tokio::test]
    async fn test_waiters_served_in_arrival_order() {
        let mm = Arc::new(MemoryManager::new(100));
        let cancel = CancellationToken::new();
        mm.acquire(100, &cancel).await.unwrap();

        let big = {
            let (mm, cancel) = (mm.clone(), cancel.clone());
            tokio::spawn(async move { mm.acquire(90, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let small = {
            let (mm, cancel) = (mm.clone(), cancel.clone());
            tokio::spawn(async move { mm.acquire(10, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // 20 bytes would fit the small request, but the big one is first
        mm.return_memory(20);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!small.is_finished());
        assert!(!mm.try_acquire(1));

        mm.return_memory(80);
        big.await.unwrap().unwrap();
        small.await.unwrap().unwrap();
        assert_eq!(mm.available(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let mm = Arc::new(MemoryManager::new(100));
        let cancel = CancellationToken::new();
        mm.acquire(100, &cancel).await.unwrap();

        let waiter = {
            let (mm, cancel) = (mm.clone(), cancel.clone());
            tokio::spawn(async move { mm.acquire(10, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        cancel.cancel();
        assert_matches!(waiter.await.unwrap(), Err(Error::Interrupted(_)));
        assert_eq!(mm.waiting(), 0);

        mm.return_memory(100);
        assert_eq!(mm.available(), 100);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak() {
        let mm = Arc::new(MemoryManager::new(100));
        let cancel = CancellationToken::new();
        mm.acquire(100, &cancel).await.unwrap();

        let waiter = {
            let (mm, cancel) = (mm.clone(), cancel.clone());
            tokio::spawn(async move { mm.acquire(40, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        mm.return_memory(100);
        assert_eq!(mm.available(), 100);
        assert_eq!(mm.waiting(), 0);
    }

    #[test]
    fn test_queued_acquire_woken_by_return() {
        use tokio_test::{assert_pending, assert_ready_ok, task};

        let mm = MemoryManager::new(100);
        let cancel = CancellationToken::new();
        assert!(mm.try_acquire(100));

        let mut acquire = task::spawn(mm.acquire(40, &cancel));
        assert_pending!(acquire.poll());
        assert_eq!(mm.waiting(), 1);

        mm.return_memory(50);
        assert!(acquire.is_woken());
        assert_ready_ok!(acquire.poll());
        assert_eq!(mm.available(), 10);
    }

    #[test]
    fn test_over_return_is_clamped() {
        let mm = MemoryManager::new(100);
        assert!(mm.try_acquire(30));

        mm.return_memory(50);
        assert_eq!(mm.available(), 100);
        assert_eq!(mm.outstanding(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(u64),
        Return(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..=64).prop_map(Op::Acquire),
            (0usize..16).prop_map(Op::Return),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Outstanding bytes always equal the sum of live grants and never
        /// exceed the limit.
        #[test]
        fn prop_memory_conservation(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let limit = 128;
            let mm = MemoryManager::new(limit);
            let mut held: Vec<u64> = Vec::new();

            for op in ops {
                match op {
                    Op::Acquire(bytes) => {
                        if mm.try_acquire(bytes) {
                            held.push(bytes);
                        }
                    }
                    Op::Return(idx) => {
                        if !held.is_empty() {
                            let bytes = held.swap_remove(idx % held.len());
                            mm.return_memory(bytes);
                        }
                    }
                }
                let sum: u64 = held.iter().sum();
                prop_assert!(mm.outstanding() <= limit);
                prop_assert_eq!(mm.outstanding(), sum);
            }

            for bytes in held.drain(..) {
                mm.return_memory(bytes);
            }
            prop_assert_eq!(mm.available(), limit);
        }
    }
}
