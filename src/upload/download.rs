//! Download handles used by the repair path
//!
//! When a segment's local copy is missing, the lifecycle controller asks the
//! download subsystem to rebuild the plaintext from the sectors already on
//! hosts. This module holds the request parameters, the destination buffer
//! and the completion handle shared between both sides.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::domain::ports::FileSnapshot;
use crate::error::{Error, Result};

/// In-memory destination of a download.
#[derive(Debug, Clone, Default)]
pub struct DownloadBuffer {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl DownloadBuffer {
    /// Create a zeroed buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            buf: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    /// Copy `data` into the buffer at `offset`, growing it if needed.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let mut buf = self.buf.lock();
        let end = offset + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    /// Take the contents, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buf.lock())
    }

    /// Drop the contents.
    pub fn clear(&self) {
        *self.buf.lock() = Vec::new();
    }
}

/// Parameters of a download request.
#[derive(Debug, Clone)]
pub struct DownloadParams {
    pub destination: DownloadBuffer,
    pub file: FileSnapshot,
    /// Offset within the file
    pub offset: u64,
    pub length: u64,
    /// Higher runs sooner; repair downloads use 0
    pub priority: u64,
    pub latency_target: Duration,
    /// Extra sectors fetched in parallel to cut tail latency
    pub overdrive: usize,
    /// Whether the downloader must reserve its own memory
    pub needs_memory: bool,
}

type CompletionCallback = Box<dyn FnOnce(Option<&Error>) -> Result<()> + Send>;

struct DownloadState {
    err: Option<String>,
    callbacks: Vec<CompletionCallback>,
}

/// Completion handle of a queued download.
pub struct Download {
    destination: DownloadBuffer,
    offset: u64,
    length: u64,
    state: Mutex<DownloadState>,
    done: watch::Sender<bool>,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl Download {
    pub fn new(params: &DownloadParams) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            destination: params.destination.clone(),
            offset: params.offset,
            length: params.length,
            state: Mutex::new(DownloadState {
                err: None,
                callbacks: Vec::new(),
            }),
            done,
        })
    }

    pub fn destination(&self) -> &DownloadBuffer {
        &self.destination
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_complete(&self) -> bool {
        *self.done.borrow()
    }

    /// Register a callback run once the download completes. Runs at once if
    /// the download has already completed.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Option<&Error>) -> Result<()> + Send + 'static,
    {
        let mut state = self.state.lock();
        if !self.is_complete() {
            state.callbacks.push(Box::new(f));
            return;
        }
        drop(state);
        if let Err(e) = f(self.err().as_ref()) {
            debug!("download completion callback failed: {}", e);
        }
    }

    /// Mark the download finished. Only the first call has any effect.
    pub fn complete(&self, err: Option<Error>) {
        let callbacks = {
            let mut state = self.state.lock();
            if self.is_complete() {
                return;
            }
            state.err = err.map(|e| e.to_string());
            self.done.send_replace(true);
            std::mem::take(&mut state.callbacks)
        };

        let err = self.err();
        for callback in callbacks {
            if let Err(e) = callback(err.as_ref()) {
                debug!("download completion callback failed: {}", e);
            }
        }
    }

    /// Wait until the download completes.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Failure of a completed download.
    pub fn err(&self) -> Option<Error> {
        self.state
            .lock()
            .err
            .clone()
            .map(Error::DownloadFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ChaChaCipher, ReedSolomonCoder};
    use crate::domain::ports::{FileId, StoragePath};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params() -> DownloadParams {
        DownloadParams {
            destination: DownloadBuffer::new(8),
            file: FileSnapshot {
                id: FileId::new(),
                path: StoragePath::new("a/b"),
                file_size: 8,
                sector_size: 2,
                coder: Arc::new(ReedSolomonCoder::new(4, 6).unwrap()),
                cipher: Arc::new(ChaChaCipher::generate()),
                sectors: vec![],
            },
            offset: 0,
            length: 8,
            priority: 0,
            latency_target: Duration::from_millis(200),
            overdrive: 0,
            needs_memory: false,
        }
    }

    #[test]
    fn test_buffer_write_and_take() {
        let buf = DownloadBuffer::new(4);
        buf.write_at(2, b"xyz");
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.take(), vec![0, 0, b'x', b'y', b'z']);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_wait_resolves_on_complete() {
        let download = Download::new(&params());
        let waiter = {
            let download = download.clone();
            tokio::spawn(async move { download.wait().await })
        };

        download.complete(None);
        waiter.await.unwrap();
        assert!(download.is_complete());
        assert!(download.err().is_none());
    }

    #[test]
    fn test_callbacks_run_exactly_once() {
        let download = Download::new(&params());
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        download.on_complete(move |err| {
            assert!(err.is_some());
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        download.complete(Some(Error::HostUnavailable {
            host: "h1".to_string(),
        }));
        download.complete(None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(download.err().is_some());

        // Late registration runs immediately
        let c = calls.clone();
        download.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
