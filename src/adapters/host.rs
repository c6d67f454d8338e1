//! In-Memory Storage Host
//!
//! Implements the `HostSession` port against a map of sectors. Faults can
//! be injected to exercise the engine's failure paths: fail the next N
//! uploads, fail every upload, or take the host offline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::domain::ports::{HostId, HostSession, SectorRoot};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Faults {
    fail_next: u32,
    failing: bool,
    offline: bool,
}

/// Host storing sectors in memory.
#[derive(Debug)]
pub struct MemoryHost {
    id: HostId,
    sectors: DashMap<SectorRoot, Bytes>,
    latency: Duration,
    faults: Mutex<Faults>,
    uploads: AtomicU64,
    downloads: AtomicU64,
    rejected: AtomicU64,
}

impl MemoryHost {
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_latency(id, Duration::ZERO)
    }

    /// Host that takes `latency` to answer each request.
    pub fn with_latency(id: &str, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: HostId::from(id),
            sectors: DashMap::new(),
            latency,
            faults: Mutex::new(Faults::default()),
            uploads: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Reject the next `count` uploads.
    pub fn fail_next(&self, count: u32) {
        self.faults.lock().fail_next = count;
    }

    /// Reject every upload until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.faults.lock().failing = failing;
    }

    /// An offline host rejects uploads and downloads.
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    pub fn contains(&self, root: &SectorRoot) -> bool {
        self.sectors.contains_key(root)
    }

    /// Successful uploads.
    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Uploads refused by injected faults.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn check_upload(&self) -> Result<()> {
        let mut faults = self.faults.lock();
        if faults.offline {
            return Err(Error::HostUnavailable {
                host: self.id.to_string(),
            });
        }
        if faults.failing {
            return Err(self.upload_error("host refuses uploads"));
        }
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return Err(self.upload_error("injected failure"));
        }
        Ok(())
    }

    fn upload_error(&self, reason: &str) -> Error {
        Error::SectorUploadFailed {
            host: self.id.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl HostSession for MemoryHost {
    fn host_id(&self) -> &HostId {
        &self.id
    }

    async fn upload_sector(&self, data: Bytes) -> Result<SectorRoot> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Err(e) = self.check_upload() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let root = SectorRoot::of(&data);
        self.sectors.insert(root, data);
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(root)
    }

    async fn download_sector(&self, root: &SectorRoot) -> Result<Bytes> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.faults.lock().offline {
            return Err(Error::HostUnavailable {
                host: self.id.to_string(),
            });
        }

        let data = self
            .sectors
            .get(root)
            .map(|d| d.value().clone())
            .ok_or_else(|| Error::SectorNotFound {
                host: self.id.to_string(),
                root: root.to_string(),
            })?;
        self.downloads.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_upload_then_download() {
        let host = MemoryHost::new("h1");
        let root = host
            .upload_sector(Bytes::from_static(b"sector"))
            .await
            .unwrap();

        assert!(host.contains(&root));
        assert_eq!(host.download_sector(&root).await.unwrap(), "sector");
        assert_eq!(host.uploads(), 1);
        assert_eq!(host.downloads(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let host = MemoryHost::new("h1");
        host.fail_next(2);

        for _ in 0..2 {
            assert_matches!(
                host.upload_sector(Bytes::from_static(b"x")).await,
                Err(Error::SectorUploadFailed { .. })
            );
        }
        assert!(host.upload_sector(Bytes::from_static(b"x")).await.is_ok());
        assert_eq!(host.rejected(), 2);
    }

    #[tokio::test]
    async fn test_offline_host() {
        let host = MemoryHost::new("h1");
        let root = host
            .upload_sector(Bytes::from_static(b"y"))
            .await
            .unwrap();
        host.set_offline(true);

        assert_matches!(
            host.upload_sector(Bytes::from_static(b"y")).await,
            Err(Error::HostUnavailable { .. })
        );
        assert_matches!(
            host.download_sector(&root).await,
            Err(Error::HostUnavailable { .. })
        );
    }

    #[tokio::test]
    async fn test_missing_sector() {
        let host = MemoryHost::new("h1");
        assert_matches!(
            host.download_sector(&SectorRoot::of(b"nope")).await,
            Err(Error::SectorNotFound { .. })
        );
    }
}
