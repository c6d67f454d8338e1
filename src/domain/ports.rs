//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the collaborators the upload engine depends on. The
//! engine only ever talks to them through these traits; concrete adapters
//! live in [`crate::adapters`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Upload Engine                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  FileStore │ FileEntry │ ErasureCoder │ Cipher      │    │
//! │  │  HostSession │ Downloader                           │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Adapters (Impls)                        │
//! │  ReedSolomonCoder │ ChaChaCipher │ MemoryFileStore          │
//! │  MemoryHost │ HostDownloader                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Result;
use crate::upload::download::{Download, DownloadParams};

// =============================================================================
// Value Objects
// =============================================================================

/// Identifier of a file tracked by the file store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Path of a file inside the storage namespace (not a local path).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoragePath(String);

impl StoragePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parent directory, or `None` at the root.
    pub fn parent(&self) -> Option<StoragePath> {
        let trimmed = self.0.trim_end_matches('/');
        trimmed
            .rfind('/')
            .map(|idx| StoragePath(trimmed[..idx].to_string()))
    }
}

impl std::fmt::Display for StoragePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StoragePath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a storage host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Content address of a stored sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorRoot(pub [u8; 32]);

impl SectorRoot {
    /// Root of the given sector contents.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl std::fmt::Display for SectorRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Where one copy of a sector lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorLocation {
    pub host: HostId,
    pub root: SectorRoot,
}

/// Point-in-time view of a file used by downloads.
#[derive(Clone)]
pub struct FileSnapshot {
    pub id: FileId,
    pub path: StoragePath,
    pub file_size: u64,
    pub sector_size: u64,
    pub coder: Arc<dyn ErasureCoder>,
    pub cipher: Arc<dyn Cipher>,
    /// `sectors[segment][sector]` lists every known copy of that sector
    pub sectors: Vec<Vec<Vec<SectorLocation>>>,
}

impl FileSnapshot {
    /// Bytes of plaintext covered by one segment.
    pub fn segment_size(&self) -> u64 {
        self.sector_size * self.coder.min_sectors() as u64
    }
}

impl std::fmt::Debug for FileSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSnapshot")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("sector_size", &self.sector_size)
            .field("segments", &self.sectors.len())
            .finish()
    }
}

// =============================================================================
// Erasure Coding Port
// =============================================================================

/// Port for erasure coding a segment into sectors.
pub trait ErasureCoder: Send + Sync {
    /// Sectors needed to recover a segment.
    fn min_sectors(&self) -> usize;

    /// Sectors produced per segment (minimum + redundancy).
    fn num_sectors(&self) -> usize;

    /// Encode a segment into `num_sectors()` equally sized sectors.
    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Recover the first `out_len` bytes of a segment from any
    /// `min_sectors()` of its sectors.
    fn recover(&self, sectors: &mut [Option<Vec<u8>>], out_len: usize) -> Result<Vec<u8>>;
}

// =============================================================================
// Cipher Port
// =============================================================================

/// Port for sector encryption.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

// =============================================================================
// Host Port
// =============================================================================

/// Port for the connection to one storage host.
///
/// Contract formation and the wire protocol sit behind this trait.
#[async_trait]
pub trait HostSession: Send + Sync {
    fn host_id(&self) -> &HostId;

    /// Store one sector on the host.
    async fn upload_sector(&self, data: Bytes) -> Result<SectorRoot>;

    /// Fetch a previously stored sector.
    async fn download_sector(&self, root: &SectorRoot) -> Result<Bytes>;
}

// =============================================================================
// File Store Port
// =============================================================================

/// Port for an open file. The upload engine holds one handle per segment
/// and closes it when the segment is released.
pub trait FileEntry: Send + Sync {
    fn id(&self) -> FileId;

    fn path(&self) -> StoragePath;

    /// Location of the local copy, if one is known.
    fn local_path(&self) -> Option<PathBuf>;

    fn file_size(&self) -> u64;

    fn sector_size(&self) -> u64;

    fn erasure_coder(&self) -> Arc<dyn ErasureCoder>;

    fn cipher(&self) -> Arc<dyn Cipher>;

    /// Bytes of plaintext covered by one segment.
    fn segment_size(&self) -> u64 {
        self.sector_size() * self.erasure_coder().min_sectors() as u64
    }

    fn num_segments(&self) -> u64 {
        let segment_size = self.segment_size();
        if segment_size == 0 {
            return 0;
        }
        self.file_size().div_ceil(segment_size).max(1)
    }

    fn is_stuck(&self, segment: u64) -> bool;

    fn set_stuck(&self, segment: u64, stuck: bool) -> Result<()>;

    /// Known locations of each sector of a segment.
    fn sector_locations(&self, segment: u64) -> Vec<Vec<SectorLocation>>;

    /// Record that a sector has been stored on a host.
    fn add_sector(&self, segment: u64, sector: usize, location: SectorLocation) -> Result<()>;

    fn snapshot(&self) -> FileSnapshot;

    fn set_access_time(&self, at: DateTime<Utc>) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Port for the file store that owns file metadata.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Open a handle to a file.
    async fn open(&self, path: &StoragePath) -> Result<Arc<dyn FileEntry>>;

    /// Recompute aggregated metadata of the directories above `path`.
    async fn update_dir_metadata(&self, path: &StoragePath) -> Result<()>;
}

// =============================================================================
// Download Port
// =============================================================================

/// Port for the download subsystem.
pub trait Downloader: Send + Sync {
    /// Queue a download. The returned handle completes when the destination
    /// buffer is filled or the download fails.
    fn request_download(&self, params: DownloadParams) -> Result<Arc<Download>>;
}

// =============================================================================
// Tests
// =============================================================================
