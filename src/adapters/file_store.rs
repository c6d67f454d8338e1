//! In-Memory File Store
//!
//! Implements the `FileStore` and `FileEntry` ports with metadata held in
//! memory: geometry, stuck flags per segment, sector locations and access
//! time. The plaintext itself stays wherever `local_path` points.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::adapters::{ChaChaCipher, ReedSolomonCoder};
use crate::domain::ports::{
    Cipher, ErasureCoder, FileEntry, FileId, FileSnapshot, FileStore, SectorLocation,
    StoragePath,
};
use crate::error::{Error, Result};

// =============================================================================
// File Entry
// =============================================================================

/// Metadata of one file. Every `open` hands out the same entry; opens and
/// closes are counted.
pub struct MemoryFileEntry {
    id: FileId,
    path: StoragePath,
    file_size: u64,
    sector_size: u64,
    coder: Arc<dyn ErasureCoder>,
    cipher: Arc<dyn Cipher>,
    local_path: RwLock<Option<PathBuf>>,
    stuck: RwLock<HashSet<u64>>,
    /// `sectors[segment][sector]` lists every stored copy
    sectors: RwLock<Vec<Vec<Vec<SectorLocation>>>>,
    access_time: RwLock<Option<DateTime<Utc>>>,
    opens: AtomicU64,
    closes: AtomicU64,
}

impl std::fmt::Debug for MemoryFileEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFileEntry")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("sector_size", &self.sector_size)
            .finish()
    }
}

impl MemoryFileEntry {
    pub fn builder(path: impl Into<String>) -> MemoryFileEntryBuilder {
        MemoryFileEntryBuilder {
            path: StoragePath::new(path),
            file_size: 0,
            sector_size: 4096,
            min_sectors: 4,
            num_sectors: 6,
            local_path: None,
            coder: None,
            cipher: None,
        }
    }

    pub fn set_local_path(&self, path: Option<PathBuf>) {
        *self.local_path.write() = path;
    }

    pub fn access_time(&self) -> Option<DateTime<Utc>> {
        *self.access_time.read()
    }

    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    /// Segments currently flagged stuck, in ascending order.
    pub fn stuck_segments(&self) -> Vec<u64> {
        let mut stuck: Vec<u64> = self.stuck.read().iter().copied().collect();
        stuck.sort_unstable();
        stuck
    }

    /// Number of sectors of `segment` with at least one stored copy.
    pub fn stored_sectors(&self, segment: u64) -> usize {
        self.sectors
            .read()
            .get(segment as usize)
            .map(|sectors| sectors.iter().filter(|copies| !copies.is_empty()).count())
            .unwrap_or(0)
    }

    fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }
}

impl FileEntry for MemoryFileEntry {
    fn id(&self) -> FileId {
        self.id
    }

    fn path(&self) -> StoragePath {
        self.path.clone()
    }

    fn local_path(&self) -> Option<PathBuf> {
        self.local_path.read().clone()
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn sector_size(&self) -> u64 {
        self.sector_size
    }

    fn erasure_coder(&self) -> Arc<dyn ErasureCoder> {
        Arc::clone(&self.coder)
    }

    fn cipher(&self) -> Arc<dyn Cipher> {
        Arc::clone(&self.cipher)
    }

    fn is_stuck(&self, segment: u64) -> bool {
        self.stuck.read().contains(&segment)
    }

    fn set_stuck(&self, segment: u64, stuck: bool) -> Result<()> {
        if segment >= self.num_segments() {
            return Err(Error::FileStore(format!(
                "segment {} out of range for {}",
                segment, self.path
            )));
        }
        let mut flags = self.stuck.write();
        if stuck {
            flags.insert(segment);
        } else {
            flags.remove(&segment);
        }
        Ok(())
    }

    fn sector_locations(&self, segment: u64) -> Vec<Vec<SectorLocation>> {
        self.sectors
            .read()
            .get(segment as usize)
            .cloned()
            .unwrap_or_else(|| vec![Vec::new(); self.coder.num_sectors()])
    }

    fn add_sector(&self, segment: u64, sector: usize, location: SectorLocation) -> Result<()> {
        if segment >= self.num_segments() || sector >= self.coder.num_sectors() {
            return Err(Error::FileStore(format!(
                "sector {}/{} out of range for {}",
                segment, sector, self.path
            )));
        }
        let mut sectors = self.sectors.write();
        let copies = &mut sectors[segment as usize][sector];
        if !copies.contains(&location) {
            copies.push(location);
        }
        Ok(())
    }

    fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            id: self.id,
            path: self.path.clone(),
            file_size: self.file_size,
            sector_size: self.sector_size,
            coder: Arc::clone(&self.coder),
            cipher: Arc::clone(&self.cipher),
            sectors: self.sectors.read().clone(),
        }
    }

    fn set_access_time(&self, at: DateTime<Utc>) -> Result<()> {
        *self.access_time.write() = Some(at);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Builder for [`MemoryFileEntry`].
#[derive(Clone)]
pub struct MemoryFileEntryBuilder {
    path: StoragePath,
    file_size: u64,
    sector_size: u64,
    min_sectors: usize,
    num_sectors: usize,
    local_path: Option<PathBuf>,
    coder: Option<Arc<dyn ErasureCoder>>,
    cipher: Option<Arc<dyn Cipher>>,
}

impl std::fmt::Debug for MemoryFileEntryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFileEntryBuilder")
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("sector_size", &self.sector_size)
            .field("min_sectors", &self.min_sectors)
            .field("num_sectors", &self.num_sectors)
            .field("custom_coder", &self.coder.is_some())
            .field("custom_cipher", &self.cipher.is_some())
            .finish()
    }
}

impl MemoryFileEntryBuilder {
    pub fn file_size(mut self, bytes: u64) -> Self {
        self.file_size = bytes;
        self
    }

    pub fn sector_size(mut self, bytes: u64) -> Self {
        self.sector_size = bytes;
        self
    }

    /// Reed-Solomon geometry. Ignored when [`Self::coder`] is set.
    pub fn erasure(mut self, min_sectors: usize, num_sectors: usize) -> Self {
        self.min_sectors = min_sectors;
        self.num_sectors = num_sectors;
        self
    }

    /// Use `coder` instead of a Reed-Solomon coder; the geometry is taken
    /// from it.
    pub fn coder(mut self, coder: Arc<dyn ErasureCoder>) -> Self {
        self.coder = Some(coder);
        self
    }

    pub fn local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    /// Seal sectors with `cipher`; a fresh ChaCha20-Poly1305 key otherwise.
    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn build(self) -> Result<Arc<MemoryFileEntry>> {
        if self.sector_size == 0 {
            return Err(Error::FileStore("sector size must be greater than 0".to_string()));
        }
        let coder: Arc<dyn ErasureCoder> = match self.coder {
            Some(coder) => coder,
            None => Arc::new(ReedSolomonCoder::new(self.min_sectors, self.num_sectors)?),
        };
        if coder.min_sectors() == 0 {
            return Err(Error::FileStore("erasure coder needs at least one data sector".to_string()));
        }
        let cipher: Arc<dyn Cipher> = match self.cipher {
            Some(cipher) => cipher,
            None => Arc::new(ChaChaCipher::generate()),
        };
        let num_sectors = coder.num_sectors();
        let segment_size = self.sector_size * coder.min_sectors() as u64;
        let num_segments = self.file_size.div_ceil(segment_size).max(1) as usize;

        Ok(Arc::new(MemoryFileEntry {
            id: FileId::new(),
            path: self.path,
            file_size: self.file_size,
            sector_size: self.sector_size,
            coder,
            cipher,
            local_path: RwLock::new(self.local_path),
            stuck: RwLock::new(HashSet::new()),
            sectors: RwLock::new(vec![vec![Vec::new(); num_sectors]; num_segments]),
            access_time: RwLock::new(None),
            opens: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        }))
    }
}

// =============================================================================
// File Store
// =============================================================================

/// File store keeping all metadata in memory.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: DashMap<StoragePath, Arc<MemoryFileEntry>>,
    /// Metadata refreshes per directory
    dir_updates: DashMap<StoragePath, u64>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file. Fails if the path is taken.
    pub fn insert(&self, entry: Arc<MemoryFileEntry>) -> Result<Arc<MemoryFileEntry>> {
        match self.files.entry(entry.path.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::FileStore(format!(
                "{} already exists",
                entry.path
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
                Ok(entry)
            }
        }
    }

    /// Build and register a file in one step.
    pub fn create_file(
        &self,
        path: &str,
        file_size: u64,
        sector_size: u64,
        min_sectors: usize,
        num_sectors: usize,
        local_path: Option<PathBuf>,
    ) -> Result<Arc<MemoryFileEntry>> {
        let mut builder = MemoryFileEntry::builder(path)
            .file_size(file_size)
            .sector_size(sector_size)
            .erasure(min_sectors, num_sectors);
        if let Some(local) = local_path {
            builder = builder.local_path(local);
        }
        self.insert(builder.build()?)
    }

    pub fn get(&self, path: &StoragePath) -> Option<Arc<MemoryFileEntry>> {
        self.files.get(path).map(|e| Arc::clone(e.value()))
    }

    /// How often metadata of `dir` was refreshed.
    pub fn dir_updates(&self, dir: &StoragePath) -> u64 {
        self.dir_updates.get(dir).map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn open(&self, path: &StoragePath) -> Result<Arc<dyn FileEntry>> {
        let entry = self
            .get(path)
            .ok_or_else(|| Error::FileNotFound(path.to_string()))?;
        entry.record_open();
        Ok(entry as Arc<dyn FileEntry>)
    }

    async fn update_dir_metadata(&self, path: &StoragePath) -> Result<()> {
        if !self.files.contains_key(path) {
            return Err(Error::FileNotFound(path.to_string()));
        }
        let mut dir = path.parent();
        while let Some(current) = dir {
            *self.dir_updates.entry(current.clone()).or_insert(0) += 1;
            dir = current.parent();
        }
        debug!(path = %path, "directory metadata updated");
        Ok(())
    }
}
