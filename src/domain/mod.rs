//! Domain Layer
//!
//! Collaborator ports and the value objects that cross them.
//!
//! # Usage
//!
//! ```ignore
//! use sectorcast::domain::ports::{FileStore, HostSession};
//!
//! async fn first_segment_size(store: &dyn FileStore, path: &StoragePath) -> Result<u64> {
//!     let entry = store.open(path).await?;
//!     let size = entry.segment_size();
//!     entry.close()?;
//!     Ok(size)
//! }
//! ```

pub mod ports;

pub use ports::{
    Cipher, Downloader, ErasureCoder, FileEntry, FileId, FileSnapshot, FileStore, HostId,
    HostSession, SectorLocation, SectorRoot, StoragePath,
};
