//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                             │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                          │ │
//! │  │ ErasureCoder │ Cipher │ FileStore │ HostSession │ Downloader││
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                      │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ ReedSolomonCoder │ ChaChaCipher │ MemoryFileStore          │ │
//! │  │ MemoryHost │ HostDownloader                                │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use sectorcast::adapters::{HostDownloader, MemoryFileStore, MemoryHost};
//!
//! let host = MemoryHost::new("host-1");
//! let downloader = HostDownloader::new();
//! downloader.register(host.clone());
//!
//! // Use it through the domain port trait
//! let root = host.upload_sector(sector).await?;
//! ```

mod cipher;
mod downloader;
mod file_store;
mod host;
mod reed_solomon;

pub use cipher::{ChaChaCipher, SEAL_OVERHEAD};
pub use downloader::HostDownloader;
pub use file_store::{MemoryFileEntry, MemoryFileEntryBuilder, MemoryFileStore};
pub use host::MemoryHost;
pub use reed_solomon::ReedSolomonCoder;
