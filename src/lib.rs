//! Sectorcast - Erasure-Coded Segment Upload Engine
//!
//! Splits files into fixed-size segments, erasure codes and encrypts each
//! segment into sectors, and uploads those sectors to a pool of storage
//! hosts. Memory is bounded by a global budget, segments that cannot reach
//! their redundancy target are flagged stuck for a later repair pass.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          UploadManager                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Upload Heap │───▶│  Lifecycle   │───▶│   Workers    │       │
//! │  │  (priority)  │    │ (fetch, code │    │ (one / host) │       │
//! │  │              │    │  encrypt)    │    │              │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          ▲                   │                   │              │
//! │          │            ┌──────┴───────┐           │              │
//! │          └────────────│Memory Manager│◀──────────┘              │
//! │                       └──────────────┘                          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory and codec implementations of the domain ports
//! - [`config`] - Engine configuration
//! - [`domain`] - Collaborator ports and value objects
//! - [`error`] - Error types
//! - [`upload`] - Memory manager, segments, workers, heap and lifecycle

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod upload;

// Re-export commonly used types
pub use config::UploadConfig;
pub use domain::ports::{FileStore, HostId, HostSession, StoragePath};
pub use error::{Error, Result};
pub use upload::{
    MemoryManager, SegmentId, SegmentPhase, UnfinishedSegment, UploadContext, UploadManager,
    UploadStats,
};
