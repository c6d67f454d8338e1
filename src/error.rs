//! Error types for the segment upload engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while scheduling, encoding and uploading segments
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking wait observed the shutdown signal
    #[error("Interrupted by shutdown: {0}")]
    Interrupted(String),

    /// The task manager no longer admits new tasks
    #[error("Task manager is closed")]
    TaskManagerClosed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Retrieval Errors
    // =========================================================================
    /// File has no local copy and a download is not warranted
    #[error("File not available locally: {path}")]
    FileNotAvailableLocally { path: String },

    /// Local copy exists but could not be read
    #[error("Failed to read {path} locally: {reason}")]
    LocalReadFailed { path: String, reason: String },

    /// Repair download failed
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    // =========================================================================
    // Erasure Coding Errors
    // =========================================================================
    /// EC encoding failed
    #[error("EC encoding failed: {0}")]
    EcEncodingFailed(String),

    /// Invalid EC configuration
    #[error("Invalid EC configuration: {0}")]
    InvalidEcConfig(String),

    /// Insufficient sectors for recovery
    #[error("Insufficient sectors for recovery: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    /// EC reconstruction failed
    #[error("EC reconstruction failed: {0}")]
    EcReconstructionFailed(String),

    // =========================================================================
    // Cipher Errors
    // =========================================================================
    /// Sector encryption failed
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Sector decryption failed
    #[error("Decryption failed: {0}")]
    Decryption(String),

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// A single request can never be satisfied under the ceiling
    #[error("Memory request of {requested} bytes exceeds limit of {limit} bytes")]
    MemoryRequestTooLarge { requested: u64, limit: u64 },

    // =========================================================================
    // File Store Errors
    // =========================================================================
    /// File not found in the file store
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// File store metadata operation failed
    #[error("File store error: {0}")]
    FileStore(String),

    // =========================================================================
    // Host Errors
    // =========================================================================
    /// Host is not reachable or was removed from the pool
    #[error("Host unavailable: {host}")]
    HostUnavailable { host: String },

    /// Host rejected or failed a sector upload
    #[error("Sector upload to {host} failed: {reason}")]
    SectorUploadFailed { host: String, reason: String },

    /// Host does not store the requested sector
    #[error("Sector {root} not found on host {host}")]
    SectorNotFound { host: String, root: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),
}
