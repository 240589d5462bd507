//! LSVD engine: a userspace log-structured virtual disk.
//!
//! The engine exposes a conventional block-device read/write surface over a
//! large logical address space while persisting data as an append-only log of
//! immutable numbered objects in a backing store, with a journaled NVMe write
//! cache absorbing write latency and a 64 KiB-line NVMe read cache absorbing
//! read latency.
//!
//! # Architecture
//!
//! ```text
//! Writes → write cache (NVMe journal) → translation layer (8 MiB batches)
//!        → numbered data objects on the backend
//! Reads  → object map → RAM batches / read cache (RAM, NVMe, backend)
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use lsvd_engine::{Volume, VolumeConfig};
//!
//! # async fn example() -> Result<(), lsvd_engine::LsvdError> {
//! let config = VolumeConfig::in_memory("/tmp/lsvd-cache");
//! Volume::format(&config, 1 << 30).await?;
//! let vol = Volume::open(config).await?;
//!
//! vol.write(0, &[0xAA; 4096]).await?;
//! let data = vol.read(0, 4096).await?;
//! assert_eq!(&data[..], &[0xAA; 4096][..]);
//!
//! vol.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod extent;
pub mod journal;
pub mod nvme;
pub mod objects;
pub mod read_cache;
pub mod translate;
pub mod volume;
pub mod write_cache;

pub use config::VolumeConfig;
pub use volume::Volume;

use thiserror::Error;

/// Logical block address in 512-byte sectors.
pub type Lba = i64;

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// Maximum payload of one in-memory write batch (one data object).
pub const BATCH_SIZE: usize = 8 * 1024 * 1024;

/// Journal block size on the cache device.
pub const JOURNAL_BLOCK: usize = 4096;

/// Read-cache line size.
pub const LINE_BYTES: usize = 64 * 1024;

/// Sectors per read-cache line.
pub const LINE_SECTORS: Lba = (LINE_BYTES / SECTOR_SIZE) as Lba;

/// Errors that can occur in the LSVD engine.
#[derive(Error, Debug)]
pub enum LsvdError {
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("Short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    #[error("Backend unavailable (engine halted after upload failure)")]
    BackendUnavailable,

    #[error("Cache device error: {0}")]
    NvmeIo(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Engine is shut down")]
    Shutdown,
}

impl LsvdError {
    /// True when the underlying cause is a missing object, which recovery
    /// treats as end-of-log rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LsvdError::ObjectStore(object_store::Error::NotFound { .. })
        )
    }
}

/// Result type alias for engine operations.
pub type LsvdResult<T> = Result<T, LsvdError>;

pub(crate) fn div_round_up(n: usize, m: usize) -> usize {
    (n + m - 1) / m
}
