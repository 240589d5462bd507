//! Configuration for the LSVD engine.

use object_store::memory::InMemory;
use object_store::ObjectStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a volume.
#[derive(Clone)]
pub struct VolumeConfig {
    /// The object store holding the volume's numbered objects.
    pub backend: Arc<dyn ObjectStore>,

    /// Object name prefix. The superblock is the bare prefix; data and
    /// checkpoint objects are `{prefix}.{seq:08x}`.
    pub prefix: String,

    /// Directory holding the NVMe cache files (`write.cache`, `read.cache`).
    pub cache_dir: PathBuf,

    /// Maximum payload of one write batch before it is sealed into a data
    /// object. Default: 8 MiB.
    pub batch_size: usize,

    /// Number of background upload workers draining sealed batches.
    /// Default: 2
    pub upload_workers: usize,

    /// Size of the write-cache journal region in 4 KiB blocks, including the
    /// superblock at block 0. Default: 4096 (16 MiB).
    pub write_cache_blocks: u32,

    /// Number of 64 KiB lines in the read cache. Default: 256 (16 MiB).
    pub read_cache_units: u32,

    /// Bound on read-cache RAM line buffers. Default: 48.
    pub max_line_bufs: usize,

    /// Number of batches between automatic checkpoints. Default: 100.
    pub ckpt_interval: u32,

    /// An open, non-empty batch older than this is sealed by the flush
    /// ticker. Default: 2 seconds.
    pub flush_timeout: Duration,

    /// How often the flush ticker wakes. Default: 500 ms.
    pub flush_tick: Duration,

    /// How often the checkpoint ticker wakes. Default: 1 second.
    pub ckpt_tick: Duration,

    /// How often the read-cache eviction ticker wakes. Default: 500 ms.
    pub evict_tick: Duration,
}

impl VolumeConfig {
    /// Create a config for in-memory object storage (testing).
    pub fn in_memory<P: AsRef<Path>>(cache_dir: P) -> Self {
        Self::new(Arc::new(InMemory::new()), "vol", cache_dir)
    }

    /// Create a config against an existing object store.
    pub fn new<P: AsRef<Path>>(
        backend: Arc<dyn ObjectStore>,
        prefix: &str,
        cache_dir: P,
    ) -> Self {
        Self {
            backend,
            prefix: prefix.to_string(),
            cache_dir: cache_dir.as_ref().to_path_buf(),
            batch_size: crate::BATCH_SIZE,
            upload_workers: 2,
            write_cache_blocks: 4096,
            read_cache_units: 256,
            max_line_bufs: 48,
            ckpt_interval: 100,
            flush_timeout: Duration::from_secs(2),
            flush_tick: Duration::from_millis(500),
            ckpt_tick: Duration::from_secs(1),
            evict_tick: Duration::from_millis(500),
        }
    }

    /// Path of the write-cache journal file.
    pub fn write_cache_path(&self) -> PathBuf {
        self.cache_dir.join("write.cache")
    }

    /// Path of the read-cache line file.
    pub fn read_cache_path(&self) -> PathBuf {
        self.cache_dir.join("read.cache")
    }

    /// Builder-style: set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Builder-style: set the upload worker count.
    pub fn with_upload_workers(mut self, n: usize) -> Self {
        self.upload_workers = n;
        self
    }

    /// Builder-style: set the write-cache journal size in 4 KiB blocks.
    pub fn with_write_cache_blocks(mut self, blocks: u32) -> Self {
        self.write_cache_blocks = blocks;
        self
    }

    /// Builder-style: set the read-cache line count.
    pub fn with_read_cache_units(mut self, units: u32) -> Self {
        self.read_cache_units = units;
        self
    }

    /// Builder-style: set the checkpoint interval in batches.
    pub fn with_ckpt_interval(mut self, interval: u32) -> Self {
        self.ckpt_interval = interval;
        self
    }

    /// Builder-style: set the open-batch flush timeout.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for VolumeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeConfig")
            .field("prefix", &self.prefix)
            .field("cache_dir", &self.cache_dir)
            .field("batch_size", &self.batch_size)
            .field("upload_workers", &self.upload_workers)
            .field("write_cache_blocks", &self.write_cache_blocks)
            .field("read_cache_units", &self.read_cache_units)
            .field("ckpt_interval", &self.ckpt_interval)
            .finish()
    }
}
