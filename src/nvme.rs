//! Cache-device adapter: positioned I/O on a local NVMe partition or file.
//!
//! The engine issues naturally aligned I/O in 512-byte multiples; offsets
//! are disjoint by construction (ring allocator and line index), so a shared
//! handle with positioned reads and writes is all the layers need.

use crate::{LsvdError, LsvdResult};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

pub struct NvmeDev {
    file: File,
}

fn nvme_err(what: &str, e: std::io::Error) -> LsvdError {
    LsvdError::NvmeIo(format!("{what}: {e}"))
}

impl NvmeDev {
    /// Create (or truncate) a cache file of `bytes` bytes.
    pub fn create<P: AsRef<Path>>(path: P, bytes: u64) -> LsvdResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| nvme_err("create cache dir", e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| nvme_err("create cache device", e))?;
        file.set_len(bytes).map_err(|e| nvme_err("size cache device", e))?;
        Ok(Self { file })
    }

    /// Open an existing cache file or device.
    pub fn open<P: AsRef<Path>>(path: P) -> LsvdResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| nvme_err("open cache device", e))?;
        Ok(Self { file })
    }

    pub fn len(&self) -> LsvdResult<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| nvme_err("stat cache device", e))?
            .len())
    }

    pub fn is_empty(&self) -> LsvdResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> LsvdResult<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| nvme_err("cache read", e))
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> LsvdResult<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| nvme_err("cache write", e))
    }

    pub fn sync(&self) -> LsvdResult<()> {
        self.file.sync_all().map_err(|e| nvme_err("cache sync", e))
    }
}
