//! The assembled virtual disk: translation layer, write cache, and read
//! cache behind a block-device read/write surface.
//!
//! Writes enter the write cache, which journals them to the cache device and
//! hands them to the translation layer before acknowledging. Reads are
//! planned against the object map: holes come back zeroed, extents still in
//! RAM are copied directly, and extents on the backend are served through
//! the read cache line by line.

use crate::backend::Backend;
use crate::config::VolumeConfig;
use crate::nvme::NvmeDev;
use crate::objects::{self, SuperBlock};
use crate::read_cache::ReadCache;
use crate::translate::Translate;
use crate::write_cache::WriteCache;
use crate::{Lba, LsvdError, LsvdResult, JOURNAL_BLOCK, SECTOR_SIZE};
use bytes::Bytes;
use std::sync::Arc;
use uuid::Uuid;

pub struct Volume {
    translate: Arc<Translate>,
    wcache: Arc<WriteCache>,
    rcache: Arc<ReadCache>,
    size: u64,
}

impl Volume {
    /// Create a fresh volume: write its superblock to the backend and lay
    /// out both cache files.
    pub async fn format(cfg: &VolumeConfig, size_bytes: u64) -> LsvdResult<()> {
        if size_bytes == 0 || size_bytes % SECTOR_SIZE as u64 != 0 {
            return Err(LsvdError::InvalidArgument(format!(
                "volume size {size_bytes} not a positive sector multiple"
            )));
        }
        let uuid = Uuid::new_v4();
        let backend = Backend::new(cfg.backend.clone(), &cfg.prefix);
        let sb = SuperBlock {
            uuid,
            vol_size: size_bytes / SECTOR_SIZE as u64,
            next_obj: 1,
            ckpts: vec![],
            clones: vec![],
            snaps: vec![],
        };
        backend.put(0, vec![objects::encode_superblock(&sb)]).await?;

        let wdev = NvmeDev::create(
            cfg.write_cache_path(),
            cfg.write_cache_blocks as u64 * JOURNAL_BLOCK as u64,
        )?;
        WriteCache::format(&wdev, uuid, cfg.write_cache_blocks)?;

        let rdev = NvmeDev::create(
            cfg.read_cache_path(),
            ReadCache::device_bytes(cfg.read_cache_units),
        )?;
        ReadCache::format(&rdev, uuid, cfg.read_cache_units)?;

        tracing::info!(prefix = %cfg.prefix, size_bytes, "formatted volume");
        Ok(())
    }

    /// Open a volume: recover the translation layer from the backend, warm
    /// the read cache from its flat map, and replay the write-cache journal.
    pub async fn open(cfg: VolumeConfig) -> LsvdResult<Volume> {
        let backend = Arc::new(Backend::new(cfg.backend.clone(), &cfg.prefix));
        let (size, translate) = Translate::open(backend.clone(), &cfg).await?;

        let rdev = NvmeDev::open(cfg.read_cache_path())?;
        let rcache = ReadCache::open(
            rdev,
            backend.clone(),
            translate.obj_info(),
            translate.uuid(),
            &cfg,
        )?;

        let wdev = NvmeDev::open(cfg.write_cache_path())?;
        let wcache = WriteCache::open(wdev, translate.clone()).await?;

        Ok(Volume {
            translate,
            wcache,
            rcache,
            size,
        })
    }

    /// Volume size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_range(&self, offset: u64, len: usize) -> LsvdResult<()> {
        if offset % SECTOR_SIZE as u64 != 0 || len % SECTOR_SIZE != 0 {
            return Err(LsvdError::InvalidArgument(format!(
                "offset {offset} / length {len} not sector-aligned"
            )));
        }
        if offset + len as u64 > self.size {
            return Err(LsvdError::InvalidArgument(format!(
                "[{offset}, +{len}) beyond volume size {}",
                self.size
            )));
        }
        Ok(())
    }

    /// Write `data` at byte `offset`. Resolves once the write is journaled
    /// on the cache device and visible to subsequent reads; the backend
    /// object is cut later.
    pub async fn write(&self, offset: u64, data: &[u8]) -> LsvdResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_range(offset, data.len())?;
        self.wcache.write(offset, data).await
    }

    /// Read `len` bytes at byte `offset`; unwritten regions come back as
    /// zeros.
    pub async fn read(&self, offset: u64, len: usize) -> LsvdResult<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        self.check_range(offset, len)?;

        let mut buf = vec![0u8; len];
        let base = (offset / SECTOR_SIZE as u64) as Lba;
        let limit = base + (len / SECTOR_SIZE) as Lba;
        let reads = self.translate.map_regions(base, limit, &mut buf)?;

        for r in reads {
            let mut pos = r.buf_range.start;
            let mut sector_off = r.sector_off;
            while pos < r.buf_range.end {
                let end = r.buf_range.end;
                let n = self.rcache.read(r.seq, sector_off, &mut buf[pos..end]).await?;
                pos += n;
                sector_off += (n / SECTOR_SIZE) as Lba;
            }
        }
        Ok(Bytes::from(buf))
    }

    /// Seal the current batch; returns its sequence (0 when there was
    /// nothing to seal).
    pub async fn flush(&self) -> LsvdResult<u32> {
        self.translate.flush()
    }

    /// Write a checkpoint object and re-anchor the superblock at it.
    pub async fn checkpoint(&self) -> LsvdResult<u32> {
        self.translate.checkpoint().await
    }

    pub fn stats(&self) -> VolumeStats {
        VolumeStats {
            object_map_extents: self.translate.object_map_len(),
            objects_uploaded: self.translate.uploads(),
            cached_lines: self.rcache.cached_lines(),
            free_lines: self.rcache.free_slots(),
            backend_line_fetches: self.rcache.backend_fetches(),
        }
    }

    /// Clean shutdown: drain the write cache, seal and upload the last
    /// batch, stop every worker, and persist both cache maps.
    pub async fn close(self) -> LsvdResult<()> {
        self.wcache.shutdown().await;
        let res = match self.translate.flush() {
            Ok(seq) => self.translate.wait_uploaded(seq).await,
            Err(e) => Err(e),
        };
        self.translate.shutdown().await;
        self.rcache.shutdown().await;
        res
    }

    /// Stop every worker without draining or persisting anything that is
    /// not already durable (crash simulation for tests).
    #[cfg(test)]
    pub(crate) async fn crash(self) {
        self.wcache.halt().await;
        self.translate.shutdown().await;
        self.rcache.halt().await;
    }
}

/// Engine counters for monitoring.
#[derive(Debug, Clone)]
pub struct VolumeStats {
    pub object_map_extents: usize,
    pub objects_uploaded: u64,
    pub cached_lines: usize,
    pub free_lines: usize,
    pub backend_line_fetches: u64,
}

impl std::fmt::Display for VolumeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "extents: {} | uploaded: {} | cache lines: {} ({} free) | line fetches: {}",
            self.object_map_extents,
            self.objects_uploaded,
            self.cached_lines,
            self.free_lines,
            self.backend_line_fetches,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::ObjOffset;
    use object_store::memory::InMemory;
    use object_store::ObjectStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use tempfile::TempDir;

    const VOL_BYTES: u64 = 64 * 1024 * 1024;

    struct Rig {
        _dir: TempDir,
        cfg: VolumeConfig,
    }

    impl Rig {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let cfg = VolumeConfig::in_memory(dir.path());
            Volume::format(&cfg, VOL_BYTES).await.unwrap();
            Rig { _dir: dir, cfg }
        }

        async fn open(&self) -> Volume {
            Volume::open(self.cfg.clone()).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_fresh_volume_reads_zeros() {
        let rig = Rig::new().await;
        let vol = rig.open().await;

        assert_eq!(vol.size(), VOL_BYTES);
        assert_eq!(vol.stats().object_map_extents, 0);
        let data = vol.read(0, 4096).await.unwrap();
        assert_eq!(&data[..], &[0u8; 4096][..]);
        vol.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_read_flush_persist() {
        let rig = Rig::new().await;
        {
            let vol = rig.open().await;
            vol.write(0, &[b'A'; 4096]).await.unwrap();

            let data = vol.read(0, 4096).await.unwrap();
            assert_eq!(&data[..], &[b'A'; 4096][..]);

            assert_eq!(vol.flush().await.unwrap(), 1);
            vol.close().await.unwrap();
        }

        let vol = rig.open().await;
        let data = vol.read(0, 4096).await.unwrap();
        assert_eq!(&data[..], &[b'A'; 4096][..]);
        vol.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_overwrite_splits_extents() {
        let rig = Rig::new().await;
        let vol = rig.open().await;

        vol.write(0, &[b'A'; 8192]).await.unwrap();
        vol.write(4096, &[b'B'; 4096]).await.unwrap();

        let data = vol.read(0, 8192).await.unwrap();
        assert_eq!(&data[..4096], &[b'A'; 4096][..]);
        assert_eq!(&data[4096..], &[b'B'; 4096][..]);

        let ext = vol.translate.map_extents(0, 16);
        assert_eq!(
            ext,
            vec![
                (0, 8, ObjOffset { obj: 1, offset: 0 }),
                (8, 16, ObjOffset { obj: 1, offset: 16 }),
            ]
        );
        vol.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_many_writes_roll_objects_and_reread() {
        let dir = TempDir::new().unwrap();
        let cfg = VolumeConfig::in_memory(dir.path()).with_batch_size(64 * 1024);
        Volume::format(&cfg, VOL_BYTES).await.unwrap();
        let vol = Volume::open(cfg).await.unwrap();

        // 64 random 4 KiB writes: 256 KiB total over a 64 KiB batch size,
        // so at least four data objects get cut.
        let mut rng = StdRng::seed_from_u64(17);
        let mut expected: HashMap<u64, u8> = HashMap::new();
        for i in 0..64u32 {
            let offset = rng.gen_range(0..1024u64) * 4096;
            let fill = (i % 251) as u8;
            vol.write(offset, &[fill; 4096]).await.unwrap();
            expected.insert(offset, fill);
        }

        let last = vol.flush().await.unwrap();
        vol.translate.wait_uploaded(last).await.unwrap();
        assert!(vol.stats().objects_uploaded >= 4);

        for (&offset, &fill) in &expected {
            let data = vol.read(offset, 4096).await.unwrap();
            assert_eq!(&data[..], &[fill; 4096][..], "offset {offset}");
        }
        vol.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_restart_preserves_map_and_data() {
        let dir = TempDir::new().unwrap();
        let cfg = VolumeConfig::in_memory(dir.path()).with_batch_size(64 * 1024);
        Volume::format(&cfg, VOL_BYTES).await.unwrap();

        let mut expected: HashMap<u64, u8> = HashMap::new();
        let before = {
            let vol = Volume::open(cfg.clone()).await.unwrap();
            let mut rng = StdRng::seed_from_u64(99);
            for i in 0..32u32 {
                let offset = rng.gen_range(0..512u64) * 4096;
                let fill = (i + 1) as u8;
                vol.write(offset, &[fill; 4096]).await.unwrap();
                expected.insert(offset, fill);
            }
            let last = vol.flush().await.unwrap();
            vol.translate.wait_uploaded(last).await.unwrap();
            vol.checkpoint().await.unwrap();
            let map = vol.translate.map_extents(0, Lba::MAX);
            vol.close().await.unwrap();
            map
        };

        let vol = Volume::open(cfg).await.unwrap();
        assert_eq!(vol.translate.map_extents(0, Lba::MAX), before);
        for (&offset, &fill) in &expected {
            let data = vol.read(offset, 4096).await.unwrap();
            assert_eq!(&data[..], &[fill; 4096][..], "offset {offset}");
        }
        vol.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_consistency_from_journal() {
        let rig = Rig::new().await;
        {
            let vol = rig.open().await;
            vol.write(0, &[b'J'; 4096]).await.unwrap();
            vol.write(1024 * 1024, &[b'K'; 8192]).await.unwrap();
            // Acks received; nothing flushed or checkpointed.
            vol.crash().await;
        }

        let vol = rig.open().await;
        let a = vol.read(0, 4096).await.unwrap();
        assert_eq!(&a[..], &[b'J'; 4096][..]);
        let b = vol.read(1024 * 1024, 8192).await.unwrap();
        assert_eq!(&b[..], &[b'K'; 8192][..]);
        vol.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_coherency_after_overwrite() {
        let rig = Rig::new().await;
        let vol = rig.open().await;

        vol.write(0, &[1u8; 65536]).await.unwrap();
        let seq = vol.flush().await.unwrap();
        vol.translate.wait_uploaded(seq).await.unwrap();

        // Pull the line into the read cache.
        let data = vol.read(0, 65536).await.unwrap();
        assert_eq!(&data[..], &[1u8; 65536][..]);
        assert!(vol.stats().backend_line_fetches >= 1);

        // Overwrite part of it; the read must see the new bytes regardless
        // of cache residency.
        vol.write(4096, &[2u8; 4096]).await.unwrap();
        let data = vol.read(0, 65536).await.unwrap();
        assert_eq!(&data[..4096], &[1u8; 4096][..]);
        assert_eq!(&data[4096..8192], &[2u8; 4096][..]);
        assert_eq!(&data[8192..], &[1u8; 57344][..]);

        vol.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bounds_and_alignment() {
        let rig = Rig::new().await;
        let vol = rig.open().await;

        assert!(matches!(
            vol.write(100, &[0u8; 512]).await,
            Err(LsvdError::InvalidArgument(_))
        ));
        assert!(matches!(
            vol.read(0, 100).await,
            Err(LsvdError::InvalidArgument(_))
        ));
        assert!(matches!(
            vol.write(VOL_BYTES - 512, &[0u8; 4096]).await,
            Err(LsvdError::InvalidArgument(_))
        ));
        vol.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_without_format_fails() {
        let dir = TempDir::new().unwrap();
        let cfg = VolumeConfig::in_memory(dir.path());
        assert!(Volume::open(cfg).await.is_err());
    }

    #[tokio::test]
    async fn test_distinct_backends_are_independent() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let cfg_a = VolumeConfig::in_memory(dir_a.path());
        let cfg_b = VolumeConfig::in_memory(dir_b.path());
        Volume::format(&cfg_a, VOL_BYTES).await.unwrap();
        Volume::format(&cfg_b, VOL_BYTES).await.unwrap();

        let a = Volume::open(cfg_a).await.unwrap();
        let b = Volume::open(cfg_b).await.unwrap();
        a.write(0, &[0xAA; 4096]).await.unwrap();
        b.write(0, &[0xBB; 4096]).await.unwrap();

        assert_eq!(&a.read(0, 4096).await.unwrap()[..], &[0xAA; 4096][..]);
        assert_eq!(&b.read(0, 4096).await.unwrap()[..], &[0xBB; 4096][..]);
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_store_distinct_prefixes() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let cfg_a = VolumeConfig::new(store.clone(), "vol-a", dir_a.path());
        let cfg_b = VolumeConfig::new(store.clone(), "vol-b", dir_b.path());
        Volume::format(&cfg_a, VOL_BYTES).await.unwrap();
        Volume::format(&cfg_b, VOL_BYTES).await.unwrap();

        let a = Volume::open(cfg_a).await.unwrap();
        let b = Volume::open(cfg_b).await.unwrap();
        a.write(0, &[1u8; 4096]).await.unwrap();

        assert_eq!(&b.read(0, 4096).await.unwrap()[..], &[0u8; 4096][..]);
        a.close().await.unwrap();
        b.close().await.unwrap();
    }
}
