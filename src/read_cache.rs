//! Read cache: 64 KiB cache-lines on the cache device, indexed by
//! `(object, line)`.
//!
//! A read of a mapped extent is clipped to the end of its cache-line and
//! served from one of: the line's RAM mirror, the cache device (once the
//! line is durable there), or the backend. Concurrent readers of a line
//! being filled queue as waiters so a cold line costs exactly one backend
//! fetch. An admission guard turns cache misses into read-around backend
//! reads when the hit rate is poor, no slot is free, or too many line
//! writes are in flight.
//!
//! Slot lifecycle: free → filling → populated (RAM, then also durable once
//! `written`) → evicted → free. `in_use` pins a slot against eviction: one
//! count for the RAM mirror while the buffer is resident, one staging count
//! from buffer publish until the line's device write completes, and one per
//! device read in flight. A dedicated ticker randomly evicts idle slots
//! when the free list runs low and persists the flat map so the cache is
//! warm across restarts.

use crate::backend::Backend;
use crate::config::VolumeConfig;
use crate::journal::{self, ReadSuper};
use crate::nvme::NvmeDev;
use crate::translate::ObjInfoTable;
use crate::{Lba, LsvdError, LsvdResult, JOURNAL_BLOCK, LINE_BYTES, LINE_SECTORS, SECTOR_SIZE};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct RcInner {
    map: HashMap<(u32, u32), usize>,
    flat: Vec<Option<(u32, u32)>>,
    free: Vec<usize>,
    in_use: Vec<u32>,
    written: Vec<bool>,
    a_bit: Vec<bool>,
    buffer: Vec<Option<Bytes>>,
    pending: Vec<Vec<oneshot::Sender<()>>>,
    buf_loc: VecDeque<usize>,
    hits_user: i64,
    hits_backend: i64,
    outstanding_writes: usize,
    map_dirty: bool,
}

enum Action {
    CopyRam(Bytes),
    SsdRead(usize),
    Wait(oneshot::Receiver<()>),
    Fill(usize),
    Direct,
}

pub struct ReadCache {
    dev: Arc<NvmeDev>,
    backend: Arc<Backend>,
    obj_info: ObjInfoTable,
    rsuper: ReadSuper,
    maxbufs: usize,
    inner: Mutex<RcInner>,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    backend_fetches: AtomicU64,
}

impl ReadCache {
    /// Device bytes needed for a cache of `units` lines.
    pub fn device_bytes(units: u32) -> u64 {
        let base = 1 + journal::flat_map_blocks(units);
        base as u64 * JOURNAL_BLOCK as u64 + units as u64 * LINE_BYTES as u64
    }

    /// Lay out a fresh read cache: superblock, zeroed flat map, line region.
    pub fn format(dev: &NvmeDev, uuid: uuid::Uuid, units: u32) -> LsvdResult<()> {
        if units == 0 {
            return Err(LsvdError::InvalidArgument(
                "read cache needs at least one line".into(),
            ));
        }
        let map_blocks = journal::flat_map_blocks(units);
        let rs = ReadSuper {
            uuid,
            unit_sectors: LINE_SECTORS as u32,
            base: 1 + map_blocks,
            units,
            map_start: 1,
            map_blocks,
        };
        dev.write_at(&journal::encode_read_super(&rs), 0)?;
        let empty = journal::encode_flat_map(&vec![None; units as usize]);
        dev.write_at(&empty, JOURNAL_BLOCK as u64)?;
        dev.sync()
    }

    /// Open the cache, rebuilding the in-memory index from the on-device
    /// flat map so the cache is warm across restarts.
    pub fn open(
        dev: NvmeDev,
        backend: Arc<Backend>,
        obj_info: ObjInfoTable,
        uuid: uuid::Uuid,
        cfg: &VolumeConfig,
    ) -> LsvdResult<Arc<ReadCache>> {
        let mut block = vec![0u8; JOURNAL_BLOCK];
        dev.read_at(&mut block, 0)?;
        let rsuper = journal::parse_read_super(&block)?;
        if rsuper.uuid != uuid {
            return Err(LsvdError::InvalidObject(
                "read cache belongs to a different volume".into(),
            ));
        }
        if rsuper.unit_sectors != LINE_SECTORS as u32 || rsuper.units == 0 {
            return Err(LsvdError::InvalidObject(format!(
                "bad read cache geometry: {} x {} sectors",
                rsuper.units, rsuper.unit_sectors
            )));
        }

        let mut raw = vec![0u8; rsuper.map_blocks as usize * JOURNAL_BLOCK];
        dev.read_at(&mut raw, rsuper.map_start as u64 * JOURNAL_BLOCK as u64)?;
        let flat = journal::parse_flat_map(&raw, rsuper.units)?;

        let units = rsuper.units as usize;
        let mut map = HashMap::new();
        let mut free = Vec::new();
        let mut written = vec![false; units];
        for (slot, entry) in flat.iter().enumerate() {
            match entry {
                Some(unit) => {
                    map.insert(*unit, slot);
                    written[slot] = true;
                }
                None => free.push(slot),
            }
        }
        tracing::info!(
            units,
            warm = map.len(),
            "read cache opened"
        );

        let rc = Arc::new(ReadCache {
            dev: Arc::new(dev),
            backend,
            obj_info,
            rsuper,
            maxbufs: cfg.max_line_bufs,
            inner: Mutex::new(RcInner {
                map,
                flat,
                free,
                in_use: vec![0; units],
                written,
                a_bit: vec![false; units],
                buffer: vec![None; units],
                pending: (0..units).map(|_| Vec::new()).collect(),
                buf_loc: VecDeque::new(),
                hits_user: 1000, // starting credit so a cold cache admits
                hits_backend: 0,
                outstanding_writes: 0,
                map_dirty: false,
            }),
            running: AtomicBool::new(true),
            handles: Mutex::new(Vec::new()),
            backend_fetches: AtomicU64::new(0),
        });

        let me = rc.clone();
        let tick = cfg.evict_tick;
        let h = tokio::spawn(async move { me.evict_loop(tick).await });
        rc.handles.lock().push(h);
        Ok(rc)
    }

    fn line_offset(&self, slot: usize) -> u64 {
        self.rsuper.base as u64 * JOURNAL_BLOCK as u64 + slot as u64 * LINE_BYTES as u64
    }

    /// Backend line fetches issued since open.
    pub fn backend_fetches(&self) -> u64 {
        self.backend_fetches.load(Ordering::Relaxed)
    }

    pub fn free_slots(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn outstanding_writes(&self) -> usize {
        self.inner.lock().outstanding_writes
    }

    pub fn cached_lines(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Read from data object `obj` at data-relative sector `sector_off`,
    /// clipped to the end of the covering 64 KiB line. Returns the bytes
    /// filled into the front of `dst`; callers iterate to cover more.
    pub async fn read(&self, obj: u32, sector_off: Lba, dst: &mut [u8]) -> LsvdResult<usize> {
        let wanted = (dst.len() / SECTOR_SIZE) as Lba;
        if wanted == 0 {
            return Ok(0);
        }
        let line = (sector_off / LINE_SECTORS) as u32;
        let blk_offset = sector_off % LINE_SECTORS;
        let blk_top = (blk_offset + wanted).min(LINE_SECTORS);
        let n_sectors = blk_top - blk_offset;
        let bytes = n_sectors as usize * SECTOR_SIZE;
        let unit = (obj, line);

        loop {
            let action = {
                let mut inner = self.inner.lock();
                if let Some(&slot) = inner.map.get(&unit) {
                    inner.a_bit[slot] = true;
                    inner.hits_user += n_sectors;
                    if let Some(buf) = inner.buffer[slot].clone() {
                        Action::CopyRam(buf)
                    } else if inner.written[slot] {
                        inner.in_use[slot] += 1;
                        Action::SsdRead(slot)
                    } else {
                        // A fill is in flight; wait for its completion.
                        let (tx, rx) = oneshot::channel();
                        inner.pending[slot].push(tx);
                        Action::Wait(rx)
                    }
                } else {
                    let admit = !inner.free.is_empty()
                        && inner.hits_user * 3 > inner.hits_backend * 2
                        && inner.outstanding_writes < self.maxbufs.saturating_sub(10);
                    if admit {
                        let slot = inner.free.pop().expect("free list checked above");
                        inner.written[slot] = false;
                        inner.in_use[slot] += 1;
                        inner.map.insert(unit, slot);
                        inner.flat[slot] = Some(unit);
                        inner.map_dirty = true;
                        inner.hits_user += n_sectors;
                        inner.hits_backend += LINE_SECTORS;
                        inner.outstanding_writes += 1;
                        Action::Fill(slot)
                    } else {
                        inner.hits_user += n_sectors;
                        inner.hits_backend += n_sectors;
                        Action::Direct
                    }
                }
            };

            match action {
                Action::CopyRam(buf) => {
                    let at = blk_offset as usize * SECTOR_SIZE;
                    dst[..bytes].copy_from_slice(&buf[at..at + bytes]);
                    return Ok(bytes);
                }
                Action::SsdRead(slot) => {
                    let off = self.line_offset(slot) + blk_offset as u64 * SECTOR_SIZE as u64;
                    let res = self.dev.read_at(&mut dst[..bytes], off);
                    self.inner.lock().in_use[slot] -= 1;
                    res?;
                    return Ok(bytes);
                }
                Action::Wait(rx) => {
                    let _ = rx.await;
                    continue;
                }
                Action::Fill(slot) => {
                    let line_buf = match self.fill_line(obj, line, slot).await {
                        Ok(buf) => buf,
                        Err(e) => return Err(e),
                    };
                    let at = blk_offset as usize * SECTOR_SIZE;
                    dst[..bytes].copy_from_slice(&line_buf[at..at + bytes]);
                    self.write_line(slot, &line_buf);
                    return Ok(bytes);
                }
                Action::Direct => {
                    let (hdr_sectors, _) = self.object_geometry(obj)?;
                    let data = self
                        .backend
                        .get_data(obj, hdr_sectors, sector_off, bytes)
                        .await?;
                    self.backend_fetches.fetch_add(1, Ordering::Relaxed);
                    dst[..bytes].copy_from_slice(&data);
                    return Ok(bytes);
                }
            }
        }
    }

    fn object_geometry(&self, obj: u32) -> LsvdResult<(u32, u32)> {
        let info = self.obj_info.read();
        let oi = info
            .get(&obj)
            .ok_or_else(|| LsvdError::InvalidObject(format!("mapped object {obj} unknown")))?;
        Ok((oi.hdr_sectors, oi.data_sectors))
    }

    /// Fetch the full line from the backend (clipped to the object's data,
    /// zero-padded), publish the RAM mirror, and wake waiters. Exactly one
    /// fetch per cold line: concurrent readers queue on `pending`.
    async fn fill_line(&self, obj: u32, line: u32, slot: usize) -> LsvdResult<Bytes> {
        let fetch = async {
            let (hdr_sectors, data_sectors) = self.object_geometry(obj)?;
            let start = line as Lba * LINE_SECTORS;
            let top = (data_sectors as Lba).min(start + LINE_SECTORS);
            let fetch_bytes = ((top - start).max(0) as usize) * SECTOR_SIZE;
            self.backend_fetches.fetch_add(1, Ordering::Relaxed);
            let data = self
                .backend
                .get_data(obj, hdr_sectors, start, fetch_bytes)
                .await?;
            let mut buf = BytesMut::zeroed(LINE_BYTES);
            buf[..data.len()].copy_from_slice(&data);
            Ok::<Bytes, LsvdError>(buf.freeze())
        }
        .await;

        let mut inner = self.inner.lock();
        match fetch {
            Ok(line_buf) => {
                // Staging pin: hold the slot until `write_line` completes,
                // so a steal of the RAM hold cannot drop `in_use` to zero
                // (and eviction reuse the slot) while the device write for
                // this index is still outstanding.
                inner.in_use[slot] += 1;

                // Bound the RAM mirror pool, stealing the oldest durable
                // buffer. Undurable victims are not stealable: their line
                // exists nowhere but in this buffer, and readers finding
                // neither buffer nor `written` would queue on `pending`.
                let mut scanned = 0;
                let rotation_bound = inner.buf_loc.len();
                while inner.buf_loc.len() >= self.maxbufs && scanned < rotation_bound {
                    scanned += 1;
                    let Some(victim) = inner.buf_loc.pop_front() else {
                        break;
                    };
                    if !inner.written[victim] {
                        inner.buf_loc.push_back(victim);
                        continue;
                    }
                    inner.buffer[victim] = None;
                    inner.in_use[victim] = inner.in_use[victim].saturating_sub(1);
                }
                inner.buffer[slot] = Some(line_buf.clone());
                inner.buf_loc.push_back(slot);
                for tx in inner.pending[slot].drain(..) {
                    let _ = tx.send(());
                }
                Ok(line_buf)
            }
            Err(e) => {
                // Undo the claim; waiters re-run their lookup and retry.
                inner.map.remove(&(obj, line));
                inner.flat[slot] = None;
                inner.free.push(slot);
                inner.in_use[slot] = inner.in_use[slot].saturating_sub(1);
                inner.outstanding_writes -= 1;
                inner.pending[slot].clear();
                Err(e)
            }
        }
    }

    /// Stage the filled line onto the cache device; `written` gates serving
    /// it from there.
    fn write_line(&self, slot: usize, line_buf: &Bytes) {
        let res = self.dev.write_at(line_buf, self.line_offset(slot));
        let mut inner = self.inner.lock();
        inner.outstanding_writes -= 1;
        // Release the staging pin taken when the fill published the buffer.
        inner.in_use[slot] = inner.in_use[slot].saturating_sub(1);
        match res {
            Ok(()) => {
                inner.written[slot] = true;
                inner.map_dirty = true;
            }
            Err(e) => {
                // The line stays serviceable from RAM; it will be refetched
                // once the buffer is recycled.
                tracing::warn!(slot, error = %e, "cache line write failed");
            }
        }
        // Wake anyone who queued while the line was neither in RAM nor
        // durable; they re-run their lookup.
        for tx in inner.pending[slot].drain(..) {
            let _ = tx.send(());
        }
    }

    /// Random replacement of idle slots.
    fn evict(&self, inner: &mut RcInner, want: usize) -> usize {
        let units = inner.flat.len();
        let mut rng = rand::thread_rng();
        let mut evicted = 0;
        let mut attempts = 0;
        while evicted < want && attempts < units * 4 {
            attempts += 1;
            let j = rng.gen_range(0..units);
            if inner.in_use[j] > 0 {
                continue;
            }
            let Some(unit) = inner.flat[j] else { continue };
            inner.map.remove(&unit);
            inner.flat[j] = None;
            inner.written[j] = false;
            inner.a_bit[j] = false;
            inner.free.push(j);
            evicted += 1;
        }
        evicted
    }

    /// Flat-map entries safe to persist: only lines durable on the device.
    fn persistable_flat(inner: &RcInner) -> Vec<Option<(u32, u32)>> {
        inner
            .flat
            .iter()
            .zip(&inner.written)
            .map(|(f, w)| if *w { *f } else { None })
            .collect()
    }

    async fn evict_loop(self: Arc<Self>, tick: Duration) {
        let mut last_write = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(tick).await;
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let snapshot = {
                let mut inner = self.inner.lock();
                let units = inner.flat.len();
                let mut evicted = 0;
                if inner.free.len() < units / 16 {
                    let want = units / 4 - inner.free.len();
                    evicted = self.evict(&mut inner, want);
                    if evicted > 0 {
                        tracing::debug!(evicted, "read cache evicted lines");
                        inner.map_dirty = true;
                    }
                }
                let due = inner.map_dirty
                    && (evicted > 0 || last_write.elapsed() > Duration::from_secs(2));
                if due {
                    inner.map_dirty = false;
                    Some(Self::persistable_flat(&inner))
                } else {
                    None
                }
            };
            if let Some(flat) = snapshot {
                let buf = journal::encode_flat_map(&flat);
                if let Err(e) = self
                    .dev
                    .write_at(&buf, self.rsuper.map_start as u64 * JOURNAL_BLOCK as u64)
                {
                    tracing::warn!(error = %e, "read cache map write failed");
                }
                last_write = Instant::now();
            }
        }
    }

    /// Stop the eviction ticker and persist the flat map.
    pub async fn shutdown(&self) {
        self.halt().await;
        let flat = Self::persistable_flat(&self.inner.lock());
        let buf = journal::encode_flat_map(&flat);
        if let Err(e) = self
            .dev
            .write_at(&buf, self.rsuper.map_start as u64 * JOURNAL_BLOCK as u64)
        {
            tracing::warn!(error = %e, "read cache map write failed");
        }
        if let Err(e) = self.dev.sync() {
            tracing::warn!(error = %e, "read cache sync failed");
        }
    }

    /// Stop the ticker without persisting (crash simulation and the first
    /// half of shutdown).
    pub(crate) async fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for h in handles {
            let _ = h.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{encode_data_hdr, DataMapEntry, ObjType};
    use crate::test_util::mem_store;
    use crate::translate::ObjInfo;
    use parking_lot::RwLock;
    use tempfile::TempDir;
    use uuid::Uuid;

    /// Payload byte for `sector` of `obj`, so tests can verify any range.
    fn fill_byte(obj: u32, sector: u64) -> u8 {
        (obj as u64 * 37 + sector) as u8
    }

    async fn make_obj(backend: &Backend, info: &ObjInfoTable, obj: u32, data_sectors: u32) {
        let uuid = Uuid::new_v4();
        let mut payload = Vec::with_capacity(data_sectors as usize * SECTOR_SIZE);
        for s in 0..data_sectors as u64 {
            payload.extend(std::iter::repeat(fill_byte(obj, s)).take(SECTOR_SIZE));
        }
        let map = vec![DataMapEntry {
            lba: 0,
            len: data_sectors,
        }];
        let hdr = encode_data_hdr(&uuid, obj, 0, &map, data_sectors);
        let hdr_sectors = (hdr.len() / SECTOR_SIZE) as u32;
        backend
            .put(obj, vec![hdr, Bytes::from(payload)])
            .await
            .unwrap();
        info.write().insert(
            obj,
            ObjInfo {
                hdr_sectors,
                data_sectors,
                live_sectors: data_sectors,
                otype: ObjType::Data,
            },
        );
    }

    struct Rig {
        _dir: TempDir,
        backend: Arc<Backend>,
        info: ObjInfoTable,
        uuid: Uuid,
        cfg: VolumeConfig,
    }

    impl Rig {
        fn new(units: u32) -> Self {
            let dir = TempDir::new().unwrap();
            let uuid = Uuid::new_v4();
            let dev = NvmeDev::create(
                dir.path().join("read.cache"),
                ReadCache::device_bytes(units),
            )
            .unwrap();
            ReadCache::format(&dev, uuid, units).unwrap();
            drop(dev);

            let cfg = VolumeConfig::in_memory(dir.path()).with_read_cache_units(units);
            Rig {
                backend: Arc::new(Backend::new(mem_store(), "vol")),
                info: Arc::new(RwLock::new(HashMap::new())),
                uuid,
                cfg,
                _dir: dir,
            }
        }

        fn open(&self) -> Arc<ReadCache> {
            let dev = NvmeDev::open(self.cfg.read_cache_path()).unwrap();
            ReadCache::open(
                dev,
                self.backend.clone(),
                self.info.clone(),
                self.uuid,
                &self.cfg,
            )
            .unwrap()
        }
    }

    fn check_range(buf: &[u8], obj: u32, start_sector: u64) {
        for (i, chunk) in buf.chunks(SECTOR_SIZE).enumerate() {
            let want = fill_byte(obj, start_sector + i as u64);
            assert!(
                chunk.iter().all(|&b| b == want),
                "sector {} of obj {} wrong",
                start_sector + i as u64,
                obj
            );
        }
    }

    #[tokio::test]
    async fn test_miss_then_ram_hit() {
        let rig = Rig::new(16);
        make_obj(&rig.backend, &rig.info, 1, 256).await;
        let rc = rig.open();

        let mut buf = vec![0u8; 4096];
        let n = rc.read(1, 0, &mut buf).await.unwrap();
        assert_eq!(n, 4096);
        check_range(&buf, 1, 0);
        assert_eq!(rc.backend_fetches(), 1);

        // Second read of the same line: RAM hit, no new fetch.
        let n = rc.read(1, 8, &mut buf).await.unwrap();
        assert_eq!(n, 4096);
        check_range(&buf, 1, 8);
        assert_eq!(rc.backend_fetches(), 1);

        rc.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_clips_to_line_end() {
        let rig = Rig::new(16);
        make_obj(&rig.backend, &rig.info, 1, 256).await;
        let rc = rig.open();

        // 8 sectors starting 4 sectors before the line boundary.
        let mut buf = vec![0u8; 8 * SECTOR_SIZE];
        let n = rc.read(1, 124, &mut buf).await.unwrap();
        assert_eq!(n, 4 * SECTOR_SIZE);
        check_range(&buf[..n], 1, 124);

        // The continuation lands in line 1.
        let n2 = rc.read(1, 128, &mut buf[n..]).await.unwrap();
        assert_eq!(n2, 4 * SECTOR_SIZE);
        check_range(&buf[n..], 1, 128);
        assert_eq!(rc.backend_fetches(), 2);

        rc.shutdown().await;
    }

    #[tokio::test]
    async fn test_line_coalescing_single_fetch() {
        let rig = Rig::new(16);
        make_obj(&rig.backend, &rig.info, 5, 128).await;
        let rc = rig.open();

        let mut tasks = Vec::new();
        for i in 0..8u64 {
            let rc = rc.clone();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = rc.read(5, (i * 8) as Lba, &mut buf).await.unwrap();
                assert_eq!(n, 4096);
                check_range(&buf, 5, i * 8);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(rc.backend_fetches(), 1);

        rc.shutdown().await;
    }

    #[tokio::test]
    async fn test_ssd_hit_after_buffer_steal() {
        let mut rig = Rig::new(16);
        // Small RAM pool: the 13th fill steals the oldest buffer (obj 1's).
        rig.cfg.max_line_bufs = 12;
        for obj in 1..=13 {
            make_obj(&rig.backend, &rig.info, obj, 128).await;
        }
        let rc = rig.open();

        let mut buf = vec![0u8; 4096];
        for obj in 1..=13 {
            rc.read(obj, 0, &mut buf).await.unwrap();
        }
        assert_eq!(rc.backend_fetches(), 13);

        // Obj 1's line is no longer in RAM but is durable on the device.
        let n = rc.read(1, 16, &mut buf).await.unwrap();
        assert_eq!(n, 4096);
        check_range(&buf, 1, 16);
        assert_eq!(rc.backend_fetches(), 13);

        rc.shutdown().await;
    }

    #[tokio::test]
    async fn test_steal_skips_undurable_victim() {
        let mut rig = Rig::new(32);
        rig.cfg.max_line_bufs = 13;
        for obj in 1..=14 {
            make_obj(&rig.backend, &rig.info, obj, 128).await;
        }
        let rc = rig.open();

        let mut buf = vec![0u8; 4096];
        for obj in 1..=13 {
            rc.read(obj, 0, &mut buf).await.unwrap();
        }

        // Leave the oldest pool entry the way a still-running line write
        // does: buffer published, staging pin held, not yet durable.
        let (front, second) = {
            let mut inner = rc.inner.lock();
            let front = inner.buf_loc[0];
            let second = inner.buf_loc[1];
            inner.written[front] = false;
            inner.in_use[front] += 1;
            (front, second)
        };

        // The next fill needs a buffer; it must steal around the undurable
        // front entry and take the oldest durable one instead.
        let n = rc.read(14, 0, &mut buf).await.unwrap();
        assert_eq!(n, 4096);
        check_range(&buf, 14, 0);
        {
            let mut inner = rc.inner.lock();
            assert!(
                inner.buffer[front].is_some(),
                "undurable buffer was stolen"
            );
            assert!(
                inner.buffer[second].is_none(),
                "oldest durable buffer was kept"
            );
            // Complete the simulated write so shutdown bookkeeping is sane.
            inner.written[front] = true;
            inner.in_use[front] -= 1;
        }

        rc.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_fills_with_small_buffer_pool() {
        let mut rig = Rig::new(64);
        // Pool smaller than the read storm: fills churn the FIFO and steal
        // buffers while other fills are still staging their lines.
        rig.cfg.max_line_bufs = 13;
        for obj in 1..=40 {
            make_obj(&rig.backend, &rig.info, obj, 128).await;
        }
        let rc = rig.open();

        let mut tasks = Vec::new();
        for obj in 1..=40u32 {
            let rc = rc.clone();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = rc.read(obj, 16, &mut buf).await.unwrap();
                assert_eq!(n, 4096);
                check_range(&buf, obj, 16);
            }));
        }
        for t in tasks {
            // A lost wakeup shows up as a hang; fail instead.
            tokio::time::timeout(Duration::from_secs(10), t)
                .await
                .expect("read hung waiting on a line fill")
                .unwrap();
        }
        assert_eq!(rc.outstanding_writes(), 0);

        rc.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_around_when_no_free_slot() {
        let rig = Rig::new(2);
        for obj in 1..=3 {
            make_obj(&rig.backend, &rig.info, obj, 128).await;
        }
        let rc = rig.open();

        let mut buf = vec![0u8; 4096];
        rc.read(1, 0, &mut buf).await.unwrap();
        rc.read(2, 0, &mut buf).await.unwrap();
        assert_eq!(rc.free_slots(), 0);

        // No slot left: served read-around, not an error, nothing cached.
        rc.read(3, 0, &mut buf).await.unwrap();
        check_range(&buf, 3, 0);
        assert_eq!(rc.cached_lines(), 2);
        assert_eq!(rc.backend_fetches(), 3);

        rc.shutdown().await;
    }

    #[tokio::test]
    async fn test_eviction_replenishes_free_list() {
        let mut rig = Rig::new(32);
        // Small RAM pool so most filled lines end up idle (in_use == 0).
        rig.cfg.max_line_bufs = 12;
        rig.cfg.evict_tick = Duration::from_millis(50);

        for obj in 1..=31 {
            make_obj(&rig.backend, &rig.info, obj, 128).await;
        }
        let rc = rig.open();

        let mut buf = vec![0u8; 4096];
        for obj in 1..=31 {
            rc.read(obj, 0, &mut buf).await.unwrap();
        }
        // free = 1 < 32/16: the ticker should evict back up to 32/4 free.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(rc.free_slots() >= 8, "free = {}", rc.free_slots());

        rc.shutdown().await;
    }

    #[tokio::test]
    async fn test_warm_restart_serves_from_device() {
        let rig = Rig::new(16);
        make_obj(&rig.backend, &rig.info, 1, 128).await;
        {
            let rc = rig.open();
            let mut buf = vec![0u8; 4096];
            rc.read(1, 0, &mut buf).await.unwrap();
            assert_eq!(rc.backend_fetches(), 1);
            rc.shutdown().await; // persists the flat map
        }

        let rc = rig.open();
        assert_eq!(rc.cached_lines(), 1);
        let mut buf = vec![0u8; 4096];
        let n = rc.read(1, 8, &mut buf).await.unwrap();
        assert_eq!(n, 4096);
        check_range(&buf, 1, 8);
        // Served from the cache device, no backend traffic.
        assert_eq!(rc.backend_fetches(), 0);

        rc.shutdown().await;
    }

    #[tokio::test]
    async fn test_short_object_tail_zero_padded() {
        let rig = Rig::new(16);
        // 10 sectors of data; the line extends past the object's end.
        make_obj(&rig.backend, &rig.info, 1, 10).await;
        let rc = rig.open();

        let mut buf = vec![0u8; 8 * SECTOR_SIZE];
        let n = rc.read(1, 4, &mut buf).await.unwrap();
        assert_eq!(n, 8 * SECTOR_SIZE);
        check_range(&buf[..6 * SECTOR_SIZE], 1, 4);
        assert_eq!(&buf[6 * SECTOR_SIZE..], &[0u8; 2 * SECTOR_SIZE][..]);

        rc.shutdown().await;
    }

    #[tokio::test]
    async fn test_outstanding_writes_settle() {
        let rig = Rig::new(32);
        for obj in 1..=8 {
            make_obj(&rig.backend, &rig.info, obj, 128).await;
        }
        let rc = rig.open();

        let mut tasks = Vec::new();
        for obj in 1..=8u32 {
            let rc = rc.clone();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                rc.read(obj, 0, &mut buf).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(rc.outstanding_writes(), 0);
        assert!(rc.outstanding_writes() <= rig.cfg.max_line_bufs);

        rc.shutdown().await;
    }
}
