//! Translation layer: the logical address space over the object log.
//!
//! Writes accumulate in an in-memory batch; when the batch fills (or a flush
//! or checkpoint seals it) the batch becomes one immutable numbered data
//! object, uploaded by a background worker. The object map tracks where every
//! logical extent currently lives. Checkpoints persist a flattened copy of
//! the map so recovery starts from the newest checkpoint and replays only the
//! data-object headers written after it.
//!
//! Ordering contract: a completed `write` is visible to every subsequent
//! `read` that serializes after it; reads of extents whose object has not
//! been uploaded yet are served from the in-memory copy and never fall
//! through to the backend.

use crate::backend::Backend;
use crate::config::VolumeConfig;
use crate::extent::{ExtentMap, ObjOffset};
use crate::objects::{self, CkptMapEntry, CkptObjInfo, DataMapEntry, ObjType, SuperBlock};
use crate::{Lba, LsvdError, LsvdResult, SECTOR_SIZE};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// In-memory record of a live object; sizes in sectors. `live_sectors`
/// decreases as later writes supersede this object's extents, which is what
/// a garbage collector would consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjInfo {
    pub hdr_sectors: u32,
    pub data_sectors: u32,
    pub live_sectors: u32,
    pub otype: ObjType,
}

/// Shared handle to the per-object info table.
pub type ObjInfoTable = Arc<RwLock<HashMap<u32, ObjInfo>>>;

/// The current batch: payload bytes plus the logical placement of each
/// appended write, in payload order.
struct Batch {
    seq: u32,
    buf: Vec<u8>,
    entries: Vec<DataMapEntry>,
    opened: Instant,
}

/// A sealed batch awaiting upload. `data` is also published in `in_mem` so
/// readers can reach it until the upload completes.
struct SealedBatch {
    seq: u32,
    data: Bytes,
    entries: Vec<DataMapEntry>,
}

struct Inner {
    current: Option<Batch>,
    queue: VecDeque<SealedBatch>,
    in_mem: HashMap<u32, Bytes>,
    batch_seq: u32,
    last_ckpt: u32,
}

/// Tracks which sequences have reached the backend. The watermark is the
/// highest `n` with every sequence `1..=n` durable; the write cache reclaims
/// journal space up to it.
struct UploadTracker {
    done: BTreeSet<u32>,
    watermark: u32,
}

impl UploadTracker {
    fn mark(&mut self, seq: u32) {
        if seq <= self.watermark {
            return;
        }
        self.done.insert(seq);
        while self.done.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
    }
}

/// One backend read produced by the region planner; holes and in-memory
/// extents have already been resolved into the destination buffer.
pub(crate) struct BackendRead {
    pub seq: u32,
    pub hdr_sectors: u32,
    pub sector_off: Lba,
    pub buf_range: Range<usize>,
}

pub struct Translate {
    backend: Arc<Backend>,
    uuid: uuid::Uuid,
    vol_size: u64, // bytes
    batch_size: usize,
    ckpt_interval: u32,

    omap: RwLock<ExtentMap<ObjOffset>>,
    obj_info: ObjInfoTable,
    inner: Mutex<Inner>,
    super_block: Mutex<SuperBlock>,

    work: Notify,
    running: AtomicBool,
    halted: AtomicBool,
    uploads: AtomicU64,
    tracker: Mutex<UploadTracker>,
    uploaded_tx: watch::Sender<u32>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Translate {
    /// Open the volume: read the superblock, replay checkpoints and then
    /// data-object headers, and start the background workers. Returns the
    /// volume size in bytes.
    pub async fn open(
        backend: Arc<Backend>,
        cfg: &VolumeConfig,
    ) -> LsvdResult<(u64, Arc<Translate>)> {
        let (_, sb_buf) = backend
            .get_hdr(0)
            .await?
            .ok_or_else(|| LsvdError::InvalidObject("missing superblock".into()))?;
        let sb = objects::parse_superblock(&sb_buf)?;

        // Recovery builds candidate state and installs it only on success.
        let mut omap = ExtentMap::new();
        let mut obj_info: HashMap<u32, ObjInfo> = HashMap::new();
        let mut last_ckpt = 0u32;

        for &ck in &sb.ckpts {
            let (ch, ck_buf) = backend.get_hdr(ck).await?.ok_or_else(|| {
                LsvdError::InvalidObject(format!("checkpoint {ck} listed but missing"))
            })?;
            let c = objects::parse_checkpoint(&ck_buf)?;
            if c.hdr.uuid != sb.uuid {
                return Err(LsvdError::InvalidObject(format!(
                    "checkpoint {ck} uuid mismatch"
                )));
            }
            for o in &c.objects {
                obj_info.insert(
                    o.seq,
                    ObjInfo {
                        hdr_sectors: o.hdr_sectors,
                        data_sectors: o.data_sectors,
                        live_sectors: o.live_sectors,
                        otype: ObjType::Data,
                    },
                );
            }
            obj_info.insert(
                ck,
                ObjInfo {
                    hdr_sectors: ch.hdr_sectors,
                    data_sectors: 0,
                    live_sectors: 0,
                    otype: ObjType::Ckpt,
                },
            );
            for m in &c.map {
                omap.update(
                    m.lba,
                    m.lba + m.len,
                    ObjOffset {
                        obj: m.obj,
                        offset: m.offset as Lba,
                    },
                );
            }
            last_ckpt = ck;
        }

        // Replay data-object headers written after the newest checkpoint.
        // Each header re-asserts its extents, so replay is idempotent.
        let mut next = if last_ckpt > 0 { last_ckpt + 1 } else { 1 };
        loop {
            let Some((h, buf)) = backend.get_hdr(next).await? else {
                break;
            };
            let Ok(d) = objects::parse_data_hdr(&buf) else {
                // A non-data object (or damage) ends the log.
                break;
            };
            if h.uuid != sb.uuid {
                tracing::warn!(seq = next, "object uuid mismatch, stopping replay");
                break;
            }
            obj_info.insert(
                next,
                ObjInfo {
                    hdr_sectors: h.hdr_sectors,
                    data_sectors: h.data_sectors,
                    live_sectors: h.data_sectors,
                    otype: ObjType::Data,
                },
            );
            let mut off: Lba = 0;
            for m in &d.data_map {
                omap.update(
                    m.lba as Lba,
                    m.lba as Lba + m.len as Lba,
                    ObjOffset {
                        obj: next,
                        offset: off,
                    },
                );
                off += m.len as Lba;
            }
            next += 1;
        }

        let vol_bytes = sb.vol_size * SECTOR_SIZE as u64;
        tracing::info!(
            extents = omap.len(),
            objects = obj_info.len(),
            next_seq = next,
            last_ckpt,
            "translation layer recovered"
        );

        let (uploaded_tx, _) = watch::channel(next - 1);
        let t = Arc::new(Translate {
            backend,
            uuid: sb.uuid,
            vol_size: vol_bytes,
            batch_size: cfg.batch_size,
            ckpt_interval: cfg.ckpt_interval,
            omap: RwLock::new(omap),
            obj_info: Arc::new(RwLock::new(obj_info)),
            inner: Mutex::new(Inner {
                current: None,
                queue: VecDeque::new(),
                in_mem: HashMap::new(),
                batch_seq: next,
                last_ckpt,
            }),
            super_block: Mutex::new(sb),
            work: Notify::new(),
            running: AtomicBool::new(true),
            halted: AtomicBool::new(false),
            uploads: AtomicU64::new(0),
            tracker: Mutex::new(UploadTracker {
                done: BTreeSet::new(),
                watermark: next - 1,
            }),
            uploaded_tx,
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for _ in 0..cfg.upload_workers.max(1) {
            let me = t.clone();
            handles.push(tokio::spawn(async move { me.worker_loop().await }));
        }
        {
            let me = t.clone();
            let tick = cfg.ckpt_tick;
            handles.push(tokio::spawn(async move { me.ckpt_loop(tick).await }));
        }
        {
            let me = t.clone();
            let tick = cfg.flush_tick;
            let timeout = cfg.flush_timeout;
            handles.push(tokio::spawn(async move { me.flush_loop(tick, timeout).await }));
        }
        *t.handles.lock() = handles;

        Ok((vol_bytes, t))
    }

    pub fn uuid(&self) -> uuid::Uuid {
        self.uuid
    }

    pub fn vol_size(&self) -> u64 {
        self.vol_size
    }

    pub fn obj_info(&self) -> ObjInfoTable {
        self.obj_info.clone()
    }

    /// Watch of the highest sequence with every prior sequence durable on
    /// the backend.
    pub fn uploaded_watch(&self) -> watch::Receiver<u32> {
        self.uploaded_tx.subscribe()
    }

    pub fn object_map_len(&self) -> usize {
        self.omap.read().len()
    }

    /// Flattened object-map extents over `[base, limit)` (testing and
    /// introspection).
    pub fn map_extents(&self, base: Lba, limit: Lba) -> Vec<(Lba, Lba, ObjOffset)> {
        self.omap.read().iterate(base, limit)
    }

    /// Data objects uploaded since open.
    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    fn check_writable(&self) -> LsvdResult<()> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(LsvdError::BackendUnavailable);
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(LsvdError::Shutdown);
        }
        Ok(())
    }

    fn check_aligned(offset: u64, len: usize) -> LsvdResult<()> {
        if offset % SECTOR_SIZE as u64 != 0 || len % SECTOR_SIZE != 0 || len == 0 {
            return Err(LsvdError::InvalidArgument(format!(
                "offset {offset} / length {len} not a positive sector multiple"
            )));
        }
        Ok(())
    }

    /// Append a write to the current batch and update the object map.
    /// Returns the sequence of the batch the write landed in.
    pub fn write(&self, offset: u64, data: &[u8]) -> LsvdResult<u32> {
        self.check_writable()?;
        Self::check_aligned(offset, data.len())?;

        let mut inner = self.inner.lock();
        let full = inner
            .current
            .as_ref()
            .is_some_and(|c| c.buf.len() + data.len() > self.batch_size);
        if full {
            self.seal_locked(&mut inner);
        }
        if inner.current.is_none() {
            let seq = inner.batch_seq;
            inner.batch_seq += 1;
            inner.current = Some(Batch {
                seq,
                buf: Vec::with_capacity(self.batch_size.min(data.len().max(1 << 20))),
                entries: Vec::new(),
                opened: Instant::now(),
            });
        }

        let cur = inner.current.as_mut().expect("batch created above");
        let seq = cur.seq;
        let sector_off = (cur.buf.len() / SECTOR_SIZE) as Lba;
        let lba = (offset / SECTOR_SIZE as u64) as Lba;
        let sectors = (data.len() / SECTOR_SIZE) as Lba;
        cur.buf.extend_from_slice(data);
        cur.entries.push(DataMapEntry {
            lba: lba as u64,
            len: sectors as u32,
        });

        {
            let mut omap = self.omap.write();
            // GC bookkeeping: whatever this write displaces loses liveness.
            let displaced: Vec<(u32, Lba)> = omap
                .iterate(lba, lba + sectors)
                .into_iter()
                .map(|(b, l, v)| (v.obj, l - b))
                .collect();
            omap.update(
                lba,
                lba + sectors,
                ObjOffset {
                    obj: seq,
                    offset: sector_off,
                },
            );
            if !displaced.is_empty() {
                let mut info = self.obj_info.write();
                for (obj, sectors) in displaced {
                    if let Some(oi) = info.get_mut(&obj) {
                        oi.live_sectors = oi.live_sectors.saturating_sub(sectors as u32);
                    }
                }
            }
        }
        Ok(seq)
    }

    /// Seal the current batch if it is non-empty. Returns its sequence, or 0
    /// when there was nothing to seal.
    pub fn flush(&self) -> LsvdResult<u32> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        Ok(self.seal_locked(&mut inner))
    }

    fn seal_locked(&self, inner: &mut Inner) -> u32 {
        let Some(b) = inner.current.take() else {
            return 0;
        };
        if b.buf.is_empty() {
            inner.current = Some(b);
            return 0;
        }
        let seq = b.seq;
        let data = Bytes::from(b.buf);
        inner.in_mem.insert(seq, data.clone());
        inner.queue.push_back(SealedBatch {
            seq,
            data,
            entries: b.entries,
        });
        self.work.notify_one();
        seq
    }

    /// Write a checkpoint object carrying the flattened object map, then
    /// re-anchor the superblock at it. Returns the checkpoint's sequence.
    pub async fn checkpoint(&self) -> LsvdResult<u32> {
        self.check_writable()?;

        let (seq, entries, obj_table) = {
            let mut inner = self.inner.lock();
            self.seal_locked(&mut inner);
            let seq = inner.batch_seq;
            inner.batch_seq += 1;
            inner.last_ckpt = seq;

            let omap = self.omap.read();
            let entries: Vec<CkptMapEntry> = omap
                .iterate(0, Lba::MAX)
                .into_iter()
                .map(|(b, l, v)| CkptMapEntry {
                    lba: b,
                    len: l - b,
                    obj: v.obj,
                    offset: v.offset as u32,
                })
                .collect();

            let info = self.obj_info.read();
            let mut obj_table: Vec<CkptObjInfo> = info
                .iter()
                .filter(|(_, oi)| oi.otype == ObjType::Data)
                .map(|(&seq, oi)| CkptObjInfo {
                    seq,
                    hdr_sectors: oi.hdr_sectors,
                    data_sectors: oi.data_sectors,
                    live_sectors: oi.live_sectors,
                })
                .collect();
            obj_table.sort_by_key(|o| o.seq);
            (seq, entries, obj_table)
        };

        let body = objects::encode_checkpoint(&self.uuid, seq, &obj_table, &[], &entries);
        self.obj_info.write().insert(
            seq,
            ObjInfo {
                hdr_sectors: (body.len() / SECTOR_SIZE) as u32,
                data_sectors: 0,
                live_sectors: 0,
                otype: ObjType::Ckpt,
            },
        );
        self.backend.put(seq, vec![body]).await?;

        let sb_bytes = {
            let mut sb = self.super_block.lock();
            sb.ckpts = vec![seq];
            sb.next_obj = self.inner.lock().batch_seq;
            objects::encode_superblock(&sb)
        };
        self.backend.put(0, vec![sb_bytes]).await?;

        self.mark_uploaded(seq);
        tracing::info!(seq, extents = entries.len(), "wrote checkpoint");
        Ok(seq)
    }

    /// Plan a read: resolve holes (zeroed) and in-memory extents (copied)
    /// directly into `buf`, returning the backend reads still needed.
    pub(crate) fn map_regions(
        &self,
        base: Lba,
        limit: Lba,
        buf: &mut [u8],
    ) -> LsvdResult<Vec<BackendRead>> {
        debug_assert_eq!(buf.len(), ((limit - base) as usize) * SECTOR_SIZE);
        let mut reads = Vec::new();

        let inner = self.inner.lock();
        let omap = self.omap.read();
        if omap.is_empty() {
            buf.fill(0);
            return Ok(reads);
        }

        let mut prev = base;
        for (eb, el, v) in omap.iterate(base, limit) {
            if eb > prev {
                let gap = ((prev - base) as usize * SECTOR_SIZE)..((eb - base) as usize * SECTOR_SIZE);
                buf[gap].fill(0);
            }
            let dst = ((eb - base) as usize * SECTOR_SIZE)..((el - base) as usize * SECTOR_SIZE);
            let src_off = v.offset as usize * SECTOR_SIZE;
            let len = dst.len();

            let from_current = inner
                .current
                .as_ref()
                .filter(|c| c.seq == v.obj)
                .map(|c| &c.buf[src_off..src_off + len]);
            if let Some(src) = from_current {
                buf[dst].copy_from_slice(src);
            } else if let Some(mem) = inner.in_mem.get(&v.obj) {
                buf[dst].copy_from_slice(&mem[src_off..src_off + len]);
            } else {
                let info = self.obj_info.read();
                let oi = info.get(&v.obj).ok_or_else(|| {
                    LsvdError::InvalidObject(format!("mapped object {} unknown", v.obj))
                })?;
                reads.push(BackendRead {
                    seq: v.obj,
                    hdr_sectors: oi.hdr_sectors,
                    sector_off: v.offset,
                    buf_range: dst,
                });
            }
            prev = el;
        }
        if prev < limit {
            let tail = ((prev - base) as usize * SECTOR_SIZE)..buf.len();
            buf[tail].fill(0);
        }
        Ok(reads)
    }

    /// Read `buf.len()` bytes at `offset`, zero-filling holes.
    pub async fn read(&self, offset: u64, buf: &mut [u8]) -> LsvdResult<()> {
        Self::check_aligned(offset, buf.len())?;
        let base = (offset / SECTOR_SIZE as u64) as Lba;
        let limit = base + (buf.len() / SECTOR_SIZE) as Lba;

        let reads = self.map_regions(base, limit, buf)?;
        for r in reads {
            let data = self
                .backend
                .get_data(r.seq, r.hdr_sectors, r.sector_off, r.buf_range.len())
                .await?;
            buf[r.buf_range].copy_from_slice(&data);
        }
        Ok(())
    }

    /// Block until every sequence up to `seq` is durable on the backend.
    pub async fn wait_uploaded(&self, seq: u32) -> LsvdResult<()> {
        if seq == 0 {
            return Ok(());
        }
        let mut rx = self.uploaded_tx.subscribe();
        loop {
            if *rx.borrow() >= seq {
                return Ok(());
            }
            if self.halted.load(Ordering::SeqCst) {
                return Err(LsvdError::BackendUnavailable);
            }
            rx.changed().await.map_err(|_| LsvdError::Shutdown)?;
        }
    }

    fn mark_uploaded(&self, seq: u32) {
        let mut tr = self.tracker.lock();
        tr.mark(seq);
        let w = tr.watermark;
        drop(tr);
        self.uploaded_tx.send_replace(w);
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let notified = self.work.notified();
            let job = self.inner.lock().queue.pop_front();
            if let Some(b) = job {
                self.upload(b).await;
                continue;
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    async fn upload(&self, b: SealedBatch) {
        let data_sectors = (b.data.len() / SECTOR_SIZE) as u32;
        let last_ckpt = self.inner.lock().last_ckpt;
        let hdr = objects::encode_data_hdr(&self.uuid, b.seq, last_ckpt, &b.entries, data_sectors);
        self.obj_info.write().insert(
            b.seq,
            ObjInfo {
                hdr_sectors: (hdr.len() / SECTOR_SIZE) as u32,
                data_sectors,
                live_sectors: data_sectors,
                otype: ObjType::Data,
            },
        );

        match self.backend.put(b.seq, vec![hdr, b.data]).await {
            Ok(()) => {
                self.inner.lock().in_mem.remove(&b.seq);
                self.uploads.fetch_add(1, Ordering::Relaxed);
                self.mark_uploaded(b.seq);
                tracing::debug!(seq = b.seq, sectors = data_sectors, "uploaded data object");
            }
            Err(e) => {
                // Fail-stop: leave the in-memory copy readable, refuse new
                // work, wake anyone waiting on the watermark.
                tracing::error!(seq = b.seq, error = %e, "upload failed, halting engine");
                self.halted.store(true, Ordering::SeqCst);
                self.uploaded_tx.send_modify(|_| {});
            }
        }
    }

    async fn ckpt_loop(self: Arc<Self>, tick: Duration) {
        let mut seq0 = self.inner.lock().batch_seq;
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(tick).await;
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let seq = self.inner.lock().batch_seq;
            if seq - seq0 > self.ckpt_interval {
                seq0 = seq;
                match self.checkpoint().await {
                    Ok(seq) => tracing::debug!(seq, "periodic checkpoint"),
                    Err(LsvdError::Shutdown) => return,
                    Err(e) => {
                        tracing::error!(error = %e, "periodic checkpoint failed, halting engine");
                        self.halted.store(true, Ordering::SeqCst);
                        self.uploaded_tx.send_modify(|_| {});
                        return;
                    }
                }
            }
        }
    }

    async fn flush_loop(self: Arc<Self>, tick: Duration, timeout: Duration) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(tick).await;
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let mut inner = self.inner.lock();
            let stale = inner
                .current
                .as_ref()
                .is_some_and(|c| !c.buf.is_empty() && c.opened.elapsed() > timeout);
            if stale {
                let seq = self.seal_locked(&mut inner);
                drop(inner);
                tracing::debug!(seq, "sealed stale batch");
            }
        }
    }

    /// Stop workers and join them. Sealed batches already queued are drained
    /// first; the current batch is not sealed (callers flush first for a
    /// clean shutdown).
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.work.notify_waiters();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for h in handles {
            let _ = h.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::encode_superblock;
    use crate::test_util::mem_store;
    use object_store::ObjectStore;
    use uuid::Uuid;

    const VOL_SECTORS: u64 = 1 << 21; // 1 GiB

    async fn format(store: &Arc<dyn ObjectStore>) {
        let backend = Backend::new(store.clone(), "vol");
        let sb = SuperBlock {
            uuid: Uuid::new_v4(),
            vol_size: VOL_SECTORS,
            next_obj: 1,
            ckpts: vec![],
            clones: vec![],
            snaps: vec![],
        };
        backend.put(0, vec![encode_superblock(&sb)]).await.unwrap();
    }

    async fn open(store: &Arc<dyn ObjectStore>, cfg: &VolumeConfig) -> Arc<Translate> {
        let backend = Arc::new(Backend::new(store.clone(), "vol"));
        let (size, t) = Translate::open(backend, cfg).await.unwrap();
        assert_eq!(size, VOL_SECTORS * 512);
        t
    }

    fn cfg() -> VolumeConfig {
        // Cache paths are unused by the translation layer.
        VolumeConfig::in_memory("/nonexistent")
    }

    #[tokio::test]
    async fn test_open_empty() {
        let store = mem_store();
        format(&store).await;
        let t = open(&store, &cfg()).await;

        assert_eq!(t.object_map_len(), 0);
        let mut buf = vec![0xFFu8; 4096];
        t.read(0, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0u8; 4096]);
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_after_write() {
        let store = mem_store();
        format(&store).await;
        let t = open(&store, &cfg()).await;

        t.write(0, &[b'A'; 4096]).unwrap();
        let mut buf = vec![0u8; 4096];
        t.read(0, &mut buf).await.unwrap();
        assert_eq!(buf, vec![b'A'; 4096]);
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_hole_zeroing_around_extent() {
        let store = mem_store();
        format(&store).await;
        let t = open(&store, &cfg()).await;

        t.write(4096, &[b'B'; 4096]).unwrap();
        let mut buf = vec![0xEEu8; 12288];
        t.read(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..4096], &[0u8; 4096][..]);
        assert_eq!(&buf[4096..8192], &[b'B'; 4096][..]);
        assert_eq!(&buf[8192..], &[0u8; 4096][..]);
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_overwrite_supersedes() {
        let store = mem_store();
        format(&store).await;
        let t = open(&store, &cfg()).await;

        t.write(0, &[1u8; 8192]).unwrap();
        t.write(0, &[2u8; 8192]).unwrap();
        let mut buf = vec![0u8; 8192];
        t.read(0, &mut buf).await.unwrap();
        assert_eq!(buf, vec![2u8; 8192]);
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_partial_overlap_extents() {
        let store = mem_store();
        format(&store).await;
        let t = open(&store, &cfg()).await;

        t.write(0, &[b'A'; 8192]).unwrap();
        t.write(4096, &[b'B'; 4096]).unwrap();

        let mut buf = vec![0u8; 8192];
        t.read(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..4096], &[b'A'; 4096][..]);
        assert_eq!(&buf[4096..], &[b'B'; 4096][..]);

        let ext = t.map_extents(0, 16);
        assert_eq!(
            ext,
            vec![
                (0, 8, ObjOffset { obj: 1, offset: 0 }),
                (8, 16, ObjOffset { obj: 1, offset: 16 }),
            ]
        );
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_adjacent_writes_merge() {
        let store = mem_store();
        format(&store).await;
        let t = open(&store, &cfg()).await;

        t.write(0, &[1u8; 4096]).unwrap();
        t.write(4096, &[2u8; 4096]).unwrap();
        // Same batch, contiguous payload: one extent.
        assert_eq!(t.object_map_len(), 1);
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_returns_seq_and_uploads() {
        let store = mem_store();
        format(&store).await;
        let t = open(&store, &cfg()).await;

        t.write(0, &[b'A'; 4096]).unwrap();
        let seq = t.flush().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(t.flush().unwrap(), 0);

        t.wait_uploaded(seq).await.unwrap();
        assert_eq!(t.uploads(), 1);

        // Served from the backend once the in-memory copy is dropped.
        let mut buf = vec![0u8; 4096];
        t.read(0, &mut buf).await.unwrap();
        assert_eq!(buf, vec![b'A'; 4096]);
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_seals_on_overflow() {
        let store = mem_store();
        format(&store).await;
        let t = open(&store, &cfg().with_batch_size(8192)).await;

        t.write(0, &[1u8; 4096]).unwrap();
        t.write(4096, &[2u8; 4096]).unwrap();
        let seq = t.write(8192, &[3u8; 4096]).unwrap();
        assert_eq!(seq, 2); // third write overflowed into a new batch

        let last = t.flush().unwrap();
        t.wait_uploaded(last).await.unwrap();
        assert_eq!(t.uploads(), 2);

        let mut buf = vec![0u8; 12288];
        t.read(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..4096], &[1u8; 4096][..]);
        assert_eq!(&buf[4096..8192], &[2u8; 4096][..]);
        assert_eq!(&buf[8192..], &[3u8; 4096][..]);
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_replays_data_objects() {
        let store = mem_store();
        format(&store).await;
        {
            let t = open(&store, &cfg()).await;
            t.write(0, &[b'A'; 4096]).unwrap();
            let seq = t.flush().unwrap();
            t.wait_uploaded(seq).await.unwrap();
            t.shutdown().await;
        }

        let t = open(&store, &cfg()).await;
        let mut buf = vec![0u8; 4096];
        t.read(0, &mut buf).await.unwrap();
        assert_eq!(buf, vec![b'A'; 4096]);
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_checkpoint_restart_restores_map() {
        let store = mem_store();
        format(&store).await;

        let before = {
            let t = open(&store, &cfg().with_batch_size(16384)).await;
            for i in 0..8u64 {
                let fill = [i as u8 + 1; 4096];
                t.write(i * 4096, &fill).unwrap();
            }
            let seq = t.flush().unwrap();
            t.wait_uploaded(seq).await.unwrap();
            let ck = t.checkpoint().await.unwrap();
            assert!(ck > seq);
            let map = t.map_extents(0, Lba::MAX);
            t.shutdown().await;
            map
        };

        let t = open(&store, &cfg()).await;
        assert_eq!(t.map_extents(0, Lba::MAX), before);
        for i in 0..8u64 {
            let mut buf = vec![0u8; 4096];
            t.read(i * 4096, &mut buf).await.unwrap();
            assert_eq!(buf, vec![i as u8 + 1; 4096]);
        }
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = mem_store();
        format(&store).await;
        {
            let t = open(&store, &cfg()).await;
            t.write(0, &[5u8; 8192]).unwrap();
            t.write(4096, &[6u8; 4096]).unwrap();
            let seq = t.flush().unwrap();
            t.wait_uploaded(seq).await.unwrap();
            t.shutdown().await;
        }

        let first = {
            let t = open(&store, &cfg()).await;
            let map = t.map_extents(0, Lba::MAX);
            t.shutdown().await;
            map
        };
        let second = {
            let t = open(&store, &cfg()).await;
            let map = t.map_extents(0, Lba::MAX);
            t.shutdown().await;
            map
        };
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_live_sector_accounting() {
        let store = mem_store();
        format(&store).await;
        let t = open(&store, &cfg()).await;

        t.write(0, &[1u8; 8192]).unwrap();
        let seq = t.flush().unwrap();
        t.wait_uploaded(seq).await.unwrap();

        // Overwrite half; object 1 loses 8 live sectors.
        t.write(0, &[2u8; 4096]).unwrap();
        let info = t.obj_info();
        let live = info.read().get(&1).unwrap().live_sectors;
        assert_eq!(live, 8);
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_misaligned_rejected() {
        let store = mem_store();
        format(&store).await;
        let t = open(&store, &cfg()).await;

        assert!(matches!(
            t.write(100, &[0u8; 512]),
            Err(LsvdError::InvalidArgument(_))
        ));
        assert!(matches!(
            t.write(0, &[0u8; 100]),
            Err(LsvdError::InvalidArgument(_))
        ));
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let store = mem_store();
        format(&store).await;
        let t = open(&store, &cfg()).await;
        t.shutdown().await;
        assert!(matches!(
            t.write(0, &[0u8; 512]),
            Err(LsvdError::Shutdown)
        ));
    }
}
