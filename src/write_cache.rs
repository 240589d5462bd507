//! Write cache: a journaled write-back cache in front of the translation
//! layer.
//!
//! Every accepted write is persisted as a frame in a circular journal on the
//! cache device and handed to the translation layer before the caller's ack
//! resolves; the backend object is cut later. Writer tasks drain the pending
//! queue, coalescing queued writes into one vectored frame per cycle. A
//! reclaim task advances `oldest` past frames whose translation-layer
//! batches the backend has acknowledged.
//!
//! Crash contract: scanning the journal from `oldest` forward, each `Data`
//! frame supplies `(lba, len, nvme_block)` for the cache map and its payload
//! for replay into the translation layer, so every acknowledged write
//! survives a restart.

use crate::extent::ExtentMap;
use crate::journal::{
    self, JBlockType, JExtent, JournalFrame, WriteSuper, FRAME_HDR_BYTES, J_EXTENT_BYTES,
};
use crate::nvme::NvmeDev;
use crate::translate::Translate;
use crate::{div_round_up, Lba, LsvdError, LsvdResult, JOURNAL_BLOCK, SECTOR_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

/// Writer tasks draining the pending queue.
const N_WRITERS: usize = 4;

/// Items coalesced into one frame; keeps the extent array inside the header
/// block.
const MAX_FRAME_ITEMS: usize = (JOURNAL_BLOCK - FRAME_HDR_BYTES) / J_EXTENT_BYTES;

struct WcWork {
    lba: Lba,
    data: Bytes,
    ack: oneshot::Sender<LsvdResult<()>>,
}

/// An unreclaimed journal frame and the highest translation batch its items
/// landed in.
struct FrameRecord {
    jseq: u64,
    block: u32,
    batch_seq: u32,
}

struct WcInner {
    q: VecDeque<WcWork>,
    next: u32,
    oldest: u32,
    oldest_seq: u64,
    seq: u64,
    map: ExtentMap<Lba>,
    frames: VecDeque<FrameRecord>,
}

/// One drain cycle's worth of work, carved out under the lock.
struct Cycle {
    items: Vec<WcWork>,
    blockno: u32,
    blocks: u32, // payload blocks, header excluded
    pad: Option<(u32, u64)>,
    data_seq: u64,
}

pub struct WriteCache {
    dev: Arc<NvmeDev>,
    translate: Arc<Translate>,
    base: u32,
    limit: u32,
    inner: Mutex<WcInner>,
    work: Notify,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteCache {
    /// Lay out a fresh journal: superblock at block 0, the circular region
    /// covering the rest of the device.
    pub fn format(dev: &NvmeDev, uuid: uuid::Uuid, blocks: u32) -> LsvdResult<()> {
        if blocks < 4 {
            return Err(LsvdError::InvalidArgument(
                "write cache needs at least 4 blocks".into(),
            ));
        }
        let ws = WriteSuper {
            uuid,
            seq: 1,
            oldest_seq: 1,
            base: 1,
            limit: blocks,
            next: 1,
            oldest: 1,
        };
        dev.write_at(&journal::encode_write_super(&ws), 0)?;
        dev.sync()
    }

    /// Open the journal, replay it into the translation layer, and start the
    /// writer and reclaim tasks.
    pub async fn open(dev: NvmeDev, translate: Arc<Translate>) -> LsvdResult<Arc<WriteCache>> {
        let mut block = vec![0u8; JOURNAL_BLOCK];
        dev.read_at(&mut block, 0)?;
        let ws = journal::parse_write_super(&block)?;
        if ws.uuid != translate.uuid() {
            return Err(LsvdError::InvalidObject(
                "write cache belongs to a different volume".into(),
            ));
        }

        let (map, frames, next, seq, replayed) = Self::recover(&dev, &translate, &ws)?;
        if replayed > 0 {
            tracing::info!(frames = replayed, "write cache journal replayed");
        }

        let oldest_seq = frames.front().map(|f: &FrameRecord| f.jseq).unwrap_or(seq);
        let wc = Arc::new(WriteCache {
            dev: Arc::new(dev),
            translate,
            base: ws.base,
            limit: ws.limit,
            inner: Mutex::new(WcInner {
                q: VecDeque::new(),
                next,
                oldest: ws.oldest,
                oldest_seq,
                seq,
                map,
                frames,
            }),
            work: Notify::new(),
            running: AtomicBool::new(true),
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for _ in 0..N_WRITERS {
            let me = wc.clone();
            handles.push(tokio::spawn(async move { me.writer_loop().await }));
        }
        {
            let me = wc.clone();
            let uploaded = me.translate.uploaded_watch();
            handles.push(tokio::spawn(async move { me.reclaim_loop(uploaded).await }));
        }
        *wc.handles.lock() = handles;
        Ok(wc)
    }

    /// Scan the journal from `oldest`, validating magic, CRC, and sequence
    /// continuity. Data frames are applied to the cache map and replayed
    /// into the translation layer in journal order.
    fn recover(
        dev: &NvmeDev,
        translate: &Translate,
        ws: &WriteSuper,
    ) -> LsvdResult<(ExtentMap<Lba>, VecDeque<FrameRecord>, u32, u64, usize)> {
        let mut map = ExtentMap::new();
        let mut frames = VecDeque::new();
        let mut pos = ws.oldest;
        let mut expect_seq = ws.oldest_seq;
        let mut scanned: u32 = 0;
        let region = ws.limit - ws.base;

        loop {
            if pos >= ws.limit {
                pos = ws.base;
            }
            if scanned >= region {
                break;
            }
            let mut block = vec![0u8; JOURNAL_BLOCK];
            dev.read_at(&mut block, pos as u64 * JOURNAL_BLOCK as u64)?;
            let frame = match journal::parse_frame(&block) {
                Ok(f) => f,
                Err(_) => break, // end of valid log
            };
            if frame.uuid != ws.uuid || frame.seq != expect_seq {
                break;
            }
            expect_seq += 1;

            match frame.ftype {
                JBlockType::Pad => {
                    scanned += ws.limit - pos;
                    pos = ws.limit;
                }
                JBlockType::Data => {
                    let mut sect = (pos as u64 + 1) * 8;
                    let mut batch_seq = 0u32;
                    for e in &frame.extents {
                        let bytes = e.len as usize * SECTOR_SIZE;
                        let mut payload = vec![0u8; bytes];
                        dev.read_at(&mut payload, sect * SECTOR_SIZE as u64)?;
                        let bseq = translate.write(e.lba * SECTOR_SIZE as u64, &payload)?;
                        batch_seq = batch_seq.max(bseq);
                        map.update(e.lba as Lba, e.lba as Lba + e.len as Lba, sect as Lba);
                        sect += e.len as u64;
                    }
                    frames.push_back(FrameRecord {
                        jseq: frame.seq,
                        block: pos,
                        batch_seq,
                    });
                    scanned += frame.len_blocks;
                    pos += frame.len_blocks;
                }
                _ => break,
            }
        }

        let next = if pos >= ws.limit { ws.base } else { pos };
        let replayed = frames.len();
        Ok((map, frames, next, expect_seq, replayed))
    }

    /// Queue a write. The returned future resolves once the journal frame is
    /// on the cache device and the write has been handed to the translation
    /// layer; the backend object is cut later.
    pub async fn write(&self, offset: u64, data: &[u8]) -> LsvdResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LsvdError::Shutdown);
        }
        if offset % SECTOR_SIZE as u64 != 0 || data.len() % SECTOR_SIZE != 0 || data.is_empty() {
            return Err(LsvdError::InvalidArgument(format!(
                "offset {offset} / length {} not a positive sector multiple",
                data.len()
            )));
        }
        let blocks = div_round_up(data.len() / SECTOR_SIZE, 8) as u32;
        if blocks + 1 > self.limit - self.base {
            return Err(LsvdError::InvalidArgument(
                "write larger than the journal region".into(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.q.push_back(WcWork {
                lba: (offset / SECTOR_SIZE as u64) as Lba,
                data: Bytes::copy_from_slice(data),
                ack: tx,
            });
        }
        self.work.notify_one();
        rx.await.map_err(|_| LsvdError::Shutdown)?
    }

    /// Cache-map extents over `[base, limit)` (testing and introspection).
    pub fn map_extents(&self, base: Lba, limit: Lba) -> Vec<(Lba, Lba, Lba)> {
        self.inner.lock().map.iterate(base, limit)
    }

    /// Oldest unreclaimed journal block (testing and introspection).
    pub fn oldest(&self) -> u32 {
        self.inner.lock().oldest
    }

    fn take_work(&self, inner: &mut WcInner) -> Option<Cycle> {
        if inner.q.is_empty() {
            return None;
        }
        let mut items = Vec::new();
        let mut sectors: usize = 0;
        while let Some(w) = inner.q.front() {
            let s = w.data.len() / SECTOR_SIZE;
            let blocks = div_round_up(sectors + s, 8) as u32;
            if !items.is_empty()
                && (items.len() >= MAX_FRAME_ITEMS || blocks + 1 > self.limit - self.base)
            {
                break;
            }
            sectors += s;
            items.push(inner.q.pop_front().expect("front checked above"));
        }

        let blocks = div_round_up(sectors, 8) as u32;
        let mut pad = None;
        if self.limit - inner.next < blocks + 1 {
            // A pad frame marks the unused tail, except when the region was
            // filled exactly and there is no tail to mark.
            if inner.next < self.limit {
                pad = Some((inner.next, inner.seq));
                inner.seq += 1;
            }
            inner.next = self.base;
        }
        let blockno = inner.next;
        inner.next += blocks + 1;
        let data_seq = inner.seq;
        inner.seq += 1;

        Some(Cycle {
            items,
            blockno,
            blocks,
            pad,
            data_seq,
        })
    }

    async fn commit(&self, c: Cycle) {
        let uuid = self.translate.uuid();

        if let Some((pad_block, pad_seq)) = c.pad {
            let hdr = journal::encode_frame(&JournalFrame {
                ftype: JBlockType::Pad,
                uuid,
                seq: pad_seq,
                len_blocks: self.limit - pad_block,
                extents: vec![],
            });
            if let Err(e) = self
                .dev
                .write_at(&hdr, pad_block as u64 * JOURNAL_BLOCK as u64)
            {
                tracing::error!(error = %e, "journal pad write failed");
            }
        }

        let extents: Vec<JExtent> = c
            .items
            .iter()
            .map(|w| JExtent {
                lba: w.lba as u64,
                len: (w.data.len() / SECTOR_SIZE) as u32,
            })
            .collect();
        let hdr = journal::encode_frame(&JournalFrame {
            ftype: JBlockType::Data,
            uuid,
            seq: c.data_seq,
            len_blocks: 1 + c.blocks,
            extents,
        });

        let frame_bytes = (1 + c.blocks) as usize * JOURNAL_BLOCK;
        let mut frame = BytesMut::with_capacity(frame_bytes);
        frame.put_slice(&hdr);
        for w in &c.items {
            frame.put_slice(&w.data);
        }
        frame.resize(frame_bytes, 0);

        if let Err(e) = self
            .dev
            .write_at(&frame, c.blockno as u64 * JOURNAL_BLOCK as u64)
        {
            tracing::error!(error = %e, "journal frame write failed");
            for w in c.items {
                let _ = w.ack.send(Err(LsvdError::NvmeIo(format!(
                    "journal frame write failed: {e}"
                ))));
            }
            return;
        }

        // Journal frame is durable; hand each write to the translation layer
        // and index it, then ack.
        let mut sect = (c.blockno as Lba + 1) * 8;
        let mut batch_seq = 0u32;
        for w in c.items {
            let sectors = (w.data.len() / SECTOR_SIZE) as Lba;
            match self
                .translate
                .write(w.lba as u64 * SECTOR_SIZE as u64, &w.data)
            {
                Ok(bseq) => {
                    batch_seq = batch_seq.max(bseq);
                    let mut inner = self.inner.lock();
                    inner.map.update(w.lba, w.lba + sectors, sect);
                    drop(inner);
                    let _ = w.ack.send(Ok(()));
                }
                Err(e) => {
                    // Frame stays unreclaimable; the engine is halting.
                    batch_seq = u32::MAX;
                    let _ = w.ack.send(Err(e));
                }
            }
            sect += sectors;
        }

        // Writers can finish out of order; keep the record list in journal
        // order so reclamation advances `oldest` along the scan path.
        let mut inner = self.inner.lock();
        let at = inner.frames.partition_point(|f| f.jseq < c.data_seq);
        inner.frames.insert(
            at,
            FrameRecord {
                jseq: c.data_seq,
                block: c.blockno,
                batch_seq,
            },
        );
    }

    async fn writer_loop(self: Arc<Self>) {
        loop {
            let notified = self.work.notified();
            let cycle = self.take_work(&mut self.inner.lock());
            if let Some(c) = cycle {
                if !self.inner.lock().q.is_empty() {
                    self.work.notify_one();
                }
                self.commit(c).await;
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

    /// Advance `oldest` past frames whose translation batches the backend
    /// has acknowledged, persisting the superblock after each advance.
    async fn reclaim_loop(self: Arc<Self>, mut uploaded: watch::Receiver<u32>) {
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = uploaded.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let watermark = *uploaded.borrow();
            let snapshot = {
                let mut inner = self.inner.lock();
                let mut advanced = false;
                while inner
                    .frames
                    .front()
                    .is_some_and(|f| f.batch_seq <= watermark)
                {
                    inner.frames.pop_front();
                    advanced = true;
                }
                if advanced {
                    inner.oldest = inner.frames.front().map(|f| f.block).unwrap_or(inner.next);
                    inner.oldest_seq = inner.frames.front().map(|f| f.jseq).unwrap_or(inner.seq);
                    Some(self.super_snapshot(&inner))
                } else {
                    None
                }
            };
            if let Some(ws) = snapshot {
                if let Err(e) = self.dev.write_at(&journal::encode_write_super(&ws), 0) {
                    tracing::warn!(error = %e, "write cache superblock update failed");
                } else {
                    tracing::debug!(oldest = ws.oldest, "journal reclaimed");
                }
            }
        }
    }

    fn super_snapshot(&self, inner: &WcInner) -> WriteSuper {
        WriteSuper {
            uuid: self.translate.uuid(),
            seq: inner.seq,
            oldest_seq: inner.oldest_seq,
            base: self.base,
            limit: self.limit,
            next: inner.next,
            oldest: inner.oldest,
        }
    }

    /// Drain the queue, stop the workers, and persist the superblock.
    pub async fn shutdown(&self) {
        self.halt().await;
        let ws = self.super_snapshot(&self.inner.lock());
        if let Err(e) = self.dev.write_at(&journal::encode_write_super(&ws), 0) {
            tracing::warn!(error = %e, "write cache superblock update failed");
        }
        if let Err(e) = self.dev.sync() {
            tracing::warn!(error = %e, "write cache sync failed");
        }
    }

    /// Stop workers without persisting the superblock (crash simulation and
    /// the first half of shutdown). Queued writes still drain first.
    pub(crate) async fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.work.notify_waiters();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for h in handles {
            let _ = h.await;
        }
        // Anything still queued is refused.
        let drained: Vec<WcWork> = self.inner.lock().q.drain(..).collect();
        for w in drained {
            let _ = w.ack.send(Err(LsvdError::Shutdown));
        }
    }
}
