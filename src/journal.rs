//! Cache-device formats: journal frames and the two cache superblocks.
//!
//! The write cache persists incoming writes as frames in a circular region
//! of 4 KiB blocks. A frame is one header block followed by an 8-sector
//! aligned payload. `Data` frames carry an extent array describing the
//! payload's logical placement; `Pad` frames cover the unused tail of the
//! region before allocation wraps. The frame CRC covers the whole header
//! block (extent array included) with the CRC field zeroed, which together
//! with the monotone frame sequence is what crash recovery trusts.

use crate::{div_round_up, LsvdError, LsvdResult, JOURNAL_BLOCK};
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

pub const JOURNAL_MAGIC: u32 = 0x4C53_564A; // "LSVJ"
pub const JOURNAL_VERSION: u8 = 1;

/// Byte size of one journal extent record.
pub const J_EXTENT_BYTES: usize = 12;

/// Fixed frame header bytes before the inline extent array.
pub const FRAME_HDR_BYTES: usize = 46;

const CRC_AT: usize = 34;

/// Journal block kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JBlockType {
    Data = 1,
    Pad = 2,
    WriteSuper = 3,
    ReadSuper = 4,
}

impl TryFrom<u8> for JBlockType {
    type Error = LsvdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(JBlockType::Data),
            2 => Ok(JBlockType::Pad),
            3 => Ok(JBlockType::WriteSuper),
            4 => Ok(JBlockType::ReadSuper),
            other => Err(LsvdError::InvalidObject(format!(
                "unknown journal block type {other}"
            ))),
        }
    }
}

/// Logical placement of one write inside a `Data` frame's payload, in
/// payload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JExtent {
    pub lba: u64,
    pub len: u32, // sectors
}

/// A decoded journal frame header.
#[derive(Debug, Clone)]
pub struct JournalFrame {
    pub ftype: JBlockType,
    pub uuid: Uuid,
    pub seq: u64,
    /// Total frame length in 4 KiB blocks, header included.
    pub len_blocks: u32,
    pub extents: Vec<JExtent>,
}

fn block_prefix(buf: &mut BytesMut, btype: JBlockType, uuid: &Uuid) {
    buf.put_u32_le(JOURNAL_MAGIC);
    buf.put_u8(btype as u8);
    buf.put_u8(JOURNAL_VERSION);
    buf.put_slice(uuid.as_bytes());
}

fn check_prefix(buf: &[u8]) -> LsvdResult<(JBlockType, Uuid)> {
    if buf.len() < JOURNAL_BLOCK {
        return Err(LsvdError::ShortRead {
            wanted: JOURNAL_BLOCK,
            got: buf.len(),
        });
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != JOURNAL_MAGIC {
        return Err(LsvdError::InvalidObject(format!(
            "bad journal magic {magic:#x}"
        )));
    }
    let btype = JBlockType::try_from(buf[4])?;
    if buf[5] != JOURNAL_VERSION {
        return Err(LsvdError::InvalidObject(format!(
            "unsupported journal version {}",
            buf[5]
        )));
    }
    let uuid = Uuid::from_slice(&buf[6..22]).unwrap();
    Ok((btype, uuid))
}

/// Encode a frame header as one 4 KiB block with the extent array inline and
/// the CRC filled in.
pub fn encode_frame(frame: &JournalFrame) -> Bytes {
    debug_assert!(FRAME_HDR_BYTES + frame.extents.len() * J_EXTENT_BYTES <= JOURNAL_BLOCK);

    let mut buf = BytesMut::with_capacity(JOURNAL_BLOCK);
    block_prefix(&mut buf, frame.ftype, &frame.uuid);
    buf.put_u64_le(frame.seq);
    buf.put_u32_le(frame.len_blocks);
    buf.put_u32_le(0); // crc, patched below
    if frame.extents.is_empty() {
        buf.put_u32_le(0);
        buf.put_u32_le(0);
    } else {
        buf.put_u32_le(FRAME_HDR_BYTES as u32);
        buf.put_u32_le((frame.extents.len() * J_EXTENT_BYTES) as u32);
    }
    for e in &frame.extents {
        buf.put_u64_le(e.lba);
        buf.put_u32_le(e.len);
    }
    buf.resize(JOURNAL_BLOCK, 0);

    let crc = crc32c::crc32c(&buf);
    buf[CRC_AT..CRC_AT + 4].copy_from_slice(&crc.to_le_bytes());
    buf.freeze()
}

/// Decode and validate a frame header block. Rejects bad magic, version,
/// type, or CRC.
pub fn parse_frame(buf: &[u8]) -> LsvdResult<JournalFrame> {
    let (ftype, uuid) = check_prefix(buf)?;
    if !matches!(ftype, JBlockType::Data | JBlockType::Pad) {
        return Err(LsvdError::InvalidObject(format!(
            "not a journal frame: {ftype:?}"
        )));
    }

    let stored_crc = u32::from_le_bytes(buf[CRC_AT..CRC_AT + 4].try_into().unwrap());
    let mut zeroed = buf[..JOURNAL_BLOCK].to_vec();
    zeroed[CRC_AT..CRC_AT + 4].fill(0);
    let computed = crc32c::crc32c(&zeroed);
    if stored_crc != computed {
        return Err(LsvdError::InvalidObject(format!(
            "frame crc mismatch: stored {stored_crc:#x}, computed {computed:#x}"
        )));
    }

    let seq = u64::from_le_bytes(buf[22..30].try_into().unwrap());
    let len_blocks = u32::from_le_bytes(buf[30..34].try_into().unwrap());
    let extent_offset = u32::from_le_bytes(buf[38..42].try_into().unwrap()) as usize;
    let extent_len = u32::from_le_bytes(buf[42..46].try_into().unwrap()) as usize;

    let mut extents = Vec::with_capacity(extent_len / J_EXTENT_BYTES);
    if extent_len > 0 {
        if extent_offset + extent_len > JOURNAL_BLOCK {
            return Err(LsvdError::InvalidObject(
                "frame extent array out of bounds".into(),
            ));
        }
        for i in (0..extent_len).step_by(J_EXTENT_BYTES) {
            let at = extent_offset + i;
            extents.push(JExtent {
                lba: u64::from_le_bytes(buf[at..at + 8].try_into().unwrap()),
                len: u32::from_le_bytes(buf[at + 8..at + 12].try_into().unwrap()),
            });
        }
    }

    Ok(JournalFrame {
        ftype,
        uuid,
        seq,
        len_blocks,
        extents,
    })
}

/// Write-cache superblock, block 0 of the write-cache file. The circular
/// journal occupies blocks `[base, limit)`; `next` is the allocation cursor
/// and `oldest` the reclamation cursor. `seq` is the next frame sequence and
/// `oldest_seq` the sequence of the frame at `oldest`, which is what the
/// recovery scan expects first (stale frames from a reclaimed generation
/// fail this check).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSuper {
    pub uuid: Uuid,
    pub seq: u64,
    pub oldest_seq: u64,
    pub base: u32,
    pub limit: u32,
    pub next: u32,
    pub oldest: u32,
}

pub fn encode_write_super(ws: &WriteSuper) -> Bytes {
    let mut buf = BytesMut::with_capacity(JOURNAL_BLOCK);
    block_prefix(&mut buf, JBlockType::WriteSuper, &ws.uuid);
    buf.put_u64_le(ws.seq);
    buf.put_u64_le(ws.oldest_seq);
    buf.put_u32_le(ws.base);
    buf.put_u32_le(ws.limit);
    buf.put_u32_le(ws.next);
    buf.put_u32_le(ws.oldest);
    buf.resize(JOURNAL_BLOCK, 0);
    buf.freeze()
}

pub fn parse_write_super(buf: &[u8]) -> LsvdResult<WriteSuper> {
    let (btype, uuid) = check_prefix(buf)?;
    if btype != JBlockType::WriteSuper {
        return Err(LsvdError::InvalidObject(format!(
            "not a write-cache superblock: {btype:?}"
        )));
    }
    Ok(WriteSuper {
        uuid,
        seq: u64::from_le_bytes(buf[22..30].try_into().unwrap()),
        oldest_seq: u64::from_le_bytes(buf[30..38].try_into().unwrap()),
        base: u32::from_le_bytes(buf[38..42].try_into().unwrap()),
        limit: u32::from_le_bytes(buf[42..46].try_into().unwrap()),
        next: u32::from_le_bytes(buf[46..50].try_into().unwrap()),
        oldest: u32::from_le_bytes(buf[50..54].try_into().unwrap()),
    })
}

/// Read-cache superblock, block 0 of the read-cache file. The flat map
/// occupies blocks `[map_start, map_start + map_blocks)`; cache lines start
/// at block `base`, line `n` at byte `base * 4096 + n * 65536`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSuper {
    pub uuid: Uuid,
    pub unit_sectors: u32,
    pub base: u32,
    pub units: u32,
    pub map_start: u32,
    pub map_blocks: u32,
}

pub fn encode_read_super(rs: &ReadSuper) -> Bytes {
    let mut buf = BytesMut::with_capacity(JOURNAL_BLOCK);
    block_prefix(&mut buf, JBlockType::ReadSuper, &rs.uuid);
    buf.put_u32_le(rs.unit_sectors);
    buf.put_u32_le(rs.base);
    buf.put_u32_le(rs.units);
    buf.put_u32_le(rs.map_start);
    buf.put_u32_le(rs.map_blocks);
    buf.resize(JOURNAL_BLOCK, 0);
    buf.freeze()
}

pub fn parse_read_super(buf: &[u8]) -> LsvdResult<ReadSuper> {
    let (btype, uuid) = check_prefix(buf)?;
    if btype != JBlockType::ReadSuper {
        return Err(LsvdError::InvalidObject(format!(
            "not a read-cache superblock: {btype:?}"
        )));
    }
    Ok(ReadSuper {
        uuid,
        unit_sectors: u32::from_le_bytes(buf[22..26].try_into().unwrap()),
        base: u32::from_le_bytes(buf[26..30].try_into().unwrap()),
        units: u32::from_le_bytes(buf[30..34].try_into().unwrap()),
        map_start: u32::from_le_bytes(buf[34..38].try_into().unwrap()),
        map_blocks: u32::from_le_bytes(buf[38..42].try_into().unwrap()),
    })
}

/// Blocks needed to persist a flat map of `units` entries.
pub fn flat_map_blocks(units: u32) -> u32 {
    div_round_up(units as usize * 8, JOURNAL_BLOCK) as u32
}

/// Serialize the read-cache flat map: one `{obj, line}` pair per slot,
/// `(0, 0)` meaning free, padded to whole blocks.
pub fn encode_flat_map(flat: &[Option<(u32, u32)>]) -> Bytes {
    let mut buf = BytesMut::with_capacity(flat.len() * 8);
    for slot in flat {
        let (obj, line) = slot.unwrap_or((0, 0));
        buf.put_u32_le(obj);
        buf.put_u32_le(line);
    }
    buf.resize(flat_map_blocks(flat.len() as u32) as usize * JOURNAL_BLOCK, 0);
    buf.freeze()
}

/// Deserialize a flat map of `units` entries.
pub fn parse_flat_map(buf: &[u8], units: u32) -> LsvdResult<Vec<Option<(u32, u32)>>> {
    let wanted = units as usize * 8;
    if buf.len() < wanted {
        return Err(LsvdError::ShortRead {
            wanted,
            got: buf.len(),
        });
    }
    let mut flat = Vec::with_capacity(units as usize);
    for i in 0..units as usize {
        let obj = u32::from_le_bytes(buf[i * 8..i * 8 + 4].try_into().unwrap());
        let line = u32::from_le_bytes(buf[i * 8 + 4..i * 8 + 8].try_into().unwrap());
        flat.push(if obj == 0 { None } else { Some((obj, line)) });
    }
    Ok(flat)
}
