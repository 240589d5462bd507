//! On-disk object formats: superblock, data object, checkpoint.
//!
//! Every object begins with a fixed 40-byte header carrying magic, version,
//! type, volume UUID, sequence, and the header/data sector counts, followed
//! by a type-specific header and `(offset, len)`-addressed variable arrays.
//! Offsets are measured from byte 0 of the object so readers never parse
//! sequentially. Multi-byte fields are little-endian.
//!
//! Decoders parse into owned structs and reject mismatched magic, version,
//! or type; they never partially mutate caller state.

use crate::{div_round_up, LsvdError, LsvdResult, SECTOR_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

pub const OBJ_MAGIC: u32 = 0x4C53_5644; // "LSVD"
pub const OBJ_VERSION: u32 = 1;

/// Size of the fixed header prefix.
pub const FIXED_HDR_BYTES: usize = 40;

/// Object kinds sharing the sequence-number namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjType {
    Super = 1,
    Data = 2,
    Ckpt = 3,
}

impl TryFrom<u32> for ObjType {
    type Error = LsvdError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ObjType::Super),
            2 => Ok(ObjType::Data),
            3 => Ok(ObjType::Ckpt),
            other => Err(LsvdError::InvalidObject(format!(
                "unknown object type {other}"
            ))),
        }
    }
}

/// The fixed header present on every object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjHeader {
    pub uuid: Uuid,
    pub otype: ObjType,
    pub seq: u32,
    pub hdr_sectors: u32,
    pub data_sectors: u32,
}

/// One entry of a data object's logical placement map: `len` sectors of
/// payload belonging at `lba`, in payload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataMapEntry {
    pub lba: u64,
    pub len: u32,
}

pub const DATA_MAP_ENTRY_BYTES: usize = 12;

/// GC accounting: sectors of `seq` superseded by this object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjCleaned {
    pub seq: u32,
    pub deleted_sectors: u32,
}

/// Decoded data-object header.
#[derive(Debug, Clone)]
pub struct DataObjHeader {
    pub hdr: ObjHeader,
    pub last_data_obj: u32,
    pub ckpts: Vec<u32>,
    pub cleaned: Vec<ObjCleaned>,
    pub data_map: Vec<DataMapEntry>,
}

/// Per-object record carried by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CkptObjInfo {
    pub seq: u32,
    pub hdr_sectors: u32,
    pub data_sectors: u32,
    pub live_sectors: u32,
}

/// One flattened object-map extent carried by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CkptMapEntry {
    pub lba: i64,
    pub len: i64,
    pub obj: u32,
    pub offset: u32,
}

/// Decoded checkpoint object.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub hdr: ObjHeader,
    pub ckpts: Vec<u32>,
    pub objects: Vec<CkptObjInfo>,
    pub deletes: Vec<u32>,
    pub map: Vec<CkptMapEntry>,
}

/// A writable clone anchored at a sequence of this volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneInfo {
    pub uuid: Uuid,
    pub base_seq: u32,
    pub name: String,
}

/// A point-in-time snapshot anchored at a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapInfo {
    pub uuid: Uuid,
    pub seq: u32,
}

/// Decoded superblock: the volume's recovery anchor, object 0.
#[derive(Debug, Clone)]
pub struct SuperBlock {
    pub uuid: Uuid,
    pub vol_size: u64, // sectors
    pub next_obj: u32,
    pub ckpts: Vec<u32>,
    pub clones: Vec<CloneInfo>,
    pub snaps: Vec<SnapInfo>,
}

fn put_fixed(buf: &mut BytesMut, uuid: &Uuid, otype: ObjType, seq: u32) {
    buf.put_u32_le(OBJ_MAGIC);
    buf.put_u32_le(OBJ_VERSION);
    buf.put_u32_le(otype as u32);
    buf.put_slice(uuid.as_bytes());
    buf.put_u32_le(seq);
    buf.put_u32_le(0); // hdr_sectors, patched below
    buf.put_u32_le(0); // data_sectors, patched below
}

fn patch_sectors(buf: &mut [u8], hdr_sectors: u32, data_sectors: u32) {
    buf[32..36].copy_from_slice(&hdr_sectors.to_le_bytes());
    buf[36..40].copy_from_slice(&data_sectors.to_le_bytes());
}

fn pad_to_sector(buf: &mut BytesMut) -> u32 {
    let sectors = div_round_up(buf.len(), SECTOR_SIZE);
    buf.resize(sectors * SECTOR_SIZE, 0);
    sectors as u32
}

fn slice(buf: &[u8], off: usize, len: usize) -> LsvdResult<&[u8]> {
    buf.get(off..off + len)
        .ok_or_else(|| LsvdError::InvalidObject(format!("array [{off}, +{len}) out of bounds")))
}

fn get_u32(buf: &[u8], off: usize) -> LsvdResult<u32> {
    Ok(u32::from_le_bytes(slice(buf, off, 4)?.try_into().unwrap()))
}

fn get_u64(buf: &[u8], off: usize) -> LsvdResult<u64> {
    Ok(u64::from_le_bytes(slice(buf, off, 8)?.try_into().unwrap()))
}

/// Parse and validate the fixed header prefix.
pub fn parse_header(buf: &[u8]) -> LsvdResult<ObjHeader> {
    if buf.len() < FIXED_HDR_BYTES {
        return Err(LsvdError::ShortRead {
            wanted: FIXED_HDR_BYTES,
            got: buf.len(),
        });
    }
    let magic = get_u32(buf, 0)?;
    if magic != OBJ_MAGIC {
        return Err(LsvdError::InvalidObject(format!("bad magic {magic:#x}")));
    }
    let version = get_u32(buf, 4)?;
    if version != OBJ_VERSION {
        return Err(LsvdError::InvalidObject(format!(
            "unsupported version {version}"
        )));
    }
    let otype = ObjType::try_from(get_u32(buf, 8)?)?;
    let uuid = Uuid::from_slice(slice(buf, 12, 16)?)
        .map_err(|e| LsvdError::InvalidObject(format!("bad uuid: {e}")))?;
    Ok(ObjHeader {
        uuid,
        otype,
        seq: get_u32(buf, 28)?,
        hdr_sectors: get_u32(buf, 32)?,
        data_sectors: get_u32(buf, 36)?,
    })
}

fn expect_type(hdr: &ObjHeader, want: ObjType) -> LsvdResult<()> {
    if hdr.otype != want {
        return Err(LsvdError::InvalidObject(format!(
            "expected {want:?} object, found {:?}",
            hdr.otype
        )));
    }
    Ok(())
}

/// Encode a superblock object.
pub fn encode_superblock(sb: &SuperBlock) -> Bytes {
    let mut buf = BytesMut::new();
    put_fixed(&mut buf, &sb.uuid, ObjType::Super, 0);
    buf.put_u64_le(sb.vol_size);
    buf.put_u32_le(sb.next_obj);

    // Offset/len table, patched after the arrays are laid down.
    let table_at = buf.len();
    for _ in 0..6 {
        buf.put_u32_le(0);
    }

    let ckpts_off = buf.len() as u32;
    for c in &sb.ckpts {
        buf.put_u32_le(*c);
    }
    let ckpts_len = buf.len() as u32 - ckpts_off;

    let clones_off = buf.len() as u32;
    for c in &sb.clones {
        buf.put_slice(c.uuid.as_bytes());
        buf.put_u32_le(c.base_seq);
        buf.put_u16_le(c.name.len() as u16);
        buf.put_slice(c.name.as_bytes());
    }
    let clones_len = buf.len() as u32 - clones_off;

    let snaps_off = buf.len() as u32;
    for s in &sb.snaps {
        buf.put_slice(s.uuid.as_bytes());
        buf.put_u32_le(s.seq);
    }
    let snaps_len = buf.len() as u32 - snaps_off;

    let table = [
        ckpts_off, ckpts_len, clones_off, clones_len, snaps_off, snaps_len,
    ];
    for (i, v) in table.iter().enumerate() {
        buf[table_at + i * 4..table_at + i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }

    let sectors = pad_to_sector(&mut buf);
    patch_sectors(&mut buf, sectors, 0);
    buf.freeze()
}

/// Decode a superblock object.
pub fn parse_superblock(buf: &[u8]) -> LsvdResult<SuperBlock> {
    let hdr = parse_header(buf)?;
    expect_type(&hdr, ObjType::Super)?;

    let vol_size = get_u64(buf, 40)?;
    let next_obj = get_u32(buf, 48)?;
    let ckpts_off = get_u32(buf, 52)? as usize;
    let ckpts_len = get_u32(buf, 56)? as usize;
    let clones_off = get_u32(buf, 60)? as usize;
    let clones_len = get_u32(buf, 64)? as usize;
    let snaps_off = get_u32(buf, 68)? as usize;
    let snaps_len = get_u32(buf, 72)? as usize;

    let mut ckpts = Vec::with_capacity(ckpts_len / 4);
    for i in (0..ckpts_len).step_by(4) {
        ckpts.push(get_u32(buf, ckpts_off + i)?);
    }

    let mut clones = Vec::new();
    let clone_bytes = slice(buf, clones_off, clones_len)?;
    let mut pos = 0;
    while pos < clone_bytes.len() {
        if pos + 22 > clone_bytes.len() {
            return Err(LsvdError::InvalidObject("truncated clone record".into()));
        }
        let uuid = Uuid::from_slice(&clone_bytes[pos..pos + 16]).unwrap();
        let base_seq = u32::from_le_bytes(clone_bytes[pos + 16..pos + 20].try_into().unwrap());
        let name_len =
            u16::from_le_bytes(clone_bytes[pos + 20..pos + 22].try_into().unwrap()) as usize;
        if pos + 22 + name_len > clone_bytes.len() {
            return Err(LsvdError::InvalidObject("truncated clone name".into()));
        }
        let name = String::from_utf8(clone_bytes[pos + 22..pos + 22 + name_len].to_vec())
            .map_err(|e| LsvdError::InvalidObject(format!("bad clone name: {e}")))?;
        clones.push(CloneInfo {
            uuid,
            base_seq,
            name,
        });
        pos += 22 + name_len;
    }

    let mut snaps = Vec::with_capacity(snaps_len / 20);
    for i in (0..snaps_len).step_by(20) {
        let uuid = Uuid::from_slice(slice(buf, snaps_off + i, 16)?).unwrap();
        let seq = get_u32(buf, snaps_off + i + 16)?;
        snaps.push(SnapInfo { uuid, seq });
    }

    Ok(SuperBlock {
        uuid: hdr.uuid,
        vol_size,
        next_obj,
        ckpts,
        clones,
        snaps,
    })
}

/// Encode a data object's header section (the payload is uploaded alongside,
/// not copied here).
pub fn encode_data_hdr(
    uuid: &Uuid,
    seq: u32,
    last_ckpt: u32,
    data_map: &[DataMapEntry],
    data_sectors: u32,
) -> Bytes {
    let mut buf = BytesMut::new();
    put_fixed(&mut buf, uuid, ObjType::Data, seq);
    buf.put_u32_le(seq); // last_data_obj

    let table_at = buf.len();
    for _ in 0..6 {
        buf.put_u32_le(0);
    }

    let ckpts_off = buf.len() as u32;
    buf.put_u32_le(last_ckpt);
    let ckpts_len = 4u32;

    // No cleaned-object accounting until a garbage collector produces it.
    let cleaned_off = buf.len() as u32;
    let cleaned_len = 0u32;

    let map_off = buf.len() as u32;
    for e in data_map {
        buf.put_u64_le(e.lba);
        buf.put_u32_le(e.len);
    }
    let map_len = buf.len() as u32 - map_off;

    let table = [
        ckpts_off,
        ckpts_len,
        cleaned_off,
        cleaned_len,
        map_off,
        map_len,
    ];
    for (i, v) in table.iter().enumerate() {
        buf[table_at + i * 4..table_at + i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }

    let sectors = pad_to_sector(&mut buf);
    patch_sectors(&mut buf, sectors, data_sectors);
    buf.freeze()
}

/// Decode a data-object header.
pub fn parse_data_hdr(buf: &[u8]) -> LsvdResult<DataObjHeader> {
    let hdr = parse_header(buf)?;
    expect_type(&hdr, ObjType::Data)?;

    let last_data_obj = get_u32(buf, 40)?;
    let ckpts_off = get_u32(buf, 44)? as usize;
    let ckpts_len = get_u32(buf, 48)? as usize;
    let cleaned_off = get_u32(buf, 52)? as usize;
    let cleaned_len = get_u32(buf, 56)? as usize;
    let map_off = get_u32(buf, 60)? as usize;
    let map_len = get_u32(buf, 64)? as usize;

    let mut ckpts = Vec::with_capacity(ckpts_len / 4);
    for i in (0..ckpts_len).step_by(4) {
        ckpts.push(get_u32(buf, ckpts_off + i)?);
    }

    let mut cleaned = Vec::with_capacity(cleaned_len / 8);
    for i in (0..cleaned_len).step_by(8) {
        cleaned.push(ObjCleaned {
            seq: get_u32(buf, cleaned_off + i)?,
            deleted_sectors: get_u32(buf, cleaned_off + i + 4)?,
        });
    }

    let mut data_map = Vec::with_capacity(map_len / DATA_MAP_ENTRY_BYTES);
    for i in (0..map_len).step_by(DATA_MAP_ENTRY_BYTES) {
        data_map.push(DataMapEntry {
            lba: get_u64(buf, map_off + i)?,
            len: get_u32(buf, map_off + i + 8)?,
        });
    }

    Ok(DataObjHeader {
        hdr,
        last_data_obj,
        ckpts,
        cleaned,
        data_map,
    })
}

/// Encode a complete checkpoint object.
pub fn encode_checkpoint(
    uuid: &Uuid,
    seq: u32,
    objects: &[CkptObjInfo],
    deletes: &[u32],
    map: &[CkptMapEntry],
) -> Bytes {
    let mut buf = BytesMut::new();
    put_fixed(&mut buf, uuid, ObjType::Ckpt, seq);

    let table_at = buf.len();
    for _ in 0..8 {
        buf.put_u32_le(0);
    }

    let ckpts_off = buf.len() as u32;
    buf.put_u32_le(seq);
    let ckpts_len = 4u32;

    let objs_off = buf.len() as u32;
    for o in objects {
        buf.put_u32_le(o.seq);
        buf.put_u32_le(o.hdr_sectors);
        buf.put_u32_le(o.data_sectors);
        buf.put_u32_le(o.live_sectors);
    }
    let objs_len = buf.len() as u32 - objs_off;

    let deletes_off = buf.len() as u32;
    for d in deletes {
        buf.put_u32_le(*d);
    }
    let deletes_len = buf.len() as u32 - deletes_off;

    let map_off = buf.len() as u32;
    for m in map {
        buf.put_i64_le(m.lba);
        buf.put_i64_le(m.len);
        buf.put_u32_le(m.obj);
        buf.put_u32_le(m.offset);
    }
    let map_len = buf.len() as u32 - map_off;

    let table = [
        ckpts_off,
        ckpts_len,
        objs_off,
        objs_len,
        deletes_off,
        deletes_len,
        map_off,
        map_len,
    ];
    for (i, v) in table.iter().enumerate() {
        buf[table_at + i * 4..table_at + i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }

    let sectors = pad_to_sector(&mut buf);
    patch_sectors(&mut buf, sectors, 0);
    buf.freeze()
}

/// Decode a checkpoint object.
pub fn parse_checkpoint(buf: &[u8]) -> LsvdResult<Checkpoint> {
    let hdr = parse_header(buf)?;
    expect_type(&hdr, ObjType::Ckpt)?;

    let ckpts_off = get_u32(buf, 40)? as usize;
    let ckpts_len = get_u32(buf, 44)? as usize;
    let objs_off = get_u32(buf, 48)? as usize;
    let objs_len = get_u32(buf, 52)? as usize;
    let deletes_off = get_u32(buf, 56)? as usize;
    let deletes_len = get_u32(buf, 60)? as usize;
    let map_off = get_u32(buf, 64)? as usize;
    let map_len = get_u32(buf, 68)? as usize;

    let mut ckpts = Vec::with_capacity(ckpts_len / 4);
    for i in (0..ckpts_len).step_by(4) {
        ckpts.push(get_u32(buf, ckpts_off + i)?);
    }

    let mut objects = Vec::with_capacity(objs_len / 16);
    for i in (0..objs_len).step_by(16) {
        objects.push(CkptObjInfo {
            seq: get_u32(buf, objs_off + i)?,
            hdr_sectors: get_u32(buf, objs_off + i + 4)?,
            data_sectors: get_u32(buf, objs_off + i + 8)?,
            live_sectors: get_u32(buf, objs_off + i + 12)?,
        });
    }

    let mut deletes = Vec::with_capacity(deletes_len / 4);
    for i in (0..deletes_len).step_by(4) {
        deletes.push(get_u32(buf, deletes_off + i)?);
    }

    let mut map = Vec::with_capacity(map_len / 24);
    for i in (0..map_len).step_by(24) {
        map.push(CkptMapEntry {
            lba: get_u64(buf, map_off + i)? as i64,
            len: get_u64(buf, map_off + i + 8)? as i64,
            obj: get_u32(buf, map_off + i + 16)?,
            offset: get_u32(buf, map_off + i + 20)?,
        });
    }

    Ok(Checkpoint {
        hdr,
        ckpts,
        objects,
        deletes,
        map,
    })
}
