//! Backend adapter: numbered objects on an `ObjectStore`.
//!
//! Objects are named `{prefix}.{seq:08x}`; sequence 0 is the superblock and
//! is named by the prefix alone.

use crate::objects::{self, ObjHeader};
use crate::{Lba, LsvdError, LsvdResult, SECTOR_SIZE};
use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;

pub struct Backend {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl Backend {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
        }
    }

    /// Object-store path of numbered object `seq`.
    pub fn object_name(&self, seq: u32) -> Path {
        if seq == 0 {
            Path::from(self.prefix.as_str())
        } else {
            Path::from(format!("{}.{:08x}", self.prefix, seq))
        }
    }

    /// Write object `seq` as the concatenation of `parts`.
    pub async fn put(&self, seq: u32, parts: Vec<Bytes>) -> LsvdResult<()> {
        let path = self.object_name(seq);
        let payload = PutPayload::from_iter(parts);
        self.store.put(&path, payload).await?;
        Ok(())
    }

    /// Ranged read of `len` bytes at byte `offset` of object `seq`.
    pub async fn get(&self, seq: u32, offset: u64, len: usize) -> LsvdResult<Bytes> {
        let path = self.object_name(seq);
        let data = self.store.get_range(&path, offset..offset + len as u64).await?;
        if data.len() != len {
            return Err(LsvdError::ShortRead {
                wanted: len,
                got: data.len(),
            });
        }
        Ok(data)
    }

    /// Read `len` bytes at data-relative sector `sector_off` of data object
    /// `seq`, skipping its `hdr_sectors` header.
    pub async fn get_data(
        &self,
        seq: u32,
        hdr_sectors: u32,
        sector_off: Lba,
        len: usize,
    ) -> LsvdResult<Bytes> {
        let offset = (hdr_sectors as u64 + sector_off as u64) * SECTOR_SIZE as u64;
        self.get(seq, offset, len).await
    }

    /// Read the complete header of object `seq`: the first 4 KiB, then a
    /// re-read when `hdr_sectors` says the header is larger. Returns
    /// `Ok(None)` when the object does not exist, which recovery treats as
    /// end-of-log.
    pub async fn get_hdr(&self, seq: u32) -> LsvdResult<Option<(ObjHeader, Bytes)>> {
        let path = self.object_name(seq);
        let meta = match self.store.head(&path).await {
            Ok(meta) => meta,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let first = meta.size.min(4096);
        let buf = self.store.get_range(&path, 0..first).await?;
        let hdr = objects::parse_header(&buf)?;

        let full = hdr.hdr_sectors as u64 * SECTOR_SIZE as u64;
        if full > meta.size {
            return Err(LsvdError::ShortRead {
                wanted: full as usize,
                got: meta.size as usize,
            });
        }
        if full > buf.len() as u64 {
            let buf = self.store.get_range(&path, 0..full).await?;
            return Ok(Some((hdr, buf)));
        }
        Ok(Some((hdr, buf)))
    }
}
