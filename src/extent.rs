//! Ordered extent maps for the translation and cache layers.
//!
//! An extent map is a sorted set of non-overlapping half-open LBA ranges
//! `[base, limit)`, each mapped to a value that knows how to advance with the
//! range. Overwrites trim or split existing extents; adjacent extents whose
//! values are exactly contiguous are merged back into one.
//!
//! Two specializations are used: the object map (`ObjOffset`: LBA → object
//! and sector offset within its payload) and the write-cache map (`Lba`:
//! LBA → NVMe sector).

use crate::Lba;
use std::collections::BTreeMap;
use std::ops::Bound;

/// A mapped value that can be offset by a sector count within its extent.
pub trait ExtentValue: Copy + Eq {
    /// The value `sectors` past the start of an extent holding `self`.
    fn advance(&self, sectors: Lba) -> Self;
}

/// Location of an extent's data inside a numbered object: sector offset
/// relative to the start of the object's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjOffset {
    pub obj: u32,
    pub offset: Lba,
}

impl ExtentValue for ObjOffset {
    fn advance(&self, sectors: Lba) -> Self {
        Self {
            obj: self.obj,
            offset: self.offset + sectors,
        }
    }
}

/// NVMe sector addresses used by the write-cache map.
impl ExtentValue for Lba {
    fn advance(&self, sectors: Lba) -> Self {
        self + sectors
    }
}

#[derive(Debug, Clone, Copy)]
struct Extent<V> {
    limit: Lba,
    value: V,
}

/// Sorted map of non-overlapping extents keyed by base LBA.
#[derive(Debug, Clone)]
pub struct ExtentMap<V> {
    map: BTreeMap<Lba, Extent<V>>,
}

impl<V: ExtentValue> Default for ExtentMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: ExtentValue> ExtentMap<V> {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Insert `[base, limit) → value`, trimming or splitting any overlapping
    /// extents and merging with neighbors whose mapping is exactly
    /// contiguous.
    pub fn update(&mut self, base: Lba, limit: Lba, value: V) {
        debug_assert!(base < limit);
        self.punch(base, limit);

        let mut new_base = base;
        let mut new_limit = limit;
        let mut new_value = value;

        // Merge with a contiguous predecessor.
        if let Some((&pb, pe)) = self.map.range(..base).next_back() {
            if pe.limit == base && pe.value.advance(base - pb) == value {
                new_base = pb;
                new_value = pe.value;
                self.map.remove(&pb);
            }
        }
        // Merge with a contiguous successor.
        if let Some((&sb, se)) = self.map.range(limit..).next() {
            if sb == limit && se.value == new_value.advance(limit - new_base) {
                new_limit = se.limit;
                self.map.remove(&sb);
            }
        }
        self.map.insert(
            new_base,
            Extent {
                limit: new_limit,
                value: new_value,
            },
        );
    }

    /// Remove any mapping within `[base, limit)`, preserving the parts of
    /// overlapping extents that fall outside the range.
    pub fn erase(&mut self, base: Lba, limit: Lba) {
        self.punch(base, limit);
    }

    fn punch(&mut self, base: Lba, limit: Lba) {
        // An extent starting strictly before `base` may straddle it.
        if let Some((&eb, e)) = self.map.range(..base).next_back() {
            if e.limit > base {
                let e = *e;
                self.map.remove(&eb);
                self.map.insert(
                    eb,
                    Extent {
                        limit: base,
                        value: e.value,
                    },
                );
                if e.limit > limit {
                    self.map.insert(
                        limit,
                        Extent {
                            limit: e.limit,
                            value: e.value.advance(limit - eb),
                        },
                    );
                }
            }
        }
        // Extents starting inside [base, limit) are removed or trimmed left.
        let starts: Vec<Lba> = self.map.range(base..limit).map(|(k, _)| *k).collect();
        for s in starts {
            let e = self.map.remove(&s).expect("key collected above");
            if e.limit > limit {
                self.map.insert(
                    limit,
                    Extent {
                        limit: e.limit,
                        value: e.value.advance(limit - s),
                    },
                );
            }
        }
    }

    /// The first extent whose limit is greater than `lba`, unclipped.
    pub fn lookup(&self, lba: Lba) -> Option<(Lba, Lba, V)> {
        if let Some((&b, e)) = self.map.range(..=lba).next_back() {
            if e.limit > lba {
                return Some((b, e.limit, e.value));
            }
        }
        self.map
            .range((Bound::Excluded(lba), Bound::Unbounded))
            .next()
            .map(|(&b, e)| (b, e.limit, e.value))
    }

    /// All extents overlapping `[base, limit)`, clipped to the range with
    /// their values adjusted for the clip. Output is sorted and
    /// non-overlapping.
    pub fn iterate(&self, base: Lba, limit: Lba) -> Vec<(Lba, Lba, V)> {
        let mut out = Vec::new();
        if let Some((&b, e)) = self.map.range(..=base).next_back() {
            if e.limit > base {
                out.push((base, e.limit.min(limit), e.value.advance(base - b)));
            }
        }
        for (&b, e) in self.map.range((Bound::Excluded(base), Bound::Unbounded)) {
            if b >= limit {
                break;
            }
            out.push((b, e.limit.min(limit), e.value));
        }
        out
    }

    pub fn reset(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
