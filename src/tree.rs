//! The exception B-tree: per-chunk exception records keyed by origin
//! chunk number, one private copy per divergent snapshot.
//!
//! A leaf (`eleaf` in the original) packs two arrays into one fixed-size
//! block growing toward each other: a directory (`map[]`) of
//! `(rchunk, offset)` pairs growing down from the header, and the
//! exception records themselves growing up from the end of the block. The
//! directory is sorted by `rchunk` (chunk relative to the leaf's
//! `base_chunk`); each directory slot's exceptions run from its own offset
//! to the next slot's offset, so `map[count]` is a sentinel holding only an
//! offset. An interior node (`enode`) is simpler: a flat, sorted array of
//! `(key, child_sector)` pairs, where `entries[0].key` is never read (the
//! leftmost child covers everything below `entries[1].key`).
//!
//! Both are accessed in place through a mutable byte slice, the same shape
//! as a [`crate::cache::BlockCache`] buffer, so a caller pulls the buffer
//! out of the cache, wraps it in [`LeafMut`]/[`NodeMut`], mutates, and lets
//! the cache's dirty tracking take it from there.

use byteorder::{ByteOrder, LittleEndian};

use crate::block::Chunk;
use crate::errors::*;

pub const LEAF_MAGIC: u16 = 0x1eaf;
const LEAF_HEADER: usize = 24; // magic+version+count+base_chunk+using_mask
const MAP_ENTRY: usize = 8; // offset(u32) + rchunk(u32)
const EXCEPTION: usize = 16; // share(u64) + chunk(u64)

/// One `(offset, rchunk)` directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub offset: u32,
    pub rchunk: u32,
}

/// One exception record: which snapshots share it, and which physical
/// chunk in the snapshot store holds the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    pub share: u64,
    pub chunk: u64,
}

/// A leaf block, viewed in place.
pub struct LeafMut<'a> {
    data: &'a mut [u8],
}

impl<'a> LeafMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        LeafMut { data }
    }

    pub fn init(data: &'a mut [u8]) -> Self {
        let block_size = data.len();
        let mut leaf = LeafMut { data };
        leaf.set_magic(LEAF_MAGIC);
        leaf.set_version(0);
        leaf.set_base_chunk(Chunk::new(0));
        leaf.set_using_mask(0);
        leaf.set_count(0);
        leaf.set_map_entry(0, MapEntry { offset: block_size as u32, rchunk: 0 });
        leaf
    }

    pub fn magic(&self) -> u16 {
        LittleEndian::read_u16(&self.data[0..2])
    }
    fn set_magic(&mut self, m: u16) {
        LittleEndian::write_u16(&mut self.data[0..2], m);
    }
    fn set_version(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.data[2..4], v);
    }
    pub fn count(&self) -> u32 {
        LittleEndian::read_u32(&self.data[4..8])
    }
    fn set_count(&mut self, c: u32) {
        LittleEndian::write_u32(&mut self.data[4..8], c);
    }
    pub fn base_chunk(&self) -> Chunk {
        Chunk::new(LittleEndian::read_u64(&self.data[8..16]))
    }
    pub fn set_base_chunk(&mut self, c: Chunk) {
        LittleEndian::write_u64(&mut self.data[8..16], c.as_u64());
    }
    pub fn using_mask(&self) -> u64 {
        LittleEndian::read_u64(&self.data[16..24])
    }
    pub fn set_using_mask(&mut self, m: u64) {
        LittleEndian::write_u64(&mut self.data[16..24], m);
    }

    fn map_offset_bytes(i: u32) -> usize {
        LEAF_HEADER + i as usize * MAP_ENTRY
    }

    pub fn map_entry(&self, i: u32) -> MapEntry {
        let o = Self::map_offset_bytes(i);
        MapEntry {
            offset: LittleEndian::read_u32(&self.data[o..o + 4]),
            rchunk: LittleEndian::read_u32(&self.data[o + 4..o + 8]),
        }
    }

    fn set_map_entry(&mut self, i: u32, e: MapEntry) {
        let o = Self::map_offset_bytes(i);
        LittleEndian::write_u32(&mut self.data[o..o + 4], e.offset);
        LittleEndian::write_u32(&mut self.data[o + 4..o + 8], e.rchunk);
    }

    pub fn exception(&self, byte_offset: u32) -> Exception {
        let o = byte_offset as usize;
        Exception {
            share: LittleEndian::read_u64(&self.data[o..o + 8]),
            chunk: LittleEndian::read_u64(&self.data[o + 8..o + 16]),
        }
    }

    fn set_exception(&mut self, byte_offset: u32, e: Exception) {
        let o = byte_offset as usize;
        LittleEndian::write_u64(&mut self.data[o..o + 8], e.share);
        LittleEndian::write_u64(&mut self.data[o + 8..o + 16], e.chunk);
    }

    /// Range of exceptions belonging to directory slot `i`: `[begin, end)`
    /// in byte offsets, matching `emap(leaf, i)..emap(leaf, i+1)`.
    fn exception_range(&self, i: u32) -> (u32, u32) {
        (self.map_entry(i + 1).offset, self.map_entry(i).offset)
    }

    /// Free bytes between the bottom of the directory (including the
    /// sentinel) and the top of the exception area.
    pub fn freespace(&self) -> usize {
        let maptop = Self::map_offset_bytes(self.count() + 1);
        let exceptions_top = self.map_entry(0).offset as usize;
        exceptions_top.saturating_sub(maptop)
    }

    pub fn payload(&self) -> usize {
        let lower = Self::map_offset_bytes(self.count()) - LEAF_HEADER;
        let upper = (self.map_entry(self.count()).offset - self.map_entry(0).offset) as usize;
        lower + upper
    }

    fn find_slot(&self, target: u32) -> Option<u32> {
        (0..self.count()).find(|&i| self.map_entry(i).rchunk == target)
    }

    /// An origin chunk is unique (not shared by any live snapshot) only if
    /// every snapshot in `snapmask` has its own exception for it.
    pub fn origin_chunk_unique(&self, chunk: Chunk, snapmask: u64) -> bool {
        let target = (chunk - self.base_chunk()) as u32;
        let Some(i) = self.find_slot(target) else {
            return snapmask == 0;
        };
        let (begin, end) = self.exception_range(i);
        let mut using = 0u64;
        let mut o = begin;
        while o < end {
            using |= self.exception(o).share;
            o += EXCEPTION as u32;
        }
        (!using & snapmask) == 0
    }

    /// A snapshot chunk is unique (not shared with any other live
    /// snapshot) if it has an exception whose share mask is just this
    /// snapshot's bit. Returns `(unique, exception_chunk)`.
    pub fn snapshot_chunk_unique(&self, chunk: Chunk, snapbit: u8) -> Option<(bool, u64)> {
        let mask = 1u64 << snapbit;
        let target = (chunk - self.base_chunk()) as u32;
        let i = self.find_slot(target)?;
        let (begin, end) = self.exception_range(i);
        let mut o = begin;
        while o < end {
            let e = self.exception(o);
            if e.share & mask != 0 {
                return Some((e.share & !mask == 0, e.chunk));
            }
            o += EXCEPTION as u32;
        }
        None
    }

    /// Records a new exception for `chunk`, shared according to `snapshot`
    /// (`None` means "all of `active`", used when the origin itself writes
    /// a chunk and every live snapshot must see the old data). Returns
    /// `Err(Full)` if the leaf has no room, so the caller can split and
    /// retry.
    pub fn add_exception(
        &mut self,
        chunk: Chunk,
        exception: u64,
        snapshot: Option<u8>,
        active: u64,
    ) -> Result<()> {
        let target = (chunk - self.base_chunk()) as u32;
        let mask = snapshot.map(|s| 1u64 << s).unwrap_or(0);

        let mut i = 0u32;
        while i < self.count() && self.map_entry(i).rchunk < target {
            i += 1;
        }
        let need_new_slot = i == self.count() || self.map_entry(i).rchunk > target;

        if need_new_slot {
            if self.freespace() < EXCEPTION + MAP_ENTRY {
                return Err(ErrorKind::Full("leaf directory/exception space exhausted").into());
            }
            let insert_at = self.map_entry(i).offset;
            for j in (i..=self.count()).rev() {
                let e = self.map_entry(j);
                self.set_map_entry(j + 1, e);
            }
            self.set_map_entry(i, MapEntry { offset: insert_at, rchunk: target });
            self.set_count(self.count() + 1);
            let sharemap = snapshot.map(|_| mask).unwrap_or(active);
            self.insert_exception_at(i, sharemap, exception);
            return Ok(());
        }

        if self.freespace() < EXCEPTION {
            return Err(ErrorKind::Full("leaf exception space exhausted").into());
        }
        let (begin, end) = self.exception_range(i);
        let sharemap = match snapshot {
            None => {
                let mut used = 0u64;
                let mut o = begin;
                while o < end {
                    used |= self.exception(o).share;
                    o += EXCEPTION as u32;
                }
                (!used) & active
            }
            Some(_) => {
                let mut o = begin;
                while o < end {
                    let mut e = self.exception(o);
                    if e.share & mask != 0 {
                        e.share &= !mask;
                        self.set_exception(o, e);
                        break;
                    }
                    o += EXCEPTION as u32;
                }
                mask
            }
        };
        self.insert_exception_at(i, sharemap, exception);
        Ok(())
    }

    /// Shifts the exception area down by one record's worth and writes the
    /// new exception just below slot `i`'s current region, adjusting every
    /// directory offset up to and including `i`.
    fn insert_exception_at(&mut self, i: u32, share: u64, chunk: u64) {
        let dest_end = self.map_entry(0).offset;
        let src_end = dest_end;
        let src_begin = self.map_entry(i).offset;
        let len = (src_end - src_begin) as usize;
        let new_top = dest_end - EXCEPTION as u32;
        if len > 0 {
            self.data
                .copy_within(src_begin as usize..src_end as usize, new_top as usize + EXCEPTION);
        }
        self.set_exception(new_top, Exception { share, chunk });
        for j in 0..=i {
            let mut e = self.map_entry(j);
            e.offset -= EXCEPTION as u32;
            self.set_map_entry(j, e);
        }
    }

    /// Splits roughly in half, moving the upper half of directory slots and
    /// their exceptions into `other` (a freshly zeroed block of the same
    /// size). Returns the chunk at which the split occurred, i.e. the new
    /// leaf's `base_chunk`.
    pub fn split(&mut self, other: &mut LeafMut<'_>) -> Chunk {
        let nhead = (self.count() + 1) / 2;
        let ntail = self.count() - nhead;
        let splitpoint = self.base_chunk() + self.map_entry(nhead).rchunk as u64;

        other.set_magic(LEAF_MAGIC);
        other.set_version(0);
        other.set_base_chunk(splitpoint);
        other.set_using_mask(self.using_mask());
        other.set_count(ntail);

        let (tail_begin, tail_end) = (self.map_entry(nhead).offset, self.map_entry(0).offset);
        let tailsize = tail_end - tail_begin;
        let other_exceptions_top = other.data.len() as u32 - tailsize;
        let src = self.data[tail_begin as usize..tail_end as usize].to_vec();
        other.data[other_exceptions_top as usize..].copy_from_slice(&src);

        for j in 0..=ntail {
            let mut e = self.map_entry(nhead + j);
            e.offset = e.offset - tail_begin + other_exceptions_top;
            e.rchunk = if j < ntail { e.rchunk - self.map_entry(nhead).rchunk } else { 0 };
            other.set_map_entry(j, e);
        }

        let head_begin = self.map_entry(0).offset;
        let head_end = self.map_entry(nhead).offset;
        self.data
            .copy_within(head_begin as usize..head_end as usize, head_begin as usize + tailsize as usize);
        self.set_count(nhead);
        for j in 0..=nhead {
            let mut e = self.map_entry(j);
            e.offset += tailsize;
            self.set_map_entry(j, e);
        }
        self.set_map_entry(nhead, MapEntry { offset: self.map_entry(nhead).offset, rchunk: 0 });

        splitpoint
    }

    /// Clears every bit in `snapmask` from this leaf's exceptions, drops
    /// exceptions that end up unshared by anybody (returning their chunks
    /// for the caller to free), and repacks both the exception area and
    /// the directory. Returns whether anything in this leaf was touched.
    pub fn delete_snapshots(&mut self, snapmask: u64) -> (bool, Vec<u64>) {
        let mut freed = Vec::new();
        let mut any = false;
        let mut dest = self.map_entry(self.count()).offset;

        for i in (0..self.count()).rev() {
            let slot_end = self.map_entry(i + 1).offset;
            let slot_begin = self.map_entry(i).offset;
            let mut src = slot_end;
            while src != slot_begin {
                src -= EXCEPTION as u32;
                let mut e = self.exception(src);
                any |= (e.share & snapmask) != 0;
                e.share &= !snapmask;
                if e.share != 0 {
                    dest -= EXCEPTION as u32;
                    self.set_exception(dest, e);
                } else {
                    freed.push(e.chunk);
                }
            }
            let mut entry = self.map_entry(i);
            entry.offset = dest;
            self.set_map_entry(i, entry);
        }

        let mut write_at = 0u32;
        for i in 0..self.count() {
            let cur = self.map_entry(i);
            let next = self.map_entry(i + 1);
            if cur.offset != next.offset {
                self.set_map_entry(write_at, cur);
                write_at += 1;
            }
        }
        let top_offset = self.map_entry(self.count()).offset;
        self.set_map_entry(write_at, MapEntry { offset: top_offset, rchunk: 0 });
        self.set_count(write_at);

        (any, freed)
    }

    /// Merges `other`'s slots into the top of `self`; caller is
    /// responsible for checking the combined payload fits first.
    pub fn merge(&mut self, other: &LeafMut<'_>) {
        let nhead = self.count();
        let ntail = other.count();
        let (other_begin, other_end) = (other.map_entry(0).offset, other.map_entry(ntail).offset);
        let tailsize = other_end - other_begin;

        let head_begin = self.map_entry(0).offset;
        let head_end = self.map_entry(nhead).offset;
        self.data
            .copy_within(head_begin as usize..head_end as usize, (head_begin - tailsize) as usize);
        for j in 0..=nhead {
            let mut e = self.map_entry(j);
            e.offset -= tailsize;
            self.set_map_entry(j, e);
        }

        let new_exceptions_at = (head_end - tailsize) as usize;
        self.data[new_exceptions_at..new_exceptions_at + tailsize as usize]
            .copy_from_slice(&other.data[other_begin as usize..other_end as usize]);

        for j in 0..=ntail {
            let mut e = other.map_entry(j);
            e.offset = e.offset - other_begin + (head_end - tailsize);
            e.rchunk += self.map_entry(nhead).rchunk; // rebase onto head's last rchunk window
            self.set_map_entry(nhead + j, e);
        }
        self.set_count(nhead + ntail);
    }
}

/// An interior node, viewed in place: a flat sorted array of
/// `(key, child_sector)` pairs. `entries[0].key` is never consulted; the
/// leftmost child covers every key below `entries[1].key`.
pub struct NodeMut<'a> {
    data: &'a mut [u8],
}

const NODE_HEADER: usize = 8; // count(u32) + unused(u32)
const NODE_ENTRY: usize = 16; // key(u64) + sector(u64)

impl<'a> NodeMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        NodeMut { data }
    }

    pub fn init(data: &'a mut [u8]) -> Self {
        let mut node = NodeMut { data };
        node.set_count(0);
        node
    }

    pub fn count(&self) -> u32 {
        LittleEndian::read_u32(&self.data[0..4])
    }
    fn set_count(&mut self, c: u32) {
        LittleEndian::write_u32(&mut self.data[0..4], c);
    }

    fn entry_offset(i: u32) -> usize {
        NODE_HEADER + i as usize * NODE_ENTRY
    }

    pub fn key(&self, i: u32) -> u64 {
        let o = Self::entry_offset(i);
        LittleEndian::read_u64(&self.data[o..o + 8])
    }
    pub fn sector(&self, i: u32) -> u64 {
        let o = Self::entry_offset(i) + 8;
        LittleEndian::read_u64(&self.data[o..o + 8])
    }
    fn set_entry(&mut self, i: u32, key: u64, sector: u64) {
        let o = Self::entry_offset(i);
        LittleEndian::write_u64(&mut self.data[o..o + 8], key);
        LittleEndian::write_u64(&mut self.data[o + 8..o + 16], sector);
    }

    pub fn capacity(block_size: usize) -> u32 {
        ((block_size - NODE_HEADER) / NODE_ENTRY) as u32
    }

    /// Index of the child covering `key`: the last entry whose key is
    /// `<= key`, or 0 if `key` is below every entry past the first.
    pub fn find_child(&self, key: u64) -> u32 {
        let mut i = 0u32;
        for c in 1..self.count() {
            if self.key(c) > key {
                break;
            }
            i = c;
        }
        i
    }

    pub fn push(&mut self, key: u64, sector: u64) {
        let i = self.count();
        self.set_entry(i, key, sector);
        self.set_count(i + 1);
    }

    pub fn insert_at(&mut self, i: u32, key: u64, sector: u64) {
        for j in (i..self.count()).rev() {
            let k = self.key(j);
            let s = self.sector(j);
            self.set_entry(j + 1, k, s);
        }
        self.set_entry(i, key, sector);
        self.set_count(self.count() + 1);
    }

    /// Splits in half, moving the upper half into `other`. Returns the key
    /// that separates the two halves (the first key of `other`).
    pub fn split(&mut self, other: &mut NodeMut<'_>) -> u64 {
        let nhead = (self.count() + 1) / 2;
        let ntail = self.count() - nhead;
        for j in 0..ntail {
            let k = self.key(nhead + j);
            let s = self.sector(nhead + j);
            other.set_entry(j, k, s);
        }
        other.set_count(ntail);
        let pivot = other.key(0);
        self.set_count(nhead);
        pivot
    }

    pub fn merge(&mut self, other: &NodeMut<'_>) {
        let nhead = self.count();
        for j in 0..other.count() {
            let k = other.key(j);
            let s = other.sector(j);
            self.set_entry(nhead + j, k, s);
        }
        self.set_count(nhead + other.count());
    }
}

/// Read-only view of a leaf, for lookups that don't need
/// `BlockCache::with_data_mut`'s exclusive access.
pub struct LeafRef<'a> {
    data: &'a [u8],
}

impl<'a> LeafRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        LeafRef { data }
    }

    pub fn count(&self) -> u32 {
        LittleEndian::read_u32(&self.data[4..8])
    }
    pub fn base_chunk(&self) -> Chunk {
        Chunk::new(LittleEndian::read_u64(&self.data[8..16]))
    }

    fn map_entry(&self, i: u32) -> MapEntry {
        let o = LEAF_HEADER + i as usize * MAP_ENTRY;
        MapEntry {
            offset: LittleEndian::read_u32(&self.data[o..o + 4]),
            rchunk: LittleEndian::read_u32(&self.data[o + 4..o + 8]),
        }
    }

    fn exception(&self, byte_offset: u32) -> Exception {
        let o = byte_offset as usize;
        Exception {
            share: LittleEndian::read_u64(&self.data[o..o + 8]),
            chunk: LittleEndian::read_u64(&self.data[o + 8..o + 16]),
        }
    }

    fn exception_range(&self, i: u32) -> (u32, u32) {
        (self.map_entry(i + 1).offset, self.map_entry(i).offset)
    }

    fn find_slot(&self, target: u32) -> Option<u32> {
        (0..self.count()).find(|&i| self.map_entry(i).rchunk == target)
    }

    pub fn origin_chunk_unique(&self, chunk: Chunk, snapmask: u64) -> bool {
        let target = (chunk - self.base_chunk()) as u32;
        let Some(i) = self.find_slot(target) else {
            return snapmask == 0;
        };
        let (begin, end) = self.exception_range(i);
        let mut using = 0u64;
        let mut o = begin;
        while o < end {
            using |= self.exception(o).share;
            o += EXCEPTION as u32;
        }
        (!using & snapmask) == 0
    }

    pub fn snapshot_chunk_unique(&self, chunk: Chunk, snapbit: u8) -> Option<(bool, u64)> {
        let mask = 1u64 << snapbit;
        let target = (chunk - self.base_chunk()) as u32;
        let i = self.find_slot(target)?;
        let (begin, end) = self.exception_range(i);
        let mut o = begin;
        while o < end {
            let e = self.exception(o);
            if e.share & mask != 0 {
                return Some((e.share & !mask == 0, e.chunk));
            }
            o += EXCEPTION as u32;
        }
        None
    }

    /// Every absolute chunk in this leaf whose exception sharemap disagrees
    /// between `mask1` and `mask2` (each a single snapshot bit): one side
    /// has an exception covering it and the other doesn't, or both do but
    /// under different exception records. A chunk with no exception holding
    /// either bit isn't returned — both tags see the origin there.
    pub fn changelist_chunks(&self, mask1: u64, mask2: u64) -> Vec<u64> {
        let mut out = Vec::new();
        for i in 0..self.count() {
            let (begin, end) = self.exception_range(i);
            let (mut has1, mut has2) = (false, false);
            let mut o = begin;
            while o < end {
                let e = self.exception(o);
                has1 |= e.share & mask1 != 0;
                has2 |= e.share & mask2 != 0;
                o += EXCEPTION as u32;
            }
            if has1 != has2 {
                out.push((self.base_chunk() + self.map_entry(i).rchunk as u64).as_u64());
            }
        }
        out
    }

    /// Bytes still free for this leaf's directory and exception area —
    /// used to decide whether a pending insert will need a split before it
    /// is attempted under `with_data_mut`.
    pub fn freespace(&self) -> usize {
        let maptop = LEAF_HEADER + (self.count() as usize + 1) * MAP_ENTRY;
        let exceptions_top = self.map_entry(0).offset as usize;
        exceptions_top.saturating_sub(maptop)
    }

    /// Bytes this leaf's directory and exceptions would cost a neighbor
    /// absorbing them via `LeafMut::merge` — the flip side of `freespace`.
    pub fn payload(&self) -> usize {
        let directory = self.count() as usize * MAP_ENTRY;
        let exceptions = (self.map_entry(self.count()).offset - self.map_entry(0).offset) as usize;
        directory + exceptions
    }
}

/// Read-only view of an interior node, for path descent.
pub struct NodeRef<'a> {
    data: &'a [u8],
}

impl<'a> NodeRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        NodeRef { data }
    }

    pub fn count(&self) -> u32 {
        LittleEndian::read_u32(&self.data[0..4])
    }
    pub fn key(&self, i: u32) -> u64 {
        let o = NODE_HEADER + i as usize * NODE_ENTRY;
        LittleEndian::read_u64(&self.data[o..o + 8])
    }
    pub fn sector(&self, i: u32) -> u64 {
        let o = NODE_HEADER + i as usize * NODE_ENTRY + 8;
        LittleEndian::read_u64(&self.data[o..o + 8])
    }

    pub fn find_child(&self, key: u64) -> u32 {
        let mut i = 0u32;
        for c in 1..self.count() {
            if self.key(c) > key {
                break;
            }
            i = c;
        }
        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_buf(size: usize) -> Vec<u8> {
        vec![0u8; size]
    }

    #[test]
    fn init_leaf_is_empty_and_unique_everywhere() {
        let mut buf = leaf_buf(512);
        let leaf = LeafMut::init(&mut buf);
        assert_eq!(leaf.count(), 0);
        assert_eq!(leaf.magic(), LEAF_MAGIC);
        assert!(leaf.origin_chunk_unique(Chunk::new(5), 0));
        assert!(!leaf.origin_chunk_unique(Chunk::new(5), 0b1));
    }

    #[test]
    fn add_then_find_exception() {
        let mut buf = leaf_buf(512);
        let mut leaf = LeafMut::init(&mut buf);
        leaf.add_exception(Chunk::new(10), 777, Some(0), 0b1).unwrap();
        let (unique, addr) = leaf.snapshot_chunk_unique(Chunk::new(10), 0).unwrap();
        assert!(unique);
        assert_eq!(addr, 777);
        assert!(!leaf.origin_chunk_unique(Chunk::new(10), 0b1));
    }

    #[test]
    fn second_snapshot_sharing_same_chunk_is_not_unique() {
        let mut buf = leaf_buf(512);
        let mut leaf = LeafMut::init(&mut buf);
        leaf.add_exception(Chunk::new(10), 777, Some(0), 0b11).unwrap();
        // Origin write creates a second exception shared by all active
        // snapshots that don't have one yet (here, snapshot 1).
        leaf.add_exception(Chunk::new(20), 900, None, 0b11).unwrap();
        let (unique, _) = leaf.snapshot_chunk_unique(Chunk::new(20), 0).unwrap();
        assert!(!unique);
        let (unique1, _) = leaf.snapshot_chunk_unique(Chunk::new(20), 1).unwrap();
        assert!(!unique1);
    }

    #[test]
    fn leaf_reports_full_when_out_of_space() {
        let mut buf = leaf_buf(64);
        let mut leaf = LeafMut::init(&mut buf);
        let mut n = 0u64;
        loop {
            match leaf.add_exception(Chunk::new(n), n, Some(0), 0b1) {
                Ok(()) => n += 1,
                Err(_) => break,
            }
        }
        assert!(n > 0);
    }

    #[test]
    fn split_preserves_all_entries() {
        let mut buf = leaf_buf(512);
        let mut leaf = LeafMut::init(&mut buf);
        for i in 0..10u64 {
            leaf.add_exception(Chunk::new(i), i * 10, Some(0), 0b1).unwrap();
        }
        let mut other_buf = leaf_buf(512);
        let mut other = LeafMut::init(&mut other_buf);
        let splitpoint = leaf.split(&mut other);
        assert!(leaf.count() + other.count() == 10);
        assert_eq!(other.base_chunk(), splitpoint);
    }

    #[test]
    fn delete_snapshots_drops_unshared_exceptions_and_repacks() {
        let mut buf = leaf_buf(512);
        let mut leaf = LeafMut::init(&mut buf);
        leaf.add_exception(Chunk::new(1), 10, Some(0), 0b11).unwrap();
        leaf.add_exception(Chunk::new(2), 20, Some(1), 0b11).unwrap();
        let (any, freed) = leaf.delete_snapshots(0b1);
        assert!(any);
        assert_eq!(freed, vec![10]);
        assert_eq!(leaf.count(), 1);
        let (unique, addr) = leaf.snapshot_chunk_unique(Chunk::new(2), 1).unwrap();
        assert!(unique);
        assert_eq!(addr, 20);
    }

    #[test]
    fn node_find_child_picks_rightmost_entry_not_exceeding_key() {
        let mut buf = vec![0u8; 256];
        let mut node = NodeMut::init(&mut buf);
        node.push(0, 100); // entries[0].key unused by convention
        node.push(50, 200);
        node.push(100, 300);
        assert_eq!(node.find_child(10), 0);
        assert_eq!(node.find_child(60), 1);
        assert_eq!(node.find_child(150), 2);
    }
}
