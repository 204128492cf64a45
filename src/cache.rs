//! Buffered block cache.
//!
//! Indexed by `(device, sector)`. Every buffer carries a reference count and
//! a dirty flag; a dirty buffer is only ever written back through the
//! journal (`journal::commit_transaction`), never directly to its home
//! location. Eviction only considers buffers with `refcount == 0` that are
//! not dirty — dirty buffers are flushed by the journal first.
//!
//! The whole cache lives behind one `parking_lot::Mutex`. There is no
//! concurrency inside the core, so this is not about
//! contention; it is about letting the dispatcher hold `&BlockCache` instead
//! of `&mut BlockCache` for read-only descents.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::block::{Chunk, Sector};
use crate::device::BlockDevice;
use crate::errors::*;

/// Which physical device a buffer's sector is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceId {
    Metadata,
    Snapdata,
    Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    pub device: DeviceId,
    pub sector: Sector,
}

impl BufferId {
    pub fn new(device: DeviceId, sector: Sector) -> Self {
        BufferId { device, sector }
    }

    pub fn for_chunk(device: DeviceId, chunk: Chunk, sector_bits: u32) -> Self {
        BufferId::new(device, Sector(chunk.as_u64() << sector_bits))
    }
}

struct Buffer {
    data: Vec<u8>,
    dirty: bool,
    refcount: u32,
}

struct Inner {
    buffers: HashMap<BufferId, Buffer>,
    /// Insertion order of currently-dirty buffers; the journal must write
    /// them back in exactly this order, matching `commit_transaction`'s
    /// `list_for_each(list, &dirty_buffers)`.
    dirty_order: Vec<BufferId>,
    /// Least-recently-used order, for eviction once the cache is over
    /// budget.
    lru: VecDeque<BufferId>,
}

pub struct BlockCache {
    inner: Mutex<Inner>,
    block_size: usize,
    budget_blocks: usize,
}

impl BlockCache {
    pub fn new(block_size: usize, budget_bytes: usize) -> Self {
        BlockCache {
            inner: Mutex::new(Inner {
                buffers: HashMap::new(),
                dirty_order: Vec::new(),
                lru: VecDeque::new(),
            }),
            block_size,
            budget_blocks: (budget_bytes / block_size).max(1),
        }
    }

    /// Acquires a zero-filled, uninitialized buffer without touching disk —
    /// used when a caller is about to overwrite the whole block (new B-tree
    /// node/leaf).
    pub fn get(&self, id: BufferId) -> BufferId {
        let mut inner = self.inner.lock();
        inner
            .buffers
            .entry(id)
            .and_modify(|b| b.refcount += 1)
            .or_insert_with(|| Buffer {
                data: vec![0u8; self.block_size],
                dirty: false,
                refcount: 1,
            });
        touch_lru(&mut inner.lru, id);
        id
    }

    /// Acquires a buffer, loading it from `device` on a cache miss.
    pub fn read(&self, id: BufferId, device: &dyn BlockDevice) -> Result<BufferId> {
        {
            let mut inner = self.inner.lock();
            if let Some(buf) = inner.buffers.get_mut(&id) {
                buf.refcount += 1;
                touch_lru(&mut inner.lru, id);
                return Ok(id);
            }
        }
        let mut data = vec![0u8; self.block_size];
        device.read_at(&mut data, id.sector.as_bytes())?;
        let mut inner = self.inner.lock();
        // Re-check: another caller might have raced us in between the
        // unlocked disk read and re-acquiring the lock.
        inner
            .buffers
            .entry(id)
            .and_modify(|b| b.refcount += 1)
            .or_insert(Buffer {
                data,
                dirty: false,
                refcount: 1,
            });
        touch_lru(&mut inner.lru, id);
        Ok(id)
    }

    pub fn with_data<R>(&self, id: BufferId, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.lock();
        let buf = inner.buffers.get(&id).expect("buffer not held");
        f(&buf.data)
    }

    pub fn with_data_mut<R>(&self, id: BufferId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock();
        let buf = inner.buffers.get_mut(&id).expect("buffer not held");
        f(&mut buf.data)
    }

    /// Releases a hold acquired by `get`/`read`. If `dirty` is set the
    /// buffer is added to the dirty list (if not already on it); the buffer
    /// is only evictable once its refcount reaches zero *and* it is clean.
    pub fn release(&self, id: BufferId, dirty: bool) {
        let mut inner = self.inner.lock();
        let was_dirty = {
            let buf = inner.buffers.get_mut(&id).expect("buffer not held");
            assert!(buf.refcount > 0, "over-release of buffer");
            buf.refcount -= 1;
            if dirty {
                buf.dirty = true;
            }
            buf.dirty
        };
        if was_dirty && !inner.dirty_order.contains(&id) {
            inner.dirty_order.push(id);
        }
        self.evict_unused(&mut inner);
    }

    /// Drops a buffer outright, regardless of its dirty flag — for a caller
    /// that has just merged this buffer's content into another and is about
    /// to free the chunk backing it, so any pending write-back would only
    /// be wasted I/O onto a chunk that no longer means anything.
    ///
    /// The caller's own hold must be the only one outstanding (`refcount`
    /// of at most 1); this replaces that hold's `release` call, it doesn't
    /// follow one.
    pub fn drop_buffer(&self, id: BufferId) {
        let mut inner = self.inner.lock();
        if let Some(buf) = inner.buffers.get(&id) {
            assert!(buf.refcount <= 1, "dropping buffer {:?} still held elsewhere", id);
        }
        inner.buffers.remove(&id);
        inner.dirty_order.retain(|&d| d != id);
        inner.lru.retain(|&d| d != id);
    }

    fn evict_unused(&self, inner: &mut Inner) {
        while inner.buffers.len() > self.budget_blocks {
            let victim = inner
                .lru
                .iter()
                .find(|id| {
                    inner
                        .buffers
                        .get(id)
                        .map(|b| b.refcount == 0 && !b.dirty)
                        .unwrap_or(false)
                })
                .copied();
            match victim {
                Some(id) => {
                    inner.buffers.remove(&id);
                    inner.lru.retain(|x| *x != id);
                }
                None => break, // nothing evictable right now
            }
        }
    }

    /// Snapshot of currently-dirty buffers, in dirtying order, for the
    /// journal to write out. Clears the in-memory dirty flag on each
    /// (callers are expected to then either journal-write them or, on
    /// failure, leave the cache state alone and retry the whole commit).
    pub fn drain_dirty(&self) -> Vec<(BufferId, Vec<u8>)> {
        let mut inner = self.inner.lock();
        let order = std::mem::take(&mut inner.dirty_order);
        let mut out = Vec::with_capacity(order.len());
        for id in order {
            if let Some(buf) = inner.buffers.get_mut(&id) {
                out.push((id, buf.data.clone()));
                buf.dirty = false;
            }
        }
        out
    }

    pub fn is_dirty_list_empty(&self) -> bool {
        self.inner.lock().dirty_order.is_empty()
    }

    pub fn dirty_len(&self) -> usize {
        self.inner.lock().dirty_order.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

fn touch_lru(lru: &mut VecDeque<BufferId>, id: BufferId) {
    lru.retain(|x| *x != id);
    lru.push_back(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn get_then_release_allows_eviction() {
        let cache = BlockCache::new(512, 512 * 2);
        let dev = MemDevice::new(512 * 8);
        let id = BufferId::new(DeviceId::Metadata, Sector(0));
        cache.read(id, &dev).unwrap();
        cache.release(id, false);
        // budget of 2 blocks, only one buffer held: no eviction forced yet.
        cache.with_data(cache.get(id), |_| ());
        cache.release(id, false);
    }

    #[test]
    fn dirty_buffers_preserve_order() {
        let cache = BlockCache::new(512, 512 * 8);
        let ids: Vec<_> = (0..3)
            .map(|i| BufferId::new(DeviceId::Metadata, Sector(i)))
            .collect();
        for &id in &ids {
            cache.get(id);
            cache.release(id, true);
        }
        let dirty = cache.drain_dirty();
        let order: Vec<_> = dirty.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, ids);
        assert!(cache.is_dirty_list_empty());
    }
}
