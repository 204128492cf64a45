//! `SnapServer`: owns every piece of one running store and composes them
//! into the handful of operations the dispatcher calls
//! ([`dispatch::OpCode`]) — there is no other path to the allocator,
//! cache, journal, or tree than through this struct.

use log::{debug, info, warn};

use crate::alloc::AllocSpace;
use crate::block::{Chunk, ChunkGeometry, Sector};
use crate::cache::{BlockCache, BufferId, DeviceId};
use crate::copyout::{source_from_snapdata, CopyOutEngine};
use crate::device::BlockDevice;
use crate::errors::*;
use crate::journal::{self, JournalState};
use crate::readlock::{ClientId, PendingId, SnapLockTable};
use crate::snapshot::{MAX_SNAPSHOTS, PRIORITY_NEVER_DROP};
use crate::superblock::{Superblock, SB_SECTOR};
use crate::tree::{LeafMut, LeafRef, NodeMut, NodeRef};

/// Extra metadata chunks a single `make_unique` call might need: one new
/// leaf from a split, plus one new interior node per tree level in the
/// worst case of a split cascading to the root.
const MAX_NEW_METACHUNKS: u64 = 10;
/// How many contiguous chunks the copy-out engine coalesces before forcing
/// a flush.
const COPYOUT_COALESCE_CHUNKS: usize = 32;

pub struct SnapServer {
    pub sb: Superblock,
    pub cache: BlockCache,
    pub metadata_dev: Box<dyn BlockDevice>,
    pub snapdata_dev: Box<dyn BlockDevice>,
    pub origin_dev: Box<dyn BlockDevice>,
    pub geometry: ChunkGeometry,
    pub locks: SnapLockTable,
    copyout: CopyOutEngine,
    next_pending_id: PendingId,
}

/// A write deferred because it touched a chunk under a snapshot reader's
/// lock. The dispatcher holds onto these and replays them once
/// [`SnapServer::release_read_lock`] reports them ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredWrite {
    pub pending: PendingId,
}

/// Result of [`SnapServer::client_disconnected`]: which parked origin
/// writes are now ready to answer (their last blocking read just released)
/// versus which belonged to the disconnecting client and should simply be
/// dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectEffects {
    pub completed: Vec<PendingId>,
    pub cancelled: Vec<PendingId>,
}

/// Outcome of [`SnapServer::query_write_origin`].
pub enum OriginWrite {
    /// The write may proceed now; `exception` names the chunk the client
    /// should redirect its write to, or is `None` if the origin chunk was
    /// already unique against every live snapshot.
    Proceed(Option<Chunk>),
    /// A snapshot reader currently holds the chunk; park the write.
    Deferred(DeferredWrite),
}

impl SnapServer {
    pub fn new(
        sb: Superblock,
        metadata_dev: Box<dyn BlockDevice>,
        snapdata_dev: Box<dyn BlockDevice>,
        origin_dev: Box<dyn BlockDevice>,
        geometry: ChunkGeometry,
        cache_budget_bytes: usize,
        snaplock_hash_bits: u32,
    ) -> Self {
        SnapServer {
            sb,
            cache: BlockCache::new(geometry.block_bytes(), cache_budget_bytes),
            metadata_dev,
            snapdata_dev,
            origin_dev,
            geometry,
            locks: SnapLockTable::new(snaplock_hash_bits),
            copyout: CopyOutEngine::new(geometry, COPYOUT_COALESCE_CHUNKS),
            next_pending_id: 0,
        }
    }

    /// Formats a fresh store: lays out the superblock, both allocation
    /// bitmaps and the journal back-to-back starting at `SB_SECTOR` (§6's
    /// "[superblock] [metadata bitmap] [snapdata bitmap if separate]
    /// [journal] [free metadata chunks]"), writes an empty root leaf into
    /// the first free metadata chunk, and flushes the result. `snapdata_chunks
    /// == 0` selects the combined layout, where `snapdata_dev` is ignored.
    pub fn create(
        metadata_dev: Box<dyn BlockDevice>,
        snapdata_dev: Box<dyn BlockDevice>,
        origin_dev: Box<dyn BlockDevice>,
        geometry: ChunkGeometry,
        metadata_chunks: u64,
        snapdata_chunks: u64,
        origin_sectors: u64,
        journal_chunks: u32,
        cache_budget_bytes: usize,
        snaplock_hash_bits: u32,
    ) -> Result<SnapServer> {
        Self::check_canonical_geometry(geometry)?;
        let block_bytes = geometry.block_bytes();

        let sb_chunk = SB_SECTOR.as_u64() / geometry.sectors_per_chunk();
        let metadata_bitmap_base = sb_chunk + 1;
        let metadata_bitmap_blocks = AllocSpace::bitmap_blocks(metadata_chunks, block_bytes);
        let snapdata_bitmap_blocks = if snapdata_chunks == 0 {
            0
        } else {
            AllocSpace::bitmap_blocks(snapdata_chunks, block_bytes)
        };
        let snapdata_bitmap_base = metadata_bitmap_base + metadata_bitmap_blocks;
        let journal_base_chunk = snapdata_bitmap_base + snapdata_bitmap_blocks;
        let reserved_prefix = journal_base_chunk + journal_chunks as u64;

        let sb = Superblock::init(
            metadata_chunks,
            reserved_prefix,
            snapdata_chunks,
            geometry.chunk_to_sector(Chunk::new(journal_base_chunk)),
            journal_chunks,
            Sector(0),
            origin_sectors,
            geometry.chunk_to_sector(Chunk::new(metadata_bitmap_base)),
            geometry.chunk_to_sector(Chunk::new(snapdata_bitmap_base)),
        );

        let mut server = SnapServer::new(sb, metadata_dev, snapdata_dev, origin_dev, geometry, cache_budget_bytes, snaplock_hash_bits);

        let root_chunk = server.new_metadata_chunk()?;
        let root_sector = geometry.chunk_to_sector(root_chunk);
        let root_id = server.cache.get(BufferId::new(DeviceId::Metadata, root_sector));
        server.cache.with_data_mut(root_id, |data| {
            LeafMut::init(data);
        });
        server.cache.release(root_id, true);
        server.sb.etree_root = root_sector;
        server.sb.etree_levels = 0;
        server.sb.mark_dirty();

        server.commit()?;
        server.save_state()?;
        info!("formatted store: {} metadata chunks, {} snapdata chunks, root at {:?}", metadata_chunks, snapdata_chunks, root_sector);
        Ok(server)
    }

    /// Attaches to an already-formatted store. If the superblock's BUSY flag
    /// is still set from a previous attach that never cleanly shut down
    /// (§7), replays the journal before handing back a usable server.
    pub fn open(
        metadata_dev: Box<dyn BlockDevice>,
        snapdata_dev: Box<dyn BlockDevice>,
        origin_dev: Box<dyn BlockDevice>,
        geometry: ChunkGeometry,
        cache_budget_bytes: usize,
        snaplock_hash_bits: u32,
    ) -> Result<SnapServer> {
        Self::check_canonical_geometry(geometry)?;
        let block_bytes = geometry.block_bytes();
        let mut sb = Superblock::load(metadata_dev.as_ref(), snapdata_dev.as_ref(), block_bytes, true)?;
        let was_busy = sb.is_busy();
        sb.set_busy(true);

        let mut server = SnapServer::new(sb, metadata_dev, snapdata_dev, origin_dev, geometry, cache_budget_bytes, snaplock_hash_bits);
        if was_busy {
            warn!("store was busy on attach, replaying journal before use");
            server.recover()?;
        }
        server.save_state()?;
        Ok(server)
    }

    /// Commits any pending transaction and flushes the superblock plus both
    /// allocation bitmaps, without clearing BUSY — the periodic checkpoint
    /// `save_state` describes, safe to call while the store stays attached.
    pub fn save_state(&mut self) -> Result<()> {
        self.commit()?;
        self.sb.flush(self.metadata_dev.as_ref(), self.snapdata_dev.as_ref(), self.geometry.block_bytes())
    }

    /// Clean shutdown: clears BUSY, flushes, and syncs every device, so the
    /// next `open` skips recovery.
    pub fn shutdown(&mut self) -> Result<()> {
        self.sb.set_busy(false);
        self.save_state()?;
        self.metadata_dev.sync()?;
        self.snapdata_dev.sync()?;
        self.origin_dev.sync()?;
        Ok(())
    }

    /// `SB_SECTOR`'s layout only makes sense when it falls on a chunk
    /// boundary; the canonical 8-sector (4KiB) chunk is the only geometry
    /// that satisfies this for `SB_SECTOR == 8`, so `create`/`open` reject
    /// anything else rather than silently overlapping the superblock with
    /// the chunk before it.
    fn check_canonical_geometry(geometry: ChunkGeometry) -> Result<()> {
        if SB_SECTOR.as_u64() % geometry.sectors_per_chunk() != 0 {
            return Err(ErrorKind::Corrupt("chunk geometry does not align with SB_SECTOR".into()).into());
        }
        Ok(())
    }

    fn alloc_data_space(&self) -> &AllocSpace {
        self.sb.snapdata_alloc.as_ref().unwrap_or(&self.sb.metadata_alloc)
    }

    fn alloc_data_space_mut(&mut self) -> &mut AllocSpace {
        self.sb.snapdata_alloc.as_mut().unwrap_or(&mut self.sb.metadata_alloc)
    }

    /// Reclaims snapshots (oldest idle, lowest-priority first) until at
    /// least `want` chunks are free in `space`, or there is nothing left to
    /// reclaim.
    fn ensure_free_chunks(&mut self, is_metadata: bool, want: u64) -> Result<()> {
        loop {
            let free = if is_metadata {
                self.sb.metadata_alloc.free_chunks()
            } else {
                self.alloc_data_space().free_chunks()
            };
            if free >= want {
                return Ok(());
            }
            let Some(victim) = self.sb.snapshots.find_victim() else {
                return Err(ErrorKind::Full("no snapshots left to reclaim space from").into());
            };
            if victim.prio == PRIORITY_NEVER_DROP {
                return Err(ErrorKind::Full("store full, remaining snapshots are pinned").into());
            }
            let tag = victim.tag;
            let bit = victim.bit;
            warn!("snapshot store full, releasing snapshot tag {}", tag);
            self.squash_snapshot(bit)?;
            self.sb.snapshots.squash(tag);
            self.sb.mark_dirty();
        }
    }

    fn new_metadata_chunk(&mut self) -> Result<Chunk> {
        self.sb
            .metadata_alloc
            .alloc_chunk()
            .ok_or_else(|| ErrorKind::Full("metadata space exhausted").into())
    }

    fn new_exception_chunk(&mut self) -> Result<Chunk> {
        self.alloc_data_space_mut()
            .alloc_chunk()
            .ok_or_else(|| ErrorKind::Full("snapshot store exhausted").into())
    }

    fn read_node(&self, sector: Sector) -> Result<BufferId> {
        self.cache.read(BufferId::new(DeviceId::Metadata, sector), self.metadata_dev.as_ref())
    }

    /// Walks down from the root to the leaf covering `chunk`, returning the
    /// leaf's buffer plus the sector of every interior node visited
    /// (root-to-parent order) so a split can walk back up.
    fn probe(&self, chunk: Chunk) -> Result<(BufferId, Vec<Sector>)> {
        let mut path = Vec::new();
        let mut sector = self.sb.etree_root;
        for _ in 0..self.sb.etree_levels {
            path.push(sector);
            let id = self.read_node(sector)?;
            let child_sector = self.cache.with_data(id, |data| {
                let node = NodeRef::new(data);
                Sector(node.sector(node.find_child(chunk.as_u64())))
            });
            self.cache.release(id, false);
            sector = child_sector;
        }
        let leaf_id = self.read_node(sector)?;
        Ok((leaf_id, path))
    }

    /// `chunk` must already have been through [`probe`]; re-derives
    /// uniqueness against the leaf found there without re-probing.
    fn check_unique(&self, leaf: BufferId, chunk: Chunk, snapbit: Option<u8>) -> (bool, Option<u64>) {
        self.cache.with_data(leaf, |data| {
            let view = LeafRef::new(data);
            match snapbit {
                None => (view.origin_chunk_unique(chunk, self.sb.active_snapmask()), None),
                Some(bit) => match view.snapshot_chunk_unique(chunk, bit) {
                    Some((unique, addr)) => (unique, Some(addr)),
                    None => (false, None),
                },
            }
        })
    }

    /// The core of every write path: ensures `chunk` has a private
    /// exception for `snapbit` (or, if `snapbit` is `None`, for every live
    /// snapshot that doesn't already have one — an origin write), copying
    /// out old data first if needed. Returns the exception chunk, or the
    /// original chunk's "no exception needed" sentinel via `Ok(None)`.
    pub fn make_unique(&mut self, chunk: Chunk, snapbit: Option<u8>) -> Result<Option<Chunk>> {
        if self.sb.is_combined() {
            self.ensure_free_chunks(true, MAX_NEW_METACHUNKS + 1)?;
        } else {
            self.ensure_free_chunks(true, MAX_NEW_METACHUNKS)?;
            self.ensure_free_chunks(false, 1)?;
        }

        let (leaf, path) = self.probe(chunk)?;
        let (unique, existing_exception) = self.check_unique(leaf, chunk, snapbit);
        if unique {
            self.cache.release(leaf, false);
            return Ok(None);
        }

        let new_exception = self.new_exception_chunk()?;

        let source = match (snapbit, existing_exception) {
            (_, Some(addr)) => source_from_snapdata(addr),
            (None, None) => chunk.as_u64(),
            (Some(_), None) => chunk.as_u64(), // snapshot chunk never had an exception: copy from origin
        };
        self.copyout
            .copyout(source, new_exception, self.geometry, self.origin_dev.as_ref(), self.snapdata_dev.as_ref())?;

        self.insert_exception(leaf, path, chunk, new_exception.as_u64(), snapbit)?;
        Ok(Some(new_exception))
    }

    fn leaf_block_size(&self) -> usize {
        self.geometry.block_bytes()
    }

    /// Inserts one exception into `leaf`, splitting it (and cascading the
    /// split up through `path` if necessary) when it doesn't fit.
    fn insert_exception(
        &mut self,
        leaf: BufferId,
        path: Vec<Sector>,
        chunk: Chunk,
        exception: u64,
        snapbit: Option<u8>,
    ) -> Result<()> {
        let active = self.sb.active_snapmask();
        let fits = self
            .cache
            .with_data_mut(leaf, |data| LeafMut::new(data).add_exception(chunk, exception, snapbit, active).is_ok());
        if fits {
            self.cache.release(leaf, true);
            self.maybe_commit()?;
            return Ok(());
        }

        // Leaf is full: split it, retry the insert in whichever half now
        // covers `chunk`, then thread the new separator key up through the
        // path, splitting interior nodes in turn.
        let new_leaf_chunk = self.new_metadata_chunk()?;
        let new_leaf_sector = self.geometry.chunk_to_sector(new_leaf_chunk);
        let new_leaf_id = self.cache.get(BufferId::new(DeviceId::Metadata, new_leaf_sector));

        let mut new_leaf_buf = vec![0u8; self.leaf_block_size()];
        let splitpoint = self.cache.with_data_mut(leaf, |data| {
            let mut left = LeafMut::new(data);
            let mut right = LeafMut::init(&mut new_leaf_buf);
            left.split(&mut right)
        });
        self.cache.with_data_mut(new_leaf_id, |data| data.copy_from_slice(&new_leaf_buf));

        let target_is_new = chunk >= splitpoint;
        let insert_into = if target_is_new { new_leaf_id } else { leaf };
        self.cache.with_data_mut(insert_into, |data| {
            LeafMut::new(data).add_exception(chunk, exception, snapbit, active)
        })?;

        self.cache.release(leaf, true);
        self.cache.release(new_leaf_id, true);

        self.insert_separator(path, splitpoint.as_u64(), new_leaf_sector)?;
        self.maybe_commit()
    }

    /// Propagates a new `(key, sector)` separator up through `path`
    /// (innermost parent first), splitting an interior node when it's
    /// full and growing a new root if the split reaches the top.
    fn insert_separator(&mut self, mut path: Vec<Sector>, mut key: u64, mut sector: Sector) -> Result<()> {
        while let Some(parent_sector) = path.pop() {
            let parent_id = self.read_node(parent_sector)?;
            let capacity = NodeMut::capacity(self.leaf_block_size()) as u32;
            let inserted = self.cache.with_data_mut(parent_id, |data| {
                let mut node = NodeMut::new(data);
                if node.count() >= capacity {
                    return false;
                }
                let at = node.find_child(key) + 1;
                node.insert_at(at, key, sector.as_u64());
                true
            });
            if inserted {
                self.cache.release(parent_id, true);
                return Ok(());
            }

            let new_node_chunk = self.new_metadata_chunk()?;
            let new_node_sector = self.geometry.chunk_to_sector(new_node_chunk);
            let mut new_node_buf = vec![0u8; self.leaf_block_size()];
            let pivot = self.cache.with_data_mut(parent_id, |data| {
                let mut left = NodeMut::new(data);
                let mut right = NodeMut::init(&mut new_node_buf);
                let pivot = left.split(&mut right);
                if key >= pivot {
                    let at = right.find_child(key) + 1;
                    right.insert_at(at, key, sector.as_u64());
                } else {
                    let at = left.find_child(key) + 1;
                    left.insert_at(at, key, sector.as_u64());
                }
                pivot
            });
            let new_node_id = self.cache.get(BufferId::new(DeviceId::Metadata, new_node_sector));
            self.cache.with_data_mut(new_node_id, |data| data.copy_from_slice(&new_node_buf));
            self.cache.release(parent_id, true);
            self.cache.release(new_node_id, true);

            key = pivot;
            sector = new_node_sector;
        }

        // The split reached the root: grow the tree by one level.
        let old_root_sector = self.sb.etree_root;
        let new_root_chunk = self.new_metadata_chunk()?;
        let new_root_sector = self.geometry.chunk_to_sector(new_root_chunk);
        let new_root_id = self.cache.get(BufferId::new(DeviceId::Metadata, new_root_sector));
        self.cache.with_data_mut(new_root_id, |data| {
            let mut root = NodeMut::init(data);
            root.push(0, old_root_sector.as_u64());
            root.push(key, sector.as_u64());
        });
        self.cache.release(new_root_id, true);
        self.sb.etree_root = new_root_sector;
        self.sb.etree_levels += 1;
        self.sb.mark_dirty();
        info!("btree grew to {} levels", self.sb.etree_levels);
        Ok(())
    }

    /// An origin write touching `chunk`: makes the chunk unique against
    /// every live snapshot, deferring (via the read-lock table) if a
    /// snapshot reader currently holds it.
    pub fn query_write_origin(&mut self, chunk: Chunk, client: ClientId) -> Result<OriginWrite> {
        if self.locks.is_locked(chunk) {
            let pending = self.next_pending_id;
            self.next_pending_id += 1;
            self.locks.begin_pending(pending, client);
            self.locks.waitfor_chunk(chunk, pending);
            debug!("deferring origin write to chunk {} for client {}", chunk.as_u64(), client);
            return Ok(OriginWrite::Deferred(DeferredWrite { pending }));
        }
        let exception = self.make_unique(chunk, None)?;
        Ok(OriginWrite::Proceed(exception))
    }

    /// A snapshot-private write touching `chunk` under snapshot `snapbit`.
    /// Squashed or unknown bits are rejected outright rather than silently
    /// fabricating an exception for a snapshot that no longer exists.
    pub fn query_write_snapshot(&mut self, chunk: Chunk, snapbit: u8) -> Result<Chunk> {
        if !self.sb.snapshots.is_live_bit(snapbit) {
            return Err(ErrorKind::Protocol(format!("snapshot bit {} is squashed or does not exist", snapbit)).into());
        }
        match self.make_unique(chunk, Some(snapbit))? {
            Some(exception) => Ok(exception),
            None => {
                // Already unique: the existing exception is the answer.
                let (leaf, _) = self.probe(chunk)?;
                let (_, addr) = self.check_unique(leaf, chunk, Some(snapbit));
                self.cache.release(leaf, false);
                addr.map(Chunk::new)
                    .ok_or_else(|| ErrorKind::Corrupt("unique snapshot chunk has no exception".into()).into())
            }
        }
    }

    /// The read-only half of `QUERY_SNAPSHOT_READ` (spec §4.4's "snapshot
    /// uniqueness test", invoked as `test_unique` in §4.7's dispatcher
    /// table): does `chunk` already have an exception recorded for
    /// `snapbit`, shared or private? Returns that exception's chunk if so.
    /// Returns `Ok(None)` when the snapshot still reads this chunk straight
    /// from the origin — the caller is then responsible for taking a
    /// readlock before replying, since nothing here does.
    ///
    /// Unlike `query_write_snapshot`, this never calls `make_unique`: a
    /// snapshot read must not copy data out or allocate a new exception
    /// just because a client asked to read it, or every read would pay the
    /// cost copy-on-write exists to avoid.
    pub fn test_unique_snapshot(&self, chunk: Chunk, snapbit: u8) -> Result<Option<Chunk>> {
        if !self.sb.snapshots.is_live_bit(snapbit) {
            return Err(ErrorKind::Protocol(format!("snapshot bit {} is squashed or does not exist", snapbit)).into());
        }
        let (leaf, _path) = self.probe(chunk)?;
        let (_, existing) = self.check_unique(leaf, chunk, Some(snapbit));
        self.cache.release(leaf, false);
        Ok(existing.map(Chunk::new))
    }

    pub fn readlock_chunk(&mut self, chunk: Chunk, client: ClientId) {
        self.locks.readlock_chunk(chunk, client);
    }

    pub fn release_read_lock(&mut self, chunk: Chunk, client: ClientId) -> Vec<PendingId> {
        self.locks.release_chunk(chunk, client)
    }

    /// Cleans up every piece of state a disconnecting client left behind
    /// (§5 Cancellation): decrements the use count of the snapshot it was
    /// reading (if any), releases every readlock it holds, and drops any
    /// origin write it had parked waiting on those locks. `reading_tag` is
    /// `None` when the disconnecting client never issued a
    /// `QUERY_SNAPSHOT_READ` (e.g. it only ever wrote the origin).
    ///
    /// Callers (the host's poll loop) should dispatch a reply for every id
    /// in `completed` exactly as `release_read_lock` would, and must not
    /// reply at all for ids in `cancelled` — the client that asked for
    /// them is already gone.
    pub fn client_disconnected(&mut self, client: ClientId, reading_tag: Option<u32>) -> DisconnectEffects {
        if let Some(tag) = reading_tag {
            if let Err(e) = self.sb.snapshots.add_usecount(tag, -1) {
                warn!("disconnect: use-count decrement for tag {} failed: {}", tag, e);
            }
        }
        let cancelled = self.locks.cancel_client_pending(client);
        let completed = self.locks.release_all_for_client(client);
        DisconnectEffects { completed, cancelled }
    }

    pub fn create_snapshot(&mut self, tag: u32, ctime: u32, prio: i8) -> Result<u8> {
        let bit = self.sb.snapshots.create(tag, ctime, prio)?;
        self.sb.mark_dirty();
        Ok(bit)
    }

    pub fn delete_snapshot(&mut self, tag: u32) -> Result<()> {
        let mask = self.sb.snapshots.delete(tag)?;
        self.sb.mark_dirty();
        if mask != 0 {
            self.delete_snapshots_from_tree(mask)?;
        }
        Ok(())
    }

    /// Reclaims a victim snapshot's tree entries without removing its
    /// table row (it stays listed, squashed, until the client explicitly
    /// deletes it).
    fn squash_snapshot(&mut self, bit: u8) -> Result<()> {
        self.delete_snapshots_from_tree(1u64 << bit)
    }

    fn sector_to_metadata_chunk(&self, sector: Sector) -> Chunk {
        Chunk::new(sector.as_u64() >> self.geometry.sector_bits())
    }

    /// Visits every leaf in the tree in order, clearing `snapmask`'s bits
    /// from its exceptions and freeing any chunk that ends up unshared.
    /// Adjoining leaves (and, one level up, adjoining interior nodes) that
    /// fit together afterward are merged, the freed metadata chunk handed
    /// back to the allocator and the merged-away entry dropped from their
    /// shared parent; if the root ends up with a single child once this
    /// settles, the tree drops a level.
    ///
    /// Merging is scoped to siblings under the same immediate parent. The
    /// original's range-delete also climbs across parent boundaries when a
    /// node empties out entirely (`remove_index`'s pivot-correction walk);
    /// that path never arises here because every node this function visits
    /// keeps at least one surviving child, so there is no boundary-crossing
    /// case to handle — same-parent merging already covers everything a
    /// `delete_snapshot` or victim squash produces.
    fn delete_snapshots_from_tree(&mut self, snapmask: u64) -> Result<()> {
        let mut freed_exceptions = Vec::new();
        let mut freed_meta = Vec::new();

        if self.sb.etree_levels == 0 {
            let leaf_id = self.read_node(self.sb.etree_root)?;
            let (dirty, leaf_freed) =
                self.cache.with_data_mut(leaf_id, |data| LeafMut::new(data).delete_snapshots(snapmask));
            self.cache.release(leaf_id, dirty);
            freed_exceptions.extend(leaf_freed);
        } else {
            self.compact_node(self.sb.etree_root, self.sb.etree_levels, snapmask, &mut freed_exceptions, &mut freed_meta)?;

            loop {
                let root_id = self.read_node(self.sb.etree_root)?;
                let only_child = self
                    .cache
                    .with_data(root_id, |data| {
                        let node = NodeRef::new(data);
                        (node.count() == 1).then(|| Sector(node.sector(0)))
                    });
                match only_child {
                    Some(child_sector) => {
                        self.cache.drop_buffer(root_id);
                        freed_meta.push(self.sector_to_metadata_chunk(self.sb.etree_root));
                        self.sb.etree_root = child_sector;
                        self.sb.etree_levels -= 1;
                        self.sb.mark_dirty();
                        info!("btree dropped to {} levels", self.sb.etree_levels);
                        if self.sb.etree_levels == 0 {
                            break;
                        }
                    }
                    None => {
                        self.cache.release(root_id, false);
                        break;
                    }
                }
            }
        }

        for chunk in freed_exceptions {
            self.alloc_data_space_mut().free_chunk(Chunk::new(chunk));
        }
        for chunk in freed_meta {
            self.sb.metadata_alloc.free_chunk(chunk);
        }
        if !self.cache.is_dirty_list_empty() {
            self.commit()?;
        }
        Ok(())
    }

    /// One node's worth of `delete_snapshots_from_tree`: clears `snapmask`
    /// from every leaf under this node (recursing through interior levels
    /// first), then folds adjoining children that fit together into one,
    /// rewriting this node's entry array if anything merged away.
    fn compact_node(
        &mut self,
        node_sector: Sector,
        levels_left: u32,
        snapmask: u64,
        freed_exceptions: &mut Vec<u64>,
        freed_meta: &mut Vec<Chunk>,
    ) -> Result<()> {
        let node_id = self.read_node(node_sector)?;
        let children: Vec<(u64, u64)> = self.cache.with_data(node_id, |data| {
            let node = NodeRef::new(data);
            (0..node.count()).map(|i| (node.key(i), node.sector(i))).collect()
        });
        self.cache.release(node_id, false);
        let original_count = children.len();
        let mut surviving: Vec<(u64, u64)> = Vec::with_capacity(children.len());

        if levels_left == 1 {
            let mut prev: Option<(BufferId, bool)> = None;
            for (key, sector) in children {
                let leaf_sector = Sector(sector);
                let leaf_id = self.read_node(leaf_sector)?;
                let (touched, leaf_freed) =
                    self.cache.with_data_mut(leaf_id, |data| LeafMut::new(data).delete_snapshots(snapmask));
                freed_exceptions.extend(leaf_freed);
                let dirty = touched;

                let mut merged = false;
                if let Some((prev_id, _)) = prev {
                    let this_payload = self.cache.with_data(leaf_id, |data| LeafRef::new(data).payload());
                    let prev_free = self.cache.with_data(prev_id, |data| LeafRef::new(data).freespace());
                    if this_payload <= prev_free {
                        let mut victim = self.cache.with_data(leaf_id, |data| data.to_vec());
                        self.cache
                            .with_data_mut(prev_id, |data| LeafMut::new(data).merge(&LeafMut::new(&mut victim)));
                        self.cache.drop_buffer(leaf_id);
                        freed_meta.push(self.sector_to_metadata_chunk(leaf_sector));
                        merged = true;
                    }
                }
                if merged {
                    prev = prev.map(|(id, _)| (id, true));
                } else {
                    if let Some((prev_id, prev_dirty)) = prev {
                        self.cache.release(prev_id, prev_dirty);
                    }
                    surviving.push((key, sector));
                    prev = Some((leaf_id, dirty));
                }
                self.maybe_commit()?;
            }
            if let Some((prev_id, prev_dirty)) = prev {
                self.cache.release(prev_id, prev_dirty);
            }
        } else {
            let mut prev_idx: Option<usize> = None;
            for (key, sector) in children {
                let child_sector = Sector(sector);
                self.compact_node(child_sector, levels_left - 1, snapmask, freed_exceptions, freed_meta)?;

                let mut merged = false;
                if let Some(pi) = prev_idx {
                    let prev_sector = Sector(surviving[pi].1);
                    let prev_id = self.read_node(prev_sector)?;
                    let cur_id = self.read_node(child_sector)?;
                    let capacity = NodeMut::capacity(self.leaf_block_size()) as u32;
                    let prev_count = self.cache.with_data(prev_id, |data| NodeRef::new(data).count());
                    let cur_count = self.cache.with_data(cur_id, |data| NodeRef::new(data).count());
                    if prev_count + cur_count <= capacity {
                        let mut victim = self.cache.with_data(cur_id, |data| data.to_vec());
                        self.cache
                            .with_data_mut(prev_id, |data| NodeMut::new(data).merge(&NodeMut::new(&mut victim)));
                        self.cache.release(prev_id, true);
                        self.cache.drop_buffer(cur_id);
                        freed_meta.push(self.sector_to_metadata_chunk(child_sector));
                        merged = true;
                    } else {
                        self.cache.release(prev_id, false);
                        self.cache.release(cur_id, false);
                    }
                }
                if !merged {
                    surviving.push((key, sector));
                    prev_idx = Some(surviving.len() - 1);
                }
                self.maybe_commit()?;
            }
        }

        if surviving.len() != original_count {
            let node_id = self.read_node(node_sector)?;
            self.cache.with_data_mut(node_id, |data| {
                let mut node = NodeMut::new(data);
                node.set_count(0);
                for (k, s) in &surviving {
                    node.push(*k, *s);
                }
            });
            self.cache.release(node_id, true);
        }
        Ok(())
    }

    /// Full in-order tree walk emitting every logical chunk whose exception
    /// sharemap bit for `tag1` differs from the bit for `tag2` — the basis
    /// the external changelist/delta tool builds its transfer list from.
    /// A chunk with no directory entry at all has both tags implicitly
    /// pointing at the origin, so it is never emitted.
    pub fn stream_changelist(&self, tag1: u32, tag2: u32) -> Result<Vec<u64>> {
        let snap1 = self
            .sb
            .snapshots
            .find_by_tag(tag1)
            .ok_or_else(|| ErrorKind::Protocol(format!("no such snapshot tag {}", tag1)))?;
        let snap2 = self
            .sb
            .snapshots
            .find_by_tag(tag2)
            .ok_or_else(|| ErrorKind::Protocol(format!("no such snapshot tag {}", tag2)))?;
        if snap1.is_squashed() || snap2.is_squashed() {
            return Err(ErrorKind::Protocol("cannot stream a changelist against a squashed snapshot".into()).into());
        }
        let mask1 = 1u64 << snap1.bit;
        let mask2 = 1u64 << snap2.bit;

        let mut out = Vec::new();
        let mut stack = vec![(self.sb.etree_root, self.sb.etree_levels)];
        while let Some((sector, levels_left)) = stack.pop() {
            let id = self.read_node(sector)?;
            if levels_left == 0 {
                let diffs = self.cache.with_data(id, |data| LeafRef::new(data).changelist_chunks(mask1, mask2));
                self.cache.release(id, false);
                out.extend(diffs);
            } else {
                let children: Vec<Sector> = self.cache.with_data(id, |data| {
                    let node = NodeRef::new(data);
                    (0..node.count()).rev().map(|i| Sector(node.sector(i))).collect()
                });
                self.cache.release(id, false);
                stack.extend(children.into_iter().map(|c| (c, levels_left - 1)));
            }
        }
        Ok(out)
    }

    pub fn list_snapshots(&self) -> &[crate::snapshot::Snapshot] {
        self.sb.snapshots.as_slice()
    }

    pub fn set_priority(&mut self, tag: u32, prio: i8) -> Result<()> {
        self.sb.snapshots.set_priority(tag, prio)?;
        self.sb.mark_dirty();
        Ok(())
    }

    pub fn add_usecount(&mut self, tag: u32, delta: i32) -> Result<u16> {
        let usecnt = self.sb.snapshots.add_usecount(tag, delta)?;
        self.sb.mark_dirty();
        Ok(usecnt)
    }

    /// Flushes a commit once the dirty list is within one slot of filling
    /// a single transaction, the same back-pressure a long range-delete or
    /// insert cascade needs to stay inside `max_commit_blocks` rather than
    /// fail outright with `Full` on the eventual real commit.
    fn maybe_commit(&mut self) -> Result<()> {
        let max = journal::JournalState::max_commit_blocks(self.geometry.block_bytes());
        if self.cache.dirty_len() + 1 >= max {
            self.commit()?;
        }
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        // Any pending copy-out run must land on the snapdata device before
        // the metadata transaction referencing its destination chunk is
        // journaled, or a crash between the two could commit an exception
        // that points at data never actually written.
        self.copyout.finish(self.geometry, self.origin_dev.as_ref(), self.snapdata_dev.as_ref())?;
        let meta_used = self.sb.metadata_alloc.total_chunks() - self.sb.metadata_alloc.free_chunks();
        let snap_used = self.alloc_data_space().total_chunks() - self.alloc_data_space().free_chunks();
        journal::commit_transaction(
            &mut self.sb.journal,
            &self.cache,
            self.metadata_dev.as_ref(),
            self.geometry,
            meta_used,
            snap_used,
        )?;
        if self.sb.self_check_enabled() {
            self.sb.metadata_alloc.self_check();
            self.alloc_data_space_mut().self_check();
        }
        self.sb.mark_dirty();
        Ok(())
    }

    /// Recovers from an unclean shutdown: replays the journal, then
    /// restores the superblock's journal cursor from the result.
    pub fn recover(&mut self) -> Result<()> {
        let recovered = journal::recover_journal(
            self.metadata_dev.as_ref(),
            self.sb.journal.base,
            self.sb.journal.size,
            self.geometry,
        )?;
        self.sb.journal = JournalState {
            base: self.sb.journal.base,
            size: self.sb.journal.size,
            next: recovered.journal_next,
            sequence: recovered.sequence,
        };
        self.sb.mark_dirty();
        Ok(())
    }

    pub fn max_snapshots(&self) -> usize {
        MAX_SNAPSHOTS
    }
}
