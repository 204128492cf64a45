//! Write-ahead journal and recovery.
//!
//! A transaction is the dirty data blocks followed immediately by one
//! commit block, written in order, then replayed back to their home
//! sectors. `commit_transaction` is a no-op when the cache's dirty list is
//! empty. Recovery scans every journal slot once, classifies each as data,
//! a valid commit, or a scribbled (torn-write) commit, and replays forward
//! from the newest valid commit.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::block::{Chunk, ChunkGeometry, Sector};
use crate::cache::BlockCache;
use crate::device::BlockDevice;
use crate::errors::*;

pub const JOURNAL_MAGIC: &[u8; 8] = b"MAGICNUM";
/// magic(8) + checksum(4) + sequence(4) + entries(4) + snap_used(8) + meta_used(8)
const COMMIT_HEADER_SIZE: usize = 8 + 4 + 4 + 4 + 8 + 8;

/// One closed transaction's commit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBlock {
    pub sequence: i64,
    pub snap_used: u64,
    pub meta_used: u64,
    /// Home sector of each data block written in this transaction, in the
    /// same order the data blocks were written.
    pub sectors: Vec<u64>,
}

impl CommitBlock {
    fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        buf[0..8].copy_from_slice(JOURNAL_MAGIC);
        LittleEndian::write_i32(&mut buf[12..16], self.sequence as i32);
        LittleEndian::write_u32(&mut buf[16..20], self.sectors.len() as u32);
        LittleEndian::write_u64(&mut buf[20..28], self.snap_used);
        LittleEndian::write_u64(&mut buf[28..36], self.meta_used);
        for (i, sector) in self.sectors.iter().enumerate() {
            let off = COMMIT_HEADER_SIZE + i * 8;
            LittleEndian::write_u64(&mut buf[off..off + 8], *sector);
        }
        let checksum = block_checksum(&buf);
        LittleEndian::write_u32(&mut buf[8..12], checksum.wrapping_neg());
        buf
    }

    fn decode(buf: &[u8]) -> Option<CommitBlock> {
        if !is_commit_magic(buf) {
            return None;
        }
        let sequence = LittleEndian::read_i32(&buf[12..16]) as i64;
        let entries = LittleEndian::read_u32(&buf[16..20]) as usize;
        let snap_used = LittleEndian::read_u64(&buf[20..28]);
        let meta_used = LittleEndian::read_u64(&buf[28..36]);
        let mut sectors = Vec::with_capacity(entries);
        for i in 0..entries {
            let off = COMMIT_HEADER_SIZE + i * 8;
            if off + 8 > buf.len() {
                return None;
            }
            sectors.push(LittleEndian::read_u64(&buf[off..off + 8]));
        }
        Some(CommitBlock {
            sequence,
            snap_used,
            meta_used,
            sectors,
        })
    }
}

fn is_commit_magic(buf: &[u8]) -> bool {
    buf.len() >= 8 && &buf[0..8] == JOURNAL_MAGIC
}

/// Additive 32-bit word checksum over the whole block; a valid commit block
/// sums to zero.
fn block_checksum(buf: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for word in buf.chunks_exact(4) {
        sum = sum.wrapping_add(LittleEndian::read_u32(word));
    }
    sum
}

/// Circular-log position tracking: base sector, slot count, next free slot,
/// and the monotone sequence counter.
#[derive(Debug, Clone, Copy)]
pub struct JournalState {
    pub base: Sector,
    pub size: u32,
    pub next: u32,
    pub sequence: i64,
}

impl JournalState {
    pub fn new(base: Sector, size: u32) -> Self {
        JournalState {
            base,
            size,
            next: 0,
            sequence: 0,
        }
    }

    fn slot_sector(&self, slot: u32, geometry: ChunkGeometry) -> Sector {
        self.base + (slot as u64) * geometry.sectors_per_chunk()
    }

    fn take_slot(&mut self) -> u32 {
        let slot = self.next;
        self.next = (self.next + 1) % self.size;
        slot
    }

    pub fn max_commit_blocks(block_size: usize) -> usize {
        (block_size - COMMIT_HEADER_SIZE) / 8
    }
}

/// Drains the cache's dirty list and writes one transaction: data blocks,
/// then a commit block, then the same data blocks to their home sectors.
/// No-op if nothing is dirty. Returns the commit's new usage counters for
/// the caller to persist in the superblock image.
pub fn commit_transaction(
    journal: &mut JournalState,
    cache: &BlockCache,
    metadata_dev: &dyn BlockDevice,
    geometry: ChunkGeometry,
    meta_used: u64,
    snap_used: u64,
) -> Result<()> {
    if cache.is_dirty_list_empty() {
        return Ok(());
    }
    let dirty = cache.drain_dirty();
    let max_entries = JournalState::max_commit_blocks(geometry.block_bytes());
    if dirty.len() > max_entries {
        return Err(ErrorKind::Full("transaction exceeds max_commit_blocks").into());
    }

    let mut sectors = Vec::with_capacity(dirty.len());
    for (id, data) in &dirty {
        let slot = journal.take_slot();
        let at = journal.slot_sector(slot, geometry);
        metadata_dev.write_at(data, at.as_bytes())?;
        sectors.push(id.sector.as_u64());
    }

    let commit = CommitBlock {
        sequence: journal.sequence,
        snap_used,
        meta_used,
        sectors,
    };
    journal.sequence += 1;
    let commit_slot = journal.take_slot();
    let commit_sector = journal.slot_sector(commit_slot, geometry);
    let encoded = commit.encode(geometry.block_bytes());
    debug_assert_eq!(block_checksum(&encoded), 0);
    metadata_dev.write_at(&encoded, commit_sector.as_bytes())?;

    for (id, data) in &dirty {
        metadata_dev.write_at(data, id.sector.as_bytes())?;
    }
    debug!("committed transaction seq={} entries={}", commit.sequence, dirty.len());
    Ok(())
}

/// Result of a successful journal replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredJournal {
    pub journal_next: u32,
    pub sequence: i64,
    pub meta_used: u64,
    pub snap_used: u64,
}

/// Scans the whole journal once, finds the newest commit (tolerating
/// exactly one scribbled/torn-write block adjacent to it), then replays
/// that transaction's data blocks back to their home sectors.
pub fn recover_journal(
    device: &dyn BlockDevice,
    base: Sector,
    size: u32,
    geometry: ChunkGeometry,
) -> Result<RecoveredJournal> {
    let block_bytes = geometry.block_bytes();
    let mut last_block: Option<usize> = None;
    let mut newest_block: Option<usize> = None;
    let mut scribbled: Option<usize> = None;
    let mut sequence: i64 = -1;

    for i in 0..size as usize {
        let sector = base + (i as u64) * geometry.sectors_per_chunk();
        let mut buf = vec![0u8; block_bytes];
        device.read_at(&mut buf, sector.as_bytes())?;

        if !is_commit_magic(&buf) {
            continue;
        }

        if block_checksum(&buf) != 0 {
            warn!("journal slot {} failed checksum", i);
            if scribbled.is_some() {
                return Err(ErrorKind::Corrupt("too many scribbled blocks in journal".into()).into());
            }
            if let Some(nb) = newest_block {
                if Some(nb) != last_block {
                    return Err(ErrorKind::Corrupt("bad block not last written".into()).into());
                }
            }
            scribbled = Some(i);
            if let Some(lb) = last_block {
                newest_block = Some(lb);
            }
            sequence += 1;
            continue;
        }

        let commit = CommitBlock::decode(&buf)
            .ok_or_else(|| ErrorKind::Corrupt(format!("malformed commit block at slot {}", i)))?;

        if last_block.is_some() && commit.sequence != sequence + 1 {
            let delta = sequence - commit.sequence;
            if delta <= 0 || delta > size as i64 {
                return Err(ErrorKind::Corrupt("bad sequence".into()).into());
            }
            if newest_block.is_some() {
                return Err(ErrorKind::Corrupt("multiple sequence wraps".into()).into());
            }
            if !(scribbled.is_none() || scribbled == Some(i - 1)) {
                return Err(ErrorKind::Corrupt("bad block not last written".into()).into());
            }
            newest_block = last_block;
        }

        last_block = Some(i);
        sequence = commit.sequence;
    }

    let last_block = last_block.ok_or_else(|| ErrorKind::Corrupt("no commit blocks found".into()))?;
    let newest_block = newest_block.unwrap_or(last_block);

    let newest_sector = base + (newest_block as u64) * geometry.sectors_per_chunk();
    let mut newest_buf = vec![0u8; block_bytes];
    device.read_at(&mut newest_buf, newest_sector.as_bytes())?;
    let commit = CommitBlock::decode(&newest_buf)
        .ok_or_else(|| ErrorKind::Corrupt("newest commit block unreadable".into()))?;

    debug!(
        "replaying {} entries from journal slot {}",
        commit.sectors.len(),
        newest_block
    );

    for (i, home_sector) in commit.sectors.iter().enumerate() {
        let pos = (newest_block as i64 - commit.sectors.len() as i64 + i as i64)
            .rem_euclid(size as i64) as usize;
        let data_sector = base + (pos as u64) * geometry.sectors_per_chunk();
        let mut data_buf = vec![0u8; block_bytes];
        device.read_at(&mut data_buf, data_sector.as_bytes())?;
        if is_commit_magic(&data_buf) {
            return Err(ErrorKind::Corrupt(format!("data block [{}] marked as commit block", pos)).into());
        }
        device.write_at(&data_buf, Sector(*home_sector).as_bytes())?;
    }

    Ok(RecoveredJournal {
        journal_next: ((newest_block + 1) % size as usize) as u32,
        sequence: commit.sequence + 1,
        meta_used: commit.meta_used,
        snap_used: commit.snap_used,
    })
}

/// Chunk-at-a-time offset helper retained for callers that address journal
/// slots by chunk rather than by raw index (kept distinct from `Sector` use
/// above so call sites read as chunk arithmetic, matching `journal_sector`
/// in the original).
pub fn journal_sector(base: Sector, slot: u32, geometry: ChunkGeometry) -> Sector {
    base + (slot as u64) * geometry.sectors_per_chunk()
}

pub fn journal_chunk(base: Sector, slot: u32, geometry: ChunkGeometry) -> Chunk {
    Chunk::new(journal_sector(base, slot, geometry).as_u64() >> geometry.sector_bits())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BufferId, DeviceId};
    use crate::device::MemDevice;

    fn geometry() -> ChunkGeometry {
        ChunkGeometry::new(3) // 8 sectors = 4 KiB chunks
    }

    #[test]
    fn commit_then_recover_roundtrip() {
        let geo = geometry();
        let block = geo.block_bytes();
        let journal_base = Sector(0);
        let journal_size = 8u32;
        let dev = MemDevice::new(block * (journal_size as usize + 4));
        let cache = BlockCache::new(block, block * 8);

        let home = BufferId::new(DeviceId::Metadata, Sector(geo.sectors_per_chunk() * 100));
        cache.get(home);
        cache.with_data_mut(home, |d| d[0] = 0xAB);
        cache.release(home, true);

        let mut journal = JournalState::new(journal_base, journal_size);
        commit_transaction(&mut journal, &cache, &dev, geo, 1, 0).unwrap();

        let recovered = recover_journal(&dev, journal_base, journal_size, geo).unwrap();
        assert_eq!(recovered.journal_next, 2);
        assert_eq!(recovered.sequence, 1);
        assert_eq!(recovered.meta_used, 1);

        let mut out = vec![0u8; block];
        dev.read_at(&mut out, home.sector.as_bytes()).unwrap();
        assert_eq!(out[0], 0xAB);
    }

    #[test]
    fn tolerates_one_scribbled_commit() {
        let geo = geometry();
        let block = geo.block_bytes();
        let journal_base = Sector(0);
        let journal_size = 8u32;
        let dev = MemDevice::new(block * (journal_size as usize + 4));
        let cache = BlockCache::new(block, block * 8);

        // First transaction.
        let home = BufferId::new(DeviceId::Metadata, Sector(geo.sectors_per_chunk() * 50));
        cache.get(home);
        cache.with_data_mut(home, |d| d[0] = 0x11);
        cache.release(home, true);
        let mut journal = JournalState::new(journal_base, journal_size);
        commit_transaction(&mut journal, &cache, &dev, geo, 1, 0).unwrap();

        // Second transaction, then scribble its commit block to simulate a
        // torn write.
        cache.get(home);
        cache.with_data_mut(home, |d| d[0] = 0x22);
        cache.release(home, true);
        let commit_slot_before = journal.next;
        commit_transaction(&mut journal, &cache, &dev, geo, 2, 0).unwrap();
        let commit_sector = journal_sector(journal_base, (commit_slot_before + 1) % journal_size, geo);
        // Corrupt a few bytes past the magic so the block still parses as a
        // commit block but fails its checksum, simulating a torn write that
        // landed mid-block rather than wiping it entirely.
        dev.scribble(commit_sector.as_bytes() + 12, 8);

        let recovered = recover_journal(&dev, journal_base, journal_size, geo).unwrap();
        assert_eq!(recovered.sequence, 1); // rolled back to the first commit
        assert_eq!(recovered.meta_used, 1);
    }
}
