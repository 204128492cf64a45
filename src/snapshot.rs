//! Snapshot table: up to [`MAX_SNAPSHOTS`] live snapshots, each bound to one
//! bit in the 64-bit share masks stored in B-tree exceptions.

use log::warn;

use crate::errors::*;

pub const MAX_SNAPSHOTS: usize = 64;
/// Sentinel `bit` value meaning "this slot's tree entries were already
/// reclaimed, but the tag/usecount bookkeeping is kept until the client
/// explicitly deletes it".
pub const SNAPSHOT_SQUASHED: u8 = u8::MAX;
/// Priority that exempts a snapshot from victim selection entirely.
pub const PRIORITY_NEVER_DROP: i8 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub ctime: u32,
    pub tag: u32,
    pub usecnt: u16,
    pub bit: u8,
    pub prio: i8,
}

impl Snapshot {
    pub fn is_squashed(&self) -> bool {
        self.bit == SNAPSHOT_SQUASHED
    }
}

/// Creation-ordered list of live snapshots plus the bit allocator for the
/// 64 internal snapshot numbers.
#[derive(Debug, Clone, Default)]
pub struct SnapshotTable {
    snapshots: Vec<Snapshot>,
}

impl SnapshotTable {
    pub fn new() -> Self {
        SnapshotTable { snapshots: Vec::new() }
    }

    pub fn from_image(snapshots: Vec<Snapshot>) -> Self {
        SnapshotTable { snapshots }
    }

    pub fn as_slice(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn find_by_tag(&self, tag: u32) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.tag == tag)
    }

    /// Whether `bit` currently names a live (non-squashed) snapshot —
    /// a write against a squashed or never-created bit must be rejected
    /// rather than silently fabricating an exception for it.
    pub fn is_live_bit(&self, bit: u8) -> bool {
        self.snapshots.iter().any(|s| !s.is_squashed() && s.bit == bit)
    }

    fn find_by_tag_mut(&mut self, tag: u32) -> Option<&mut Snapshot> {
        self.snapshots.iter_mut().find(|s| s.tag == tag)
    }

    /// Bitmask of every bit currently in use, squashed or not — used only
    /// to find a free bit for a new snapshot.
    fn occupied_bits(&self) -> u64 {
        self.snapshots
            .iter()
            .filter(|s| !s.is_squashed())
            .fold(0u64, |m, s| m | (1u64 << s.bit))
    }

    /// Mask of bits belonging to live (non-squashed) snapshots — the
    /// `snapmask` every origin write and uniqueness check is framed
    /// against.
    pub fn active_mask(&self) -> u64 {
        self.occupied_bits()
    }

    pub fn create(&mut self, tag: u32, ctime: u32, prio: i8) -> Result<u8> {
        if self.snapshots.len() >= MAX_SNAPSHOTS {
            return Err(ErrorKind::Full("snapshot table full").into());
        }
        if self.find_by_tag(tag).is_some() {
            return Err(ErrorKind::Protocol(format!("snapshot tag {} already exists", tag)).into());
        }
        let used = self.occupied_bits();
        let bit = (0..MAX_SNAPSHOTS as u8).find(|&b| used & (1 << b) == 0);
        let Some(bit) = bit else {
            return Err(ErrorKind::Full("no free snapshot bit").into());
        };
        self.snapshots.push(Snapshot { ctime, tag, usecnt: 0, bit, prio });
        Ok(bit)
    }

    /// Removes a snapshot's table entry and returns the bit mask its tree
    /// entries need deleting under (zero if it was already squashed, in
    /// which case the tree was already reclaimed by an earlier victim
    /// sweep and there is nothing more to delete).
    pub fn delete(&mut self, tag: u32) -> Result<u64> {
        let pos = self
            .snapshots
            .iter()
            .position(|s| s.tag == tag)
            .ok_or_else(|| ErrorKind::Protocol(format!("no such snapshot tag {}", tag)))?;
        let snap = self.snapshots.remove(pos);
        Ok(if snap.is_squashed() { 0 } else { 1u64 << snap.bit })
    }

    pub fn set_priority(&mut self, tag: u32, prio: i8) -> Result<()> {
        let snap = self
            .find_by_tag_mut(tag)
            .ok_or_else(|| ErrorKind::Protocol(format!("no such snapshot tag {}", tag)))?;
        snap.prio = prio;
        Ok(())
    }

    pub fn add_usecount(&mut self, tag: u32, delta: i32) -> Result<u16> {
        let snap = self
            .find_by_tag_mut(tag)
            .ok_or_else(|| ErrorKind::Protocol(format!("no such snapshot tag {}", tag)))?;
        let new_usecnt = snap.usecnt as i64 + delta as i64;
        if !(0..=u16::MAX as i64).contains(&new_usecnt) {
            return Err(ErrorKind::Protocol("use count out of range".into()).into());
        }
        snap.usecnt = new_usecnt as u16;
        Ok(snap.usecnt)
    }

    /// Picks the snapshot to drop under allocation pressure: the oldest
    /// (lowest table index, i.e. earliest created) snapshot with a zero use
    /// count and the lowest priority among those; if every live snapshot is
    /// in use, falls back to the lowest-priority one regardless of use
    /// count. Squashed entries are skipped; `PRIORITY_NEVER_DROP` entries
    /// are only returned if nothing else qualifies.
    pub fn find_victim(&self) -> Option<&Snapshot> {
        let mut best: Option<&Snapshot> = None;
        for snap in &self.snapshots {
            if snap.is_squashed() {
                continue;
            }
            best = Some(match best {
                None => snap,
                Some(b) => {
                    if (snap.usecnt != 0) && (b.usecnt == 0) {
                        b
                    } else if (snap.usecnt == 0) == (b.usecnt == 0) && snap.prio >= b.prio {
                        b
                    } else {
                        snap
                    }
                }
            });
        }
        best
    }

    /// Marks a snapshot's bit squashed in place (its tree entries have been
    /// reclaimed by a victim sweep, but it is still a named, listable
    /// snapshot until deleted).
    pub fn squash(&mut self, tag: u32) {
        if let Some(snap) = self.find_by_tag_mut(tag) {
            snap.bit = SNAPSHOT_SQUASHED;
        } else {
            warn!("squash requested for unknown tag {}", tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_lowest_free_bit() {
        let mut table = SnapshotTable::new();
        let b0 = table.create(1, 0, 0).unwrap();
        let b1 = table.create(2, 0, 0).unwrap();
        assert_eq!(b0, 0);
        assert_eq!(b1, 1);
        assert_eq!(table.active_mask(), 0b11);
    }

    #[test]
    fn duplicate_tag_rejected() {
        let mut table = SnapshotTable::new();
        table.create(1, 0, 0).unwrap();
        assert!(table.create(1, 0, 0).is_err());
    }

    #[test]
    fn victim_prefers_idle_lowest_priority() {
        let mut table = SnapshotTable::new();
        table.create(1, 0, 50).unwrap();
        table.create(2, 0, 10).unwrap();
        table.add_usecount(1, 1).unwrap(); // snap 1 in use
        let victim = table.find_victim().unwrap();
        assert_eq!(victim.tag, 2); // idle beats in-use regardless of priority
    }

    #[test]
    fn victim_falls_back_to_lowest_priority_when_all_busy() {
        let mut table = SnapshotTable::new();
        table.create(1, 0, 50).unwrap();
        table.create(2, 0, 10).unwrap();
        table.add_usecount(1, 1).unwrap();
        table.add_usecount(2, 1).unwrap();
        let victim = table.find_victim().unwrap();
        assert_eq!(victim.tag, 2); // lowest priority among the busy ones
    }

    #[test]
    fn squashed_snapshot_never_chosen_as_victim() {
        let mut table = SnapshotTable::new();
        table.create(1, 0, 0).unwrap();
        table.squash(1);
        assert!(table.find_victim().is_none());
    }

    #[test]
    fn deleting_squashed_snapshot_needs_no_tree_delete() {
        let mut table = SnapshotTable::new();
        table.create(1, 0, 0).unwrap();
        table.squash(1);
        let mask = table.delete(1).unwrap();
        assert_eq!(mask, 0);
    }
}
