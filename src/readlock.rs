//! Read-lock arbiter: defers an origin write that touches a chunk currently
//! being read by one or more snapshot readers until every reader releases
//! it.
//!
//! A lock exists only while at least one reader holds it; the moment the
//! last holder releases, the lock (and its waiters) are dropped. Waiters
//! are themselves `Pending` requests that may be blocked on more than one
//! chunk at once (an origin write spanning several chunks, some locked and
//! some not) — a waiter only becomes ready once its `holdcount` reaches
//! zero across every chunk it was deferred on.

use std::collections::HashMap;

use rustc_hash::FxHashMap;

use crate::block::Chunk;

pub type ClientId = u64;
pub type PendingId = u64;

#[derive(Default)]
struct Lock {
    holders: Vec<ClientId>,
    waiters: Vec<PendingId>,
}

/// Tracks, per deferred request, how many locked chunks it is still
/// waiting on. A request becomes ready to answer once this reaches zero.
/// `owner` is the client that issued the deferred write, so a disconnect
/// can find and drop its pendings without the caller having to remember
/// which ids belong to which client.
#[derive(Debug, Default)]
struct PendingCount {
    remaining: u32,
    owner: ClientId,
}

/// Hash-bucketed table of chunk read-locks, plus the hold-count ledger for
/// requests deferred on one or more of them.
pub struct SnapLockTable {
    locks: FxHashMap<Chunk, Lock>,
    pending: HashMap<PendingId, PendingCount>,
}

impl SnapLockTable {
    pub fn new(_hash_bits: u32) -> Self {
        // The original sizes a fixed 2^hash_bits bucket array and chains
        // collisions; an `FxHashMap` gives the same O(1) amortized lookup
        // without committing to a bucket count up front.
        SnapLockTable {
            locks: FxHashMap::default(),
            pending: HashMap::new(),
        }
    }

    /// A snapshot reader takes a read lock on `chunk` for the duration of
    /// its read.
    pub fn readlock_chunk(&mut self, chunk: Chunk, client: ClientId) {
        self.locks.entry(chunk).or_default().holders.push(client);
    }

    /// An origin write defers on `chunk` if it is currently locked,
    /// registering `pending` as a waiter and bumping its hold count. No-op
    /// if the chunk isn't locked (caller can proceed immediately).
    pub fn waitfor_chunk(&mut self, chunk: Chunk, pending: PendingId) {
        if let Some(lock) = self.locks.get_mut(&chunk) {
            lock.waiters.push(pending);
            self.pending.entry(pending).or_default().remaining += 1;
        }
    }

    /// Registers `pending` up front so `waitfor_chunk` calls always find an
    /// entry to bump, mirroring the original's lazily-allocated
    /// `*pending`. Call once per deferred request before any
    /// `waitfor_chunk` calls for it. `owner` is recorded so a later
    /// disconnect of that client can find and drop this pending.
    pub fn begin_pending(&mut self, pending: PendingId, owner: ClientId) {
        self.pending.entry(pending).or_insert(PendingCount { remaining: 0, owner });
    }

    /// Releases `client`'s hold on `chunk`. Returns the set of waiters that
    /// became ready to answer (hold count reached zero) as a result —
    /// empty if the lock had other holders left, or if releasing a waiter
    /// that was also blocked elsewhere.
    pub fn release_chunk(&mut self, chunk: Chunk, client: ClientId) -> Vec<PendingId> {
        let Some(lock) = self.locks.get_mut(&chunk) else {
            return Vec::new();
        };
        if let Some(pos) = lock.holders.iter().position(|&c| c == client) {
            lock.holders.remove(pos);
        }
        if !lock.holders.is_empty() {
            return Vec::new();
        }

        let lock = self.locks.remove(&chunk).unwrap();
        let mut ready = Vec::new();
        for waiter in lock.waiters {
            if let Some(count) = self.pending.get_mut(&waiter) {
                count.remaining = count.remaining.saturating_sub(1);
                if count.remaining == 0 {
                    self.pending.remove(&waiter);
                    ready.push(waiter);
                }
            }
        }
        ready
    }

    pub fn is_locked(&self, chunk: Chunk) -> bool {
        self.locks.contains_key(&chunk)
    }

    /// Releases every lock `client` holds, as if `release_chunk` had been
    /// called once per chunk. Used when a client disconnects: §5's
    /// "release every readlock held by that client (iteratively through
    /// the hash table)". Returns the combined set of waiters that became
    /// ready across all of them.
    pub fn release_all_for_client(&mut self, client: ClientId) -> Vec<PendingId> {
        let held_chunks: Vec<Chunk> =
            self.locks.iter().filter(|(_, lock)| lock.holders.contains(&client)).map(|(&c, _)| c).collect();
        let mut ready = Vec::new();
        for chunk in held_chunks {
            ready.extend(self.release_chunk(chunk, client));
        }
        ready
    }

    /// Drops every pending request `client` originated, without counting
    /// down or dispatching a reply for it — §5's "drop any parked pending
    /// whose client matches". The dangling waiter entries left behind in
    /// `locks` are harmless: `release_chunk` already tolerates a waiter id
    /// that no longer has a `pending` entry.
    pub fn cancel_client_pending(&mut self, client: ClientId) -> Vec<PendingId> {
        let cancelled: Vec<PendingId> =
            self.pending.iter().filter(|(_, count)| count.owner == client).map(|(&id, _)| id).collect();
        for id in &cancelled {
            self.pending.remove(id);
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_to_unlocked_chunk_never_defers() {
        let mut table = SnapLockTable::new(10);
        table.begin_pending(1, 42);
        table.waitfor_chunk(Chunk::new(5), 1);
        assert!(!table.is_locked(Chunk::new(5)));
    }

    #[test]
    fn write_waits_until_reader_releases() {
        let mut table = SnapLockTable::new(10);
        table.readlock_chunk(Chunk::new(5), 100);
        table.begin_pending(1, 42);
        table.waitfor_chunk(Chunk::new(5), 1);
        assert!(table.is_locked(Chunk::new(5)));

        let ready = table.release_chunk(Chunk::new(5), 100);
        assert_eq!(ready, vec![1]);
        assert!(!table.is_locked(Chunk::new(5)));
    }

    #[test]
    fn waiter_spanning_multiple_chunks_waits_for_all() {
        let mut table = SnapLockTable::new(10);
        table.readlock_chunk(Chunk::new(1), 100);
        table.readlock_chunk(Chunk::new(2), 200);
        table.begin_pending(7, 42);
        table.waitfor_chunk(Chunk::new(1), 7);
        table.waitfor_chunk(Chunk::new(2), 7);

        let ready = table.release_chunk(Chunk::new(1), 100);
        assert!(ready.is_empty()); // still waiting on chunk 2

        let ready = table.release_chunk(Chunk::new(2), 200);
        assert_eq!(ready, vec![7]);
    }

    #[test]
    fn lock_with_multiple_readers_needs_every_release() {
        let mut table = SnapLockTable::new(10);
        table.readlock_chunk(Chunk::new(9), 1);
        table.readlock_chunk(Chunk::new(9), 2);
        assert!(table.release_chunk(Chunk::new(9), 1).is_empty());
        assert!(table.is_locked(Chunk::new(9)));
        assert!(table.release_chunk(Chunk::new(9), 2).is_empty());
        assert!(!table.is_locked(Chunk::new(9)));
    }

    #[test]
    fn disconnect_releases_every_lock_the_client_holds() {
        let mut table = SnapLockTable::new(10);
        table.readlock_chunk(Chunk::new(1), 100);
        table.readlock_chunk(Chunk::new(2), 100);
        table.begin_pending(1, 999);
        table.waitfor_chunk(Chunk::new(1), 1);
        table.begin_pending(2, 999);
        table.waitfor_chunk(Chunk::new(2), 2);

        let mut ready = table.release_all_for_client(100);
        ready.sort();
        assert_eq!(ready, vec![1, 2]);
        assert!(!table.is_locked(Chunk::new(1)));
        assert!(!table.is_locked(Chunk::new(2)));
    }

    #[test]
    fn disconnect_drops_only_that_clients_pending_writes() {
        let mut table = SnapLockTable::new(10);
        table.readlock_chunk(Chunk::new(5), 1);
        table.begin_pending(10, 200); // owned by the disconnecting client
        table.waitfor_chunk(Chunk::new(5), 10);
        table.begin_pending(11, 201); // owned by a different client
        table.waitfor_chunk(Chunk::new(5), 11);

        let cancelled = table.cancel_client_pending(200);
        assert_eq!(cancelled, vec![10]);

        // Releasing the reader still reports the surviving pending as
        // ready; the cancelled one is silently absent, not reported twice.
        let ready = table.release_chunk(Chunk::new(5), 1);
        assert_eq!(ready, vec![11]);
    }
}
