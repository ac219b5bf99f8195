//! Degraded locks: per-stripe records of which chunks are being rebuilt
//! where while their servers fail over.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::stripe::{ChunkId, ChunkPos, ListId, StripeId, StripeList};
use crate::transit::ServerAddr;
use crate::utils::Bitmap;

use serde::{Deserialize, Serialize};

/// Chunk `original` is served from the rebuilt copy at `reconstructed`.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ReconstructionEntry {
    pub original: ChunkPos,
    pub reconstructed: ChunkPos,
}

impl ReconstructionEntry {
    pub fn new(original: ChunkPos, reconstructed: ChunkPos) -> Self {
        ReconstructionEntry {
            original,
            reconstructed,
        }
    }
}

/// Degraded lock of one stripe.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct DegradedLock {
    /// Sorted by original chunk id, one entry per original chunk.
    entries: Vec<ReconstructionEntry>,

    /// Data chunk that the locking operation was working on.
    pub ongoing_at_chunk: ChunkId,
}

impl DegradedLock {
    pub fn new(entries: Vec<ReconstructionEntry>, ongoing_at_chunk: ChunkId) -> Self {
        let mut lock = DegradedLock {
            entries: vec![],
            ongoing_at_chunk,
        };
        lock.merge(&entries);
        lock
    }

    pub fn entries(&self) -> &[ReconstructionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn has_original(&self, original: &ChunkPos) -> bool {
        self.entries.iter().any(|e| e.original == *original)
    }

    /// Adds the entries whose original chunk is not locked yet. Returns how
    /// many were added.
    pub fn merge(&mut self, entries: &[ReconstructionEntry]) -> usize {
        let mut added = 0;
        for entry in entries {
            if !self.has_original(&entry.original) {
                self.entries.push(*entry);
                added += 1;
            }
        }
        self.entries.sort_by_key(|e| e.original.chunk_id);
        added
    }

    /// Assigns a reconstruction target to every chunk of the stripe that is
    /// neither surviving nor locked yet. Targets rotate over the surviving
    /// chunks not already used as targets, then over all surviving chunks.
    /// Returns how many entries were added.
    pub fn expand(
        &mut self,
        list_id: ListId,
        surviving: &[ChunkId],
        chunk_count: u32,
    ) -> usize {
        if surviving.is_empty() {
            pf_warn!("list {} has no surviving chunk to rebuild onto", list_id);
            return 0;
        }

        let mut handled = Bitmap::new(chunk_count, false);
        let mut targeted = Bitmap::new(chunk_count, false);
        for c in surviving.iter().filter(|c| **c < chunk_count) {
            let _ = handled.set(*c, true);
        }
        for entry in &self.entries {
            let _ = handled.set(entry.original.chunk_id, true);
            let _ = targeted.set(entry.reconstructed.chunk_id, true);
        }

        let mut spare: Vec<ChunkId> = surviving
            .iter()
            .copied()
            .filter(|c| !targeted.get(*c).unwrap_or(false))
            .collect();
        if spare.is_empty() {
            spare = surviving.to_vec();
        }

        let mut added = 0;
        for chunk_id in handled.zeros() {
            let target = spare[added % spare.len()];
            self.entries.push(ReconstructionEntry::new(
                ChunkPos::new(list_id, chunk_id),
                ChunkPos::new(list_id, target),
            ));
            added += 1;
        }
        self.entries.sort_by_key(|e| e.original.chunk_id);
        added
    }

    /// Entries with those of `chunk_id` moved to the front.
    pub fn reordered_for(&self, chunk_id: ChunkId) -> Vec<ReconstructionEntry> {
        let (mut front, back): (Vec<_>, Vec<_>) = self
            .entries
            .iter()
            .partition(|e| e.original.chunk_id == chunk_id);
        front.extend(back);
        front
    }
}

/// One released reconstruction handed back to its destination server.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct ReleasedChunk {
    pub stripe_id: StripeId,
    pub original: ChunkPos,
    pub reconstructed: ChunkPos,
}

/// Result of `DegradedLockMap::lock_or_merge`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LockOutcome {
    /// A new lock was installed.
    Created(DegradedLock),

    /// An existing lock was extended (possibly by nothing).
    Merged(DegradedLock),

    /// No lock existed and nothing needed rebuilding.
    Unlocked,
}

type StripeKey = (ListId, StripeId);

#[derive(Debug, Default)]
struct LockTables {
    locks: BTreeMap<StripeKey, DegradedLock>,
    releasing: HashMap<ServerAddr, Vec<(StripeKey, DegradedLock)>>,
}

/// All degraded locks known to a coordinator.
#[derive(Debug, Default)]
pub struct DegradedLockMap {
    tables: Mutex<LockTables>,
}

impl DegradedLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, LockTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn find(&self, list_id: ListId, stripe_id: StripeId) -> Option<DegradedLock> {
        self.tables().locks.get(&(list_id, stripe_id)).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables().locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables().locks.is_empty()
    }

    /// Extends the stripe's lock with `entries` if one exists; otherwise
    /// installs a new lock unless `entries` is empty. Either way the lock is
    /// expanded to cover every non-surviving chunk.
    pub fn lock_or_merge(
        &self,
        list_id: ListId,
        stripe_id: StripeId,
        entries: &[ReconstructionEntry],
        ongoing_at_chunk: ChunkId,
        surviving: &[ChunkId],
        chunk_count: u32,
    ) -> LockOutcome {
        let mut tables = self.tables();
        if let Some(lock) = tables.locks.get_mut(&(list_id, stripe_id)) {
            let added = lock.merge(entries) + lock.expand(list_id, surviving, chunk_count);
            pf_trace!(
                "lock ({}, {}) extended by {} entries",
                list_id,
                stripe_id,
                added
            );
            return LockOutcome::Merged(lock.clone());
        }
        if entries.is_empty() {
            return LockOutcome::Unlocked;
        }

        let mut lock = DegradedLock::new(entries.to_vec(), ongoing_at_chunk);
        lock.expand(list_id, surviving, chunk_count);
        tables.locks.insert((list_id, stripe_id), lock.clone());
        pf_debug!("lock ({}, {}) created: {:?}", list_id, stripe_id, lock);
        LockOutcome::Created(lock)
    }

    /// Takes every lock that rebuilds a chunk placed on `server` and groups
    /// its reconstructions by the server holding the rebuilt copy. The locks
    /// stay in the releasing set until `finish_release`.
    pub fn release_for_server(
        &self,
        server: &ServerAddr,
        stripes: &StripeList,
    ) -> HashMap<ServerAddr, Vec<ReleasedChunk>> {
        let mut tables = self.tables();
        let keys: Vec<StripeKey> = tables
            .locks
            .iter()
            .filter(|(_, lock)| {
                lock.entries
                    .iter()
                    .any(|e| stripes.server_of(e.original).as_ref() == Some(server))
            })
            .map(|(key, _)| *key)
            .collect();

        let mut grouped: HashMap<ServerAddr, Vec<ReleasedChunk>> = HashMap::new();
        let mut released = vec![];
        for key in keys {
            let Some(lock) = tables.locks.remove(&key) else {
                continue;
            };
            for entry in &lock.entries {
                let Some(dst) = stripes.server_of(entry.reconstructed) else {
                    pf_warn!("no server for rebuilt chunk {:?}", entry.reconstructed);
                    continue;
                };
                grouped.entry(dst).or_default().push(ReleasedChunk {
                    stripe_id: key.1,
                    original: entry.original,
                    reconstructed: entry.reconstructed,
                });
            }
            released.push((key, lock));
        }
        pf_debug!("releasing {} locks of server {}", released.len(), server);
        tables.releasing.entry(*server).or_default().extend(released);
        grouped
    }

    /// Number of locks of `server` waiting for `finish_release`.
    pub fn releasing_len(&self, server: &ServerAddr) -> usize {
        self.tables().releasing.get(server).map_or(0, Vec::len)
    }

    /// Drops the locks released for `server`. Returns how many were dropped.
    pub fn finish_release(&self, server: &ServerAddr) -> usize {
        self.tables().releasing.remove(server).map_or(0, |v| v.len())
    }

    /// Puts the locks taken by `release_for_server` back in place after a
    /// failed release. A lock re-created for the same stripe meanwhile is
    /// merged with the returned one.
    pub fn abort_release(&self, server: &ServerAddr) -> usize {
        let mut tables = self.tables();
        let Some(released) = tables.releasing.remove(server) else {
            return 0;
        };
        let restored = released.len();
        for (key, lock) in released {
            match tables.locks.get_mut(&key) {
                Some(existing) => {
                    existing.merge(lock.entries());
                }
                None => {
                    tables.locks.insert(key, lock);
                }
            }
        }
        pf_debug!("restored {} locks of server {}", restored, server);
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::seq::SliceRandom;
    use std::collections::HashSet;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn entry(list: ListId, from: ChunkId, to: ChunkId) -> ReconstructionEntry {
        ReconstructionEntry::new(ChunkPos::new(list, from), ChunkPos::new(list, to))
    }

    fn addr(last: u8) -> ServerAddr {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 7, last), 9000)
    }

    #[test]
    fn merge_keeps_first_target() {
        let mut lock = DegradedLock::new(vec![entry(0, 3, 0), entry(0, 1, 2)], 1);
        assert_eq!(lock.entries(), &[entry(0, 1, 2), entry(0, 3, 0)]);
        assert_eq!(lock.merge(&[entry(0, 1, 4), entry(0, 2, 4)]), 1);
        assert_eq!(
            lock.entries(),
            &[entry(0, 1, 2), entry(0, 2, 4), entry(0, 3, 0)]
        );
        assert_eq!(
            lock.reordered_for(2),
            vec![entry(0, 2, 4), entry(0, 1, 2), entry(0, 3, 0)]
        );
    }

    #[test]
    fn expand_round_robin() {
        let mut lock = DegradedLock::new(vec![entry(1, 0, 4)], 0);
        // chunks 1 and 2 lost as well, 3..=5 survive and 4 is already used
        assert_eq!(lock.expand(1, &[3, 4, 5], 6), 2);
        assert_eq!(
            lock.entries(),
            &[entry(1, 0, 4), entry(1, 1, 3), entry(1, 2, 5)]
        );
        assert_eq!(lock.expand(1, &[3, 4, 5], 6), 0);
        assert_eq!(DegradedLock::default().expand(1, &[], 6), 0);
    }

    #[test]
    fn random_expand_covers_stripe() {
        let mut rng = rand::thread_rng();
        for _ in 0..300 {
            let n: u32 = rng.gen_range(2..16);
            let mut ids: Vec<ChunkId> = (0..n).collect();
            ids.shuffle(&mut rng);
            let nsurv = rng.gen_range(1..n as usize);
            let (surviving, lost) = ids.split_at(nsurv);
            let nlocked = rng.gen_range(0..=lost.len());
            let seeded: Vec<_> = lost[..nlocked]
                .iter()
                .map(|c| entry(0, *c, *surviving.choose(&mut rng).unwrap()))
                .collect();

            let mut lock = DegradedLock::new(seeded.clone(), 0);
            lock.expand(0, surviving, n);

            let originals: Vec<ChunkId> =
                lock.entries().iter().map(|e| e.original.chunk_id).collect();
            let mut expected: Vec<ChunkId> = lost.to_vec();
            expected.sort();
            assert_eq!(originals, expected);
            for e in lock.entries() {
                assert!(surviving.contains(&e.reconstructed.chunk_id));
            }
            for e in &seeded {
                assert!(lock.entries().contains(e));
            }
            // fresh targets are spread before any reuse
            let fresh: Vec<_> = lock
                .entries()
                .iter()
                .filter(|e| !seeded.contains(e))
                .map(|e| e.reconstructed.chunk_id)
                .collect();
            let unused = surviving
                .iter()
                .filter(|c| !seeded.iter().any(|e| e.reconstructed.chunk_id == **c))
                .count();
            if unused > 0 && fresh.len() <= unused {
                let distinct: HashSet<_> = fresh.iter().collect();
                assert_eq!(distinct.len(), fresh.len());
            }
        }
    }

    #[test]
    fn lock_merge_release() {
        let servers: Vec<_> = (1..=4).map(addr).collect();
        let stripes = StripeList::new(2, 2, vec![servers.clone()]).unwrap();
        let map = DegradedLockMap::new();

        assert_eq!(map.lock_or_merge(0, 9, &[], 0, &[1, 2, 3], 4), LockOutcome::Unlocked);
        let LockOutcome::Created(lock) =
            map.lock_or_merge(0, 9, &[entry(0, 0, 2)], 0, &[1, 2, 3], 4)
        else {
            panic!("lock not created");
        };
        assert_eq!(lock.entries(), &[entry(0, 0, 2)]);
        assert!(matches!(
            map.lock_or_merge(0, 9, &[entry(0, 0, 3)], 0, &[1, 2, 3], 4),
            LockOutcome::Merged(l) if l.entries() == [entry(0, 0, 2)]
        ));
        map.lock_or_merge(0, 10, &[entry(0, 1, 3)], 1, &[0, 2, 3], 4);
        assert_eq!(map.len(), 2);

        let grouped = map.release_for_server(&addr(1), &stripes);
        assert_eq!(
            grouped.get(&addr(3)),
            Some(&vec![ReleasedChunk {
                stripe_id: 9,
                original: ChunkPos::new(0, 0),
                reconstructed: ChunkPos::new(0, 2),
            }])
        );
        assert_eq!(map.len(), 1);
        assert!(map.find(0, 10).is_some());
        assert_eq!(map.releasing_len(&addr(1)), 1);
        assert_eq!(map.finish_release(&addr(1)), 1);
        assert_eq!(map.releasing_len(&addr(1)), 0);
    }

    #[test]
    fn failed_release_restores_locks() {
        let servers: Vec<_> = (1..=4).map(addr).collect();
        let stripes = StripeList::new(2, 2, vec![servers.clone()]).unwrap();
        let map = DegradedLockMap::new();
        map.lock_or_merge(0, 9, &[entry(0, 0, 2)], 0, &[1, 2, 3], 4);
        map.lock_or_merge(0, 10, &[entry(0, 0, 3)], 0, &[1, 2, 3], 4);

        assert_eq!(map.release_for_server(&addr(1), &stripes).len(), 2);
        assert!(map.is_empty());
        // stripe 10 gets locked again while the release is in flight
        map.lock_or_merge(0, 10, &[entry(0, 0, 3)], 0, &[1, 2, 3], 4);

        assert_eq!(map.abort_release(&addr(1)), 2);
        assert_eq!(map.releasing_len(&addr(1)), 0);
        assert_eq!(map.len(), 2);
        assert_eq!(map.find(0, 9).map(|l| l.entries().to_vec()), Some(vec![entry(0, 0, 2)]));
        assert_eq!(map.find(0, 10).map(|l| l.len()), Some(1));
        assert_eq!(map.abort_release(&addr(1)), 0);
    }
}
