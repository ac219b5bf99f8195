//! Degraded lock acquisition on behalf of clients operating on a stripe
//! whose servers are failing over.

use std::sync::Arc;

use crate::client::RemapEntry;
use crate::coordinator::degraded::{
    DegradedLock, DegradedLockMap, LockOutcome, ReconstructionEntry,
};
use crate::coordinator::remapping::{RemappingKey, RemappingRecordMap};
use crate::stripe::{ChunkId, ChunkPos, ListId, StripeId, StripeList};
use crate::transit::StateTable;
use crate::utils::StripeKvError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Client request for the degraded lock of the stripe holding `key`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct DegradedLockRequest {
    pub key: Bytes,

    /// For objects split across data chunks, which part is being worked on.
    pub split_offset: Option<u32>,

    /// Reconstructions the client would like to perform.
    pub entries: Vec<ReconstructionEntry>,
}

/// Lock state as returned to the client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LockedView {
    pub is_sealed: bool,
    pub stripe_id: StripeId,
    pub chunk_id: ChunkId,
    pub surviving_chunk_ids: Vec<ChunkId>,

    /// Entries of `chunk_id` come first.
    pub entries: Vec<ReconstructionEntry>,
    pub ongoing_at_chunk: ChunkId,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum DegradedLockResult {
    /// Lock newly acquired.
    IsLocked(LockedView),

    /// Lock already held; view includes what this request added.
    WasLocked(LockedView),

    /// Nothing to rebuild, proceed normally.
    NotLocked,

    /// Key unknown.
    NotExist,

    /// Key was written through redirection; read from these chunks.
    Remapped(Vec<RemapEntry>),
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct DegradedLockResponse {
    pub key: Bytes,
    pub result: DegradedLockResult,
}

/// Where a key lives.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct KeyLocation {
    pub list_id: ListId,
    pub stripe_id: StripeId,

    /// Data chunk holding (the first part of) the key.
    pub chunk_id: ChunkId,
    pub is_sealed: bool,
}

/// Key-to-chunk index lookup.
pub trait ChunkLocator: Send + Sync {
    fn locate(&self, key: &[u8]) -> Option<KeyLocation>;
}

/// Serves degraded lock requests against the coordinator's view of server
/// states.
pub struct DegradedLockManager {
    table: Arc<StateTable>,
    stripes: Arc<StripeList>,
    locks: Arc<DegradedLockMap>,
    remapping: Arc<RemappingRecordMap>,
    locator: Arc<dyn ChunkLocator>,
}

impl DegradedLockManager {
    pub fn new(
        table: Arc<StateTable>,
        stripes: Arc<StripeList>,
        locks: Arc<DegradedLockMap>,
        remapping: Arc<RemappingRecordMap>,
        locator: Arc<dyn ChunkLocator>,
    ) -> Self {
        DegradedLockManager {
            table,
            stripes,
            locks,
            remapping,
            locator,
        }
    }

    /// Acquires, extends or declines the degraded lock for a request.
    pub fn acquire(&self, req: &DegradedLockRequest) -> DegradedLockResponse {
        let result = self.acquire_result(req);
        pf_trace!("degraded lock {:?} -> {:?}", req.key, result);
        DegradedLockResponse {
            key: req.key.clone(),
            result,
        }
    }

    /// Decodes a request message, serves it and encodes the response.
    pub fn handle_message(&self, msg: &[u8]) -> Result<Bytes, StripeKvError> {
        let req: DegradedLockRequest = rmp_serde::from_slice(msg)?;
        let resp = self.acquire(&req);
        Ok(Bytes::from(rmp_serde::to_vec(&resp)?))
    }

    fn acquire_result(&self, req: &DegradedLockRequest) -> DegradedLockResult {
        if let Some(record) = self.remapping.find(&RemappingKey::Key(req.key.clone())) {
            return DegradedLockResult::Remapped(record.entries);
        }

        let Some(loc) = self.locator.locate(&req.key) else {
            return DegradedLockResult::NotExist;
        };
        let data = self.stripes.data_chunk_count();
        let ongoing = match req.split_offset {
            Some(offset) => {
                ((u64::from(loc.chunk_id) + u64::from(offset)) % u64::from(data)) as ChunkId
            }
            None => loc.chunk_id,
        };

        let chunk_count = self.stripes.chunk_count();
        let surviving: Vec<ChunkId> = (0..chunk_count)
            .filter(|c| !self.remappable(ChunkPos::new(loc.list_id, *c)))
            .collect();

        let entries: Vec<ReconstructionEntry> = req
            .entries
            .iter()
            .filter(|e| self.remappable(e.original))
            .filter(|e| {
                loc.is_sealed
                    || !self.stripes.is_data_chunk(e.original.chunk_id)
                    || e.original.chunk_id == ongoing
            })
            .copied()
            .collect();

        let view = |lock: DegradedLock| LockedView {
            is_sealed: loc.is_sealed,
            stripe_id: loc.stripe_id,
            chunk_id: ongoing,
            surviving_chunk_ids: surviving.clone(),
            entries: lock.reordered_for(ongoing),
            ongoing_at_chunk: lock.ongoing_at_chunk,
        };
        match self.locks.lock_or_merge(
            loc.list_id,
            loc.stripe_id,
            &entries,
            ongoing,
            &surviving,
            chunk_count,
        ) {
            LockOutcome::Created(lock) => DegradedLockResult::IsLocked(view(lock)),
            LockOutcome::Merged(lock) => DegradedLockResult::WasLocked(view(lock)),
            LockOutcome::Unlocked => DegradedLockResult::NotLocked,
        }
    }

    fn remappable(&self, pos: ChunkPos) -> bool {
        self.stripes
            .server_of(pos)
            .is_some_and(|s| self.table.allow_remapping(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::remapping::RemappingRecord;
    use crate::transit::{RemapState, Role, ServerAddr};
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(last: u8) -> ServerAddr {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 9, last), 9000)
    }

    struct MapLocator(HashMap<Vec<u8>, KeyLocation>);

    impl ChunkLocator for MapLocator {
        fn locate(&self, key: &[u8]) -> Option<KeyLocation> {
            self.0.get(key).copied()
        }
    }

    fn entry(from: ChunkId, to: ChunkId) -> ReconstructionEntry {
        ReconstructionEntry::new(ChunkPos::new(0, from), ChunkPos::new(0, to))
    }

    // 3 data + 2 parity on one list, server of chunk 0 failing over
    fn manager() -> Result<(DegradedLockManager, Arc<RemappingRecordMap>), StripeKvError> {
        let servers: Vec<_> = (1..=5).map(addr).collect();
        let table = Arc::new(StateTable::new(Role::Coordinator));
        for s in &servers {
            table.add_server(*s, RemapState::Normal);
        }
        table.add_server(addr(1), RemapState::Degraded);
        let stripes = Arc::new(StripeList::new(3, 2, vec![servers])?);
        let remapping = Arc::new(RemappingRecordMap::new());
        let locator = MapLocator(HashMap::from([
            (
                b"sealed".to_vec(),
                KeyLocation { list_id: 0, stripe_id: 4, chunk_id: 0, is_sealed: true },
            ),
            (
                b"open".to_vec(),
                KeyLocation { list_id: 0, stripe_id: 5, chunk_id: 1, is_sealed: false },
            ),
        ]));
        let lockman = DegradedLockManager::new(
            table,
            stripes,
            Arc::new(DegradedLockMap::new()),
            remapping.clone(),
            Arc::new(locator),
        );
        Ok((lockman, remapping))
    }

    fn request(key: &'static [u8], split_offset: Option<u32>, entries: Vec<ReconstructionEntry>) -> DegradedLockRequest {
        DegradedLockRequest {
            key: Bytes::from_static(key),
            split_offset,
            entries,
        }
    }

    #[test]
    fn lock_then_relock() -> Result<(), StripeKvError> {
        let (lockman, _) = manager()?;
        // chunk 2's server is healthy so its entry is dropped
        let resp = lockman.acquire(&request(b"sealed", None, vec![entry(0, 3), entry(2, 4)]));
        let DegradedLockResult::IsLocked(view) = resp.result else {
            panic!("expected a new lock, got {:?}", resp.result);
        };
        assert_eq!(view.stripe_id, 4);
        assert_eq!(view.chunk_id, 0);
        assert_eq!(view.surviving_chunk_ids, vec![1, 2, 3, 4]);
        assert_eq!(view.entries, vec![entry(0, 3)]);

        let resp = lockman.acquire(&request(b"sealed", Some(2), vec![entry(0, 1)]));
        let DegradedLockResult::WasLocked(view) = resp.result else {
            panic!("expected the held lock, got {:?}", resp.result);
        };
        assert_eq!(view.chunk_id, 2);
        assert_eq!(view.entries, vec![entry(0, 3)]);
        assert_eq!(view.ongoing_at_chunk, 0);
        Ok(())
    }

    #[test]
    fn unsealed_filters_other_data_chunks() -> Result<(), StripeKvError> {
        let (lockman, _) = manager()?;
        // chunk 0 is neither the ongoing chunk nor sealed
        let resp = lockman.acquire(&request(b"open", None, vec![entry(0, 3)]));
        assert_eq!(resp.result, DegradedLockResult::NotLocked);
        // the offset shifts the ongoing chunk onto the failed one
        let resp = lockman.acquire(&request(b"open", Some(2), vec![entry(0, 3)]));
        assert!(matches!(resp.result, DegradedLockResult::IsLocked(v) if v.chunk_id == 0));
        Ok(())
    }

    #[test]
    fn huge_split_offset_wraps_over_data_chunks() -> Result<(), StripeKvError> {
        let (lockman, _) = manager()?;
        // (1 + u32::MAX) % 3 == 1, a healthy data chunk
        let req = request(b"open", Some(u32::MAX), vec![entry(0, 3)]);
        let reply = lockman.handle_message(&rmp_serde::to_vec(&req)?)?;
        let resp: DegradedLockResponse = rmp_serde::from_slice(&reply)?;
        assert_eq!(resp.result, DegradedLockResult::NotLocked);
        // (1 + u32::MAX - 1) % 3 == 0, the failed chunk
        let resp = lockman.acquire(&request(b"open", Some(u32::MAX - 1), vec![entry(0, 3)]));
        assert!(matches!(resp.result, DegradedLockResult::IsLocked(v) if v.chunk_id == 0));
        Ok(())
    }

    #[test]
    fn remapped_and_missing_keys() -> Result<(), StripeKvError> {
        let (lockman, remapping) = manager()?;
        let remapped = vec![RemapEntry {
            original: ChunkPos::new(0, 0),
            remapped: ChunkPos::new(0, 2),
        }];
        remapping.insert(
            RemappingKey::Key(Bytes::from_static(b"sealed")),
            RemappingRecord::new(remapped.clone()),
            addr(1),
        );
        let resp = lockman.acquire(&request(b"sealed", None, vec![entry(0, 3)]));
        assert_eq!(resp.result, DegradedLockResult::Remapped(remapped));
        let resp = lockman.acquire(&request(b"ghost", None, vec![]));
        assert_eq!(resp.result, DegradedLockResult::NotExist);
        Ok(())
    }

    #[test]
    fn message_round_trip() -> Result<(), StripeKvError> {
        let (lockman, _) = manager()?;
        let req = request(b"sealed", None, vec![entry(0, 4)]);
        let reply = lockman.handle_message(&rmp_serde::to_vec(&req)?)?;
        let resp: DegradedLockResponse = rmp_serde::from_slice(&reply)?;
        assert_eq!(resp.key, req.key);
        assert!(matches!(resp.result, DegradedLockResult::IsLocked(_)));
        assert!(lockman.handle_message(b"\xc1garbage").is_err());
        Ok(())
    }
}
