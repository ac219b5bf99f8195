//! Registry of remapped (redirected) writes, indexed by the server whose
//! chunks were redirected away.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::client::RemapEntry;
use crate::stripe::ChunkPos;
use crate::transit::ServerAddr;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// What a remapping record is registered under: the key of a data object,
/// or the position of a parity chunk.
#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub enum RemappingKey {
    Key(Bytes),
    Chunk(ChunkPos),
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RemappingRecord {
    pub entries: Vec<RemapEntry>,

    /// Cleared by a delete of the key; invalid records are never served.
    pub valid: bool,

    /// Remapped data already synced back to the original server.
    pub sent: bool,
}

impl RemappingRecord {
    pub fn new(entries: Vec<RemapEntry>) -> Self {
        RemappingRecord {
            entries,
            valid: true,
            sent: false,
        }
    }
}

#[derive(Debug, Default)]
struct Records {
    records: HashMap<RemappingKey, (ServerAddr, RemappingRecord)>,
    by_server: HashMap<ServerAddr, HashSet<RemappingKey>>,
}

impl Records {
    fn unindex(&mut self, key: &RemappingKey, server: &ServerAddr) {
        if let Some(keys) = self.by_server.get_mut(server) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_server.remove(server);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RemappingRecordMap {
    inner: Mutex<Records>,
}

impl RemappingRecordMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Records> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a record for writes redirected away from `server`. A valid
    /// record is never overwritten; an invalidated one is replaced. Returns
    /// whether the record was installed.
    pub fn insert(
        &self,
        key: RemappingKey,
        record: RemappingRecord,
        server: ServerAddr,
    ) -> bool {
        let mut inner = self.inner();
        if let Some((old_server, old)) = inner.records.get(&key) {
            if old.valid {
                pf_trace!("valid remapping record of {:?} kept", key);
                return false;
            }
            let old_server = *old_server;
            inner.unindex(&key, &old_server);
        }
        inner.by_server.entry(server).or_default().insert(key.clone());
        inner.records.insert(key, (server, record));
        true
    }

    /// Valid record registered under `key`.
    pub fn find(&self, key: &RemappingKey) -> Option<RemappingRecord> {
        self.inner()
            .records
            .get(key)
            .filter(|(_, record)| record.valid)
            .map(|(_, record)| record.clone())
    }

    pub fn invalidate(&self, key: &RemappingKey) -> bool {
        match self.inner().records.get_mut(key) {
            Some((_, record)) => {
                record.valid = false;
                true
            }
            None => false,
        }
    }

    pub fn mark_sent(&self, key: &RemappingKey) -> bool {
        match self.inner().records.get_mut(key) {
            Some((_, record)) => {
                record.sent = true;
                true
            }
            None => false,
        }
    }

    /// Valid records of `server` not yet synced back to it.
    pub fn unsent_for(&self, server: &ServerAddr) -> Vec<(RemappingKey, RemappingRecord)> {
        let inner = self.inner();
        let Some(keys) = inner.by_server.get(server) else {
            return vec![];
        };
        keys.iter()
            .filter_map(|key| {
                inner
                    .records
                    .get(key)
                    .filter(|(_, r)| r.valid && !r.sent)
                    .map(|(_, r)| (key.clone(), r.clone()))
            })
            .collect()
    }

    /// Drops every record of `server`. Returns how many were dropped.
    pub fn erase_server(&self, server: &ServerAddr) -> usize {
        let mut inner = self.inner();
        let Some(keys) = inner.by_server.remove(server) else {
            return 0;
        };
        for key in &keys {
            inner.records.remove(key);
        }
        keys.len()
    }

    pub fn len(&self) -> usize {
        self.inner().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(last: u8) -> ServerAddr {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 8, last), 9000)
    }

    fn remap(from: u32, to: u32) -> RemapEntry {
        RemapEntry {
            original: ChunkPos::new(0, from),
            remapped: ChunkPos::new(0, to),
        }
    }

    #[test]
    fn insert_after_invalidate() {
        let map = RemappingRecordMap::new();
        let key = RemappingKey::Key(Bytes::from_static(b"apple"));
        assert!(map.insert(key.clone(), RemappingRecord::new(vec![remap(0, 2)]), addr(1)));
        assert!(!map.insert(key.clone(), RemappingRecord::new(vec![remap(0, 3)]), addr(1)));
        assert_eq!(map.find(&key).map(|r| r.entries), Some(vec![remap(0, 2)]));

        assert!(map.invalidate(&key));
        assert_eq!(map.find(&key), None);
        assert_eq!(map.len(), 1);

        assert!(map.insert(key.clone(), RemappingRecord::new(vec![remap(1, 3)]), addr(2)));
        assert_eq!(map.find(&key).map(|r| r.entries), Some(vec![remap(1, 3)]));
        assert_eq!(map.erase_server(&addr(1)), 0);
        assert_eq!(map.erase_server(&addr(2)), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn unsent_and_erase() {
        let map = RemappingRecordMap::new();
        let k1 = RemappingKey::Key(Bytes::from_static(b"k1"));
        let k2 = RemappingKey::Chunk(ChunkPos::new(0, 3));
        let k3 = RemappingKey::Key(Bytes::from_static(b"k3"));
        map.insert(k1.clone(), RemappingRecord::new(vec![remap(0, 2)]), addr(1));
        map.insert(k2.clone(), RemappingRecord::new(vec![remap(3, 2)]), addr(1));
        map.insert(k3.clone(), RemappingRecord::new(vec![remap(1, 2)]), addr(5));
        assert!(map.mark_sent(&k1));
        assert!(!map.mark_sent(&RemappingKey::Key(Bytes::from_static(b"nope"))));

        let unsent = map.unsent_for(&addr(1));
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].0, k2);
        assert!(map.unsent_for(&addr(9)).is_empty());

        assert_eq!(map.erase_server(&addr(1)), 2);
        assert_eq!(map.len(), 1);
        assert!(map.find(&k3).is_some());
    }
}
