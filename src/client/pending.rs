//! Client table of in-flight normal requests and per-server replay buffers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::stripe::ChunkPos;
use crate::transit::{PendingIdentifier, ServerAddr};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Kind of a client request.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Get,
    Set,
    Update,
    Delete,
}

impl RequestKind {
    /// Request modifies data (and hence parity).
    pub fn is_write(self) -> bool {
        !matches!(self, RequestKind::Get)
    }
}

/// One in-flight sub-request sent to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: PendingIdentifier,
    pub kind: RequestKind,
    pub key: Bytes,

    /// Data chunk position the key maps to.
    pub data_chunk: ChunkPos,

    /// Server the sub-request was sent to.
    pub target: ServerAddr,
}

#[derive(Debug, Default)]
struct PendingInner {
    normal: HashMap<PendingIdentifier, PendingRequest>,

    /// Parent request ID -> number of live sub-requests.
    parents: HashMap<u32, usize>,

    /// Requests pulled off unreachable servers, waiting for replay.
    replay: HashMap<ServerAddr, Vec<PendingRequest>>,
}

impl PendingInner {
    fn unlink_parent(&mut self, parent: u32) {
        if let Some(cnt) = self.parents.get_mut(&parent) {
            *cnt -= 1;
            if *cnt == 0 {
                self.parents.remove(&parent);
            }
        }
    }
}

/// Live-request table of a client.
#[derive(Debug, Default)]
pub struct PendingTable {
    inner: Mutex<PendingInner>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a sub-request as in flight. Returns false on a duplicate ID.
    pub fn insert(&self, request: PendingRequest) -> bool {
        let mut inner = self.lock();
        if inner.normal.contains_key(&request.id) {
            return false;
        }
        *inner.parents.entry(request.id.parent_request_id).or_default() += 1;
        inner.normal.insert(request.id, request);
        true
    }

    /// Removes a completed sub-request.
    pub fn complete(&self, id: &PendingIdentifier) -> Option<PendingRequest> {
        let mut inner = self.lock();
        let request = inner.normal.remove(id)?;
        inner.unlink_parent(request.id.parent_request_id);
        Some(request)
    }

    /// Some sub-request of the parent request is still in flight.
    pub fn is_live(&self, parent_request_id: u32) -> bool {
        self.lock().parents.contains_key(&parent_request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of in-flight sub-requests.
    pub fn normal_requests(&self) -> Vec<PendingRequest> {
        self.lock().normal.values().cloned().collect()
    }

    /// Moves every in-flight sub-request sent to `server` into its replay
    /// buffer. Returns how many were moved.
    pub fn take_for_server(&self, server: &ServerAddr) -> usize {
        let mut inner = self.lock();
        let ids: Vec<PendingIdentifier> = inner
            .normal
            .values()
            .filter(|r| r.target == *server)
            .map(|r| r.id)
            .collect();
        let mut moved = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(request) = inner.normal.remove(&id) {
                inner.unlink_parent(request.id.parent_request_id);
                moved.push(request);
            }
        }
        let cnt = moved.len();
        inner.replay.entry(*server).or_default().extend(moved);
        cnt
    }

    /// Takes the replay buffer of `server`, oldest first.
    pub fn take_replay(&self, server: &ServerAddr) -> Vec<PendingRequest> {
        let mut requests =
            self.lock().replay.remove(server).unwrap_or_default();
        requests.sort_by_key(|r| (r.id.timestamp, r.id.instance_id, r.id.request_id));
        requests
    }

    pub fn replay_len(&self, server: &ServerAddr) -> usize {
        self.lock().replay.get(server).map_or(0, Vec::len)
    }
}
