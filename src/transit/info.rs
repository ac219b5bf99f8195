//! Client-side bookkeeping that gates leaving `Intermediate`.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Correlation key matching asynchronous completions to the request that
/// started them. Equality and hashing only look at
/// `(instance_id, request_id)`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PendingIdentifier {
    pub instance_id: u32,
    pub parent_instance_id: u32,
    pub request_id: u32,
    pub parent_request_id: u32,
    pub timestamp: u32,
    /// Opaque handle of the initiating context.
    pub token: u64,
}

impl PendingIdentifier {
    pub fn new(
        instance_id: u32,
        parent_instance_id: u32,
        request_id: u32,
        parent_request_id: u32,
    ) -> Self {
        PendingIdentifier {
            instance_id,
            parent_instance_id,
            request_id,
            parent_request_id,
            timestamp: 0,
            token: 0,
        }
    }
}

impl PartialEq for PendingIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.instance_id == other.instance_id
            && self.request_id == other.request_id
    }
}

impl Eq for PendingIdentifier {}

impl Hash for PendingIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance_id.hash(state);
        self.request_id.hash(state);
    }
}

/// Shared counter of outstanding parity-delta reverts for one server.
/// Handed to whoever issues the reverts: `add` before sending each one,
/// `done` when it completes.
#[derive(Debug, Clone, Default)]
pub struct RevertCounter(Arc<AtomicU32>);

impl RevertCounter {
    pub fn add(&self, n: u32) {
        self.0.fetch_add(n, Ordering::AcqRel);
    }

    /// Marks `n` reverts as completed. Returns the outstanding count.
    pub fn done(&self, n: u32) -> u32 {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(n))
            })
            .unwrap_or_else(|v| v);
        if prev < n {
            pf_warn!("revert counter underflow: {} done with {} pending", n, prev);
        }
        prev.saturating_sub(n)
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct PendingNormalRequests {
    request_ids: HashSet<u32>,
    completed: bool,
}

/// Per-server transition bookkeeping kept by a client: outstanding parity
/// reverts and the normal requests that were in flight when the server
/// entered `Intermediate`.
#[derive(Debug)]
pub struct StateTransitInfo {
    parity_revert: RevertCounter,
    pending: Mutex<PendingNormalRequests>,
}

impl Default for StateTransitInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTransitInfo {
    pub fn new() -> Self {
        StateTransitInfo {
            parity_revert: RevertCounter::default(),
            pending: Mutex::new(PendingNormalRequests {
                request_ids: HashSet::new(),
                completed: true,
            }),
        }
    }

    pub fn revert_counter(&self) -> RevertCounter {
        self.parity_revert.clone()
    }

    pub fn outstanding_reverts(&self) -> u32 {
        self.parity_revert.get()
    }

    /// Tracks a pending request id. Returns the number now tracked.
    pub fn add_pending_request(&self, request_id: u32) -> usize {
        let mut pending = self.lock();
        pending.request_ids.insert(request_id);
        pending.request_ids.len()
    }

    /// Stops tracking a request id. Returns the number still tracked.
    pub fn remove_pending_request(&self, request_id: u32) -> usize {
        let mut pending = self.lock();
        pending.request_ids.remove(&request_id);
        pending.request_ids.len()
    }

    /// Marks completion when forced or when nothing is tracked anymore.
    pub fn set_completed(&self, force: bool) -> bool {
        let mut pending = self.lock();
        pending.completed = force || pending.request_ids.is_empty();
        pending.completed
    }

    /// Marks the tracker as waiting for a drain: unforced, completion is only
    /// cleared if something is actually tracked.
    pub fn unset_completed(&self, force: bool) -> bool {
        let mut pending = self.lock();
        pending.completed = !force && pending.request_ids.is_empty();
        pending.completed
    }

    /// Clears all tracked ids and marks the tracker incomplete.
    pub fn reset_pending(&self) {
        let mut pending = self.lock();
        pending.request_ids.clear();
        pending.completed = false;
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub fn pending_count(&self) -> usize {
        self.lock().request_ids.len()
    }

    /// Drops ids whose requests are no longer live and marks completion
    /// when the set drains. Returns whether the tracker is completed.
    pub fn prune(&self, is_live: impl Fn(u32) -> bool) -> bool {
        let mut pending = self.lock();
        pending.request_ids.retain(|id| is_live(*id));
        if pending.request_ids.is_empty() {
            pending.completed = true;
        }
        pending.completed
    }

    /// Server may leave `Intermediate`: no outstanding reverts and all
    /// pending requests drained.
    pub fn ready_to_ack(&self, is_live: impl Fn(u32) -> bool) -> bool {
        self.parity_revert.get() == 0 && self.prune(is_live)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingNormalRequests> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_eq_hash() {
        let mut a = PendingIdentifier::new(1, 10, 5, 50);
        a.token = 0xdead;
        let b = PendingIdentifier::new(1, 99, 5, 77);
        let c = PendingIdentifier::new(2, 10, 5, 50);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn completion_flags() {
        let info = StateTransitInfo::new();
        assert!(info.is_completed());
        assert!(info.unset_completed(false));
        assert!(!info.unset_completed(true));
        assert_eq!(info.add_pending_request(3), 1);
        assert_eq!(info.add_pending_request(4), 2);
        assert!(!info.unset_completed(false));
        assert!(!info.set_completed(false));
        assert!(info.set_completed(true));
        assert_eq!(info.remove_pending_request(3), 1);
        assert_eq!(info.remove_pending_request(4), 0);
        assert!(info.set_completed(false));
    }

    #[test]
    fn prune_against_live_table() {
        let info = StateTransitInfo::new();
        info.reset_pending();
        for id in [1, 2, 3] {
            info.add_pending_request(id);
        }
        assert!(!info.prune(|id| id != 2));
        assert_eq!(info.pending_count(), 2);
        assert!(info.prune(|_| false));
        assert_eq!(info.pending_count(), 0);
    }

    #[test]
    fn reverts_gate_ack() {
        let info = StateTransitInfo::new();
        let counter = info.revert_counter();
        counter.add(2);
        assert!(!info.ready_to_ack(|_| false));
        assert_eq!(counter.done(1), 1);
        assert!(!info.ready_to_ack(|_| false));
        assert_eq!(counter.done(1), 0);
        assert!(info.ready_to_ack(|_| false));
        assert_eq!(counter.done(1), 0);
    }
}
