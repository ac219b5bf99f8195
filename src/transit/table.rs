//! Per-server state table shared by all three node roles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::transit::{RemapState, ServerAddr, StateChange, StateRecord};

/// Node role owning a state table. Only affects which states stop normal
/// responses from being accepted.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Role {
    Coordinator,
    Client,
    Server,
}

/// Result of applying a received state record to a table.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Applied {
    /// Server is not tracked; record ignored.
    Unknown,

    /// Record repeats the current state (or one already acked); no-op.
    Duplicate(RemapState),

    /// Record names a transition the lifecycle never takes; ignored.
    Illegal(RemapState),

    /// State moved forward from the contained state.
    Changed(RemapState),
}

/// Lock-protected state of one server.
pub type StateCell = Arc<Mutex<RemapState>>;

/// Locks a state cell, recovering the value if a holder panicked.
pub fn lock_cell(cell: &Mutex<RemapState>) -> MutexGuard<'_, RemapState> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Map from server address to its own lock-protected state. Cells are only
/// created through `add_server`; lookups never materialise new entries.
#[derive(Debug)]
pub struct StateTable {
    role: Role,
    cells: RwLock<HashMap<ServerAddr, StateCell>>,
}

impl StateTable {
    pub fn new(role: Role) -> Self {
        StateTable {
            role,
            cells: RwLock::new(HashMap::new()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Starts tracking a server in given state. If the server is already
    /// tracked, its state is overwritten. Returns true if newly added.
    pub fn add_server(&self, server: ServerAddr, state: RemapState) -> bool {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        match cells.get(&server) {
            Some(cell) => {
                *lock_cell(cell) = state;
                false
            }
            None => {
                cells.insert(server, Arc::new(Mutex::new(state)));
                true
            }
        }
    }

    /// Stops tracking a server. Returns true if it was tracked.
    pub fn remove_server(&self, server: &ServerAddr) -> bool {
        self.cells
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server)
            .is_some()
    }

    pub fn contains(&self, server: &ServerAddr) -> bool {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(server)
    }

    /// Handle to the server's state cell, to be locked by the caller.
    pub fn cell(&self, server: &ServerAddr) -> Option<StateCell> {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .cloned()
    }

    pub fn state_of(&self, server: &ServerAddr) -> Option<RemapState> {
        self.cell(server).map(|cell| *lock_cell(&cell))
    }

    /// Sorted list of tracked servers.
    pub fn servers(&self) -> Vec<ServerAddr> {
        let mut servers: Vec<_> = self
            .cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        servers.sort();
        servers
    }

    /// Current state of every tracked server, sorted by address.
    pub fn snapshot(&self) -> Vec<StateRecord> {
        self.records_of(&self.servers())
    }

    /// Current states of the given servers; unknown ones are left out.
    pub fn records_of(&self, servers: &[ServerAddr]) -> Vec<StateRecord> {
        servers
            .iter()
            .filter_map(|s| self.state_of(s).map(|st| StateRecord::new(*s, st)))
            .collect()
    }

    /// Applies a received record. On a legal forward step, `on_advance` is
    /// called with the previous state while the server's lock is still held,
    /// then the new state is stored.
    pub fn apply_with(
        &self,
        record: &StateRecord,
        on_advance: impl FnOnce(RemapState),
    ) -> Applied {
        let Some(cell) = self.cell(&record.server) else {
            return Applied::Unknown;
        };
        let mut state = lock_cell(&cell);
        let from = *state;
        match RemapState::classify(from, record.state) {
            StateChange::Duplicate => Applied::Duplicate(from),
            StateChange::Illegal => Applied::Illegal(from),
            StateChange::Advance => {
                on_advance(from);
                *state = record.state;
                Applied::Changed(from)
            }
        }
    }

    /// Applies a received record without side effects.
    pub fn apply(&self, record: &StateRecord) -> Applied {
        self.apply_with(record, |_| {})
    }

    /// Remap path may be used for the server. Unknown servers: false.
    pub fn allow_remapping(&self, server: &ServerAddr) -> bool {
        self.state_of(server)
            .is_some_and(RemapState::allows_remapping)
    }

    /// Writes to the server must use the coordinated flow. Unknown
    /// servers: false.
    pub fn use_coordinated_flow(&self, server: &ServerAddr) -> bool {
        self.state_of(server)
            .is_some_and(RemapState::uses_coordinated_flow)
    }

    /// Normal-path responses from the server are still accepted. Unknown
    /// servers are treated as healthy: true.
    pub fn accept_normal_response(&self, server: &ServerAddr) -> bool {
        match (self.role, self.state_of(server)) {
            (_, None) => true,
            (Role::Client, Some(state)) => !matches!(
                state,
                RemapState::WaitDegraded | RemapState::Degraded
            ),
            (_, Some(state)) => state != RemapState::Degraded,
        }
    }

    /// Server is in `Intermediate` or `Coordinated`. Unknown servers: false.
    pub fn is_in_transition(&self, server: &ServerAddr) -> bool {
        self.state_of(server).is_some_and(RemapState::in_transition)
    }

    /// Number of tracked servers not in `Normal`.
    pub fn count_not_normal(&self) -> usize {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        cells
            .values()
            .filter(|cell| *lock_cell(cell) != RemapState::Normal)
            .count()
    }

    /// At least `maximum` servers are already away from `Normal`.
    pub fn reach_maximum_remapped(&self, maximum: usize) -> bool {
        self.count_not_normal() >= maximum
    }
}
