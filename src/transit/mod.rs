//! Server state transition machinery shared by coordinator, clients and
//! servers: lifecycle states, the per-server state table, broadcast wire
//! format, and client ack bookkeeping.

mod state;
mod record;
mod table;
mod info;

use std::net::SocketAddrV4;

pub use state::{RemapState, StateChange};
pub use record::{
    StateRecord, decode_states, encode_states, MAX_MESSLEN, MAX_RECORDS,
    RECORD_LEN,
};
pub use table::{Applied, Role, StateCell, StateTable, lock_cell};
pub use info::{PendingIdentifier, RevertCounter, StateTransitInfo};

/// Address identifying a storage server (IPv4 + port).
pub type ServerAddr = SocketAddrV4;
