//! Client side of the failover machinery.

mod pending;
mod remap;
mod transit;

pub use pending::{PendingRequest, PendingTable, RequestKind};
pub use remap::{BasicRemappingScheme, RemapConfig, RemapEntry};
pub use transit::{ClientConfig, ClientStateTransitHandler, ClientTransitActions};
