//! Storage server side of the failover machinery.

mod transit;

pub use transit::ServerStateTransitHandler;
