//! Coordinator side of the failover machinery: transition orchestration,
//! degraded locks and remapping records.

mod degraded;
mod hooks;
mod lockman;
mod remapping;
mod transit;
mod worker;

pub use degraded::{
    DegradedLock, DegradedLockMap, LockOutcome, ReconstructionEntry,
    ReleasedChunk,
};
pub use hooks::{CoordinatorHooks, NoopHooks};
pub use lockman::{
    ChunkLocator, DegradedLockManager, DegradedLockRequest,
    DegradedLockResponse, DegradedLockResult, KeyLocation, LockedView,
};
pub use remapping::{RemappingKey, RemappingRecord, RemappingRecordMap};
pub use transit::{
    CoordinatorConfig, CoordinatorStateTransitHandler, TransitOutcome,
};
pub use worker::StateTransitEvent;
