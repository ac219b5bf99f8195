//! Work the coordinator delegates to the rest of the store at the end of a
//! transition.

use std::collections::HashMap;

use crate::coordinator::degraded::ReleasedChunk;
use crate::coordinator::remapping::{RemappingKey, RemappingRecord};
use crate::transit::ServerAddr;
use crate::utils::StripeKvError;

use async_trait::async_trait;

#[async_trait]
pub trait CoordinatorHooks: Send + Sync {
    /// Server reached the end of the failure path; `crashed` tells a crash
    /// apart from a voluntary (overload) transition.
    async fn transit_to_degraded_end(
        &self,
        server: ServerAddr,
        crashed: bool,
    ) -> Result<(), StripeKvError>;

    /// Pushes the data written elsewhere while the server was degraded back
    /// to it. Returns once the server has it.
    async fn sync_remapped_data(
        &self,
        server: ServerAddr,
        records: Vec<(RemappingKey, RemappingRecord)>,
    ) -> Result<(), StripeKvError>;

    /// Tells the servers holding rebuilt chunks to hand them back. Returns
    /// once every destination has acknowledged.
    async fn release_degraded_locks(
        &self,
        server: ServerAddr,
        released: HashMap<ServerAddr, Vec<ReleasedChunk>>,
    ) -> Result<(), StripeKvError>;
}

/// Hooks that do nothing, for deployments (and tests) without data movement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl CoordinatorHooks for NoopHooks {
    async fn transit_to_degraded_end(
        &self,
        _server: ServerAddr,
        _crashed: bool,
    ) -> Result<(), StripeKvError> {
        Ok(())
    }

    async fn sync_remapped_data(
        &self,
        _server: ServerAddr,
        _records: Vec<(RemappingKey, RemappingRecord)>,
    ) -> Result<(), StripeKvError> {
        Ok(())
    }

    async fn release_degraded_locks(
        &self,
        _server: ServerAddr,
        _released: HashMap<ServerAddr, Vec<ReleasedChunk>>,
    ) -> Result<(), StripeKvError> {
        Ok(())
    }
}
