//! Reliable group-multicast bus consumed by the state transition handlers.
//!
//! Nodes join named groups and multicast opaque payloads to sets of groups.
//! Besides payloads, members observe join/leave notifications of the groups
//! they belong to. A sender never receives its own multicast.

mod local;
mod daemon;
mod remote;

use crate::utils::StripeKvError;

use async_trait::async_trait;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

pub use local::{LocalBus, LocalEndpoint};
pub use daemon::BusDaemon;
pub use remote::RemoteEndpoint;

/// Group of coordinator nodes.
pub const COORD_GROUP: &str = "coordinators";

/// Group of client nodes.
pub const CLIENT_GROUP: &str = "clients";

/// Group of storage server nodes.
pub const SERVER_GROUP: &str = "servers";

/// Member name prefix of coordinators.
pub const COORD_PREFIX: &str = "coord";

/// Member name prefix of clients.
pub const CLIENT_PREFIX: &str = "client";

/// Member name prefix of storage servers.
pub const SERVER_PREFIX: &str = "server";

/// Something observed on the bus.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    /// Payload multicast by `sender`.
    Message { sender: String, payload: Bytes },

    /// `member` joined `group`.
    Joined { group: String, member: String },

    /// `member` left `group` (explicitly or by disconnecting).
    Left { group: String, member: String },
}

/// Reliable multicast primitive.
#[async_trait]
pub trait MulticastBus: Send + Sync {
    /// Unique member name of this endpoint.
    fn name(&self) -> &str;

    /// Joins a group.
    async fn join(&self, group: &str) -> Result<(), StripeKvError>;

    /// Leaves a group.
    async fn leave(&self, group: &str) -> Result<(), StripeKvError>;

    /// Multicasts a payload to every member of the given groups, each member
    /// receiving it at most once.
    async fn multicast(
        &self,
        groups: &[&str],
        payload: Bytes,
    ) -> Result<(), StripeKvError>;

    /// Waits for the next event. Only one task should be receiving.
    async fn receive(&self) -> Result<BusEvent, StripeKvError>;
}
