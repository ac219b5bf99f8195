//! Stripe-list placement: which server holds which chunk position.

use crate::transit::ServerAddr;
use crate::utils::StripeKvError;

use serde::{Deserialize, Serialize};

/// Stripe list ID.
pub type ListId = u32;

/// Stripe ID within a list.
pub type StripeId = u32;

/// Chunk position within a stripe.
pub type ChunkId = u32;

/// A chunk position in some stripe list.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Clone,
    Copy,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct ChunkPos {
    pub list_id: ListId,
    pub chunk_id: ChunkId,
}

impl ChunkPos {
    pub fn new(list_id: ListId, chunk_id: ChunkId) -> Self {
        ChunkPos { list_id, chunk_id }
    }
}

/// Fixed assignment of servers to chunk positions. Every list has the same
/// coding scheme: positions `[0, data_count)` are data chunks and the rest
/// are parity chunks.
#[derive(Debug, Clone)]
pub struct StripeList {
    data_count: u32,
    parity_count: u32,
    lists: Vec<Vec<ServerAddr>>,
}

impl StripeList {
    /// Creates the placement. Each list must name `data_count +
    /// parity_count` distinct servers.
    pub fn new(
        data_count: u32,
        parity_count: u32,
        lists: Vec<Vec<ServerAddr>>,
    ) -> Result<Self, StripeKvError> {
        if data_count == 0 {
            return Err(StripeKvError::msg("data chunk count must be positive"));
        }
        let chunk_count = (data_count + parity_count) as usize;
        for (i, servers) in lists.iter().enumerate() {
            if servers.len() != chunk_count {
                return Err(StripeKvError::msg(format!(
                    "list {} has {} servers, expected {}",
                    i,
                    servers.len(),
                    chunk_count
                )));
            }
            for (j, s) in servers.iter().enumerate() {
                if servers[..j].contains(s) {
                    return Err(StripeKvError::msg(format!(
                        "list {} places server {} twice",
                        i, s
                    )));
                }
            }
        }
        Ok(StripeList {
            data_count,
            parity_count,
            lists,
        })
    }

    pub fn data_chunk_count(&self) -> u32 {
        self.data_count
    }

    pub fn parity_chunk_count(&self) -> u32 {
        self.parity_count
    }

    pub fn chunk_count(&self) -> u32 {
        self.data_count + self.parity_count
    }

    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    pub fn is_data_chunk(&self, chunk_id: ChunkId) -> bool {
        chunk_id < self.data_count
    }

    /// Servers of a list in chunk order.
    pub fn servers_of(&self, list_id: ListId) -> Option<&[ServerAddr]> {
        self.lists.get(list_id as usize).map(Vec::as_slice)
    }

    /// Server holding a chunk position.
    pub fn server_of(&self, pos: ChunkPos) -> Option<ServerAddr> {
        self.servers_of(pos.list_id)
            .and_then(|servers| servers.get(pos.chunk_id as usize))
            .copied()
    }

    /// Chunk position of a server within a list, if it is part of it.
    pub fn chunk_of(&self, list_id: ListId, server: &ServerAddr) -> Option<ChunkId> {
        self.servers_of(list_id)?
            .iter()
            .position(|s| s == server)
            .map(|i| i as ChunkId)
    }

    /// Lists in which the server holds a parity chunk.
    pub fn lists_with_parity_server(&self, server: &ServerAddr) -> Vec<ListId> {
        (0..self.lists.len() as ListId)
            .filter(|&l| {
                self.chunk_of(l, server)
                    .is_some_and(|c| !self.is_data_chunk(c))
            })
            .collect()
    }
}
