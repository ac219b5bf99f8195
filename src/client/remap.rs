//! Load-aware write redirection used by degraded request handling.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::stripe::{ChunkId, ChunkPos, StripeList};
use crate::transit::{ServerAddr, StateTable};
use crate::utils::StripeKvError;

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

/// Configuration parameters of the remapping scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapConfig {
    /// Latency charged to a server each time it is picked, in microsecs.
    pub increment_us: u64,
}

impl Default for RemapConfig {
    fn default() -> Self {
        RemapConfig { increment_us: 100 }
    }
}

/// One redirected chunk position.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct RemapEntry {
    pub original: ChunkPos,
    pub remapped: ChunkPos,
}

/// Picks substitute servers for chunks whose servers are failing over (or
/// overloaded), preferring the least loaded candidates of the same stripe
/// list.
pub struct BasicRemappingScheme {
    table: Arc<StateTable>,
    stripes: Arc<StripeList>,

    /// Cumulative latency observed per server.
    loading: Mutex<HashMap<ServerAddr, Duration>>,

    /// Servers reported hot by the load statistics exchange.
    overloaded: RwLock<HashSet<ServerAddr>>,

    increment: Duration,
}

impl BasicRemappingScheme {
    pub fn new(
        table: Arc<StateTable>,
        stripes: Arc<StripeList>,
        config_str: Option<&str>,
    ) -> Result<Self, StripeKvError> {
        let config = parsed_config!(config_str => RemapConfig; increment_us)?;
        Ok(BasicRemappingScheme {
            table,
            stripes,
            loading: Mutex::new(HashMap::new()),
            overloaded: RwLock::new(HashSet::new()),
            increment: Duration::from_micros(config.increment_us),
        })
    }

    /// Records the cumulative latency of a server.
    pub fn update_latency(&self, server: ServerAddr, latency: Duration) {
        self.loading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server, latency);
    }

    pub fn latency_of(&self, server: &ServerAddr) -> Option<Duration> {
        self.loading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .copied()
    }

    /// Replaces the overloaded-server set.
    pub fn set_overloaded(&self, servers: impl IntoIterator<Item = ServerAddr>) {
        *self
            .overloaded
            .write()
            .unwrap_or_else(PoisonError::into_inner) = servers.into_iter().collect();
    }

    /// Server may be remapped and is currently hot.
    pub fn is_overloaded(&self, server: &ServerAddr) -> bool {
        self.table.allow_remapping(server)
            && self
                .overloaded
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(server)
    }

    /// Finds substitutes for the entries of `original` whose servers allow
    /// remapping (only data chunks when `is_get`). A substitute is a chunk
    /// position of the same list whose server is neither hosting one of
    /// `original`, nor already chosen in this call, nor in coordinated flow;
    /// the lowest known latency wins, ties going to the first found. Entries
    /// without any eligible substitute are left out of the result.
    pub fn redirect(&self, original: &[ChunkPos], is_get: bool) -> Vec<RemapEntry> {
        let selected: HashSet<ServerAddr> = original
            .iter()
            .filter_map(|pos| self.stripes.server_of(*pos))
            .collect();
        let mut redirected: HashSet<ServerAddr> = HashSet::new();
        let mut loading = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
        let mut remapped = Vec::new();

        for pos in original {
            let Some(server) = self.stripes.server_of(*pos) else {
                pf_warn!("chunk {:?} has no server in placement", pos);
                continue;
            };
            if !self.table.allow_remapping(&server) {
                continue;
            }
            if is_get && !self.stripes.is_data_chunk(pos.chunk_id) {
                continue;
            }
            let Some(servers) = self.stripes.servers_of(pos.list_id) else {
                continue;
            };

            let mut best: Option<(ChunkId, ServerAddr)> = None;
            for (j, candidate) in servers.iter().enumerate() {
                if selected.contains(candidate)
                    || redirected.contains(candidate)
                    || self.table.use_coordinated_flow(candidate)
                {
                    continue;
                }
                match best {
                    None => best = Some((j as ChunkId, *candidate)),
                    Some((_, current)) => {
                        if let (Some(lc), Some(lb)) =
                            (loading.get(candidate), loading.get(&current))
                        {
                            if lc < lb {
                                best = Some((j as ChunkId, *candidate));
                            }
                        }
                    }
                }
            }

            match best {
                Some((chunk_id, candidate)) => {
                    *loading.entry(candidate).or_default() += self.increment;
                    redirected.insert(candidate);
                    remapped.push(RemapEntry {
                        original: *pos,
                        remapped: ChunkPos::new(pos.list_id, chunk_id),
                    });
                }
                None => {
                    pf_error!(
                        "no substitute for chunk {:?} of server {}",
                        pos,
                        server
                    );
                }
            }
        }
        remapped
    }
}
