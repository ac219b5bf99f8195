//! Client-side state transition handler: applies coordinator broadcasts,
//! runs the local side effects of each phase, and acknowledges phases back
//! to the coordinator once it is safe to do so.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::bus::{
    BusEvent, CLIENT_GROUP, COORD_GROUP, COORD_PREFIX, MulticastBus,
};
use crate::client::pending::{PendingRequest, PendingTable};
use crate::stripe::{ListId, StripeList};
use crate::transit::{
    Applied, PendingIdentifier, RemapState, RevertCounter, Role, ServerAddr,
    StateRecord,
    StateTable, StateTransitInfo, decode_states, encode_states, lock_cell,
    MAX_RECORDS,
};
use crate::utils::StripeKvError;

use serde::{Deserialize, Serialize};

use tokio::sync::{Notify, watch};
use tokio::time::{self, Duration, MissedTickBehavior};

/// Configuration parameters of the client transition handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Background ack check interval in millisecs; 0 disables it.
    pub ack_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            ack_interval_ms: 1000,
        }
    }
}

/// Side effects a client performs when a server changes phase. Methods
/// other than `replay_requests` run while the server's state lock is held
/// and must not block.
pub trait ClientTransitActions: Send + Sync {
    /// Queues a metadata sync request to the server.
    fn sync_metadata(&self, server: ServerAddr);

    /// Starts reverting parity deltas buffered for the server. Call
    /// `counter.add()` before issuing each revert and `counter.done()` (or
    /// `complete_parity_revert()` on the handler) when it finishes.
    fn revert_parity_deltas(&self, server: ServerAddr, counter: RevertCounter);

    /// Re-issues requests that never completed on the server through the
    /// degraded path.
    fn replay_requests(&self, server: ServerAddr, requests: Vec<PendingRequest>);
}

/// State transition handler running inside a client.
pub struct ClientStateTransitHandler {
    bus: Arc<dyn MulticastBus>,
    table: Arc<StateTable>,
    infos: RwLock<HashMap<ServerAddr, Arc<StateTransitInfo>>>,
    pending: Arc<PendingTable>,
    stripes: Arc<StripeList>,
    actions: Arc<dyn ClientTransitActions>,
    ack_wakeup: Notify,
    config: ClientConfig,
}

// ClientStateTransitHandler public API implementation
impl ClientStateTransitHandler {
    /// Creates the handler and joins the clients group.
    pub async fn new_and_setup(
        bus: Arc<dyn MulticastBus>,
        stripes: Arc<StripeList>,
        pending: Arc<PendingTable>,
        actions: Arc<dyn ClientTransitActions>,
        config_str: Option<&str>,
    ) -> Result<Self, StripeKvError> {
        let config = parsed_config!(config_str => ClientConfig;
                                    ack_interval_ms)?;
        bus.join(CLIENT_GROUP).await?;
        Ok(ClientStateTransitHandler {
            bus,
            table: Arc::new(StateTable::new(Role::Client)),
            infos: RwLock::new(HashMap::new()),
            pending,
            stripes,
            actions,
            ack_wakeup: Notify::new(),
            config,
        })
    }

    pub fn table(&self) -> &Arc<StateTable> {
        &self.table
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Starts tracking a server. Its state stays `Undefined` until the
    /// coordinator's broadcast names it.
    pub fn add_alive_server(&self, server: ServerAddr) -> bool {
        self.infos
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(server)
            .or_insert_with(|| Arc::new(StateTransitInfo::new()));
        self.table.add_server(server, RemapState::Undefined)
    }

    pub fn remove_alive_server(&self, server: &ServerAddr) -> bool {
        self.infos
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server);
        self.table.remove_server(server)
    }

    pub fn transit_info(&self, server: &ServerAddr) -> Option<Arc<StateTransitInfo>> {
        self.infos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .cloned()
    }

    pub fn allow_remapping(&self, server: &ServerAddr) -> bool {
        self.table.allow_remapping(server)
    }

    pub fn use_coordinated_flow(&self, server: &ServerAddr) -> bool {
        self.table.use_coordinated_flow(server)
    }

    pub fn accept_normal_response(&self, server: &ServerAddr) -> bool {
        self.table.accept_normal_response(server)
    }

    /// Marks a sub-request as completed and wakes the acker.
    pub fn complete_request(
        &self,
        id: &PendingIdentifier,
    ) -> Option<PendingRequest> {
        let request = self.pending.complete(id);
        if request.is_some() {
            self.ack_wakeup.notify_one();
        }
        request
    }

    /// Marks `n` parity reverts for the server as completed and wakes the
    /// acker.
    pub fn complete_parity_revert(&self, server: &ServerAddr, n: u32) {
        match self.transit_info(server) {
            Some(info) => {
                info.revert_counter().done(n);
                self.ack_wakeup.notify_one();
            }
            None => pf_warn!("revert completion for unknown server {}", server),
        }
    }

    /// Applies a batch of broadcast records and runs the follow-up work:
    /// pending purge and acks for `Intermediate`, acks for `Coordinated`,
    /// replay for `Degraded`. Returns how many servers changed state.
    pub async fn apply_states(
        &self,
        records: &[StateRecord],
    ) -> Result<usize, StripeKvError> {
        let mut intermediate = vec![];
        let mut coordinated = vec![];
        let mut degraded = vec![];

        for record in records {
            let server = record.server;
            let applied = self.table.apply_with(record, |from| {
                match record.state {
                    RemapState::Intermediate => self.enter_intermediate(server),
                    RemapState::Degraded if from == RemapState::Intermediate => {
                        pf_error!(
                            "server {} degraded before this client acked",
                            server
                        );
                    }
                    _ => {}
                }
            });
            match applied {
                Applied::Changed(from) => {
                    pf_info!("server {} {} -> {}", server, from, record.state);
                    match record.state {
                        RemapState::Intermediate => intermediate.push(server),
                        RemapState::Coordinated => coordinated.push(server),
                        RemapState::Degraded => degraded.push(server),
                        _ => {}
                    }
                }
                Applied::Duplicate(cur) => {
                    pf_debug!(
                        "duplicate {} for server {} at {}",
                        record.state,
                        server,
                        cur
                    );
                }
                Applied::Unknown => {
                    pf_warn!("state for unknown server {} ignored", server);
                }
                Applied::Illegal(from) => {
                    pf_error!(
                        "illegal transition {} -> {} of {} ignored",
                        from,
                        record.state,
                        server
                    );
                }
            }
        }

        let changed = intermediate.len() + coordinated.len() + degraded.len();
        let mut result = Ok(changed);

        if !intermediate.is_empty() {
            for server in &intermediate {
                let moved = self.pending.take_for_server(server);
                if moved > 0 {
                    pf_debug!("buffered {} requests of {} for replay", moved, server);
                }
            }
            if let Err(e) = self.ack_transit(None).await {
                pf_warn!("immediate ack failed: {}", e);
                result = Err(e);
            }
        }
        if !coordinated.is_empty() {
            if let Err(e) = self.ack_transit(Some(&coordinated)).await {
                pf_warn!("immediate ack failed: {}", e);
                result = Err(e);
            }
        }
        for server in degraded {
            let requests = self.pending.take_replay(&server);
            if !requests.is_empty() {
                pf_info!("replaying {} requests of {}", requests.len(), server);
                self.actions.replay_requests(server, requests);
            }
        }
        result
    }

    /// Checks whether this client may ack the server's current phase; if so
    /// moves it to the matching `Wait*` state and returns the ack record.
    pub fn check_ack_for_server(&self, server: &ServerAddr) -> Option<StateRecord> {
        let cell = self.table.cell(server)?;
        let info = self.transit_info(server)?;
        let mut state = lock_cell(&cell);
        let next = match *state {
            RemapState::Intermediate => {
                if !info.ready_to_ack(|id| self.pending.is_live(id)) {
                    pf_trace!(
                        "server {} not ackable: {} reverts, {} pending",
                        server,
                        info.outstanding_reverts(),
                        info.pending_count()
                    );
                    return None;
                }
                RemapState::WaitDegraded
            }
            RemapState::Coordinated => RemapState::WaitNormal,
            _ => return None,
        };
        *state = next;
        Some(StateRecord::new(*server, next))
    }

    /// Sends acks for every ackable server among `servers` (all tracked
    /// servers if `None`). Returns the number of servers acked. If the send
    /// fails, the acked servers fall back to their previous phase so a later
    /// attempt retries.
    pub async fn ack_transit(
        &self,
        servers: Option<&[ServerAddr]>,
    ) -> Result<usize, StripeKvError> {
        let targets = match servers {
            Some(servers) => servers.to_vec(),
            None => self.table.servers(),
        };
        let acks: Vec<StateRecord> = targets
            .iter()
            .filter_map(|s| self.check_ack_for_server(s))
            .collect();
        if acks.is_empty() {
            return Ok(0);
        }

        for (i, batch) in acks.chunks(MAX_RECORDS).enumerate() {
            let sent = match encode_states(batch) {
                Ok(payload) => self.bus.multicast(&[COORD_GROUP], payload).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                self.revert_acks(&acks[i * MAX_RECORDS..]);
                return logged_err!("error sending acks: {}", e);
            }
        }
        pf_debug!("acked {:?}", acks);
        Ok(acks.len())
    }

    /// Background acker loop: re-checks ack eligibility on every interval
    /// tick or completion signal until termination.
    pub async fn run_acker(
        &self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), StripeKvError> {
        if self.config.ack_interval_ms == 0 {
            pf_debug!("background acker disabled");
            return Ok(());
        }
        let mut interval =
            time::interval(Duration::from_millis(self.config.ack_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = self.ack_wakeup.notified() => {},
                _ = rx_term.changed() => break,
            }
            if let Err(e) = self.ack_transit(None).await {
                pf_warn!("background ack failed: {}", e);
            }
        }
        Ok(())
    }

    /// Reader loop consuming the bus until termination.
    pub async fn run(
        &self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), StripeKvError> {
        pf_debug!("client transit reader '{}' started", self.bus.name());
        loop {
            tokio::select! {
                event = self.bus.receive() => self.handle_event(event?).await,
                _ = rx_term.changed() => break,
            }
        }
        pf_debug!("client transit reader '{}' stopped", self.bus.name());
        Ok(())
    }
}

// ClientStateTransitHandler internal helpers
impl ClientStateTransitHandler {
    async fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::Message { sender, payload } => {
                if !sender.starts_with(COORD_PREFIX) {
                    pf_debug!("ignoring state message from '{}'", sender);
                    return;
                }
                match decode_states(&payload) {
                    Ok(records) => {
                        // failures are logged inside, the acker retries
                        let _ = self.apply_states(&records).await;
                    }
                    Err(e) => pf_error!("bad state message from '{}': {}", sender, e),
                }
            }
            BusEvent::Joined { group, member } => {
                pf_debug!("'{}' joined '{}'", member, group);
            }
            BusEvent::Left { group, member } => {
                pf_debug!("'{}' left '{}'", member, group);
            }
        }
    }

    /// Local work on entering `Intermediate`; runs under the server's lock.
    fn enter_intermediate(&self, server: ServerAddr) {
        let Some(info) = self.transit_info(&server) else {
            pf_error!("no transit info for tracked server {}", server);
            return;
        };
        self.actions.sync_metadata(server);
        info.reset_pending();
        self.gather_pending_normal_requests(server, &info);
        self.actions.revert_parity_deltas(server, info.revert_counter());
    }

    /// Tracks in-flight writes whose parity lands on `target` so that the
    /// phase is not acked before they drain.
    fn gather_pending_normal_requests(
        &self,
        target: ServerAddr,
        info: &StateTransitInfo,
    ) {
        let lists: HashSet<ListId> = self
            .stripes
            .lists_with_parity_server(&target)
            .into_iter()
            .collect();

        let mut outdated = vec![];
        for request in self.pending.normal_requests() {
            if !request.kind.is_write() {
                continue;
            }
            let Some(data_server) = self.stripes.server_of(request.data_chunk)
            else {
                continue;
            };
            if data_server == target {
                // will be replayed through the degraded path anyway
                outdated.push(request.id.parent_request_id);
                continue;
            }
            if !lists.contains(&request.data_chunk.list_id) {
                continue;
            }
            if self.table.use_coordinated_flow(&data_server) {
                continue;
            }
            info.add_pending_request(request.id.parent_request_id);
        }

        if info.pending_count() == 0 {
            info.set_completed(false);
        }
        pf_debug!(
            "server {} waits for {} pending requests",
            target,
            info.pending_count()
        );

        if !outdated.is_empty() {
            let infos = self.infos.read().unwrap_or_else(PoisonError::into_inner);
            for (server, other) in infos.iter() {
                if *server == target {
                    continue;
                }
                for id in &outdated {
                    other.remove_pending_request(*id);
                }
            }
        }
    }

    fn revert_acks(&self, records: &[StateRecord]) {
        for record in records {
            if let Some(cell) = self.table.cell(&record.server) {
                let mut state = lock_cell(&cell);
                *state = match (*state, record.state) {
                    (RemapState::WaitDegraded, RemapState::WaitDegraded) => {
                        RemapState::Intermediate
                    }
                    (RemapState::WaitNormal, RemapState::WaitNormal) => {
                        RemapState::Coordinated
                    }
                    (cur, _) => cur,
                };
            }
        }
    }
}
