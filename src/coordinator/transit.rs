//! Coordinator-side state transition handler: drives servers through the
//! failure and recovery paths, collecting client acks between phases.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::{
    BusEvent, CLIENT_GROUP, CLIENT_PREFIX, COORD_GROUP, COORD_PREFIX,
    MulticastBus, SERVER_GROUP, SERVER_PREFIX,
};
use crate::coordinator::degraded::DegradedLockMap;
use crate::coordinator::hooks::CoordinatorHooks;
use crate::coordinator::lockman::{ChunkLocator, DegradedLockManager};
use crate::coordinator::remapping::RemappingRecordMap;
use crate::coordinator::worker::{
    EventHandler, StateTransitEvent, WorkerPool, event_queue,
    insert_repeated_events,
};
use crate::stripe::StripeList;
use crate::transit::{
    Applied, RemapState, Role, ServerAddr, StateRecord, StateTable,
    decode_states, encode_states, lock_cell, MAX_RECORDS,
};
use crate::utils::StripeKvError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{self, Duration};

/// Configuration parameters of the coordinator transition handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Number of transition workers.
    pub workers: usize,

    /// Capacity of the transition event queue.
    pub queue_capacity: usize,

    /// Sleep between insertion attempts into a full queue, in millisecs.
    pub insert_retry_ms: u64,

    /// Delay before retrying a recovery whose hand-back hooks failed, in
    /// millisecs.
    pub hook_retry_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            workers: 4,
            queue_capacity: 256,
            insert_retry_ms: 10,
            hook_retry_ms: 100,
        }
    }
}

/// Which servers a transition request started and which it skipped.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct TransitOutcome {
    pub started: Vec<ServerAddr>,
    pub skipped: Vec<ServerAddr>,
}

/// Servers finishing a transition together get one final broadcast.
#[derive(Debug, Default)]
struct Batch {
    ongoing: HashSet<ServerAddr>,
    updated: Vec<ServerAddr>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State transition handler running inside a coordinator.
pub struct CoordinatorStateTransitHandler {
    bus: Arc<dyn MulticastBus>,
    table: Arc<StateTable>,
    stripes: Arc<StripeList>,
    hooks: Arc<dyn CoordinatorHooks>,
    locks: Arc<DegradedLockMap>,
    remapping: Arc<RemappingRecordMap>,

    /// Servers known to have crashed; never brought back automatically.
    crashed: Mutex<HashSet<ServerAddr>>,

    batch: Mutex<Batch>,

    /// Live client member names.
    clients: Mutex<HashSet<String>>,

    /// Clients that acked the current phase, per server.
    acks: Mutex<HashMap<ServerAddr, HashSet<String>>>,

    /// Ack arrival signal, per server.
    signals: Mutex<HashMap<ServerAddr, Arc<Notify>>>,

    tx_event: mpsc::Sender<StateTransitEvent>,
    rx_event: Mutex<Option<mpsc::Receiver<StateTransitEvent>>>,

    config: CoordinatorConfig,
}

// CoordinatorStateTransitHandler public API implementation
impl CoordinatorStateTransitHandler {
    /// Creates the handler and joins all three groups so that client and
    /// server membership changes are observed.
    pub async fn new_and_setup(
        bus: Arc<dyn MulticastBus>,
        stripes: Arc<StripeList>,
        hooks: Arc<dyn CoordinatorHooks>,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, StripeKvError> {
        let config = parsed_config!(config_str => CoordinatorConfig;
                                    workers, queue_capacity, insert_retry_ms,
                                    hook_retry_ms)?;
        if config.workers == 0 {
            return logged_err!("invalid config.workers '{}'", config.workers);
        }
        if config.queue_capacity == 0 {
            return logged_err!(
                "invalid config.queue_capacity '{}'",
                config.queue_capacity
            );
        }

        for group in [COORD_GROUP, CLIENT_GROUP, SERVER_GROUP] {
            bus.join(group).await?;
        }
        let (tx_event, rx_event) = event_queue(config.queue_capacity);

        Ok(Arc::new(CoordinatorStateTransitHandler {
            bus,
            table: Arc::new(StateTable::new(Role::Coordinator)),
            stripes,
            hooks,
            locks: Arc::new(DegradedLockMap::new()),
            remapping: Arc::new(RemappingRecordMap::new()),
            crashed: Mutex::new(HashSet::new()),
            batch: Mutex::new(Batch::default()),
            clients: Mutex::new(HashSet::new()),
            acks: Mutex::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
            tx_event,
            rx_event: Mutex::new(Some(rx_event)),
            config,
        }))
    }

    pub fn table(&self) -> &Arc<StateTable> {
        &self.table
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn degraded_locks(&self) -> &Arc<DegradedLockMap> {
        &self.locks
    }

    pub fn remapping_records(&self) -> &Arc<RemappingRecordMap> {
        &self.remapping
    }

    /// Degraded lock manager sharing this coordinator's state view, lock
    /// map and remapping records.
    pub fn lock_manager(&self, locator: Arc<dyn ChunkLocator>) -> DegradedLockManager {
        DegradedLockManager::new(
            self.table.clone(),
            self.stripes.clone(),
            self.locks.clone(),
            self.remapping.clone(),
            locator,
        )
    }

    pub fn state_of(&self, server: &ServerAddr) -> Option<RemapState> {
        self.table.state_of(server)
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

    pub fn is_in_transition(&self, server: &ServerAddr) -> bool {
        self.table.is_in_transition(server)
    }

    /// Caps voluntary transitions: at least `maximum` servers are already
    /// away from `Normal`.
    pub fn reach_maximum_remapped(&self, maximum: usize) -> bool {
        self.table.reach_maximum_remapped(maximum)
    }

    /// Starts tracking a server in `Normal`.
    pub fn add_alive_server(&self, server: ServerAddr) -> bool {
        locked(&self.acks).insert(server, HashSet::new());
        locked(&self.signals)
            .entry(server)
            .or_insert_with(|| Arc::new(Notify::new()));
        self.table.add_server(server, RemapState::Normal)
    }

    /// Forgets a server. Workers waiting on it give up.
    pub fn remove_alive_server(&self, server: &ServerAddr) -> bool {
        let removed = self.table.remove_server(server);
        locked(&self.acks).remove(server);
        locked(&self.crashed).remove(server);
        locked(&self.batch).ongoing.remove(server);
        if let Some(signal) = locked(&self.signals).remove(server) {
            signal.notify_waiters();
        }
        removed
    }

    pub fn is_crashed(&self, server: &ServerAddr) -> bool {
        locked(&self.crashed).contains(server)
    }

    /// Un-crashes a server so that it may return to `Normal`.
    pub fn remove_crashed_server(&self, server: &ServerAddr) -> bool {
        locked(&self.crashed).remove(server)
    }

    pub fn add_alive_client(&self, client: &str) -> bool {
        let added = locked(&self.clients).insert(client.to_string());
        if added {
            pf_info!("client '{}' joined", client);
        }
        added
    }

    /// Forgets a client, dropping its acks. Waiters are re-woken since the
    /// remaining clients may now cover the phase.
    pub fn remove_alive_client(&self, client: &str) -> bool {
        let removed = locked(&self.clients).remove(client);
        if removed {
            pf_info!("client '{}' left", client);
            for pool in locked(&self.acks).values_mut() {
                pool.remove(client);
            }
            self.notify_all();
        }
        removed
    }

    /// Sorted live client names.
    pub fn alive_clients(&self) -> Vec<String> {
        let mut clients: Vec<_> = locked(&self.clients).iter().cloned().collect();
        clients.sort();
        clients
    }

    /// Sorted names of clients that acked the server's current phase.
    pub fn acked_clients(&self, server: &ServerAddr) -> Vec<String> {
        let mut acked: Vec<_> = locked(&self.acks)
            .get(server)
            .map(|pool| pool.iter().cloned().collect())
            .unwrap_or_default();
        acked.sort();
        acked
    }

    /// Starts the failure path for the given servers: each server in
    /// `Normal` enters `Intermediate`, the batch is broadcast, and one
    /// worker event per server is queued. A `forced` (crash) transition
    /// marks the servers crashed and does not wait for client acks. If the
    /// broadcast fails, every started server is put back to `Normal`.
    pub async fn transit_to_degraded(
        &self,
        servers: &[ServerAddr],
        forced: bool,
    ) -> Result<TransitOutcome, StripeKvError> {
        if servers.len() > MAX_RECORDS {
            return logged_err!(
                "transition of {} servers exceeds limit {}",
                servers.len(),
                MAX_RECORDS
            );
        }
        let newly_crashed: Vec<ServerAddr> = if forced {
            let mut crashed = locked(&self.crashed);
            servers.iter().copied().filter(|s| crashed.insert(*s)).collect()
        } else {
            vec![]
        };

        let outcome =
            self.begin_phase(servers, RemapState::Normal, RemapState::Intermediate);
        self.commit_phase(&outcome, RemapState::Normal, true, forced, &newly_crashed)
            .await?;
        Ok(outcome)
    }

    /// Starts the recovery path for the given servers: each server in
    /// `Degraded` and not crashed enters `Coordinated`, the batch is
    /// broadcast, and one worker event per server is queued. If the
    /// broadcast fails, every started server is put back to `Degraded`.
    pub async fn transit_to_normal(
        &self,
        servers: &[ServerAddr],
        forced: bool,
    ) -> Result<TransitOutcome, StripeKvError> {
        if servers.len() > MAX_RECORDS {
            return logged_err!(
                "transition of {} servers exceeds limit {}",
                servers.len(),
                MAX_RECORDS
            );
        }

        let (crashed, candidates): (Vec<ServerAddr>, Vec<ServerAddr>) = {
            let crashed_set = locked(&self.crashed);
            servers.iter().copied().partition(|s| crashed_set.contains(s))
        };
        for server in &crashed {
            pf_warn!("crashed server {} stays degraded", server);
        }

        let mut outcome = self.begin_phase(
            &candidates,
            RemapState::Degraded,
            RemapState::Coordinated,
        );
        outcome.skipped.extend(crashed);
        self.commit_phase(&outcome, RemapState::Degraded, false, forced, &[])
            .await?;
        Ok(outcome)
    }

    /// Handles an ack message from a client. Returns how many records were
    /// accepted.
    pub fn update_state(&self, sender: &str, records: &[StateRecord]) -> usize {
        if !sender.starts_with(CLIENT_PREFIX) {
            pf_warn!("ack from non-client '{}' ignored", sender);
            return 0;
        }
        if !locked(&self.clients).contains(sender) {
            pf_debug!("ack from unknown client '{}' ignored", sender);
            return 0;
        }

        let mut accepted = 0;
        for record in records {
            let server = record.server;
            let Some(current) = self.table.state_of(&server) else {
                pf_warn!("ack for unknown server {} ignored", server);
                continue;
            };
            let expected = match current {
                RemapState::Intermediate => RemapState::WaitDegraded,
                RemapState::Coordinated => RemapState::WaitNormal,
                _ => RemapState::Undefined,
            };
            if record.state != expected {
                pf_debug!(
                    "stale ack {} of {} from '{}' at {}",
                    record.state,
                    server,
                    sender,
                    current
                );
                continue;
            }

            locked(&self.acks)
                .entry(server)
                .or_default()
                .insert(sender.to_string());
            accepted += 1;
            if self.all_acked(&server) {
                pf_debug!("all clients acked {} of {}", current, server);
                self.notify(&server);
            }
        }
        accepted
    }

    /// Broadcasts the current states of `servers` (all servers if empty) to
    /// every group.
    pub async fn broadcast_state(
        &self,
        servers: &[ServerAddr],
    ) -> Result<(), StripeKvError> {
        if servers.len() > MAX_RECORDS {
            return logged_err!(
                "broadcast of {} servers exceeds limit {}",
                servers.len(),
                MAX_RECORDS
            );
        }
        let records = if servers.is_empty() {
            self.table.snapshot()
        } else {
            self.table.records_of(servers)
        };
        self.multicast_records(&records, &[COORD_GROUP, CLIENT_GROUP, SERVER_GROUP])
            .await
    }

    /// Sends the current states of `servers` (all servers if empty) to the
    /// clients group only.
    pub async fn send_state_to_clients(
        &self,
        servers: &[ServerAddr],
    ) -> Result<(), StripeKvError> {
        let records = if servers.is_empty() {
            self.table.snapshot()
        } else {
            self.table.records_of(servers)
        };
        self.multicast_records(&records, &[CLIENT_GROUP]).await
    }

    /// Spawns the worker pool and runs the reader loop until termination,
    /// then waits for the workers. Can only be run once.
    pub async fn run(
        self: Arc<Self>,
        rx_term: watch::Receiver<bool>,
    ) -> Result<(), StripeKvError> {
        let Some(rx_event) = locked(&self.rx_event).take() else {
            return logged_err!("coordinator transit handler already running");
        };
        let pool = WorkerPool::spawn(
            self.config.workers,
            self.clone(),
            rx_event,
            rx_term.clone(),
        );

        pf_debug!("coordinator transit reader '{}' started", self.bus.name());
        let mut rx_term = rx_term;
        let result = loop {
            tokio::select! {
                event = self.bus.receive() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(e) => break Err(e),
                },
                _ = rx_term.changed() => break Ok(()),
            }
        };
        pf_debug!("coordinator transit reader '{}' stopped", self.bus.name());

        // wake workers stuck waiting for acks
        self.notify_all();
        pool.join().await;
        result
    }
}

// CoordinatorStateTransitHandler internal helpers
impl CoordinatorStateTransitHandler {
    /// Moves every server currently in `from` to `to` and clears its ack
    /// pool.
    fn begin_phase(
        &self,
        servers: &[ServerAddr],
        from: RemapState,
        to: RemapState,
    ) -> TransitOutcome {
        let mut outcome = TransitOutcome::default();
        for server in servers {
            let Some(cell) = self.table.cell(server) else {
                pf_warn!("transition of unknown server {} skipped", server);
                outcome.skipped.push(*server);
                continue;
            };
            {
                let mut state = lock_cell(&cell);
                if *state != from {
                    pf_debug!("server {} at {}, {} skipped", server, *state, to);
                    outcome.skipped.push(*server);
                    continue;
                }
                *state = to;
            }
            locked(&self.acks).entry(*server).or_default().clear();
            locked(&self.batch).ongoing.insert(*server);
            outcome.started.push(*server);
        }
        outcome
    }

    /// Broadcasts the started servers and queues their worker events; rolls
    /// them back to `from` if the broadcast fails, un-crashing the servers in
    /// `newly_crashed` too.
    async fn commit_phase(
        &self,
        outcome: &TransitOutcome,
        from: RemapState,
        start: bool,
        forced: bool,
        newly_crashed: &[ServerAddr],
    ) -> Result<(), StripeKvError> {
        if outcome.started.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.broadcast_state(&outcome.started).await {
            {
                let mut crashed = locked(&self.crashed);
                for server in newly_crashed {
                    crashed.remove(server);
                }
            }
            for server in &outcome.started {
                if let Some(cell) = self.table.cell(server) {
                    *lock_cell(&cell) = from;
                }
                locked(&self.batch).ongoing.remove(server);
            }
            return logged_err!("transition of {:?} rolled back: {}", outcome.started, e);
        }
        pf_info!(
            "servers {:?} {} (forced {})",
            outcome.started,
            if start { "failing over" } else { "recovering" },
            forced
        );

        let events = outcome
            .started
            .iter()
            .map(|server| StateTransitEvent {
                server: *server,
                start,
                forced,
            })
            .collect();
        insert_repeated_events(
            &self.tx_event,
            events,
            Duration::from_millis(self.config.insert_retry_ms),
        )
        .await
    }

    /// Every live client is in the server's ack pool.
    fn all_acked(&self, server: &ServerAddr) -> bool {
        let clients = locked(&self.clients);
        let acks = locked(&self.acks);
        let Some(pool) = acks.get(server) else {
            return false;
        };
        clients.iter().all(|c| pool.contains(c))
    }

    fn signal_of(&self, server: &ServerAddr) -> Option<Arc<Notify>> {
        locked(&self.signals).get(server).cloned()
    }

    fn notify(&self, server: &ServerAddr) {
        if let Some(signal) = self.signal_of(server) {
            signal.notify_waiters();
        }
    }

    fn notify_all(&self) {
        for signal in locked(&self.signals).values() {
            signal.notify_waiters();
        }
    }

    /// Waits until all live clients acked the server's current phase.
    /// Returns false if the server is removed or termination is signalled
    /// first.
    async fn wait_for_acks(
        &self,
        server: &ServerAddr,
        rx_term: &mut watch::Receiver<bool>,
    ) -> bool {
        let Some(signal) = self.signal_of(server) else {
            return false;
        };
        loop {
            let notified = signal.notified();
            tokio::pin!(notified);
            // register before checking so no wakeup slips in between
            notified.as_mut().enable();

            if *rx_term.borrow() || !self.table.contains(server) {
                return false;
            }
            if self.all_acked(server) {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {},
                changed = rx_term.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                },
            }
        }
    }

    /// Sets the server from `from` to `to` if it is still in `from`.
    fn advance(&self, server: &ServerAddr, from: RemapState, to: RemapState) -> bool {
        let Some(cell) = self.table.cell(server) else {
            return false;
        };
        let mut state = lock_cell(&cell);
        if *state != from {
            pf_warn!("server {} left {} meanwhile, now {}", server, from, *state);
            return false;
        }
        *state = to;
        true
    }

    /// Takes the server out of the ongoing batch. When it was the last one,
    /// broadcasts the final states of every server finished in the batch.
    async fn finish_in_batch(&self, server: &ServerAddr, changed: bool) {
        let updated = {
            let mut batch = locked(&self.batch);
            batch.ongoing.remove(server);
            if changed {
                batch.updated.push(*server);
            }
            if !batch.ongoing.is_empty() {
                return;
            }
            std::mem::take(&mut batch.updated)
        };
        if updated.is_empty() {
            return;
        }
        for chunk in updated.chunks(MAX_RECORDS) {
            if let Err(e) = self.broadcast_state(chunk).await {
                pf_error!("error broadcasting final states of {:?}: {}", chunk, e);
            }
        }
    }

    /// Worker half of the failure path.
    async fn finish_degraded(
        &self,
        event: StateTransitEvent,
        rx_term: &mut watch::Receiver<bool>,
    ) {
        let server = event.server;
        let crashed = self.is_crashed(&server);
        if let Err(e) = self.hooks.transit_to_degraded_end(server, crashed).await {
            pf_error!("degraded-end hook of {} failed: {}", server, e);
        }

        if !event.forced && !self.wait_for_acks(&server, rx_term).await {
            pf_warn!("stopped waiting for acks of {}", server);
            self.finish_in_batch(&server, false).await;
            return;
        }
        let changed =
            self.advance(&server, RemapState::Intermediate, RemapState::Degraded);
        if changed {
            pf_info!("server {} is now {}", server, RemapState::Degraded);
        }
        self.finish_in_batch(&server, changed).await;
    }

    /// Worker half of the recovery path.
    async fn finish_normal(
        &self,
        event: StateTransitEvent,
        rx_term: &mut watch::Receiver<bool>,
    ) {
        let server = event.server;
        if !event.forced && !self.wait_for_acks(&server, rx_term).await {
            pf_warn!("stopped waiting for acks of {}", server);
            self.finish_in_batch(&server, false).await;
            return;
        }
        if self.table.state_of(&server) != Some(RemapState::Coordinated) {
            pf_warn!("server {} left {} meanwhile", server, RemapState::Coordinated);
            self.finish_in_batch(&server, false).await;
            return;
        }

        if self.transit_to_normal_end(&server).await.is_err() {
            pf_warn!("server {} stays {}, retrying", server, RemapState::Coordinated);
            self.retry_later(event);
            return;
        }
        let changed =
            self.advance(&server, RemapState::Coordinated, RemapState::Normal);
        if changed {
            pf_info!("server {} is now {}", server, RemapState::Normal);
        }
        self.finish_in_batch(&server, changed).await;
    }

    /// Hands everything done on the server's behalf while it was degraded
    /// back to it: remapped data first, then rebuilt chunks. Records and
    /// locks are only dropped once both hooks succeeded.
    async fn transit_to_normal_end(&self, server: &ServerAddr) -> Result<(), StripeKvError> {
        let records = self.remapping.unsent_for(server);
        let keys: Vec<_> = records.iter().map(|(key, _)| key.clone()).collect();
        if let Err(e) = self.hooks.sync_remapped_data(*server, records).await {
            return logged_err!("remapped data sync of {} failed: {}", server, e);
        }
        for key in &keys {
            self.remapping.mark_sent(key);
        }

        let released = self.locks.release_for_server(server, &self.stripes);
        if let Err(e) = self.hooks.release_degraded_locks(*server, released).await {
            self.locks.abort_release(server);
            return logged_err!("degraded lock release of {} failed: {}", server, e);
        }
        let dropped = self.locks.finish_release(server);
        let erased = self.remapping.erase_server(server);
        pf_debug!(
            "server {}: {} remapping records erased, {} locks released",
            server,
            erased,
            dropped
        );
        Ok(())
    }

    /// Queues the event again after `hook_retry_ms`, without holding up the
    /// worker meanwhile.
    fn retry_later(&self, event: StateTransitEvent) {
        let tx_event = self.tx_event.clone();
        let delay = Duration::from_millis(self.config.hook_retry_ms);
        let retry = Duration::from_millis(self.config.insert_retry_ms);
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Err(e) = insert_repeated_events(&tx_event, vec![event], retry).await {
                pf_error!("error requeueing event of {}: {}", event.server, e);
            }
        });
    }

    async fn multicast_records(
        &self,
        records: &[StateRecord],
        groups: &[&str],
    ) -> Result<(), StripeKvError> {
        for batch in records.chunks(MAX_RECORDS) {
            let payload = encode_states(batch)?;
            self.bus.multicast(groups, payload).await?;
        }
        Ok(())
    }

    async fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::Message { sender, payload } => {
                let records = match decode_states(&payload) {
                    Ok(records) => records,
                    Err(e) => {
                        pf_error!("bad state message from '{}': {}", sender, e);
                        return;
                    }
                };
                if sender.starts_with(CLIENT_PREFIX) {
                    self.update_state(&sender, &records);
                } else if sender.starts_with(COORD_PREFIX) {
                    self.mirror_states(&sender, &records);
                } else {
                    pf_debug!("ignoring state message from '{}'", sender);
                }
            }

            BusEvent::Joined { group, member } => {
                if group == CLIENT_GROUP && member.starts_with(CLIENT_PREFIX) {
                    self.add_alive_client(&member);
                    if let Err(e) = self.send_state_to_clients(&[]).await {
                        pf_error!("error sending states to '{}': {}", member, e);
                    }
                } else if group == SERVER_GROUP && member.starts_with(SERVER_PREFIX) {
                    pf_info!("server '{}' joined", member);
                    if let Err(e) = self.broadcast_state(&[]).await {
                        pf_error!("error broadcasting states: {}", e);
                    }
                }
            }

            BusEvent::Left { group, member } => {
                if group == CLIENT_GROUP && member.starts_with(CLIENT_PREFIX) {
                    self.remove_alive_client(&member);
                } else if group == SERVER_GROUP {
                    pf_info!("server '{}' left", member);
                }
            }
        }
    }

    /// Follows another coordinator's broadcasts.
    fn mirror_states(&self, sender: &str, records: &[StateRecord]) {
        for record in records {
            match self.table.apply(record) {
                Applied::Changed(from) => pf_debug!(
                    "'{}' moved {} {} -> {}",
                    sender,
                    record.server,
                    from,
                    record.state
                ),
                Applied::Illegal(from) => pf_warn!(
                    "'{}' sent illegal {} -> {} of {}",
                    sender,
                    from,
                    record.state,
                    record.server
                ),
                Applied::Duplicate(_) | Applied::Unknown => {}
            }
        }
    }
}

#[async_trait]
impl EventHandler for CoordinatorStateTransitHandler {
    async fn handle_transit_event(
        &self,
        event: StateTransitEvent,
        rx_term: &mut watch::Receiver<bool>,
    ) {
        if event.start {
            self.finish_degraded(event, rx_term).await;
        } else {
            self.finish_normal(event, rx_term).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::client::{
        ClientStateTransitHandler, ClientTransitActions, PendingRequest,
        PendingTable, RemapEntry, RequestKind,
    };
    use crate::coordinator::degraded::{ReconstructionEntry, ReleasedChunk};
    use crate::coordinator::hooks::NoopHooks;
    use crate::coordinator::remapping::{RemappingKey, RemappingRecord};
    use crate::server::ServerStateTransitHandler;
    use crate::stripe::ChunkPos;
    use crate::transit::{PendingIdentifier, RevertCounter};
    use bytes::Bytes;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time;

    fn addr(last: u8) -> ServerAddr {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 10, last), 9000)
    }

    struct QuietActions;

    impl ClientTransitActions for QuietActions {
        fn sync_metadata(&self, _server: ServerAddr) {}
        fn revert_parity_deltas(&self, _server: ServerAddr, _counter: RevertCounter) {}
        fn replay_requests(&self, _server: ServerAddr, _requests: Vec<PendingRequest>) {}
    }

    #[derive(Default)]
    struct RecordingHooks {
        ends: Mutex<Vec<(ServerAddr, bool)>>,
        synced: Mutex<Vec<(ServerAddr, usize)>>,
        released: Mutex<Vec<HashMap<ServerAddr, Vec<ReleasedChunk>>>>,
    }

    #[async_trait]
    impl CoordinatorHooks for RecordingHooks {
        async fn transit_to_degraded_end(
            &self,
            server: ServerAddr,
            crashed: bool,
        ) -> Result<(), StripeKvError> {
            self.ends.lock().unwrap().push((server, crashed));
            Ok(())
        }

        async fn sync_remapped_data(
            &self,
            server: ServerAddr,
            records: Vec<(RemappingKey, RemappingRecord)>,
        ) -> Result<(), StripeKvError> {
            self.synced.lock().unwrap().push((server, records.len()));
            Ok(())
        }

        async fn release_degraded_locks(
            &self,
            _server: ServerAddr,
            released: HashMap<ServerAddr, Vec<ReleasedChunk>>,
        ) -> Result<(), StripeKvError> {
            self.released.lock().unwrap().push(released);
            Ok(())
        }
    }

    // hand-back hooks that refuse while their flag is set
    #[derive(Default)]
    struct FlakyHooks {
        fail_sync: AtomicBool,
        fail_release: AtomicBool,
        synced: Mutex<Vec<usize>>,
        released: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl CoordinatorHooks for FlakyHooks {
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
            records: Vec<(RemappingKey, RemappingRecord)>,
        ) -> Result<(), StripeKvError> {
            self.synced.lock().unwrap().push(records.len());
            if self.fail_sync.load(Ordering::SeqCst) {
                return Err(StripeKvError::msg("sync refused"));
            }
            Ok(())
        }

        async fn release_degraded_locks(
            &self,
            _server: ServerAddr,
            released: HashMap<ServerAddr, Vec<ReleasedChunk>>,
        ) -> Result<(), StripeKvError> {
            self.released
                .lock()
                .unwrap()
                .push(released.values().map(Vec::len).sum());
            if self.fail_release.load(Ordering::SeqCst) {
                return Err(StripeKvError::msg("release refused"));
            }
            Ok(())
        }
    }

    async fn eventually(
        what: &str,
        check: impl Fn() -> bool,
    ) -> Result<(), StripeKvError> {
        for _ in 0..300 {
            if check() {
                return Ok(());
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        Err(StripeKvError::msg(format!("timed out waiting for {}", what)))
    }

    struct Cluster {
        bus: LocalBus,
        tx_term: watch::Sender<bool>,
        coord: Arc<CoordinatorStateTransitHandler>,
        clients: Vec<(Arc<ClientStateTransitHandler>, Arc<PendingTable>)>,
        servers: Vec<ServerAddr>,
    }

    impl Cluster {
        async fn coord_reaches(
            &self,
            server: ServerAddr,
            state: RemapState,
        ) -> Result<(), StripeKvError> {
            eventually(&format!("coordinator {} at {}", server, state), || {
                self.coord.state_of(&server) == Some(state)
            })
            .await
        }

        async fn clients_reach(
            &self,
            server: ServerAddr,
            state: RemapState,
        ) -> Result<(), StripeKvError> {
            eventually(&format!("clients {} at {}", server, state), || {
                self.clients
                    .iter()
                    .all(|(c, _)| c.table().state_of(&server) == Some(state))
            })
            .await
        }
    }

    // servers 1..=4 on one list, chunks 2 and 3 (servers 3, 4) are parity
    async fn cluster(
        nclients: usize,
        hooks: Arc<dyn CoordinatorHooks>,
    ) -> Result<Cluster, StripeKvError> {
        let bus = LocalBus::new();
        let (tx_term, rx_term) = watch::channel(false);
        let servers: Vec<_> = (1..=4).map(addr).collect();
        let stripes = Arc::new(StripeList::new(2, 2, vec![servers.clone()])?);

        let coord = CoordinatorStateTransitHandler::new_and_setup(
            Arc::new(bus.connect("coord0")?),
            stripes.clone(),
            hooks,
            Some("workers = 2\ninsert_retry_ms = 1\nhook_retry_ms = 5"),
        )
        .await?;
        for s in &servers {
            coord.add_alive_server(*s);
        }
        tokio::spawn(coord.clone().run(rx_term.clone()));

        let mut clients = vec![];
        for i in 0..nclients {
            let pending = Arc::new(PendingTable::new());
            let client = Arc::new(
                ClientStateTransitHandler::new_and_setup(
                    Arc::new(bus.connect(format!("client{}", i))?),
                    stripes.clone(),
                    pending.clone(),
                    Arc::new(QuietActions),
                    Some("ack_interval_ms = 10"),
                )
                .await?,
            );
            for s in &servers {
                client.add_alive_server(*s);
            }
            let (c, rx) = (client.clone(), rx_term.clone());
            tokio::spawn(async move { c.run(rx).await });
            let (c, rx) = (client.clone(), rx_term.clone());
            tokio::spawn(async move { c.run_acker(rx).await });
            clients.push((client, pending));
        }

        let cluster = Cluster {
            bus,
            tx_term,
            coord,
            clients,
            servers,
        };
        eventually("clients registered", || {
            cluster.coord.alive_clients().len() == nclients
        })
        .await?;
        for s in &cluster.servers {
            cluster.clients_reach(*s, RemapState::Normal).await?;
        }
        Ok(cluster)
    }

    // write to data chunk 0 (server 1) whose parity lands on servers 3, 4
    fn blocking_write(pending: &PendingTable) -> PendingIdentifier {
        let id = PendingIdentifier::new(1, 1, 42, 42);
        assert!(pending.insert(PendingRequest {
            id,
            kind: RequestKind::Update,
            key: Bytes::from_static(b"k42"),
            data_chunk: ChunkPos::new(0, 0),
            target: addr(1),
        }));
        id
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn graceful_failover_three_clients() -> Result<(), StripeKvError> {
        let cl = cluster(3, Arc::new(NoopHooks)).await?;
        let s = cl.servers[2];
        let (last, pending) = &cl.clients[2];
        let id = blocking_write(pending);

        let outcome = cl.coord.transit_to_degraded(&[s], false).await?;
        assert_eq!(outcome.started, vec![s]);
        eventually("two of three acks", || {
            cl.coord.acked_clients(&s) == vec!["client0", "client1"]
        })
        .await?;
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cl.coord.state_of(&s), Some(RemapState::Intermediate));
        assert_eq!(last.table().state_of(&s), Some(RemapState::Intermediate));
        for (c, _) in &cl.clients[..2] {
            assert_eq!(c.table().state_of(&s), Some(RemapState::WaitDegraded));
        }

        assert!(last.complete_request(&id).is_some());
        cl.coord_reaches(s, RemapState::Degraded).await?;
        assert_eq!(
            cl.coord.acked_clients(&s),
            vec!["client0", "client1", "client2"]
        );
        cl.clients_reach(s, RemapState::Degraded).await?;
        for (c, _) in &cl.clients {
            assert!(c.allow_remapping(&s));
            assert!(!c.accept_normal_response(&s));
            assert!(c.accept_normal_response(&cl.servers[1]));
        }

        // already away from normal
        let outcome = cl.coord.transit_to_degraded(&[s], false).await?;
        assert_eq!(outcome.skipped, vec![s]);

        let outcome = cl.coord.transit_to_normal(&[s], false).await?;
        assert_eq!(outcome.started, vec![s]);
        cl.coord_reaches(s, RemapState::Normal).await?;
        cl.clients_reach(s, RemapState::Normal).await?;
        assert!(!cl.coord.is_in_transition(&s));
        cl.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_client_holds_phase() -> Result<(), StripeKvError> {
        let cl = cluster(2, Arc::new(NoopHooks)).await?;
        let parity = cl.servers[2];
        let (slow, pending) = &cl.clients[0];
        let id = blocking_write(pending);

        cl.coord.transit_to_degraded(&[parity], false).await?;
        eventually("fast client ack", || {
            cl.coord.acked_clients(&parity) == vec!["client1"]
        })
        .await?;
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cl.coord.state_of(&parity), Some(RemapState::Intermediate));
        assert!(cl.coord.reach_maximum_remapped(1));

        assert!(slow.complete_request(&id).is_some());
        cl.coord_reaches(parity, RemapState::Degraded).await?;
        cl.clients_reach(parity, RemapState::Degraded).await?;
        cl.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crash_and_recover() -> Result<(), StripeKvError> {
        let cl = cluster(1, Arc::new(NoopHooks)).await?;
        let parity = cl.servers[3];
        // this client would never ack, a crash does not wait for it
        blocking_write(&cl.clients[0].1);

        cl.coord.transit_to_degraded(&[parity], true).await?;
        assert!(cl.coord.is_crashed(&parity));
        cl.coord_reaches(parity, RemapState::Degraded).await?;
        cl.clients_reach(parity, RemapState::Degraded).await?;

        let outcome = cl.coord.transit_to_normal(&[parity], false).await?;
        assert_eq!(outcome.skipped, vec![parity]);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cl.coord.state_of(&parity), Some(RemapState::Degraded));

        assert!(cl.coord.remove_crashed_server(&parity));
        let outcome = cl.coord.transit_to_normal(&[parity], false).await?;
        assert_eq!(outcome.started, vec![parity]);
        cl.coord_reaches(parity, RemapState::Normal).await?;
        cl.clients_reach(parity, RemapState::Normal).await?;
        cl.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_batch_never_sent() -> Result<(), StripeKvError> {
        let cl = cluster(0, Arc::new(NoopHooks)).await?;
        let many: Vec<_> = (0..256u16)
            .map(|i| SocketAddrV4::new(Ipv4Addr::new(10, 0, 11, 1), 10000 + i))
            .collect();
        for s in &many {
            cl.coord.add_alive_server(*s);
        }

        let sent = cl.bus.multicast_count();
        assert!(cl.coord.transit_to_degraded(&many, true).await.is_err());
        assert!(cl.coord.transit_to_normal(&many, false).await.is_err());
        assert!(cl.coord.broadcast_state(&many).await.is_err());
        assert_eq!(cl.bus.multicast_count(), sent);
        assert!(many.iter().all(|s| {
            cl.coord.state_of(s) == Some(RemapState::Normal) && !cl.coord.is_crashed(s)
        }));

        let outcome = cl.coord.transit_to_degraded(&many[..255], false).await?;
        assert_eq!(outcome.started.len(), 255);
        for s in &many[..255] {
            cl.coord_reaches(*s, RemapState::Degraded).await?;
        }
        cl.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_broadcast_rolls_back() -> Result<(), StripeKvError> {
        let cl = cluster(1, Arc::new(NoopHooks)).await?;
        let s = cl.servers[1];

        cl.bus.set_fail_multicast(true);
        assert!(cl.coord.transit_to_degraded(&[s], false).await.is_err());
        assert_eq!(cl.coord.state_of(&s), Some(RemapState::Normal));
        cl.bus.set_fail_multicast(false);

        cl.coord.transit_to_degraded(&[s], false).await?;
        cl.coord_reaches(s, RemapState::Degraded).await?;
        cl.clients_reach(s, RemapState::Degraded).await?;
        cl.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_crash_broadcast_uncrashes() -> Result<(), StripeKvError> {
        let hooks = Arc::new(RecordingHooks::default());
        let cl = cluster(1, hooks.clone()).await?;
        let s = cl.servers[1];

        cl.bus.set_fail_multicast(true);
        assert!(cl.coord.transit_to_degraded(&[s], true).await.is_err());
        cl.bus.set_fail_multicast(false);
        assert_eq!(cl.coord.state_of(&s), Some(RemapState::Normal));
        assert!(!cl.coord.is_crashed(&s));

        cl.coord.transit_to_degraded(&[s], false).await?;
        cl.coord_reaches(s, RemapState::Degraded).await?;
        assert_eq!(*hooks.ends.lock().unwrap(), vec![(s, false)]);

        let outcome = cl.coord.transit_to_normal(&[s], false).await?;
        assert_eq!(outcome.started, vec![s]);
        cl.coord_reaches(s, RemapState::Normal).await?;
        cl.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_leave_unblocks_wait() -> Result<(), StripeKvError> {
        let cl = cluster(0, Arc::new(NoopHooks)).await?;
        let s = cl.servers[0];
        assert!(cl.coord.add_alive_client("client9"));

        cl.coord.transit_to_degraded(&[s], false).await?;
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cl.coord.state_of(&s), Some(RemapState::Intermediate));

        let stale = [StateRecord::new(s, RemapState::WaitNormal)];
        let fresh = [StateRecord::new(s, RemapState::WaitDegraded)];
        assert_eq!(cl.coord.update_state("client9", &stale), 0);
        assert_eq!(cl.coord.update_state("client7", &fresh), 0);
        assert_eq!(cl.coord.update_state("server1", &fresh), 0);

        assert!(cl.coord.remove_alive_client("client9"));
        cl.coord_reaches(s, RemapState::Degraded).await?;
        cl.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recovery_hands_back_data() -> Result<(), StripeKvError> {
        let hooks = Arc::new(RecordingHooks::default());
        let cl = cluster(0, hooks.clone()).await?;
        let s = cl.servers[0];

        cl.coord.transit_to_degraded(&[s], false).await?;
        cl.coord_reaches(s, RemapState::Degraded).await?;
        assert_eq!(*hooks.ends.lock().unwrap(), vec![(s, false)]);

        cl.coord.remapping_records().insert(
            RemappingKey::Key(Bytes::from_static(b"k1")),
            RemappingRecord::new(vec![RemapEntry {
                original: ChunkPos::new(0, 0),
                remapped: ChunkPos::new(0, 1),
            }]),
            s,
        );
        let entry = ReconstructionEntry::new(ChunkPos::new(0, 0), ChunkPos::new(0, 2));
        cl.coord
            .degraded_locks()
            .lock_or_merge(0, 7, &[entry], 0, &[1, 2, 3], 4);

        cl.coord.transit_to_normal(&[s], false).await?;
        cl.coord_reaches(s, RemapState::Normal).await?;
        assert_eq!(*hooks.synced.lock().unwrap(), vec![(s, 1)]);
        let released = hooks.released.lock().unwrap().clone();
        assert_eq!(released.len(), 1);
        assert_eq!(
            released[0].get(&cl.servers[2]),
            Some(&vec![ReleasedChunk {
                stripe_id: 7,
                original: ChunkPos::new(0, 0),
                reconstructed: ChunkPos::new(0, 2),
            }])
        );
        assert!(cl.coord.remapping_records().is_empty());
        assert!(cl.coord.degraded_locks().is_empty());
        assert_eq!(cl.coord.degraded_locks().releasing_len(&s), 0);
        cl.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_hand_back_keeps_coordinated() -> Result<(), StripeKvError> {
        let hooks = Arc::new(FlakyHooks::default());
        let cl = cluster(0, hooks.clone()).await?;
        let s = cl.servers[0];
        cl.coord.transit_to_degraded(&[s], false).await?;
        cl.coord_reaches(s, RemapState::Degraded).await?;

        let key = RemappingKey::Key(Bytes::from_static(b"k1"));
        cl.coord.remapping_records().insert(
            key.clone(),
            RemappingRecord::new(vec![RemapEntry {
                original: ChunkPos::new(0, 0),
                remapped: ChunkPos::new(0, 1),
            }]),
            s,
        );
        let entry = ReconstructionEntry::new(ChunkPos::new(0, 0), ChunkPos::new(0, 2));
        cl.coord
            .degraded_locks()
            .lock_or_merge(0, 7, &[entry], 0, &[1, 2, 3], 4);

        // data sync keeps failing: nothing is dropped, no release attempted
        hooks.fail_sync.store(true, Ordering::SeqCst);
        cl.coord.transit_to_normal(&[s], false).await?;
        eventually("sync retried", || hooks.synced.lock().unwrap().len() >= 3).await?;
        assert_eq!(cl.coord.state_of(&s), Some(RemapState::Coordinated));
        assert!(cl.coord.remapping_records().find(&key).is_some());
        assert!(hooks.released.lock().unwrap().is_empty());

        // lock release keeps failing: every attempt sees the restored lock
        hooks.fail_release.store(true, Ordering::SeqCst);
        hooks.fail_sync.store(false, Ordering::SeqCst);
        eventually("release retried", || hooks.released.lock().unwrap().len() >= 3).await?;
        assert_eq!(cl.coord.state_of(&s), Some(RemapState::Coordinated));
        assert!(cl.coord.remapping_records().find(&key).is_some());
        assert!(hooks.released.lock().unwrap().iter().all(|n| *n == 1));

        hooks.fail_release.store(false, Ordering::SeqCst);
        cl.coord_reaches(s, RemapState::Normal).await?;
        assert!(cl.coord.remapping_records().is_empty());
        assert!(cl.coord.degraded_locks().is_empty());
        assert_eq!(cl.coord.degraded_locks().releasing_len(&s), 0);
        assert!(hooks.synced.lock().unwrap().iter().any(|n| *n == 1));
        cl.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn joining_server_gets_snapshot() -> Result<(), StripeKvError> {
        let cl = cluster(0, Arc::new(NoopHooks)).await?;
        let s = cl.servers[1];
        cl.coord.transit_to_degraded(&[s], true).await?;
        cl.coord_reaches(s, RemapState::Degraded).await?;

        let server = Arc::new(
            ServerStateTransitHandler::new_and_setup(Arc::new(
                cl.bus.connect("server1")?,
            ))
            .await?,
        );
        for a in &cl.servers {
            server.add_alive_server(*a);
        }
        let (h, rx) = (server.clone(), cl.tx_term.subscribe());
        tokio::spawn(async move { h.run(rx).await });

        eventually("server snapshot", || {
            server.table().state_of(&s) == Some(RemapState::Degraded)
                && server.table().state_of(&cl.servers[0]) == Some(RemapState::Normal)
        })
        .await?;
        assert!(!server.accept_normal_response(&s));
        cl.tx_term.send(true)?;
        Ok(())
    }
}
