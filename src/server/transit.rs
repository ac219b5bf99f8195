//! Server-side state transition handler: applies coordinator broadcasts and
//! answers routing predicates for request handling.

use std::sync::Arc;

use crate::bus::{BusEvent, COORD_PREFIX, MulticastBus, SERVER_GROUP};
use crate::transit::{
    Applied, RemapState, Role, ServerAddr, StateRecord, StateTable,
    decode_states,
};
use crate::utils::StripeKvError;

use tokio::sync::watch;

/// State transition handler running inside a storage server.
pub struct ServerStateTransitHandler {
    bus: Arc<dyn MulticastBus>,
    table: Arc<StateTable>,
}

impl ServerStateTransitHandler {
    /// Creates the handler and joins the servers group.
    pub async fn new_and_setup(
        bus: Arc<dyn MulticastBus>,
    ) -> Result<Self, StripeKvError> {
        bus.join(SERVER_GROUP).await?;
        Ok(ServerStateTransitHandler {
            bus,
            table: Arc::new(StateTable::new(Role::Server)),
        })
    }

    pub fn table(&self) -> &Arc<StateTable> {
        &self.table
    }

    /// Starts tracking a peer server. Its state stays `Undefined` until the
    /// coordinator's broadcast names it.
    pub fn add_alive_server(&self, server: ServerAddr) -> bool {
        self.table.add_server(server, RemapState::Undefined)
    }

    pub fn remove_alive_server(&self, server: &ServerAddr) -> bool {
        self.table.remove_server(server)
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

    /// Applies a batch of broadcast records. Returns how many changed state.
    pub fn apply_states(&self, records: &[StateRecord]) -> usize {
        let mut changed = 0;
        for record in records {
            match self.table.apply(record) {
                Applied::Changed(from) => {
                    pf_info!("server {} {} -> {}", record.server, from, record.state);
                    changed += 1;
                }
                Applied::Duplicate(_) => {}
                Applied::Unknown => {
                    pf_warn!("state for unknown server {} ignored", record.server);
                }
                Applied::Illegal(from) => {
                    pf_error!(
                        "illegal transition {} -> {} of {} ignored",
                        from,
                        record.state,
                        record.server
                    );
                }
            }
        }
        changed
    }

    fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::Message { sender, payload } => {
                if !sender.starts_with(COORD_PREFIX) {
                    pf_debug!("ignoring state message from '{}'", sender);
                    return;
                }
                match decode_states(&payload) {
                    Ok(records) => {
                        self.apply_states(&records);
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

    /// Reader loop consuming the bus until termination.
    pub async fn run(
        &self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), StripeKvError> {
        pf_debug!("server transit reader '{}' started", self.bus.name());
        loop {
            tokio::select! {
                event = self.bus.receive() => self.handle_event(event?),
                _ = rx_term.changed() => break,
            }
        }
        pf_debug!("server transit reader '{}' stopped", self.bus.name());
        Ok(())
    }
}
