//! In-process bus hub, connecting nodes living in the same process.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::{BusEvent, MulticastBus};
use crate::utils::StripeKvError;

use async_trait::async_trait;

use bytes::Bytes;

use tokio::sync::{self, mpsc};

#[derive(Debug, Default)]
struct Hub {
    /// Member name -> event channel.
    members: HashMap<String, mpsc::UnboundedSender<BusEvent>>,

    /// Group name -> member names.
    groups: HashMap<String, BTreeSet<String>>,

    /// Fail every multicast while set.
    fail_multicast: bool,

    /// Number of multicasts accepted so far.
    multicasts: u64,
}

impl Hub {
    fn notify_group(&self, group: &str, event: BusEvent) {
        if let Some(members) = self.groups.get(group) {
            for member in members {
                if let Some(tx) = self.members.get(member) {
                    let _ = tx.send(event.clone());
                }
            }
        }
    }

    fn leave(&mut self, group: &str, member: &str) -> bool {
        let removed = self
            .groups
            .get_mut(group)
            .is_some_and(|members| members.remove(member));
        if removed {
            self.notify_group(
                group,
                BusEvent::Left {
                    group: group.into(),
                    member: member.into(),
                },
            );
        }
        removed
    }
}

/// Process-local bus. Cloning yields another handle to the same hub.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    hub: Arc<Mutex<Hub>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new member endpoint with a unique name.
    pub fn connect(
        &self,
        name: impl Into<String>,
    ) -> Result<LocalEndpoint, StripeKvError> {
        let name = name.into();
        let mut hub = lock_hub(&self.hub);
        if hub.members.contains_key(&name) {
            return logged_err!("duplicate bus member name '{}'", name);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        hub.members.insert(name.clone(), tx);
        Ok(LocalEndpoint {
            name,
            hub: self.hub.clone(),
            rx_event: sync::Mutex::new(rx),
        })
    }

    /// Makes every multicast fail until reset, simulating a transport fault.
    pub fn set_fail_multicast(&self, fail: bool) {
        lock_hub(&self.hub).fail_multicast = fail;
    }

    /// Number of multicasts accepted by the hub.
    pub fn multicast_count(&self) -> u64 {
        lock_hub(&self.hub).multicasts
    }

    /// Current members of a group.
    pub fn members_of(&self, group: &str) -> Vec<String> {
        lock_hub(&self.hub)
            .groups
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn lock_hub(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One member of a `LocalBus`. Dropping it leaves all its groups.
#[derive(Debug)]
pub struct LocalEndpoint {
    name: String,
    hub: Arc<Mutex<Hub>>,
    rx_event: sync::Mutex<mpsc::UnboundedReceiver<BusEvent>>,
}

#[async_trait]
impl MulticastBus for LocalEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn join(&self, group: &str) -> Result<(), StripeKvError> {
        let mut hub = lock_hub(&self.hub);
        let added = hub
            .groups
            .entry(group.into())
            .or_default()
            .insert(self.name.clone());
        if added {
            hub.notify_group(
                group,
                BusEvent::Joined {
                    group: group.into(),
                    member: self.name.clone(),
                },
            );
        }
        Ok(())
    }

    async fn leave(&self, group: &str) -> Result<(), StripeKvError> {
        if !lock_hub(&self.hub).leave(group, &self.name) {
            return logged_err!("'{}' is not a member of '{}'", self.name, group);
        }
        Ok(())
    }

    async fn multicast(
        &self,
        groups: &[&str],
        payload: Bytes,
    ) -> Result<(), StripeKvError> {
        let mut hub = lock_hub(&self.hub);
        if hub.fail_multicast {
            return Err(StripeKvError::msg("multicast transport failure"));
        }
        let mut targets = BTreeSet::new();
        for group in groups {
            if let Some(members) = hub.groups.get(*group) {
                targets.extend(members.iter().filter(|m| **m != self.name));
            }
        }
        for member in targets {
            if let Some(tx) = hub.members.get(member) {
                let _ = tx.send(BusEvent::Message {
                    sender: self.name.clone(),
                    payload: payload.clone(),
                });
            }
        }
        hub.multicasts += 1;
        Ok(())
    }

    async fn receive(&self) -> Result<BusEvent, StripeKvError> {
        match self.rx_event.lock().await.recv().await {
            Some(event) => Ok(event),
            None => logged_err!("bus event channel of '{}' closed", self.name),
        }
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        let mut hub = lock_hub(&self.hub);
        hub.members.remove(&self.name);
        let groups: Vec<String> = hub
            .groups
            .iter()
            .filter(|(_, members)| members.contains(&self.name))
            .map(|(g, _)| g.clone())
            .collect();
        for group in groups {
            hub.leave(&group, &self.name);
        }
    }
}
