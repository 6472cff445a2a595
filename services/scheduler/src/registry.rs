//! Agent/offer registry.
//!
//! The registry is the scheduler's live view of which agents currently hold
//! unconsumed offers. It keeps two invariants:
//!
//! - every offer belongs to exactly one agent
//! - an agent with no offers is not in the registry
//!
//! All mutation goes through one registry-wide lock. Snapshots returned by
//! [`Registry::agents`] are owned copies and never observe later changes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use drover_proto::{AgentId, Offer, OfferId, Quantities, Resource};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

/// An agent and the offers it currently holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    id: AgentId,
    hostname: String,
    offers: BTreeMap<OfferId, Offer>,
}

impl Agent {
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            hostname: String::new(),
            offers: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Offers held by this agent, ordered by offer id.
    pub fn offers(&self) -> impl Iterator<Item = &Offer> {
        self.offers.values()
    }

    pub fn offer(&self, id: &OfferId) -> Option<&Offer> {
        self.offers.get(id)
    }

    pub fn offer_count(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    /// All resources across this agent's offers.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> + Clone {
        self.offers.values().flat_map(|o| o.resources.iter())
    }

    /// Aggregate quantities across this agent's offers.
    pub fn quantities(&self) -> Quantities {
        Quantities::measure(self.resources())
    }

    fn insert(&mut self, offer: Offer) {
        if self.hostname.is_empty() {
            self.hostname = offer.hostname.clone();
        }
        self.offers.insert(offer.id.clone(), offer);
    }
}

/// Registry of agents holding offers.
#[derive(Debug, Default)]
pub struct Registry {
    agents: RwLock<HashMap<AgentId, Agent>>,
    offer_added: Notify,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<AgentId, Agent>> {
        self.agents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<AgentId, Agent>> {
        self.agents.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace an agent. Agents without offers are ignored.
    pub fn add_agent(&self, agent: Agent) {
        if agent.is_empty() {
            return;
        }
        self.write().insert(agent.id.clone(), agent);
        self.offer_added.notify_waiters();
    }

    pub fn get_agent(&self, id: &AgentId) -> Option<Agent> {
        self.read().get(id).cloned()
    }

    /// Remove an agent together with all of its offers.
    pub fn remove_agent(&self, id: &AgentId) -> Option<Agent> {
        self.write().remove(id)
    }

    /// Register an offer, creating its agent if unseen.
    pub fn add_offer(&self, offer: Offer) {
        debug!(offer_id = %offer.id, agent_id = %offer.agent_id, "Adding offer");
        {
            let mut agents = self.write();
            agents
                .entry(offer.agent_id.clone())
                .or_insert_with(|| Agent::new(offer.agent_id.clone()))
                .insert(offer);
        }
        self.offer_added.notify_waiters();
    }

    /// Remove an offer wherever it is held, pruning its agent if left empty.
    pub fn remove_offer(&self, id: &OfferId) -> Option<Offer> {
        let mut agents = self.write();

        let agent_id = agents
            .values()
            .find(|a| a.offers.contains_key(id))
            .map(|a| a.id.clone())?;

        let agent = agents.get_mut(&agent_id)?;
        let offer = agent.offers.remove(id);
        if agent.is_empty() {
            agents.remove(&agent_id);
            debug!(agent_id = %agent_id, "Pruned agent with no offers");
        }
        offer
    }

    /// Remove every offer in `ids` or none of them.
    ///
    /// Returns the first id not held in the registry, leaving the registry
    /// untouched. Agents left without offers are pruned.
    pub fn take_offers(&self, ids: &[OfferId]) -> Result<Vec<Offer>, OfferId> {
        let mut agents = self.write();

        let mut owners = Vec::with_capacity(ids.len());
        for id in ids {
            let owner = agents
                .values()
                .find(|a| a.offers.contains_key(id))
                .map(|a| a.id.clone())
                .ok_or_else(|| id.clone())?;
            owners.push(owner);
        }

        let mut taken = Vec::with_capacity(ids.len());
        for (id, owner) in ids.iter().zip(owners) {
            let Some(agent) = agents.get_mut(&owner) else {
                continue;
            };
            // A repeated id was already taken on an earlier pass.
            if let Some(offer) = agent.offers.remove(id) {
                taken.push(offer);
            }
            if agent.is_empty() {
                agents.remove(&owner);
                debug!(agent_id = %owner, "Pruned agent with no offers");
            }
        }
        Ok(taken)
    }

    /// Look up an offer without removing it.
    pub fn get_offer(&self, id: &OfferId) -> Option<Offer> {
        self.read()
            .values()
            .find_map(|a| a.offers.get(id))
            .cloned()
    }

    /// Snapshot of all agents, ordered by agent id.
    pub fn agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.read().values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn agent_count(&self) -> usize {
        self.read().len()
    }

    pub fn offer_count(&self) -> usize {
        self.read().values().map(Agent::offer_count).sum()
    }

    /// Drop every agent and offer. Offers do not survive a new subscription.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Future that resolves on the next offer added after it is enabled.
    ///
    /// Enable it (or poll it once) before taking a snapshot so an offer added
    /// between the snapshot and the wait is not missed.
    pub fn offer_added(&self) -> Notified<'_> {
        self.offer_added.notified()
    }
}
