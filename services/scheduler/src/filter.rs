//! Resource filter chain.
//!
//! Filters are pure and order-preserving: each one keeps the agents that
//! satisfy its check, in the order it received them. A chain applies its
//! filters in sequence, so the result is the intersection of all of them.

use drover_proto::{names, port_count, sum_scalar};

use crate::registry::Agent;
use crate::task::ResourceRequest;

/// A single candidate filter.
pub trait Filter: Send + Sync {
    /// Filter name for logging.
    fn name(&self) -> &'static str;

    /// Returns true if the agent can host the request.
    fn accepts(&self, request: &ResourceRequest, agent: &Agent) -> bool;

    /// Keep the agents this filter accepts, preserving order.
    fn filter(&self, request: &ResourceRequest, agents: Vec<Agent>) -> Vec<Agent> {
        agents
            .into_iter()
            .filter(|a| self.accepts(request, a))
            .collect()
    }
}

/// Keeps agents whose aggregate offered cpus, mem and disk cover the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceFilter;

impl Filter for ResourceFilter {
    fn name(&self) -> &'static str {
        "resource"
    }

    fn accepts(&self, request: &ResourceRequest, agent: &Agent) -> bool {
        sum_scalar(agent.resources(), names::CPUS) >= request.cpus
            && sum_scalar(agent.resources(), names::MEM) >= request.mem
            && sum_scalar(agent.resources(), names::DISK) >= request.disk
    }
}

/// Keeps agents offering at least as many ports as the request maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortFilter;

impl Filter for PortFilter {
    fn name(&self) -> &'static str {
        "ports"
    }

    fn accepts(&self, request: &ResourceRequest, agent: &Agent) -> bool {
        request.ports == 0 || port_count(agent.resources()) >= request.ports as u64
    }
}

/// Ordered list of filters.
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new(vec![Box::new(ResourceFilter), Box::new(PortFilter)])
    }
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Apply every filter in sequence.
    pub fn apply(&self, request: &ResourceRequest, agents: Vec<Agent>) -> Vec<Agent> {
        self.filters
            .iter()
            .fold(agents, |agents, f| f.filter(request, agents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use drover_proto::{AgentId, Offer, OfferId, Resource};
    use proptest::prelude::*;

    fn registry_with(agents: &[(f64, f64, u64)]) -> Registry {
        let registry = Registry::new();
        for (i, (cpus, mem, ports)) in agents.iter().enumerate() {
            let mut resources = vec![
                Resource::scalar(names::CPUS, *cpus),
                Resource::scalar(names::MEM, *mem),
            ];
            if *ports > 0 {
                resources.push(Resource::ranges(names::PORTS, [(31000, 31000 + ports - 1)]));
            }
            registry.add_offer(Offer {
                id: OfferId::parse(&format!("O{i}")).unwrap(),
                framework_id: None,
                agent_id: AgentId::parse(&format!("S{i}")).unwrap(),
                hostname: String::new(),
                resources,
            });
        }
        registry
    }

    fn request(cpus: f64, mem: f64, ports: usize) -> ResourceRequest {
        ResourceRequest {
            cpus,
            mem,
            disk: 0.0,
            ports,
        }
    }

    #[test]
    fn test_chain_keeps_fitting_agents_in_order() {
        let registry = registry_with(&[(1.0, 256.0, 10), (0.2, 1024.0, 10), (2.0, 512.0, 0)]);
        let chain = FilterChain::default();

        let kept = chain.apply(&request(0.5, 128.0, 0), registry.agents());
        let ids: Vec<&str> = kept.iter().map(|a| a.id().as_str()).collect();
        assert_eq!(ids, vec!["S0", "S2"]);

        let kept = chain.apply(&request(0.5, 128.0, 1), registry.agents());
        let ids: Vec<&str> = kept.iter().map(|a| a.id().as_str()).collect();
        assert_eq!(ids, vec!["S0"]);
    }

    #[test]
    fn test_combined_offers_count() {
        let registry = registry_with(&[(0.5, 64.0, 0)]);
        registry.add_offer(Offer {
            id: OfferId::parse("O9").unwrap(),
            framework_id: None,
            agent_id: AgentId::parse("S0").unwrap(),
            hostname: String::new(),
            resources: vec![Resource::scalar(names::CPUS, 0.5), Resource::scalar(names::MEM, 64.0)],
        });

        let kept = FilterChain::default().apply(&request(1.0, 128.0, 0), registry.agents());
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_chain_names() {
        assert_eq!(FilterChain::default().names(), vec!["resource", "ports"]);
    }

    proptest! {
        #[test]
        fn prop_filter_is_idempotent(
            agents in proptest::collection::vec((0.0f64..4.0, 0.0f64..2048.0, 0u64..8), 0..12),
            cpus in 0.0f64..4.0,
            mem in 0.0f64..2048.0,
            ports in 0usize..8,
        ) {
            let registry = registry_with(&agents);
            let chain = FilterChain::default();
            let req = request(cpus, mem, ports);

            let once = chain.apply(&req, registry.agents());
            let twice = chain.apply(&req, once.clone());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_filter_output_is_subsequence(
            agents in proptest::collection::vec((0.0f64..4.0, 0.0f64..2048.0, 0u64..8), 0..12),
            cpus in 0.0f64..4.0,
        ) {
            let registry = registry_with(&agents);
            let input = registry.agents();
            let output = FilterChain::default().apply(&request(cpus, 0.0, 0), input.clone());

            let mut it = input.iter();
            for agent in &output {
                prop_assert!(it.any(|a| a == agent));
                prop_assert!(agent.quantities().cpus >= cpus);
            }
        }
    }
}
