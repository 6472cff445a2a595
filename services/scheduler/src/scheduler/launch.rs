//! Task launch: place, accept, then wait for a terminal status.
//!
//! ```text
//! Pending ─► Filtering ─► Placed ─► Accepted ─► Awaiting-Status ─┬─► Terminal-Success
//!    │           │                                    │           └─► Terminal-Failure
//!    │           └─ resource_timeout ─► ResourceTimeout               │
//!    │                                                creation_timeout ─► RECONCILE ─┐
//!    │                                                    ▲──────────────────────────┘
//!    └─ record saved as "pending"               max reconciles ─► CreationTimeout
//! ```

use drover_proto::{ports, AgentId, Call, Filters, Offer, OfferId, TaskId, TaskInfo, TaskStatus};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::Scheduler;
use crate::error::SchedulerError;
use crate::registry::Agent;
use crate::store::{TaskRecord, STATUS_FAILED, STATUS_TIMEOUT};
use crate::task::{detect_error, is_done, ResourceRequest, TaskSpec};

/// Outcome of a successful placement.
#[derive(Debug)]
struct Placed {
    info: TaskInfo,
    agent_id: AgentId,
    offer_ids: Vec<OfferId>,
}

impl Scheduler {
    /// Launch a task and wait until it reaches a terminal state.
    ///
    /// Returns the terminal status on success. A task that ends in a
    /// failure-class state yields [`SchedulerError::TaskTerminal`]; a task
    /// that could not be placed yields [`SchedulerError::ResourceTimeout`].
    #[instrument(skip_all, fields(task_id = %spec.id, name = %spec.name))]
    pub async fn launch_task(&self, spec: &TaskSpec) -> Result<TaskStatus, SchedulerError> {
        info!(cpus = spec.cpus, mem = spec.mem, disk = spec.disk, "Launching task");
        self.save_pending(spec);

        let result = self.launch(spec).await;
        if let Err(e) = &result {
            self.record_failure(&spec.id, e);
        }
        result
    }

    async fn launch(&self, spec: &TaskSpec) -> Result<TaskStatus, SchedulerError> {
        let placed = self.place(spec).await?;

        // Registered before ACCEPT: the first update may arrive before send returns.
        let mut updates = self.state.register_task(&spec.id);

        let call = Call::accept(
            self.framework_id(),
            placed.offer_ids.clone(),
            vec![placed.info],
            Some(Filters::refuse(self.config.refuse_seconds)),
        );
        if let Err(e) = self.call(&call, 202).await {
            self.state.retire_task(&spec.id);
            self.release(&placed.offer_ids).await;
            return Err(e);
        }
        info!(agent_id = %placed.agent_id, offers = placed.offer_ids.len(), "Task accepted");

        let result = self.await_terminal(&spec.id, &placed.agent_id, &mut updates).await;
        self.state.retire_task(&spec.id);
        result
    }

    /// Pick an agent and consume its offers.
    ///
    /// The placement lock is held from the first snapshot until the chosen
    /// offers are out of the registry, and released before ACCEPT is sent.
    async fn place(&self, spec: &TaskSpec) -> Result<Placed, SchedulerError> {
        let request = spec.resource_request();
        let deadline = Instant::now() + self.config.resource_timeout;

        let _guard = tokio::time::timeout_at(deadline, self.placement.lock())
            .await
            .map_err(|_| SchedulerError::ResourceTimeout)?;

        loop {
            let offer_added = self.state.registry.offer_added();
            tokio::pin!(offer_added);
            offer_added.as_mut().enable();

            let candidates = self.filters.apply(&request, self.state.registry.agents());
            if !candidates.is_empty() {
                let strategy = self.strategy.current();
                let ranked = strategy.rank_and_sort(candidates);
                debug!(strategy = strategy.name(), candidates = ranked.len(), "Ranked candidates");
                return self.consume(spec, &request, &ranked[0]);
            }

            debug!("No agent satisfies the request, waiting for offers");
            if tokio::time::timeout_at(deadline, offer_added).await.is_err() {
                warn!(
                    timeout_secs = self.config.resource_timeout.as_secs_f64(),
                    "No resources for task"
                );
                return Err(SchedulerError::ResourceTimeout);
            }
        }
    }

    /// Hand offers taken for a failed ACCEPT back to the resource manager.
    async fn release(&self, offer_ids: &[OfferId]) {
        let call = Call::decline(
            self.framework_id(),
            offer_ids.to_vec(),
            Some(Filters::refuse(self.config.refuse_seconds)),
        );
        match self.call(&call, 202).await {
            Ok(_) => debug!(offers = ?offer_ids, "Released offers after failed accept"),
            Err(e) => warn!(error = %e, offers = ?offer_ids, "Failed to release offers"),
        }
    }

    /// Build the task against `agent` and remove the offers it uses.
    fn consume(
        &self,
        spec: &TaskSpec,
        request: &ResourceRequest,
        agent: &Agent,
    ) -> Result<Placed, SchedulerError> {
        let offers = choose_offers(agent, request);
        let host_ports = ports(offers.iter().flat_map(|o| o.resources.iter()), request.ports);
        let info = spec.build(agent.id(), &host_ports)?;

        let offer_ids: Vec<OfferId> = offers.iter().map(|o| o.id.clone()).collect();
        if let Err(missing) = self.state.registry.take_offers(&offer_ids) {
            error!(offer_id = %missing, agent_id = %agent.id(), "Chosen offer vanished from registry");
            return Err(SchedulerError::ConsistencyViolation { offer_id: missing });
        }

        info!(agent_id = %agent.id(), offers = ?offer_ids, ports = ?host_ports, "Task placed");
        self.update_record(&spec.id, |record| {
            record.agent_id = Some(agent.id().clone());
            record.ports = host_ports.clone();
        });

        Ok(Placed {
            info,
            agent_id: agent.id().clone(),
            offer_ids,
        })
    }

    /// Wait for a terminal status, reconciling whenever the wait times out.
    async fn await_terminal(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
        updates: &mut mpsc::UnboundedReceiver<TaskStatus>,
    ) -> Result<TaskStatus, SchedulerError> {
        let mut reconciles = 0u32;

        loop {
            match tokio::time::timeout(self.config.creation_timeout, updates.recv()).await {
                Ok(Some(status)) => {
                    debug!(state = %status.state, "Task status");
                    if is_done(&status) {
                        detect_error(&status)?;
                        info!(state = %status.state, "Task finished");
                        return Ok(status);
                    }
                }
                Ok(None) => return Err(SchedulerError::TaskAbandoned(task_id.clone())),
                Err(_) => {
                    if reconciles >= self.config.max_reconcile_attempts {
                        return Err(SchedulerError::CreationTimeout {
                            task_id: task_id.clone(),
                            attempts: reconciles,
                        });
                    }
                    reconciles += 1;
                    warn!(attempt = reconciles, "No terminal status yet, reconciling");

                    if let Err(e) = self
                        .reconcile_tasks([(task_id.clone(), Some(agent_id.clone()))])
                        .await
                    {
                        error!(error = %e, "Reconcile failed");
                        return Err(SchedulerError::CreationTimeout {
                            task_id: task_id.clone(),
                            attempts: reconciles,
                        });
                    }
                }
            }
        }
    }

    fn save_pending(&self, spec: &TaskSpec) {
        let mut record = TaskRecord::new(spec.id.clone(), spec.name.clone());
        record.cpus = spec.cpus;
        record.mem = spec.mem;
        record.disk = spec.disk;
        record.image = spec.image().map(str::to_string);

        if let Err(e) = self.store.save_task(&record) {
            error!(task_id = %spec.id, error = %e, "Failed to save task record");
        }
    }

    fn record_failure(&self, id: &TaskId, err: &SchedulerError) {
        let (status, message) = match err {
            SchedulerError::ResourceTimeout => (STATUS_TIMEOUT, err.to_string()),
            SchedulerError::CreationTimeout { .. } => (STATUS_TIMEOUT, err.to_string()),
            // Already persisted from the update itself.
            SchedulerError::TaskTerminal { .. } => return,
            _ => (STATUS_FAILED, err.to_string()),
        };

        self.update_record(id, |record| {
            record.status = status.to_string();
            record.err_msg = message;
        });
    }
}

/// The first offer that satisfies the request alone, otherwise all of the
/// agent's offers together.
fn choose_offers<'a>(agent: &'a Agent, request: &ResourceRequest) -> Vec<&'a Offer> {
    match agent.offers().find(|o| request.fits(&o.quantities())) {
        Some(offer) => vec![offer],
        None => agent.offers().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use drover_proto::{names, Resource};

    fn agent_with(offers: &[(&str, f64, f64)]) -> Agent {
        let registry = Registry::new();
        for (id, cpus, mem) in offers {
            registry.add_offer(Offer {
                id: OfferId::parse(id).unwrap(),
                framework_id: None,
                agent_id: AgentId::parse("A1").unwrap(),
                hostname: String::new(),
                resources: vec![
                    Resource::scalar(names::CPUS, *cpus),
                    Resource::scalar(names::MEM, *mem),
                ],
            });
        }
        registry.get_agent(&AgentId::parse("A1").unwrap()).unwrap()
    }

    fn request(cpus: f64, mem: f64) -> ResourceRequest {
        ResourceRequest {
            cpus,
            mem,
            disk: 0.0,
            ports: 0,
        }
    }

    #[test]
    fn test_choose_single_fitting_offer() {
        let agent = agent_with(&[("O1", 0.25, 64.0), ("O2", 1.0, 256.0)]);
        let chosen: Vec<&str> = choose_offers(&agent, &request(0.5, 128.0))
            .iter()
            .map(|o| o.id.as_str())
            .collect();
        assert_eq!(chosen, vec!["O2"]);
    }

    #[test]
    fn test_choose_combines_offers_when_none_fits_alone() {
        let agent = agent_with(&[("O1", 0.5, 64.0), ("O2", 0.5, 64.0)]);
        let chosen = choose_offers(&agent, &request(1.0, 128.0));
        assert_eq!(chosen.len(), 2);
    }
}
