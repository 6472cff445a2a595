//! # Scheduler engine
//!
//! Subscribes to the resource manager, keeps the live agent/offer view,
//! places tasks and tracks them to a terminal state.
//!
//! ## Lifecycle
//!
//! ```text
//! subscribe() ──► SUBSCRIBE call ──► reader task ──► dispatch(event)
//!                                        │               ├─ registry (offers, rescind)
//!                                        │               ├─ task channels (updates)
//!                                        │               ├─ store (framework id, task records)
//!                                        │               └─ event bus (every event)
//!                                        ├─ silent for reconnect_duration ──► resubscribe
//!                                        └─ first SUBSCRIBE failed ──► resubscribe with backoff
//! unsubscribe() ──► quit signal ──► reader exits, stream dropped
//! ```
//!
//! Only the leader subscribes; the manager drives `subscribe`/`unsubscribe`
//! from leadership changes.
//!
//! ## Concurrency
//!
//! - the registry has its own lock
//! - placement decisions are serialized by one async mutex held from the
//!   candidate snapshot until the chosen offers are removed
//! - each launch owns the receiving end of its task's status channel

mod dispatch;
mod launch;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use drover_proto::{
    AgentId, Call, Event, Filters, FrameworkId, FrameworkInfo, Offer, OfferId, TaskId, TaskStatus,
};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::EventBus;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::events::{EventManager, TaskEvent};
use crate::filter::FilterChain;
use crate::registry::Registry;
use crate::store::{Store, TaskRecord};
use crate::strategy::{RandomStrategy, Strategy, StrategyHandle};
use crate::task::{is_done, ResourceRequest};
use crate::transport::{CallResponse, EventStream, Transport};

/// Capacity of the error channel handed to the caller of [`Scheduler::new`].
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Shared mutable state of one scheduler.
#[derive(Debug)]
pub struct SchedulerState {
    registry: Registry,
    tasks: RwLock<HashMap<TaskId, mpsc::UnboundedSender<TaskStatus>>>,
    framework: RwLock<FrameworkInfo>,
}

impl SchedulerState {
    fn new(framework: FrameworkInfo) -> Self {
        Self {
            registry: Registry::new(),
            tasks: RwLock::new(HashMap::new()),
            framework: RwLock::new(framework),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Open the status channel for a task about to be launched.
    fn register_task(&self, id: &TaskId) -> mpsc::UnboundedReceiver<TaskStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), tx);
        rx
    }

    fn retire_task(&self, id: &TaskId) -> bool {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// Deliver a status to the task's launcher. Returns false if none waits.
    fn route_status(&self, status: &TaskStatus) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&status.task_id)
            .is_some_and(|tx| tx.send(status.clone()).is_ok())
    }

    /// Number of launches currently waiting for a status.
    pub fn task_count(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn framework_id(&self) -> Option<FrameworkId> {
        self.framework
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id
            .clone()
    }

    fn set_framework_id(&self, id: FrameworkId) {
        self.framework
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .id = Some(id);
    }

    fn framework_info(&self) -> FrameworkInfo {
        self.framework
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// How candidates are narrowed and ordered.
pub struct PlacementPolicy {
    pub filters: FilterChain,
    pub strategy: Arc<dyn Strategy>,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            filters: FilterChain::default(),
            strategy: Arc::new(RandomStrategy::new()),
        }
    }
}

struct StreamHandle {
    quit: watch::Sender<bool>,
    reader: JoinHandle<()>,
}

/// The scheduler engine.
pub struct Scheduler {
    config: SchedulerConfig,
    cluster: String,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    state: SchedulerState,
    filters: FilterChain,
    strategy: StrategyHandle,
    bus: EventBus<Event>,
    events: EventManager,
    placement: Mutex<()>,
    stream: Mutex<Option<StreamHandle>>,
    errors: mpsc::Sender<SchedulerError>,
}

impl Scheduler {
    /// Create a scheduler. A framework id persisted by an earlier run is
    /// reused so the next SUBSCRIBE resumes the same framework.
    ///
    /// Protocol and stream errors are reported on the returned receiver.
    pub fn new(
        config: SchedulerConfig,
        cluster: impl Into<String>,
        mut framework: FrameworkInfo,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        policy: PlacementPolicy,
    ) -> (Arc<Self>, mpsc::Receiver<SchedulerError>) {
        match store.get_framework_id() {
            Ok(Some(id)) => {
                info!(framework_id = %id, "Resuming persisted framework");
                framework.id = Some(id);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load framework id"),
        }

        let (errors, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let scheduler = Arc::new(Self {
            bus: EventBus::new(config.bus_buffer, config.bus_send_timeout),
            events: EventManager::new(config.max_event_clients),
            config,
            cluster: cluster.into(),
            transport,
            store,
            state: SchedulerState::new(framework),
            filters: policy.filters,
            strategy: StrategyHandle::new(policy.strategy),
            placement: Mutex::new(()),
            stream: Mutex::new(None),
            errors,
        });
        (scheduler, errors_rx)
    }

    /// Name of the cluster this scheduler serves.
    pub fn cluster_name(&self) -> &str {
        &self.cluster
    }

    pub fn framework_id(&self) -> Option<FrameworkId> {
        self.state.framework_id()
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Bus carrying every dispatched event.
    pub fn bus(&self) -> &EventBus<Event> {
        &self.bus
    }

    /// Swap the placement strategy. Launches already ranking keep the old one.
    pub fn set_strategy(&self, strategy: Arc<dyn Strategy>) {
        info!(strategy = strategy.name(), "Placement strategy changed");
        self.strategy.set(strategy);
    }

    /// Whether a reader is running.
    pub async fn is_subscribed(&self) -> bool {
        self.stream
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.reader.is_finished())
    }

    /// Subscribe to the resource manager and start reading events.
    ///
    /// Does nothing if a reader is already running. When the first SUBSCRIBE
    /// fails the error is reported and the reader keeps retrying it with the
    /// resubscribe backoff until it succeeds or `unsubscribe` is called.
    #[instrument(skip_all, fields(cluster = %self.cluster))]
    pub async fn subscribe(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut current = self.stream.lock().await;
        if current.as_ref().is_some_and(|h| !h.reader.is_finished()) {
            debug!("Already subscribed");
            return Ok(());
        }

        let stream = match self.open_stream().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Subscribe failed, retrying in background");
                self.report(e);
                None
            }
        };
        let (quit, quit_rx) = watch::channel(false);
        let reader = tokio::spawn(Arc::clone(self).read_events(stream, quit_rx));
        *current = Some(StreamHandle { quit, reader });
        Ok(())
    }

    /// Stop the reader and drop the subscription.
    ///
    /// Launches already waiting for a status keep waiting until their own
    /// timeouts fire.
    pub async fn unsubscribe(&self) {
        let Some(handle) = self.stream.lock().await.take() else {
            return;
        };

        info!(cluster = %self.cluster, "Unsubscribing from resource manager");
        let _ = handle.quit.send(true);
        if let Err(e) = handle.reader.await {
            error!(error = %e, "Event reader panicked");
        }
    }

    async fn open_stream(&self) -> Result<EventStream, SchedulerError> {
        // Offers from an earlier subscription are void.
        self.state.registry.clear();

        let call = Call::subscribe(self.state.framework_info());
        info!(framework_id = ?call.framework_id, "Subscribing to resource manager");
        Ok(self.transport.subscribe(&call).await?)
    }

    async fn read_events(
        self: Arc<Self>,
        stream: Option<EventStream>,
        mut quit: watch::Receiver<bool>,
    ) {
        let silence = self.config.reconnect_duration;
        let mut stream = match stream {
            Some(stream) => stream,
            None => match self.resubscribe(&mut quit, 1).await {
                Some(stream) => stream,
                None => {
                    info!("Event reader stopped before subscribing");
                    return;
                }
            },
        };

        loop {
            let next = tokio::select! {
                _ = stopped(&mut quit) => break,
                next = tokio::time::timeout(silence, stream.next()) => next,
            };

            let lost = match next {
                Ok(Some(Ok(event))) => {
                    self.dispatch(event).await;
                    continue;
                }
                Ok(Some(Err(e))) if e.is_decode() => {
                    // The stream itself is intact; skip the bad record.
                    self.report(e.into());
                    continue;
                }
                Ok(Some(Err(e))) => {
                    let reason = e.to_string();
                    self.report(e.into());
                    reason
                }
                Ok(None) => "stream ended".to_string(),
                Err(_) => format!("no event for {}s", silence.as_secs_f64()),
            };

            warn!(reason = %lost, "Subscription lost, resubscribing");
            match self.resubscribe(&mut quit, 0).await {
                Some(fresh) => stream = fresh,
                None => break,
            }
        }

        info!("Event reader stopped");
    }

    /// Retry SUBSCRIBE until it succeeds or `quit` fires. `failed` counts
    /// attempts that already failed; each one adds a backoff delay first.
    async fn resubscribe(
        &self,
        quit: &mut watch::Receiver<bool>,
        failed: u32,
    ) -> Option<EventStream> {
        let mut attempt = failed;
        loop {
            if attempt > 0 {
                let delay = self.config.resubscribe_backoff.delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting to resubscribe");
                tokio::select! {
                    _ = stopped(quit) => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if *quit.borrow() {
                return None;
            }

            match self.open_stream().await {
                Ok(stream) => {
                    info!(attempt, "Resubscribed to resource manager");
                    return Some(stream);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Resubscribe failed");
                    self.report(e);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Forward an error to the error channel. Never blocks.
    fn report(&self, err: SchedulerError) {
        error!(error = %err, "Scheduler error");
        if self.errors.try_send(err).is_err() {
            debug!("Error channel full or closed, error dropped");
        }
    }

    async fn call(&self, call: &Call, expected: u16) -> Result<CallResponse, SchedulerError> {
        let response = self.transport.send(call).await?;
        Ok(response.expect(call.name(), expected)?)
    }

    /// Acknowledge a status update. Updates without a uuid need no ack.
    pub async fn acknowledge(&self, status: &TaskStatus) -> Result<(), SchedulerError> {
        let Some(uuid) = status.uuid.clone() else {
            return Ok(());
        };
        let Some(agent_id) = status.agent_id.clone() else {
            warn!(task_id = %status.task_id, "Update with uuid but no agent id, cannot acknowledge");
            return Ok(());
        };

        let call = Call::acknowledge(self.framework_id(), agent_id, status.task_id.clone(), uuid);
        self.call(&call, 202).await?;
        Ok(())
    }

    /// Ask the resource manager to resend the latest status of these tasks.
    pub async fn reconcile_tasks(
        &self,
        tasks: impl IntoIterator<Item = (TaskId, Option<AgentId>)>,
    ) -> Result<(), SchedulerError> {
        let call = Call::reconcile(self.framework_id(), tasks);
        self.call(&call, 202).await?;
        Ok(())
    }

    /// Release an offer back to the resource manager.
    pub async fn decline_offer(&self, offer_id: &OfferId) -> Result<(), SchedulerError> {
        if self.state.registry.remove_offer(offer_id).is_none() {
            debug!(offer_id = %offer_id, "Declining offer not held in registry");
        }

        let call = Call::decline(
            self.framework_id(),
            vec![offer_id.clone()],
            Some(Filters::refuse(self.config.refuse_seconds)),
        );
        self.call(&call, 202).await?;
        debug!(offer_id = %offer_id, "Offer declined");
        Ok(())
    }

    /// Kill a task and wait for it to reach a terminal state.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn kill_task(
        &self,
        task_id: &TaskId,
        agent_id: Option<&AgentId>,
    ) -> Result<TaskStatus, SchedulerError> {
        info!("Killing task");

        // Subscribe before sending so the final update cannot slip past.
        let wanted = task_id.clone();
        let mut updates = self.bus.subscribe_filtered(move |event| {
            matches!(event, Event::Update { update } if update.status.task_id == wanted)
        });

        let call = Call::kill(self.framework_id(), task_id.clone(), agent_id.cloned());
        self.call(&call, 202).await?;

        let deadline = tokio::time::Instant::now() + self.config.creation_timeout;
        loop {
            match tokio::time::timeout_at(deadline, updates.recv()).await {
                Ok(Some(Event::Update { update })) => {
                    debug!(state = %update.status.state, "Kill progress");
                    if is_done(&update.status) {
                        info!(state = %update.status.state, "Task stopped");
                        return Ok(update.status);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => return Err(SchedulerError::TaskAbandoned(task_id.clone())),
                Err(_) => return Err(SchedulerError::KillTimeout(task_id.clone())),
            }
        }
    }

    /// Wait for the next OFFERS event carrying offers that each satisfy
    /// `request`, and return those offers.
    ///
    /// The offers stay in the registry; this only observes them.
    pub async fn request_offers(
        &self,
        request: ResourceRequest,
        timeout: Duration,
    ) -> Result<Vec<Offer>, SchedulerError> {
        let event = self
            .bus
            .wait_for(
                move |event| match event {
                    Event::Offers { offers } => offers
                        .offers
                        .iter()
                        .any(|o| request.fits(&o.quantities())),
                    _ => false,
                },
                timeout,
            )
            .await
            .ok_or(SchedulerError::EventTimeout)?;

        match event {
            Event::Offers { offers } => Ok(offers
                .offers
                .into_iter()
                .filter(|o| request.fits(&o.quantities()))
                .collect()),
            other => Err(SchedulerError::Internal(format!(
                "offer wait matched {} event",
                other.name()
            ))),
        }
    }

    /// Stream task events to `sink` until it is closed.
    ///
    /// Fails at once with [`SchedulerError::TooManyEventClients`] when the
    /// event manager is full.
    pub async fn subscribe_event(
        &self,
        sink: mpsc::Sender<TaskEvent>,
        remote: &str,
    ) -> Result<(), SchedulerError> {
        self.events.subscribe(remote, sink.clone())?;
        info!(remote, "Event client connected");

        sink.closed().await;

        self.events.unsubscribe(remote);
        info!(remote, "Event client disconnected");
        Ok(())
    }

    pub fn event_client_count(&self) -> usize {
        self.events.client_count()
    }

    /// Read-modify-write a task record. Failures are logged.
    fn update_record(&self, id: &TaskId, apply: impl FnOnce(&mut TaskRecord)) {
        let mut record = match self.store.get_task(id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(task_id = %id, "No stored record for task");
                return;
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "Failed to load task record");
                return;
            }
        };

        apply(&mut record);
        record.updated_at = chrono::Utc::now();
        if let Err(e) = self.store.update_task(&record) {
            error!(task_id = %id, error = %e, "Failed to update task record");
        }
    }
}

async fn stopped(quit: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = quit.wait_for(|stop| *stop).await;
}
