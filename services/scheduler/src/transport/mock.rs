//! In-process transport for tests and local development.
//!
//! Records every call, lets the test push events into the live subscription,
//! and can answer ACCEPT and RECONCILE with scripted status updates the way a
//! resource manager would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use drover_id::Ulid;
use drover_proto::{Call, CallKind, Event, FrameworkId, Operation, TaskState, TaskStatus};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{CallResponse, EventStream, Transport, TransportError};

type EventSender = mpsc::UnboundedSender<Result<Event, TransportError>>;

/// Scripted transport.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<Call>>,
    stream: Mutex<Option<EventSender>>,
    statuses: Mutex<HashMap<&'static str, u16>>,
    launch_reply: Mutex<Vec<TaskState>>,
    reconcile_reply: Mutex<Vec<TaskState>>,
    framework_id: Mutex<Option<FrameworkId>>,
    subscriptions: AtomicU32,
    fail_subscribe: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to every launched task with updates in these states.
    pub fn reply_to_launch(&self, states: impl IntoIterator<Item = TaskState>) {
        *lock(&self.launch_reply) = states.into_iter().collect();
    }

    /// Reply to every reconciled task with updates in these states.
    pub fn reply_to_reconcile(&self, states: impl IntoIterator<Item = TaskState>) {
        *lock(&self.reconcile_reply) = states.into_iter().collect();
    }

    /// Framework id announced in SUBSCRIBED when the call carries none.
    pub fn assign_framework_id(&self, id: FrameworkId) {
        *lock(&self.framework_id) = Some(id);
    }

    /// Override the status code returned for a call type.
    pub fn set_status(&self, call: &'static str, status: u16) {
        lock(&self.statuses).insert(call, status);
    }

    /// Make the next `count` SUBSCRIBE attempts fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.fail_subscribe.store(count, Ordering::SeqCst);
    }

    /// Push an event into the live subscription. Returns false if none is open.
    pub fn push(&self, event: Event) -> bool {
        self.push_result(Ok(event))
    }

    /// Push a transport error into the live subscription.
    pub fn push_error(&self, error: TransportError) -> bool {
        self.push_result(Err(error))
    }

    /// End the live subscription as if the connection dropped.
    pub fn close_stream(&self) {
        lock(&self.stream).take();
    }

    /// Whether a subscription is currently open and read.
    pub fn is_streaming(&self) -> bool {
        lock(&self.stream)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Number of successful SUBSCRIBE calls.
    pub fn subscription_count(&self) -> u32 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Every call sent so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    /// Calls of one type, in order.
    pub fn calls_of(&self, name: &str) -> Vec<Call> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.name() == name)
            .cloned()
            .collect()
    }

    fn push_result(&self, item: Result<Event, TransportError>) -> bool {
        match lock(&self.stream).as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    fn status_for(&self, call: &Call) -> u16 {
        let default = match call.kind {
            CallKind::Subscribe { .. } => 200,
            _ => 202,
        };
        lock(&self.statuses)
            .get(call.name())
            .copied()
            .unwrap_or(default)
    }

    fn scripted_updates(&self, call: &Call) -> Vec<TaskStatus> {
        match &call.kind {
            CallKind::Accept { accept } => {
                let states = lock(&self.launch_reply).clone();
                accept
                    .operations
                    .iter()
                    .flat_map(|op| match op {
                        Operation::Launch { launch } => launch.task_infos.iter(),
                    })
                    .flat_map(|info| {
                        states.iter().map(move |state| {
                            let mut status = TaskStatus::new(info.task_id.clone(), *state);
                            status.agent_id = Some(info.agent_id.clone());
                            status
                        })
                    })
                    .collect()
            }
            CallKind::Reconcile { reconcile } => {
                let states = lock(&self.reconcile_reply).clone();
                reconcile
                    .tasks
                    .iter()
                    .flat_map(|task| {
                        states.iter().map(move |state| {
                            let mut status = TaskStatus::new(task.task_id.clone(), *state);
                            status.agent_id = task.agent_id.clone();
                            status
                        })
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, call: &Call) -> Result<CallResponse, TransportError> {
        debug!(call = call.name(), "Mock transport received call");
        lock(&self.calls).push(call.clone());

        let status = self.status_for(call);
        if (200..300).contains(&status) {
            for mut update in self.scripted_updates(call) {
                update.uuid = Some(Ulid::new().to_string());
                self.push(Event::update(update));
            }
        }

        Ok(CallResponse {
            status,
            body: Bytes::new(),
        })
    }

    async fn subscribe(&self, call: &Call) -> Result<EventStream, TransportError> {
        lock(&self.calls).push(call.clone());

        let remaining = self.fail_subscribe.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_subscribe.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::UnexpectedStatus {
                call: call.name(),
                status: 503,
                body: "master unavailable".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let announced = call
            .framework_id
            .clone()
            .or_else(|| lock(&self.framework_id).clone());
        if let Some(id) = announced {
            let _ = tx.send(Ok(Event::subscribed(id)));
        }
        *lock(&self.stream) = Some(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
