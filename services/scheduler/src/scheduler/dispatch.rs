//! Event dispatch.

use drover_proto::{Event, FrameworkId, Offer, OfferId, TaskStatus};
use tracing::{debug, error, info, warn};

use super::Scheduler;
use crate::error::SchedulerError;
use crate::events::TaskEvent;

impl Scheduler {
    /// Apply one event to the scheduler state, then publish it on the bus.
    pub(crate) async fn dispatch(&self, event: Event) {
        match &event {
            Event::Subscribed { subscribed } => self.on_subscribed(&subscribed.framework_id),
            Event::Offers { offers } => self.on_offers(&offers.offers),
            Event::Rescind { rescind } => self.on_rescind(&rescind.offer_id),
            Event::Update { update } => self.on_update(&update.status).await,
            Event::Message { message } => {
                debug!(agent_id = %message.agent_id, executor_id = %message.executor_id, "Executor message");
            }
            Event::Failure { failure } => {
                warn!(
                    agent_id = ?failure.agent_id,
                    executor_id = ?failure.executor_id,
                    status = ?failure.status,
                    "Agent or executor failure"
                );
            }
            Event::Error { error } => {
                self.report(SchedulerError::Remote(error.message.clone()));
            }
            Event::Heartbeat => debug!("Heartbeat from resource manager"),
            Event::Unknown => debug!("Ignoring unknown event"),
        }

        self.bus.publish(event).await;
    }

    fn on_subscribed(&self, id: &FrameworkId) {
        info!(framework_id = %id, "Subscription successful");
        self.state.set_framework_id(id.clone());

        if let Err(e) = self.store.update_framework_id(id) {
            error!(framework_id = %id, error = %e, "Failed to persist framework id");
        }
    }

    fn on_offers(&self, offers: &[Offer]) {
        debug!(count = offers.len(), "Received offers");
        for offer in offers {
            self.state.registry.add_offer(offer.clone());
        }
    }

    fn on_rescind(&self, offer_id: &OfferId) {
        match self.state.registry.remove_offer(offer_id) {
            Some(_) => debug!(offer_id = %offer_id, "Offer rescinded"),
            None => debug!(offer_id = %offer_id, "Rescind for unknown or consumed offer"),
        }
    }

    /// Acknowledge, hand the status to its launcher, then persist it.
    async fn on_update(&self, status: &TaskStatus) {
        info!(
            task_id = %status.task_id,
            state = %status.state,
            healthy = ?status.healthy,
            "Received status update"
        );

        if let Err(e) = self.acknowledge(status).await {
            error!(task_id = %status.task_id, state = %status.state, error = %e, "Failed to acknowledge status update");
            self.report(e);
        }

        if !self.state.route_status(status) {
            debug!(task_id = %status.task_id, "No launcher waiting for this task");
        }

        self.update_record(&status.task_id, |record| {
            record.status = status.state.as_str().to_string();
            record.healthy = status.healthy.unwrap_or(false);
            record.err_msg = format!("{}:{}", status.reason_str(), status.message_str());
            if let Some(agent_id) = &status.agent_id {
                record.agent_id = Some(agent_id.clone());
            }
        });

        self.events.broadcast(&TaskEvent::from(status));
    }
}
