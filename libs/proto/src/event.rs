//! Events pushed by the resource manager on the subscription stream.

use drover_id::{AgentId, ExecutorId, FrameworkId, OfferId};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::resources::Offer;
use crate::task::TaskStatus;

/// An event received on the subscription stream.
///
/// Event kinds this client does not understand decode to [`Event::Unknown`]
/// instead of failing, so a newer resource manager does not break the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Subscribed { subscribed: Subscribed },
    Offers { offers: Offers },
    Rescind { rescind: Rescind },
    Update { update: Update },
    Message { message: Message },
    Failure { failure: Failure },
    Error { error: ErrorMessage },
    Heartbeat,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribed {
    pub framework_id: FrameworkId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Offers {
    #[serde(default)]
    pub offers: Vec<Offer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rescind {
    pub offer_id: OfferId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub agent_id: AgentId,
    pub executor_id: ExecutorId,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

impl Event {
    /// Protocol name of the event type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Subscribed { .. } => "SUBSCRIBED",
            Self::Offers { .. } => "OFFERS",
            Self::Rescind { .. } => "RESCIND",
            Self::Update { .. } => "UPDATE",
            Self::Message { .. } => "MESSAGE",
            Self::Failure { .. } => "FAILURE",
            Self::Error { .. } => "ERROR",
            Self::Heartbeat => "HEARTBEAT",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Decode a single event from JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtoError> {
        serde_json::from_slice(bytes).map_err(ProtoError::Decode)
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtoError> {
        serde_json::to_vec(self).map_err(ProtoError::Encode)
    }

    /// Convenience constructor for an OFFERS event.
    pub fn offers(offers: Vec<Offer>) -> Self {
        Self::Offers {
            offers: Offers { offers },
        }
    }

    /// Convenience constructor for an UPDATE event.
    pub fn update(status: TaskStatus) -> Self {
        Self::Update {
            update: Update { status },
        }
    }

    /// Convenience constructor for a RESCIND event.
    pub fn rescind(offer_id: OfferId) -> Self {
        Self::Rescind {
            rescind: Rescind { offer_id },
        }
    }

    /// Convenience constructor for a SUBSCRIBED event.
    pub fn subscribed(framework_id: FrameworkId) -> Self {
        Self::Subscribed {
            subscribed: Subscribed {
                framework_id,
                heartbeat_interval_seconds: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    #[test]
    fn test_decode_heartbeat() {
        let event = Event::from_json(br#"{"type":"HEARTBEAT"}"#).unwrap();
        assert_eq!(event, Event::Heartbeat);
    }

    #[test]
    fn test_decode_subscribed() {
        let event = Event::from_json(
            br#"{"type":"SUBSCRIBED","subscribed":{"framework_id":{"value":"F1"},"heartbeat_interval_seconds":15}}"#,
        )
        .unwrap();
        match event {
            Event::Subscribed { subscribed } => {
                assert_eq!(subscribed.framework_id.as_str(), "F1");
                assert_eq!(subscribed.heartbeat_interval_seconds, Some(15.0));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_update() {
        let event = Event::from_json(
            br#"{"type":"UPDATE","update":{"status":{"task_id":{"value":"t1"},"state":"TASK_RUNNING"}}}"#,
        )
        .unwrap();
        let Event::Update { update } = event else {
            panic!("expected update");
        };
        assert_eq!(update.status.state, TaskState::Running);
    }

    #[test]
    fn test_decode_unknown_type() {
        let event = Event::from_json(br#"{"type":"INVERSE_OFFERS"}"#).unwrap();
        assert_eq!(event, Event::Unknown);
        assert_eq!(event.name(), "UNKNOWN");
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Event::from_json(b"{not json").is_err());
    }
}
