//! Calls sent from the framework to the resource manager.

use drover_id::{AgentId, FrameworkId, OfferId, TaskId};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::framework::FrameworkInfo;
use crate::resources::Filters;
use crate::task::TaskInfo;

/// A request to the resource manager's scheduler endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<FrameworkId>,

    #[serde(flatten)]
    pub kind: CallKind,
}

/// Call kind and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallKind {
    Subscribe { subscribe: Subscribe },
    Teardown,
    Accept { accept: Accept },
    Decline { decline: Decline },
    Revive,
    Kill { kill: Kill },
    Acknowledge { acknowledge: Acknowledge },
    Reconcile { reconcile: Reconcile },
}

impl CallKind {
    /// Protocol name of the call type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::Teardown => "TEARDOWN",
            Self::Accept { .. } => "ACCEPT",
            Self::Decline { .. } => "DECLINE",
            Self::Revive => "REVIVE",
            Self::Kill { .. } => "KILL",
            Self::Acknowledge { .. } => "ACKNOWLEDGE",
            Self::Reconcile { .. } => "RECONCILE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub framework_info: FrameworkInfo,
}

/// An operation applied to accepted offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Launch { launch: Launch },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Launch {
    pub task_infos: Vec<TaskInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accept {
    pub offer_ids: Vec<OfferId>,

    #[serde(default)]
    pub operations: Vec<Operation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decline {
    pub offer_ids: Vec<OfferId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kill {
    pub task_id: TaskId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledge {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileTask {
    pub task_id: TaskId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reconcile {
    #[serde(default)]
    pub tasks: Vec<ReconcileTask>,
}

impl Call {
    /// SUBSCRIBE, resuming the framework id carried in `framework_info` if set.
    pub fn subscribe(framework_info: FrameworkInfo) -> Self {
        Self {
            framework_id: framework_info.id.clone(),
            kind: CallKind::Subscribe {
                subscribe: Subscribe { framework_info },
            },
        }
    }

    /// TEARDOWN of the whole framework.
    pub fn teardown(framework_id: Option<FrameworkId>) -> Self {
        Self {
            framework_id,
            kind: CallKind::Teardown,
        }
    }

    /// ACCEPT the given offers with a single LAUNCH operation.
    pub fn accept(
        framework_id: Option<FrameworkId>,
        offer_ids: Vec<OfferId>,
        task_infos: Vec<TaskInfo>,
        filters: Option<Filters>,
    ) -> Self {
        Self {
            framework_id,
            kind: CallKind::Accept {
                accept: Accept {
                    offer_ids,
                    operations: vec![Operation::Launch {
                        launch: Launch { task_infos },
                    }],
                    filters,
                },
            },
        }
    }

    /// DECLINE the given offers.
    pub fn decline(
        framework_id: Option<FrameworkId>,
        offer_ids: Vec<OfferId>,
        filters: Option<Filters>,
    ) -> Self {
        Self {
            framework_id,
            kind: CallKind::Decline {
                decline: Decline { offer_ids, filters },
            },
        }
    }

    /// REVIVE previously declined offers.
    pub fn revive(framework_id: Option<FrameworkId>) -> Self {
        Self {
            framework_id,
            kind: CallKind::Revive,
        }
    }

    /// KILL a task.
    pub fn kill(framework_id: Option<FrameworkId>, task_id: TaskId, agent_id: Option<AgentId>) -> Self {
        Self {
            framework_id,
            kind: CallKind::Kill {
                kill: Kill { task_id, agent_id },
            },
        }
    }

    /// ACKNOWLEDGE a reliable status update.
    pub fn acknowledge(
        framework_id: Option<FrameworkId>,
        agent_id: AgentId,
        task_id: TaskId,
        uuid: String,
    ) -> Self {
        Self {
            framework_id,
            kind: CallKind::Acknowledge {
                acknowledge: Acknowledge {
                    agent_id,
                    task_id,
                    uuid,
                },
            },
        }
    }

    /// RECONCILE the given tasks. An empty list asks for every known task.
    pub fn reconcile(
        framework_id: Option<FrameworkId>,
        tasks: impl IntoIterator<Item = (TaskId, Option<AgentId>)>,
    ) -> Self {
        Self {
            framework_id,
            kind: CallKind::Reconcile {
                reconcile: Reconcile {
                    tasks: tasks
                        .into_iter()
                        .map(|(task_id, agent_id)| ReconcileTask { task_id, agent_id })
                        .collect(),
                },
            },
        }
    }

    /// Protocol name of the call type.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtoError> {
        serde_json::to_vec(self).map_err(ProtoError::Encode)
    }

    /// Decode from JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtoError> {
        serde_json::from_slice(bytes).map_err(ProtoError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fw() -> Option<FrameworkId> {
        Some(FrameworkId::parse("F1").unwrap())
    }

    #[test]
    fn test_kill_wire_shape() {
        let call = Call::kill(
            fw(),
            TaskId::parse("t1").unwrap(),
            Some(AgentId::parse("S1").unwrap()),
        );
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "framework_id": {"value": "F1"},
                "type": "KILL",
                "kill": {"task_id": {"value": "t1"}, "agent_id": {"value": "S1"}}
            })
        );
    }

    #[test]
    fn test_accept_carries_launch_operation() {
        let call = Call::accept(
            fw(),
            vec![OfferId::parse("O1").unwrap()],
            vec![],
            Some(Filters::refuse(1.0)),
        );
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "ACCEPT");
        assert_eq!(json["accept"]["operations"][0]["type"], "LAUNCH");
        assert_eq!(json["accept"]["filters"]["refuse_seconds"], 1.0);
        assert_eq!(call.name(), "ACCEPT");
    }

    #[test]
    fn test_subscribe_without_id_omits_framework_id() {
        let info = FrameworkInfo {
            id: None,
            user: "root".into(),
            name: "drover".into(),
            principal: None,
            failover_timeout: None,
            checkpoint: None,
            hostname: None,
            capabilities: vec![],
        };
        let json = serde_json::to_value(Call::subscribe(info)).unwrap();
        assert!(json.get("framework_id").is_none());
        assert_eq!(json["subscribe"]["framework_info"]["name"], "drover");
    }

    #[test]
    fn test_call_json_roundtrip() {
        let call = Call::reconcile(
            fw(),
            [(TaskId::parse("t1").unwrap(), Some(AgentId::parse("S1").unwrap()))],
        );
        let bytes = call.to_json().unwrap();
        assert_eq!(Call::from_json(&bytes).unwrap(), call);
    }
}
