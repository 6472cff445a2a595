//! Framework identity.

use drover_id::FrameworkId;
use serde::{Deserialize, Serialize};

/// Capabilities a framework can advertise on subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityType {
    PartitionAware,
    TaskKillingState,
    GpuResources,
    MultiRole,
    #[serde(other)]
    Unknown,
}

/// A single advertised capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    #[serde(rename = "type")]
    pub kind: CapabilityType,
}

/// The framework's registered identity with the resource manager.
///
/// `id` is absent until the first successful subscription. Once assigned it
/// must be persisted and sent on every later subscription so the resource
/// manager treats the reconnect as a failover rather than a new framework.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameworkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FrameworkId>,

    pub user: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_timeout: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
}

impl FrameworkInfo {
    /// Returns true if the framework advertises the given capability.
    pub fn has_capability(&self, kind: CapabilityType) -> bool {
        self.capabilities.iter().any(|c| c.kind == kind)
    }
}
