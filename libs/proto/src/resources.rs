//! Resources and offers.

use drover_id::{AgentId, FrameworkId, OfferId};
use serde::{Deserialize, Serialize};

/// Well-known resource names.
pub mod names {
    pub const CPUS: &str = "cpus";
    pub const MEM: &str = "mem";
    pub const DISK: &str = "disk";
    pub const PORTS: &str = "ports";
}

/// Value kind of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Scalar,
    Ranges,
    Set,
    Text,
}

/// A scalar value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub value: f64,
}

/// An inclusive range `[begin, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub begin: u64,
    pub end: u64,
}

impl Range {
    /// Number of values covered by this range.
    pub fn len(&self) -> u64 {
        if self.end < self.begin {
            0
        } else {
            (self.end - self.begin).saturating_add(1)
        }
    }

    /// Returns true if the range covers no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A list of ranges.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ranges {
    #[serde(default)]
    pub range: Vec<Range>,
}

/// A named resource, either a scalar quantity or a set of ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ValueType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalar: Option<Scalar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Ranges>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Resource {
    /// Build a scalar resource.
    pub fn scalar(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: ValueType::Scalar,
            scalar: Some(Scalar { value }),
            ranges: None,
            role: None,
        }
    }

    /// Build a ranges resource.
    pub fn ranges(name: &str, ranges: impl IntoIterator<Item = (u64, u64)>) -> Self {
        Self {
            name: name.to_string(),
            kind: ValueType::Ranges,
            scalar: None,
            ranges: Some(Ranges {
                range: ranges
                    .into_iter()
                    .map(|(begin, end)| Range { begin, end })
                    .collect(),
            }),
            role: None,
        }
    }

    /// Build a `ports` resource reserving exactly one port.
    pub fn port(port: u64) -> Self {
        Self::ranges(names::PORTS, [(port, port)])
    }

    /// Scalar value, or zero for non-scalar resources.
    pub fn scalar_value(&self) -> f64 {
        self.scalar.map(|s| s.value).unwrap_or(0.0)
    }

    /// Ranges of this resource, empty for non-range resources.
    pub fn range_list(&self) -> &[Range] {
        self.ranges.as_ref().map(|r| r.range.as_slice()).unwrap_or(&[])
    }
}

/// Sum the scalar values of every resource named `name`.
pub fn sum_scalar<'a>(resources: impl IntoIterator<Item = &'a Resource>, name: &str) -> f64 {
    resources
        .into_iter()
        .filter(|r| r.name == name && r.kind == ValueType::Scalar)
        .map(Resource::scalar_value)
        .sum()
}

/// Count the ports offered across every `ports` resource without expanding them.
pub fn port_count<'a>(resources: impl IntoIterator<Item = &'a Resource>) -> u64 {
    resources
        .into_iter()
        .filter(|r| r.name == names::PORTS)
        .flat_map(|r| r.range_list().iter())
        .map(Range::len)
        .fold(0, u64::saturating_add)
}

/// Expand up to `limit` ports from the `ports` resources, in offer order.
pub fn ports<'a>(resources: impl IntoIterator<Item = &'a Resource>, limit: usize) -> Vec<u64> {
    resources
        .into_iter()
        .filter(|r| r.name == names::PORTS)
        .flat_map(|r| r.range_list().iter())
        .flat_map(|range| range.begin..=range.end)
        .take(limit)
        .collect()
}

/// Aggregate quantities carried by a set of resources.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quantities {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub ports: u64,
}

impl Quantities {
    /// Measure a set of resources.
    pub fn measure<'a>(resources: impl IntoIterator<Item = &'a Resource> + Clone) -> Self {
        Self {
            cpus: sum_scalar(resources.clone(), names::CPUS),
            mem: sum_scalar(resources.clone(), names::MEM),
            disk: sum_scalar(resources.clone(), names::DISK),
            ports: port_count(resources),
        }
    }
}

impl std::ops::Add for Quantities {
    type Output = Quantities;

    fn add(self, rhs: Quantities) -> Quantities {
        Quantities {
            cpus: self.cpus + rhs.cpus,
            mem: self.mem + rhs.mem,
            disk: self.disk + rhs.disk,
            ports: self.ports.saturating_add(rhs.ports),
        }
    }
}

/// A grant of an agent's spare resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<FrameworkId>,

    pub agent_id: AgentId,

    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Offer {
    /// Aggregate quantities carried by this offer.
    pub fn quantities(&self) -> Quantities {
        Quantities::measure(self.resources.iter())
    }
}

/// Filters attached to accept/decline calls.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refuse_seconds: Option<f64>,
}

impl Filters {
    /// Refuse the declined resources for the given number of seconds.
    pub fn refuse(seconds: f64) -> Self {
        Self {
            refuse_seconds: Some(seconds),
        }
    }
}
