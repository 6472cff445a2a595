//! Task specifications and their launch descriptors.

use std::collections::BTreeMap;

use drover_proto::{
    names, AgentId, CommandInfo, ContainerInfo, ContainerType, DockerInfo, DockerNetwork,
    HealthCheck, HealthCheckType, HttpCheckInfo, Label, Labels, Parameter, PortMapping,
    Quantities, Resource, TaskId, TaskInfo, TaskState, TaskStatus, TcpCheckInfo, Volume,
    VolumeMode,
};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// HTTP statuses an HTTP health check treats as healthy.
pub const HEALTHY_HTTP_STATUSES: [u32; 4] = [200, 201, 301, 302];

/// Resources a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub ports: usize,
}

impl ResourceRequest {
    /// Returns true if the given quantities cover this request.
    pub fn fits(&self, available: &Quantities) -> bool {
        available.cpus >= self.cpus
            && available.mem >= self.mem
            && available.disk >= self.disk
            && available.ports >= self.ports as u64
    }
}

/// Container port to expose through a host port taken from the offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMappingSpec {
    pub container_port: u32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub name: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Host path mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub container_path: String,
    pub host_path: String,
    /// `RW` or `RO`; anything but `RW` mounts read-only.
    #[serde(default)]
    pub mode: String,
}

/// Docker container settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    /// `none`, `host`, `bridge` or `user`. Unrecognized values mean `none`.
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub force_pull_image: bool,
    #[serde(default)]
    pub parameters: Vec<(String, String)>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub port_mappings: Vec<PortMappingSpec>,
}

/// Health check settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// `cmd`, `http` or `tcp`.
    pub protocol: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub path: String,
    /// Index into the task's port mappings whose host port the health check targets.
    #[serde(default)]
    pub port_index: usize,
    #[serde(default)]
    pub delay_seconds: f64,
    pub interval_seconds: f64,
    pub timeout_seconds: f64,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub grace_period_seconds: f64,
}

/// A task to place on the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub name: String,
    pub cpus: f64,
    pub mem: f64,
    #[serde(default)]
    pub disk: f64,
    /// Command line; the first word is the executable.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub container: Option<ContainerSpec>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl TaskSpec {
    /// New task with a generated id.
    pub fn new(name: impl Into<String>, cpus: f64, mem: f64) -> Self {
        Self {
            id: TaskId::generate(),
            name: name.into(),
            cpus,
            mem,
            disk: 0.0,
            command: String::new(),
            container: None,
            health_check: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn port_mappings(&self) -> &[PortMappingSpec] {
        self.container
            .as_ref()
            .map(|c| c.port_mappings.as_slice())
            .unwrap_or(&[])
    }

    pub fn image(&self) -> Option<&str> {
        self.container.as_ref().map(|c| c.image.as_str())
    }

    /// Resources this task needs from an offer.
    pub fn resource_request(&self) -> ResourceRequest {
        ResourceRequest {
            cpus: self.cpus,
            mem: self.mem,
            disk: self.disk,
            ports: self.port_mappings().len(),
        }
    }

    /// Build the launch descriptor for the given agent and offered host ports.
    ///
    /// `host_ports` must hold at least one port per port mapping; they are
    /// bound to the mappings in order.
    pub fn build(&self, agent_id: &AgentId, host_ports: &[u64]) -> Result<TaskInfo, SchedulerError> {
        let mappings = self.port_mappings();
        if host_ports.len() < mappings.len() {
            return Err(SchedulerError::InvalidTask(format!(
                "task {} needs {} port(s), offer has {}",
                self.id,
                mappings.len(),
                host_ports.len()
            )));
        }
        let host_ports = &host_ports[..mappings.len()];

        Ok(TaskInfo {
            name: self.name.clone(),
            task_id: self.id.clone(),
            agent_id: agent_id.clone(),
            resources: self.resources(host_ports),
            command: Some(self.command_info()),
            container: self
                .container
                .as_ref()
                .map(|c| container_info(c, host_ports)),
            health_check: self
                .health_check
                .as_ref()
                .map(|h| health_check(h, host_ports))
                .transpose()?,
            labels: self.labels_info(),
        })
    }

    fn resources(&self, host_ports: &[u64]) -> Vec<Resource> {
        let mut resources = Vec::new();
        for (name, value) in [
            (names::CPUS, self.cpus),
            (names::MEM, self.mem),
            (names::DISK, self.disk),
        ] {
            if value > 0.0 {
                resources.push(Resource::scalar(name, value));
            }
        }
        resources.extend(host_ports.iter().map(|p| Resource::port(*p)));
        resources
    }

    fn command_info(&self) -> CommandInfo {
        let mut words = self.command.split_whitespace();
        match words.next() {
            Some(value) => CommandInfo {
                shell: false,
                value: Some(value.to_string()),
                arguments: words.map(str::to_string).collect(),
            },
            None => CommandInfo {
                shell: false,
                ..CommandInfo::default()
            },
        }
    }

    fn labels_info(&self) -> Option<Labels> {
        if self.labels.is_empty() {
            return None;
        }
        Some(Labels {
            labels: self
                .labels
                .iter()
                .map(|(k, v)| Label {
                    key: k.clone(),
                    value: Some(v.clone()),
                })
                .collect(),
        })
    }
}

fn network(name: &str) -> DockerNetwork {
    match name {
        "host" => DockerNetwork::Host,
        "bridge" => DockerNetwork::Bridge,
        "user" => DockerNetwork::User,
        _ => DockerNetwork::None,
    }
}

fn container_info(spec: &ContainerSpec, host_ports: &[u64]) -> ContainerInfo {
    ContainerInfo {
        kind: ContainerType::Docker,
        volumes: spec
            .volumes
            .iter()
            .map(|v| Volume {
                container_path: v.container_path.clone(),
                host_path: Some(v.host_path.clone()),
                mode: if v.mode.eq_ignore_ascii_case("RW") {
                    VolumeMode::Rw
                } else {
                    VolumeMode::Ro
                },
            })
            .collect(),
        docker: Some(DockerInfo {
            image: spec.image.clone(),
            network: network(&spec.network),
            port_mappings: spec
                .port_mappings
                .iter()
                .zip(host_ports)
                .map(|(m, host)| PortMapping {
                    host_port: *host as u32,
                    container_port: m.container_port,
                    protocol: Some(m.protocol.clone()),
                })
                .collect(),
            privileged: spec.privileged,
            parameters: spec
                .parameters
                .iter()
                .map(|(key, value)| Parameter {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            force_pull_image: spec.force_pull_image,
        }),
    }
}

fn health_check(spec: &HealthCheckSpec, host_ports: &[u64]) -> Result<HealthCheck, SchedulerError> {
    let port = || {
        host_ports
            .get(spec.port_index)
            .map(|p| *p as u32)
            .ok_or_else(|| {
                SchedulerError::InvalidTask(format!(
                    "health check port index {} out of range",
                    spec.port_index
                ))
            })
    };

    let mut check = HealthCheck {
        kind: HealthCheckType::Command,
        delay_seconds: spec.delay_seconds,
        interval_seconds: spec.interval_seconds,
        timeout_seconds: spec.timeout_seconds,
        consecutive_failures: spec.consecutive_failures,
        grace_period_seconds: spec.grace_period_seconds,
        command: None,
        http: None,
        tcp: None,
    };

    match spec.protocol.to_ascii_lowercase().as_str() {
        "cmd" => {
            check.command = Some(CommandInfo {
                shell: true,
                value: Some(spec.command.clone()),
                arguments: Vec::new(),
            });
        }
        "http" => {
            check.kind = HealthCheckType::Http;
            check.http = Some(HttpCheckInfo {
                scheme: Some("http".to_string()),
                port: port()?,
                path: Some(spec.path.clone()),
                statuses: HEALTHY_HTTP_STATUSES.to_vec(),
            });
        }
        "tcp" => {
            check.kind = HealthCheckType::Tcp;
            check.tcp = Some(TcpCheckInfo { port: port()? });
        }
        other => {
            return Err(SchedulerError::InvalidTask(format!(
                "unknown health check protocol {other:?}"
            )))
        }
    }

    Ok(check)
}

/// Returns true once the task's wait is over.
///
/// UNREACHABLE and UNKNOWN are not final: the agent may come back, and
/// reconciliation settles them.
pub fn is_done(status: &TaskStatus) -> bool {
    matches!(
        status.state,
        TaskState::Finished
            | TaskState::Failed
            | TaskState::Killed
            | TaskState::Error
            | TaskState::Lost
            | TaskState::Dropped
            | TaskState::Gone
            | TaskState::GoneByOperator
    )
}

/// Map a failure-class status to an error.
pub fn detect_error(status: &TaskStatus) -> Result<(), SchedulerError> {
    match status.state {
        TaskState::Failed
        | TaskState::Error
        | TaskState::Lost
        | TaskState::Dropped
        | TaskState::Unreachable
        | TaskState::Gone
        | TaskState::GoneByOperator
        | TaskState::Unknown => Err(SchedulerError::TaskTerminal {
            task_id: status.task_id.clone(),
            state: status.state,
            reason: status.reason_str().to_string(),
            message: status.message_str().to_string(),
            origin: status.source_str().to_string(),
            healthy: status.healthy.unwrap_or(false),
        }),
        _ => Ok(()),
    }
}
