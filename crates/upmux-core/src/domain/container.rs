//! Sandbox container bookkeeping.
//!
//! Containers are tagged with labels so a cleanup sweep can find them
//! without any live handle from the owning actor.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Label marking a container as managed by upmux.
pub const LABEL_MANAGED: &str = "dev.upmux.managed";
/// Label carrying the owning upmux instance id.
pub const LABEL_INSTANCE: &str = "dev.upmux.instance";
/// Label carrying the owning server name.
pub const LABEL_SERVER: &str = "dev.upmux.server";
/// Label carrying the pid of the process that created the container.
pub const LABEL_CREATED_BY: &str = "dev.upmux.created";

/// Labels attached to a managed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLabels {
    pub instance_id: String,
    pub server_name: String,
    pub creator_pid: u32,
}

impl ContainerLabels {
    pub fn new(instance_id: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            server_name: server_name.into(),
            creator_pid: std::process::id(),
        }
    }

    /// Label key/value pairs in a stable order.
    pub fn pairs(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (LABEL_MANAGED, "true".to_string()),
            (LABEL_INSTANCE, self.instance_id.clone()),
            (LABEL_SERVER, self.server_name.clone()),
            (LABEL_CREATED_BY, self.creator_pid.to_string()),
        ])
    }
}

/// Which managed containers a sweep targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelSelector {
    /// Every container upmux ever created on this host.
    AllManaged,
    /// Containers created by one upmux instance.
    Instance(String),
    /// Containers for one server of one instance.
    Server { instance_id: String, server: String },
}

impl LabelSelector {
    /// `key=value` filters, all of which must match.
    pub fn filters(&self) -> Vec<String> {
        let mut filters = vec![format!("{LABEL_MANAGED}=true")];
        match self {
            Self::AllManaged => {}
            Self::Instance(id) => filters.push(format!("{LABEL_INSTANCE}={id}")),
            Self::Server {
                instance_id,
                server,
            } => {
                filters.push(format!("{LABEL_INSTANCE}={instance_id}"));
                filters.push(format!("{LABEL_SERVER}={server}"));
            }
        }
        filters
    }

    /// Whether a label set matches this selector.
    pub fn matches(&self, labels: &ContainerLabels) -> bool {
        match self {
            Self::AllManaged => true,
            Self::Instance(id) => &labels.instance_id == id,
            Self::Server {
                instance_id,
                server,
            } => &labels.instance_id == instance_id && &labels.server_name == server,
        }
    }
}

/// How to launch the upstream inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// A sandbox container owned by one server's actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedContainer {
    pub server_name: String,
    pub container_name: String,
    pub cid_file: PathBuf,
    /// Resolved lazily from the cidfile once the container is running.
    pub container_id: Option<String>,
    pub labels: ContainerLabels,
    pub launch: LaunchSpec,
}

/// Observed container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Missing,
}
