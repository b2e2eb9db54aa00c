//! Resource update events consumed by the state manager.
//!
//! One event carries one object of a fixed kind plus the lifecycle transition
//! the producer observed. Events are serde-encoded as JSON, one per line, in
//! recorded streams.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::records::{ContainerStatus, Lifecycle, PodStatus, QosClass};
use crate::Uid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateEvent {
    Created,
    Running,
    Updated,
    Terminating,
    Terminated,
}

impl UpdateEvent {
    pub fn lifecycle(self) -> Lifecycle {
        match self {
            UpdateEvent::Created | UpdateEvent::Running | UpdateEvent::Updated => Lifecycle::Active,
            UpdateEvent::Terminating => Lifecycle::Terminating,
            UpdateEvent::Terminated => Lifecycle::Terminated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NamespaceUpdate {
    pub uid: Uid,
    pub name: String,
    #[serde(default)]
    pub start_ts: u64,
    #[serde(default)]
    pub stop_ts: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodUpdate {
    pub uid: Uid,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub qos: QosClass,
    #[serde(default)]
    pub status: PodStatus,
    #[serde(default)]
    pub start_ts: u64,
    #[serde(default)]
    pub stop_ts: Option<u64>,
    #[serde(default)]
    pub containers: SmallVec<[Uid; 4]>,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerUpdate {
    pub uid: Uid,
    pub name: String,
    #[serde(default)]
    pub pod_uid: Option<Uid>,
    #[serde(default)]
    pub status: ContainerStatus,
    #[serde(default)]
    pub start_ts: u64,
    #[serde(default)]
    pub stop_ts: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub uid: Uid,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub pods: SmallVec<[Uid; 4]>,
    #[serde(default)]
    pub start_ts: u64,
    #[serde(default)]
    pub stop_ts: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ResourceObject {
    Namespace(NamespaceUpdate),
    Pod(PodUpdate),
    Container(ContainerUpdate),
    Service(ServiceUpdate),
}

impl ResourceObject {
    pub fn uid(&self) -> &str {
        match self {
            ResourceObject::Namespace(n) => &n.uid,
            ResourceObject::Pod(p) => &p.uid,
            ResourceObject::Container(c) => &c.uid,
            ResourceObject::Service(s) => &s.uid,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ResourceObject::Namespace(n) => &n.name,
            ResourceObject::Pod(p) => &p.name,
            ResourceObject::Container(c) => &c.name,
            ResourceObject::Service(s) => &s.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResourceObject::Namespace(_) => "namespace",
            ResourceObject::Pod(_) => "pod",
            ResourceObject::Container(_) => "container",
            ResourceObject::Service(_) => "service",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUpdate {
    pub resource_version: u64,
    pub event: UpdateEvent,
    pub object: ResourceObject,
}

/// Structural problems that make an update unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("{kind} update has an empty uid")]
    EmptyUid { kind: &'static str },
    #[error("{kind} {uid} has an empty name")]
    EmptyName { kind: &'static str, uid: Uid },
    #[error("{kind} {uid} carries resource version 0")]
    ZeroVersion { kind: &'static str, uid: Uid },
    #[error("{kind} {uid} references an empty uid")]
    EmptyReference { kind: &'static str, uid: Uid },
    #[error("container {uid} names itself as its pod")]
    SelfReference { uid: Uid },
    #[error("decoding update: {0}")]
    Decode(String),
}

impl ResourceUpdate {
    pub fn new(resource_version: u64, event: UpdateEvent, object: ResourceObject) -> Self {
        Self { resource_version, event, object }
    }

    pub fn uid(&self) -> &str { self.object.uid() }

    /// Parse one JSON-encoded update.
    pub fn from_json(line: &str) -> Result<Self, UpdateError> {
        serde_json::from_str(line).map_err(|e| UpdateError::Decode(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), UpdateError> {
        let kind = self.object.kind();
        let uid = self.object.uid();
        if uid.is_empty() {
            return Err(UpdateError::EmptyUid { kind });
        }
        if self.object.name().is_empty() {
            return Err(UpdateError::EmptyName { kind, uid: uid.to_string() });
        }
        if self.resource_version == 0 {
            return Err(UpdateError::ZeroVersion { kind, uid: uid.to_string() });
        }
        let empty_ref = match &self.object {
            ResourceObject::Pod(p) => p.containers.iter().any(|c| c.is_empty()),
            ResourceObject::Service(s) => s.pods.iter().any(|p| p.is_empty()),
            ResourceObject::Container(c) => {
                if c.pod_uid.as_deref() == Some(uid) {
                    return Err(UpdateError::SelfReference { uid: uid.to_string() });
                }
                c.pod_uid.as_deref() == Some("")
            }
            ResourceObject::Namespace(_) => false,
        };
        if empty_ref {
            return Err(UpdateError::EmptyReference { kind, uid: uid.to_string() });
        }
        Ok(())
    }
}
