//! Entity records held by the metadata state.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::{Uid, Upid};

/// Lifecycle of a mirrored object. Only moves forward; `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Active,
    Terminating,
    Terminated,
}

impl Lifecycle {
    pub fn is_terminated(self) -> bool { matches!(self, Lifecycle::Terminated) }
    pub fn advance(self, next: Lifecycle) -> Lifecycle { self.max(next) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QosClass {
    #[default]
    Unknown,
    Guaranteed,
    Burstable,
    BestEffort,
}

impl QosClass {
    pub fn as_str(self) -> &'static str {
        match self {
            QosClass::Unknown => "Unknown",
            QosClass::Guaranteed => "Guaranteed",
            QosClass::Burstable => "Burstable",
            QosClass::BestEffort => "BestEffort",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Unknown,
    Pending,
    Running,
    Succeeded,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodStatus {
    pub phase: PodPhase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContainerState {
    #[default]
    Unknown,
    Waiting,
    Running,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub state: ContainerState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
}

/// Process registered by discovery. Only `stop_ts` ever changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidInfo {
    pub upid: Upid,
    pub cmdline: String,
    pub container_uid: Option<Uid>,
    pub start_ts: u64,
    pub stop_ts: Option<u64>,
}

impl PidInfo {
    pub fn new(upid: Upid, cmdline: impl Into<String>, container_uid: impl Into<String>) -> Self {
        let cid: String = container_uid.into();
        Self {
            upid,
            cmdline: cmdline.into(),
            container_uid: if cid.is_empty() { None } else { Some(cid) },
            start_ts: upid.start_ts(),
            stop_ts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub uid: Uid,
    pub name: String,
    pub start_ts: u64,
    pub stop_ts: Option<u64>,
    pub lifecycle: Lifecycle,
    pub resource_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    pub uid: Uid,
    pub name: String,
    pub namespace: String,
    pub ip: Option<String>,
    pub qos: QosClass,
    pub status: PodStatus,
    pub start_ts: u64,
    pub stop_ts: Option<u64>,
    pub containers: FxHashSet<Uid>,
    pub node_name: String,
    pub hostname: String,
    pub lifecycle: Lifecycle,
    pub resource_version: u64,
}

impl PodInfo {
    pub fn display_name(&self) -> String { crate::display_name(&self.namespace, &self.name) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub uid: Uid,
    pub name: String,
    pub pod_uid: Option<Uid>,
    pub status: ContainerStatus,
    pub start_ts: u64,
    pub stop_ts: Option<u64>,
    pub lifecycle: Lifecycle,
    pub resource_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub uid: Uid,
    pub name: String,
    pub namespace: String,
    /// Pods named by the last accepted update, live or not.
    pub pods: FxHashSet<Uid>,
    pub start_ts: u64,
    pub stop_ts: Option<u64>,
    pub lifecycle: Lifecycle,
    pub resource_version: u64,
}

impl ServiceInfo {
    pub fn display_name(&self) -> String { crate::display_name(&self.namespace, &self.name) }
}
