//! The metadata state aggregate: entity records plus every index over them.
//!
//! Index families:
//! - primary maps, UID -> record (records behind `Arc` so a snapshot clone is shallow)
//! - name -> UID for the current holder of each display name, and UID -> name
//! - UPID -> `PidInfo`, registered by process discovery
//! - structural links (pod <-> container, pod <- service declarations, container -> UPIDs)
//!   which may point at objects not seen yet or already terminated
//! - liveness indices (UPID -> container/pod/services, pod <-> service, pod IP -> pod)
//!   which only ever reference existing, non-terminated records
//!
//! All mutation goes through this type so that a termination and the purge of
//! every liveness entry it implies happen in one step on the writer's copy.

mod mutate;
mod retention;

pub use retention::EvictionStats;

use std::sync::Arc;

use kmeta_core::{ContainerInfo, Lifecycle, NamespaceInfo, PidInfo, PodInfo, ServiceInfo, Uid, Upid};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Identity of the agent that owns this state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentInfo {
    pub asid: u32,
    pub agent_id: Uuid,
    pub hostname: String,
    pub pod_name: String,
    pub node_name: String,
}

impl AgentInfo {
    pub fn new(asid: u32, agent_id: Uuid, hostname: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self { asid, agent_id, hostname: hostname.into(), pod_name: pod_name.into(), node_name: String::new() }
    }

    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentMetadataState {
    agent: AgentInfo,
    epoch: u64,
    resource_version: u64,

    namespaces: FxHashMap<Uid, Arc<NamespaceInfo>>,
    pods: FxHashMap<Uid, Arc<PodInfo>>,
    containers: FxHashMap<Uid, Arc<ContainerInfo>>,
    services: FxHashMap<Uid, Arc<ServiceInfo>>,

    namespace_names: FxHashMap<String, Uid>,
    pod_names: FxHashMap<String, Uid>,
    container_names: FxHashMap<String, Uid>,
    service_names: FxHashMap<String, Uid>,
    uid_names: FxHashMap<Uid, String>,

    pids: FxHashMap<Upid, Arc<PidInfo>>,

    container_pod: FxHashMap<Uid, Uid>,
    containers_by_pod: FxHashMap<Uid, FxHashSet<Uid>>,
    services_by_pod: FxHashMap<Uid, FxHashSet<Uid>>,
    container_upids: FxHashMap<Uid, FxHashSet<Upid>>,

    upid_containers: FxHashMap<Upid, Uid>,
    upid_pods: FxHashMap<Upid, Uid>,
    upid_services: FxHashMap<Upid, FxHashSet<Uid>>,
    pod_services: FxHashMap<Uid, FxHashSet<Uid>>,
    service_pods: FxHashMap<Uid, FxHashSet<Uid>>,
    pod_ips: FxHashMap<String, FxHashSet<Uid>>,
}

/// Counts for diagnostics and gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateStats {
    pub epoch: u64,
    pub resource_version: u64,
    pub namespaces: usize,
    pub pods: usize,
    pub live_pods: usize,
    pub containers: usize,
    pub live_containers: usize,
    pub services: usize,
    pub live_services: usize,
    pub upids: usize,
    pub live_upids: usize,
}

/// A liveness index disagrees with the records. Always a bug in the mutation path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("{index} references unknown {uid}")]
    Dangling { index: &'static str, uid: String },
    #[error("{index} references terminated {uid}")]
    Terminated { index: &'static str, uid: String },
    #[error("pod {pod} and service {service} are linked in one direction only")]
    Asymmetric { pod: Uid, service: Uid },
    #[error("{index} entry {key} disagrees with record {uid}")]
    Mismatch { index: &'static str, key: String, uid: Uid },
}

/// Lifecycle bookkeeping shared by all mirrored kinds.
pub(crate) trait Tracked {
    fn lifecycle(&self) -> Lifecycle;
    fn start_ts(&self) -> u64;
    fn stop_ts(&self) -> Option<u64>;
}

macro_rules! tracked {
    ($($t:ty),*) => {$(
        impl Tracked for $t {
            fn lifecycle(&self) -> Lifecycle { self.lifecycle }
            fn start_ts(&self) -> u64 { self.start_ts }
            fn stop_ts(&self) -> Option<u64> { self.stop_ts }
        }
    )*};
}

tracked!(NamespaceInfo, PodInfo, ContainerInfo, ServiceInfo);

pub(crate) fn is_live<T: Tracked>(records: &FxHashMap<Uid, Arc<T>>, uid: &str) -> bool {
    records.get(uid).is_some_and(|r| !r.lifecycle().is_terminated())
}

fn check_live<T: Tracked>(
    records: &FxHashMap<Uid, Arc<T>>,
    uid: &str,
    index: &'static str,
) -> Result<(), InvariantViolation> {
    match records.get(uid) {
        None => Err(InvariantViolation::Dangling { index, uid: uid.to_string() }),
        Some(r) if r.lifecycle().is_terminated() => Err(InvariantViolation::Terminated { index, uid: uid.to_string() }),
        Some(_) => Ok(()),
    }
}

impl AgentMetadataState {
    pub fn new(agent: AgentInfo) -> Self {
        Self { agent, ..Default::default() }
    }

    pub fn agent(&self) -> &AgentInfo { &self.agent }
    /// Sequence number of the last applied batch.
    pub fn epoch(&self) -> u64 { self.epoch }
    /// Highest resource version applied so far.
    pub fn resource_version(&self) -> u64 { self.resource_version }

    pub(crate) fn set_epoch(&mut self, epoch: u64) { self.epoch = epoch; }
    pub(crate) fn advance_version(&mut self, version: u64) {
        self.resource_version = self.resource_version.max(version);
    }

    // ---- lookups by UID / name ----

    pub fn namespace(&self, uid: &str) -> Option<&NamespaceInfo> { self.namespaces.get(uid).map(Arc::as_ref) }
    pub fn pod(&self, uid: &str) -> Option<&PodInfo> { self.pods.get(uid).map(Arc::as_ref) }
    pub fn container(&self, uid: &str) -> Option<&ContainerInfo> { self.containers.get(uid).map(Arc::as_ref) }
    pub fn service(&self, uid: &str) -> Option<&ServiceInfo> { self.services.get(uid).map(Arc::as_ref) }

    pub fn namespace_uid_by_name(&self, name: &str) -> Option<&str> {
        self.namespace_names.get(name).map(String::as_str)
    }
    /// `name` is `namespace/name`.
    pub fn pod_uid_by_name(&self, name: &str) -> Option<&str> { self.pod_names.get(name).map(String::as_str) }
    pub fn container_uid_by_name(&self, name: &str) -> Option<&str> {
        self.container_names.get(name).map(String::as_str)
    }
    /// `name` is `namespace/name`.
    pub fn service_uid_by_name(&self, name: &str) -> Option<&str> {
        self.service_names.get(name).map(String::as_str)
    }

    pub fn pod_by_name(&self, name: &str) -> Option<&PodInfo> { self.pod_uid_by_name(name).and_then(|u| self.pod(u)) }
    pub fn container_by_name(&self, name: &str) -> Option<&ContainerInfo> {
        self.container_uid_by_name(name).and_then(|u| self.container(u))
    }
    pub fn service_by_name(&self, name: &str) -> Option<&ServiceInfo> {
        self.service_uid_by_name(name).and_then(|u| self.service(u))
    }

    /// Display name recorded for any UID, live or historical.
    pub fn name_of(&self, uid: &str) -> Option<&str> { self.uid_names.get(uid).map(String::as_str) }

    // ---- liveness-gated resolution ----

    /// Live pod holding `ip`. Several live pods share an IP under host
    /// networking; the one started last wins, ties go to the smaller UID.
    pub fn pod_uid_by_ip(&self, ip: &str) -> Option<&str> {
        self.pod_ips
            .get(ip)?
            .iter()
            .filter_map(|uid| self.pod(uid))
            .max_by(|a, b| a.start_ts.cmp(&b.start_ts).then_with(|| b.uid.cmp(&a.uid)))
            .map(|p| p.uid.as_str())
    }

    /// Ungated: survives termination of the process's pod and container.
    pub fn pid_info(&self, upid: &Upid) -> Option<&PidInfo> { self.pids.get(upid).map(Arc::as_ref) }

    pub fn container_for_upid(&self, upid: &Upid) -> Option<&ContainerInfo> {
        self.upid_containers.get(upid).and_then(|c| self.container(c))
    }

    pub fn pod_for_upid(&self, upid: &Upid) -> Option<&PodInfo> {
        self.upid_pods.get(upid).and_then(|p| self.pod(p))
    }

    /// Services backing the process's pod. Order is unspecified.
    pub fn services_for_upid(&self, upid: &Upid) -> Vec<&ServiceInfo> {
        self.upid_services
            .get(upid)
            .map(|ss| ss.iter().filter_map(|s| self.service(s)).collect())
            .unwrap_or_default()
    }

    /// Live services backing a live pod. Order is unspecified.
    pub fn services_for_pod(&self, pod_uid: &str) -> Vec<&ServiceInfo> {
        self.pod_services
            .get(pod_uid)
            .map(|ss| ss.iter().filter_map(|s| self.service(s)).collect())
            .unwrap_or_default()
    }

    /// Live pods backing a live service. Order is unspecified.
    pub fn pods_for_service(&self, service_uid: &str) -> Vec<&PodInfo> {
        self.service_pods
            .get(service_uid)
            .map(|ps| ps.iter().filter_map(|p| self.pod(p)).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> StateStats {
        StateStats {
            epoch: self.epoch,
            resource_version: self.resource_version,
            namespaces: self.namespaces.len(),
            pods: self.pods.len(),
            live_pods: self.pods.values().filter(|p| !p.lifecycle.is_terminated()).count(),
            containers: self.containers.len(),
            live_containers: self.containers.values().filter(|c| !c.lifecycle.is_terminated()).count(),
            services: self.services.len(),
            live_services: self.services.values().filter(|s| !s.lifecycle.is_terminated()).count(),
            upids: self.pids.len(),
            live_upids: self.upid_containers.len(),
        }
    }

    /// Verify that every liveness index only references existing, non-terminated
    /// records and that the pod <-> service indices mirror each other.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for (upid, c) in &self.upid_containers {
            if !self.pids.contains_key(upid) {
                return Err(InvariantViolation::Dangling { index: "upid_containers", uid: upid.to_string() });
            }
            check_live(&self.containers, c, "upid_containers")?;
        }
        for p in self.upid_pods.values() {
            check_live(&self.pods, p, "upid_pods")?;
        }
        for ss in self.upid_services.values() {
            for s in ss {
                check_live(&self.services, s, "upid_services")?;
            }
        }
        for (p, ss) in &self.pod_services {
            check_live(&self.pods, p, "pod_services")?;
            for s in ss {
                check_live(&self.services, s, "pod_services")?;
                if !self.service_pods.get(s).is_some_and(|ps| ps.contains(p)) {
                    return Err(InvariantViolation::Asymmetric { pod: p.clone(), service: s.clone() });
                }
            }
        }
        for (s, ps) in &self.service_pods {
            check_live(&self.services, s, "service_pods")?;
            for p in ps {
                if !self.pod_services.get(p).is_some_and(|ss| ss.contains(s)) {
                    return Err(InvariantViolation::Asymmetric { pod: p.clone(), service: s.clone() });
                }
            }
        }
        for (ip, holders) in &self.pod_ips {
            for p in holders {
                check_live(&self.pods, p, "pod_ips")?;
                if self.pods.get(p).and_then(|r| r.ip.as_deref()) != Some(ip.as_str()) {
                    return Err(InvariantViolation::Mismatch { index: "pod_ips", key: ip.clone(), uid: p.clone() });
                }
            }
        }
        for p in self.pods.values().filter(|p| !p.lifecycle.is_terminated()) {
            if let Some(ip) = &p.ip {
                if !self.pod_ips.get(ip).is_some_and(|h| h.contains(&p.uid)) {
                    return Err(InvariantViolation::Mismatch { index: "pod_ips", key: ip.clone(), uid: p.uid.clone() });
                }
            }
        }
        Ok(())
    }
}
