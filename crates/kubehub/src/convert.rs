//! Kubernetes objects to update events.

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::{
    ContainerStatus as K8sContainerStatus, Endpoints, Namespace, Pod,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kmeta_core::{
    ContainerState, ContainerStatus, ContainerUpdate, NamespaceUpdate, PodPhase, PodStatus, PodUpdate, QosClass,
    ResourceObject, ResourceUpdate, ServiceUpdate, UpdateEvent,
};
use smallvec::SmallVec;

/// Nanoseconds since the Unix epoch.
pub fn time_ns(t: &Time) -> u64 { t.0.timestamp_nanos_opt().unwrap_or(0).max(0) as u64 }

pub fn now_ns() -> u64 { chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64 }

struct Meta<'a> {
    uid: &'a str,
    name: &'a str,
    namespace: &'a str,
    version: u64,
    start_ts: u64,
    deleted_ts: Option<u64>,
}

fn meta<'a>(m: &'a ObjectMeta, kind: &str) -> Result<Meta<'a>> {
    let uid = m.uid.as_deref().ok_or_else(|| anyhow!("{} missing metadata.uid", kind))?;
    let name = m.name.as_deref().ok_or_else(|| anyhow!("{} {} missing metadata.name", kind, uid))?;
    let rv = m.resource_version.as_deref().ok_or_else(|| anyhow!("{} {} missing metadata.resourceVersion", kind, uid))?;
    let version = rv.parse::<u64>().with_context(|| format!("parsing resourceVersion {:?} of {} {}", rv, kind, uid))?;
    Ok(Meta {
        uid,
        name,
        namespace: m.namespace.as_deref().unwrap_or(""),
        version,
        start_ts: m.creation_timestamp.as_ref().map(time_ns).unwrap_or(0),
        deleted_ts: m.deletion_timestamp.as_ref().map(time_ns),
    })
}

fn phase(s: Option<&str>) -> PodPhase {
    match s {
        Some("Pending") => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Unknown,
    }
}

fn qos(s: Option<&str>) -> QosClass {
    match s {
        Some("Guaranteed") => QosClass::Guaranteed,
        Some("Burstable") => QosClass::Burstable,
        Some("BestEffort") => QosClass::BestEffort,
        _ => QosClass::Unknown,
    }
}

/// Runtime id without its `containerd://` style scheme.
fn container_uid(raw: &str) -> &str { raw.split_once("://").map_or(raw, |(_, id)| id) }

fn container_update(
    c: &K8sContainerStatus,
    pod_uid: &str,
    version: u64,
    pod_deleting: bool,
) -> Option<ResourceUpdate> {
    let uid = container_uid(c.container_id.as_deref()?);
    if uid.is_empty() {
        return None;
    }
    let state = c.state.as_ref();
    let (status, event, start_ts, stop_ts) = if let Some(t) = state.and_then(|s| s.terminated.as_ref()) {
        (
            ContainerStatus {
                state: ContainerState::Terminated,
                message: t.message.clone().unwrap_or_default(),
                reason: t.reason.clone().unwrap_or_default(),
            },
            UpdateEvent::Terminated,
            t.started_at.as_ref().map(time_ns).unwrap_or(0),
            Some(t.finished_at.as_ref().map(time_ns).unwrap_or_else(now_ns)),
        )
    } else if let Some(r) = state.and_then(|s| s.running.as_ref()) {
        (
            ContainerStatus { state: ContainerState::Running, ..Default::default() },
            if pod_deleting { UpdateEvent::Terminating } else { UpdateEvent::Running },
            r.started_at.as_ref().map(time_ns).unwrap_or(0),
            None,
        )
    } else {
        let w = state.and_then(|s| s.waiting.as_ref());
        (
            ContainerStatus {
                state: ContainerState::Waiting,
                message: w.and_then(|w| w.message.clone()).unwrap_or_default(),
                reason: w.and_then(|w| w.reason.clone()).unwrap_or_default(),
            },
            UpdateEvent::Created,
            0,
            None,
        )
    };
    Some(ResourceUpdate::new(version, event, ResourceObject::Container(ContainerUpdate {
        uid: uid.to_string(),
        name: c.name.clone(),
        pod_uid: Some(pod_uid.to_string()),
        status,
        start_ts,
        stop_ts,
    })))
}

/// One pod event followed by one event per container that has a runtime id.
pub fn pod_updates(pod: &Pod) -> Result<Vec<ResourceUpdate>> {
    let m = meta(&pod.metadata, "pod")?;
    let spec = pod.spec.as_ref();
    let st = pod.status.as_ref();
    let phase = phase(st.and_then(|s| s.phase.as_deref()));
    let ready = st
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"));

    let statuses: Vec<&K8sContainerStatus> = st
        .into_iter()
        .flat_map(|s| s.init_container_statuses.iter().chain(s.container_statuses.iter()).flatten())
        .collect();
    let containers: Vec<ResourceUpdate> = statuses
        .iter()
        .filter_map(|c| container_update(c, m.uid, m.version, m.deleted_ts.is_some()))
        .collect();

    let finished = matches!(phase, PodPhase::Succeeded | PodPhase::Failed);
    let event = match (m.deleted_ts.is_some(), finished, phase) {
        (_, true, _) => UpdateEvent::Terminated,
        (true, false, _) => UpdateEvent::Terminating,
        (false, false, PodPhase::Running) => UpdateEvent::Running,
        (false, false, PodPhase::Pending) => UpdateEvent::Created,
        _ => UpdateEvent::Updated,
    };
    let stop_ts = if finished {
        containers
            .iter()
            .filter_map(|u| match &u.object {
                ResourceObject::Container(c) => c.stop_ts,
                _ => None,
            })
            .max()
            .or(m.deleted_ts)
    } else {
        m.deleted_ts
    };

    let pod_update = ResourceUpdate::new(m.version, event, ResourceObject::Pod(PodUpdate {
        uid: m.uid.to_string(),
        name: m.name.to_string(),
        namespace: m.namespace.to_string(),
        ip: st.and_then(|s| s.pod_ip.clone()).filter(|ip| !ip.is_empty()),
        qos: qos(st.and_then(|s| s.qos_class.as_deref())),
        status: PodStatus {
            phase,
            message: st.and_then(|s| s.message.clone()).unwrap_or_default(),
            reason: st.and_then(|s| s.reason.clone()).unwrap_or_default(),
            ready,
        },
        start_ts: m.start_ts,
        stop_ts,
        containers: containers.iter().map(|u| u.uid().to_string()).collect(),
        node_name: spec.and_then(|s| s.node_name.clone()).unwrap_or_default(),
        hostname: spec.and_then(|s| s.hostname.clone()).unwrap_or_default(),
    }));

    let mut out = Vec::with_capacity(containers.len() + 1);
    out.push(pod_update);
    out.extend(containers);
    Ok(out)
}

/// Service membership from an Endpoints object: every address, ready or not,
/// whose target is a pod. The service is identified by the Endpoints UID.
pub fn service_update(ep: &Endpoints) -> Result<ResourceUpdate> {
    let m = meta(&ep.metadata, "endpoints")?;
    let mut pods: SmallVec<[String; 4]> = SmallVec::new();
    for subset in ep.subsets.iter().flatten() {
        for addr in subset.addresses.iter().flatten().chain(subset.not_ready_addresses.iter().flatten()) {
            let Some(target) = addr.target_ref.as_ref() else { continue };
            if target.kind.as_deref() != Some("Pod") {
                continue;
            }
            if let Some(uid) = target.uid.as_deref().filter(|u| !u.is_empty()) {
                if !pods.iter().any(|p| p == uid) {
                    pods.push(uid.to_string());
                }
            }
        }
    }
    let event = if m.deleted_ts.is_some() { UpdateEvent::Terminating } else { UpdateEvent::Running };
    Ok(ResourceUpdate::new(m.version, event, ResourceObject::Service(ServiceUpdate {
        uid: m.uid.to_string(),
        name: m.name.to_string(),
        namespace: m.namespace.to_string(),
        pods,
        start_ts: m.start_ts,
        stop_ts: m.deleted_ts,
    })))
}

pub fn namespace_update(ns: &Namespace) -> Result<ResourceUpdate> {
    let m = meta(&ns.metadata, "namespace")?;
    let terminating = m.deleted_ts.is_some()
        || ns.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Terminating");
    let event = if terminating { UpdateEvent::Terminating } else { UpdateEvent::Running };
    Ok(ResourceUpdate::new(m.version, event, ResourceObject::Namespace(NamespaceUpdate {
        uid: m.uid.to_string(),
        name: m.name.to_string(),
        start_ts: m.start_ts,
        stop_ts: m.deleted_ts,
    })))
}

/// Turn the last state seen for a deleted object into its terminal event.
/// Keeps an existing stop time, otherwise stamps `stop_ts`.
pub fn deleted_update(mut u: ResourceUpdate, stop_ts: u64) -> ResourceUpdate {
    u.event = UpdateEvent::Terminated;
    let slot = match &mut u.object {
        ResourceObject::Namespace(n) => &mut n.stop_ts,
        ResourceObject::Pod(p) => &mut p.stop_ts,
        ResourceObject::Container(c) => &mut c.stop_ts,
        ResourceObject::Service(s) => &mut s.stop_ts,
    };
    slot.get_or_insert(stop_ts);
    u
}
