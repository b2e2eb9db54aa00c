//! Metadata functions evaluated per row by the query engine.
//!
//! Every function is total: an unknown or no-longer-live entity yields the
//! zero value (`""` or `0`), never an error. UPID-keyed lookups go through
//! the liveness indices; UID- and name-keyed lookups read historical records.

use kmeta_core::{split_display_name, ContainerInfo, PodInfo, ServiceInfo, Upid};
use serde::Serialize;

use crate::FunctionContext;

fn json<T: Serialize>(v: &T) -> String { serde_json::to_string(v).unwrap_or_default() }

/// One value renders bare, several as a JSON array, none as `""`.
fn render_set(mut items: Vec<String>) -> String {
    match items.len() {
        0 => String::new(),
        1 => items.pop().unwrap_or_default(),
        _ => {
            items.sort_unstable();
            json(&items)
        }
    }
}

fn service_ids(services: &[&ServiceInfo]) -> String {
    render_set(services.iter().map(|s| s.uid.clone()).collect())
}

fn service_names(services: &[&ServiceInfo]) -> String {
    render_set(services.iter().map(|s| s.display_name()).collect())
}

fn pod_for(ctx: &FunctionContext, upid: Upid) -> Option<&PodInfo> { ctx.state().pod_for_upid(&upid) }

fn container_for(ctx: &FunctionContext, upid: Upid) -> Option<&ContainerInfo> {
    ctx.state().container_for_upid(&upid)
}

fn pod_field(ctx: &FunctionContext, upid: Upid, f: impl FnOnce(&PodInfo) -> String) -> String {
    pod_for(ctx, upid).map(f).unwrap_or_default()
}

// ---- agent ----

pub fn asid(ctx: &FunctionContext) -> u32 { ctx.state().agent().asid }

pub fn hostname(ctx: &FunctionContext) -> String { ctx.state().agent().hostname.clone() }

// ---- UPID decode ----

pub fn upid_to_asid(upid: Upid) -> u32 { upid.asid() }
pub fn upid_to_pid(upid: Upid) -> u32 { upid.pid() }
pub fn upid_to_start_ts(upid: Upid) -> u64 { upid.start_ts() }
pub fn upid_to_string(upid: Upid) -> String { upid.to_string() }

// ---- UPID -> pod ----

pub fn upid_to_pod_id(ctx: &FunctionContext, upid: Upid) -> String { pod_field(ctx, upid, |p| p.uid.clone()) }

pub fn upid_to_pod_name(ctx: &FunctionContext, upid: Upid) -> String { pod_field(ctx, upid, PodInfo::display_name) }

pub fn upid_to_namespace(ctx: &FunctionContext, upid: Upid) -> String {
    pod_field(ctx, upid, |p| p.namespace.clone())
}

pub fn upid_to_node_name(ctx: &FunctionContext, upid: Upid) -> String {
    pod_field(ctx, upid, |p| p.node_name.clone())
}

pub fn upid_to_hostname(ctx: &FunctionContext, upid: Upid) -> String {
    pod_field(ctx, upid, |p| p.hostname.clone())
}

pub fn upid_to_pod_ip(ctx: &FunctionContext, upid: Upid) -> String {
    pod_field(ctx, upid, |p| p.ip.clone().unwrap_or_default())
}

pub fn upid_to_pod_qos(ctx: &FunctionContext, upid: Upid) -> String {
    pod_field(ctx, upid, |p| p.qos.as_str().to_string())
}

/// `{"phase", "message", "reason", "ready"}`.
pub fn upid_to_pod_status(ctx: &FunctionContext, upid: Upid) -> String { pod_field(ctx, upid, |p| json(&p.status)) }

// ---- UPID -> container ----

pub fn upid_to_container_id(ctx: &FunctionContext, upid: Upid) -> String {
    container_for(ctx, upid).map(|c| c.uid.clone()).unwrap_or_default()
}

pub fn upid_to_container_name(ctx: &FunctionContext, upid: Upid) -> String {
    container_for(ctx, upid).map(|c| c.name.clone()).unwrap_or_default()
}

/// `{"state", "message", "reason"}`.
pub fn upid_to_container_status(ctx: &FunctionContext, upid: Upid) -> String {
    container_for(ctx, upid).map(|c| json(&c.status)).unwrap_or_default()
}

pub fn upid_to_container_start_time(ctx: &FunctionContext, upid: Upid) -> u64 {
    container_for(ctx, upid).map_or(0, |c| c.start_ts)
}

pub fn upid_to_container_stop_time(ctx: &FunctionContext, upid: Upid) -> u64 {
    container_for(ctx, upid).and_then(|c| c.stop_ts).unwrap_or(0)
}

// ---- UPID -> services ----

pub fn upid_to_service_id(ctx: &FunctionContext, upid: Upid) -> String {
    service_ids(&ctx.state().services_for_upid(&upid))
}

pub fn upid_to_service_name(ctx: &FunctionContext, upid: Upid) -> String {
    service_names(&ctx.state().services_for_upid(&upid))
}

/// Not gated: the command line outlives the process's pod and container.
pub fn upid_to_cmdline(ctx: &FunctionContext, upid: Upid) -> String {
    ctx.state().pid_info(&upid).map(|p| p.cmdline.clone()).unwrap_or_default()
}

// ---- pods ----

pub fn pod_id_to_pod_name(ctx: &FunctionContext, uid: &str) -> String {
    ctx.state().pod(uid).map(PodInfo::display_name).unwrap_or_default()
}

pub fn pod_name_to_pod_id(ctx: &FunctionContext, name: &str) -> String {
    ctx.state().pod_uid_by_name(name).unwrap_or_default().to_string()
}

pub fn pod_id_to_namespace(ctx: &FunctionContext, uid: &str) -> String {
    ctx.state().pod(uid).map(|p| p.namespace.clone()).unwrap_or_default()
}

/// Parsed from the name itself; the pod need not be known.
pub fn pod_name_to_namespace(name: &str) -> String { split_display_name(name).0.to_string() }

pub fn pod_id_to_node_name(ctx: &FunctionContext, uid: &str) -> String {
    ctx.state().pod(uid).map(|p| p.node_name.clone()).unwrap_or_default()
}

pub fn pod_id_to_start_time(ctx: &FunctionContext, uid: &str) -> u64 { ctx.state().pod(uid).map_or(0, |p| p.start_ts) }

pub fn pod_id_to_stop_time(ctx: &FunctionContext, uid: &str) -> u64 {
    ctx.state().pod(uid).and_then(|p| p.stop_ts).unwrap_or(0)
}

pub fn pod_name_to_start_time(ctx: &FunctionContext, name: &str) -> u64 {
    ctx.state().pod_by_name(name).map_or(0, |p| p.start_ts)
}

pub fn pod_name_to_stop_time(ctx: &FunctionContext, name: &str) -> u64 {
    ctx.state().pod_by_name(name).and_then(|p| p.stop_ts).unwrap_or(0)
}

pub fn pod_id_to_pod_status(ctx: &FunctionContext, uid: &str) -> String {
    ctx.state().pod(uid).map(|p| json(&p.status)).unwrap_or_default()
}

pub fn pod_name_to_pod_status(ctx: &FunctionContext, name: &str) -> String {
    ctx.state().pod_by_name(name).map(|p| json(&p.status)).unwrap_or_default()
}

pub fn pod_name_to_pod_ip(ctx: &FunctionContext, name: &str) -> String {
    ctx.state().pod_by_name(name).and_then(|p| p.ip.clone()).unwrap_or_default()
}

/// Only the live pod currently holding the IP.
pub fn pod_ip_to_pod_id(ctx: &FunctionContext, ip: &str) -> String {
    ctx.state().pod_uid_by_ip(ip).unwrap_or_default().to_string()
}

pub fn pod_id_to_service_id(ctx: &FunctionContext, uid: &str) -> String {
    service_ids(&ctx.state().services_for_pod(uid))
}

pub fn pod_id_to_service_name(ctx: &FunctionContext, uid: &str) -> String {
    service_names(&ctx.state().services_for_pod(uid))
}

pub fn pod_name_to_service_id(ctx: &FunctionContext, name: &str) -> String {
    ctx.state().pod_uid_by_name(name).map(|uid| pod_id_to_service_id(ctx, uid)).unwrap_or_default()
}

pub fn pod_name_to_service_name(ctx: &FunctionContext, name: &str) -> String {
    ctx.state().pod_uid_by_name(name).map(|uid| pod_id_to_service_name(ctx, uid)).unwrap_or_default()
}

// ---- services ----

pub fn service_id_to_service_name(ctx: &FunctionContext, uid: &str) -> String {
    ctx.state().service(uid).map(ServiceInfo::display_name).unwrap_or_default()
}

pub fn service_name_to_service_id(ctx: &FunctionContext, name: &str) -> String {
    ctx.state().service_uid_by_name(name).unwrap_or_default().to_string()
}

pub fn service_name_to_namespace(name: &str) -> String { split_display_name(name).0.to_string() }

// ---- containers ----

pub fn container_name_to_container_id(ctx: &FunctionContext, name: &str) -> String {
    ctx.state().container_uid_by_name(name).unwrap_or_default().to_string()
}

pub fn container_id_to_container_name(ctx: &FunctionContext, uid: &str) -> String {
    ctx.state().container(uid).map(|c| c.name.clone()).unwrap_or_default()
}

pub fn container_id_to_start_time(ctx: &FunctionContext, uid: &str) -> u64 {
    ctx.state().container(uid).map_or(0, |c| c.start_ts)
}

pub fn container_id_to_stop_time(ctx: &FunctionContext, uid: &str) -> u64 {
    ctx.state().container(uid).and_then(|c| c.stop_ts).unwrap_or(0)
}

pub fn container_name_to_start_time(ctx: &FunctionContext, name: &str) -> u64 {
    ctx.state().container_by_name(name).map_or(0, |c| c.start_ts)
}

pub fn container_name_to_stop_time(ctx: &FunctionContext, name: &str) -> u64 {
    ctx.state().container_by_name(name).and_then(|c| c.stop_ts).unwrap_or(0)
}

pub fn container_id_to_container_status(ctx: &FunctionContext, uid: &str) -> String {
    ctx.state().container(uid).map(|c| json(&c.status)).unwrap_or_default()
}
