//! kmeta query boundary.
//!
//! A [`FunctionContext`] pins one published snapshot of the metadata state for
//! the duration of a query; the functions in [`functions`] read from it. The
//! [`REGISTRY`] table exposes them by name for callers that dispatch on
//! strings, such as the CLI.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kmeta_core::{ParseUpidError, Upid};
use kmeta_store::{AgentMetadataState, MetadataHandle};
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

pub mod functions;

pub use functions::*;

/// Immutable view handed to every function of one query.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    state: Arc<AgentMetadataState>,
}

impl FunctionContext {
    pub fn new(state: Arc<AgentMetadataState>) -> Self { Self { state } }

    /// Pin whatever the ingest loop published last.
    pub fn from_handle(handle: &MetadataHandle) -> Self { Self::new(handle.current()) }

    pub fn state(&self) -> &AgentMetadataState { &self.state }
}

impl From<Arc<AgentMetadataState>> for FunctionContext {
    fn from(state: Arc<AgentMetadataState>) -> Self { Self::new(state) }
}

/// Errors of the by-name dispatch. The functions themselves never fail.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("{function}: {source}")]
    BadUpid {
        function: &'static str,
        #[source]
        source: ParseUpidError,
    },
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Argument shape of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    None,
    Upid,
    Text,
}

#[derive(Clone, Copy)]
pub enum Udf {
    Agent(fn(&FunctionContext) -> Value),
    Upid(fn(&FunctionContext, Upid) -> Value),
    Text(fn(&FunctionContext, &str) -> Value),
}

impl Udf {
    pub fn arg_kind(&self) -> ArgKind {
        match self {
            Udf::Agent(_) => ArgKind::None,
            Udf::Upid(_) => ArgKind::Upid,
            Udf::Text(_) => ArgKind::Text,
        }
    }
}

pub static REGISTRY: &[(&str, Udf)] = &[
    ("asid", Udf::Agent(|c| asid(c).into())),
    ("hostname", Udf::Agent(|c| hostname(c).into())),
    ("upid_to_asid", Udf::Upid(|_, u| upid_to_asid(u).into())),
    ("upid_to_pid", Udf::Upid(|_, u| upid_to_pid(u).into())),
    ("upid_to_start_ts", Udf::Upid(|_, u| upid_to_start_ts(u).into())),
    ("upid_to_string", Udf::Upid(|_, u| upid_to_string(u).into())),
    ("upid_to_pod_id", Udf::Upid(|c, u| upid_to_pod_id(c, u).into())),
    ("upid_to_pod_name", Udf::Upid(|c, u| upid_to_pod_name(c, u).into())),
    ("upid_to_namespace", Udf::Upid(|c, u| upid_to_namespace(c, u).into())),
    ("upid_to_node_name", Udf::Upid(|c, u| upid_to_node_name(c, u).into())),
    ("upid_to_hostname", Udf::Upid(|c, u| upid_to_hostname(c, u).into())),
    ("upid_to_pod_ip", Udf::Upid(|c, u| upid_to_pod_ip(c, u).into())),
    ("upid_to_pod_qos", Udf::Upid(|c, u| upid_to_pod_qos(c, u).into())),
    ("upid_to_pod_status", Udf::Upid(|c, u| upid_to_pod_status(c, u).into())),
    ("upid_to_container_id", Udf::Upid(|c, u| upid_to_container_id(c, u).into())),
    ("upid_to_container_name", Udf::Upid(|c, u| upid_to_container_name(c, u).into())),
    ("upid_to_container_status", Udf::Upid(|c, u| upid_to_container_status(c, u).into())),
    ("upid_to_container_start_time", Udf::Upid(|c, u| upid_to_container_start_time(c, u).into())),
    ("upid_to_container_stop_time", Udf::Upid(|c, u| upid_to_container_stop_time(c, u).into())),
    ("upid_to_service_id", Udf::Upid(|c, u| upid_to_service_id(c, u).into())),
    ("upid_to_service_name", Udf::Upid(|c, u| upid_to_service_name(c, u).into())),
    ("upid_to_cmdline", Udf::Upid(|c, u| upid_to_cmdline(c, u).into())),
    ("pod_id_to_pod_name", Udf::Text(|c, s| pod_id_to_pod_name(c, s).into())),
    ("pod_name_to_pod_id", Udf::Text(|c, s| pod_name_to_pod_id(c, s).into())),
    ("pod_id_to_namespace", Udf::Text(|c, s| pod_id_to_namespace(c, s).into())),
    ("pod_name_to_namespace", Udf::Text(|_, s| pod_name_to_namespace(s).into())),
    ("pod_id_to_node_name", Udf::Text(|c, s| pod_id_to_node_name(c, s).into())),
    ("pod_id_to_start_time", Udf::Text(|c, s| pod_id_to_start_time(c, s).into())),
    ("pod_id_to_stop_time", Udf::Text(|c, s| pod_id_to_stop_time(c, s).into())),
    ("pod_name_to_start_time", Udf::Text(|c, s| pod_name_to_start_time(c, s).into())),
    ("pod_name_to_stop_time", Udf::Text(|c, s| pod_name_to_stop_time(c, s).into())),
    ("pod_id_to_pod_status", Udf::Text(|c, s| pod_id_to_pod_status(c, s).into())),
    ("pod_name_to_pod_status", Udf::Text(|c, s| pod_name_to_pod_status(c, s).into())),
    ("pod_name_to_pod_ip", Udf::Text(|c, s| pod_name_to_pod_ip(c, s).into())),
    ("pod_ip_to_pod_id", Udf::Text(|c, s| pod_ip_to_pod_id(c, s).into())),
    ("pod_id_to_service_id", Udf::Text(|c, s| pod_id_to_service_id(c, s).into())),
    ("pod_id_to_service_name", Udf::Text(|c, s| pod_id_to_service_name(c, s).into())),
    ("pod_name_to_service_id", Udf::Text(|c, s| pod_name_to_service_id(c, s).into())),
    ("pod_name_to_service_name", Udf::Text(|c, s| pod_name_to_service_name(c, s).into())),
    ("service_id_to_service_name", Udf::Text(|c, s| service_id_to_service_name(c, s).into())),
    ("service_name_to_service_id", Udf::Text(|c, s| service_name_to_service_id(c, s).into())),
    ("service_name_to_namespace", Udf::Text(|_, s| service_name_to_namespace(s).into())),
    ("container_name_to_container_id", Udf::Text(|c, s| container_name_to_container_id(c, s).into())),
    ("container_id_to_container_name", Udf::Text(|c, s| container_id_to_container_name(c, s).into())),
    ("container_id_to_start_time", Udf::Text(|c, s| container_id_to_start_time(c, s).into())),
    ("container_id_to_stop_time", Udf::Text(|c, s| container_id_to_stop_time(c, s).into())),
    ("container_name_to_start_time", Udf::Text(|c, s| container_name_to_start_time(c, s).into())),
    ("container_name_to_stop_time", Udf::Text(|c, s| container_name_to_stop_time(c, s).into())),
    ("container_id_to_container_status", Udf::Text(|c, s| container_id_to_container_status(c, s).into())),
];

pub fn lookup(name: &str) -> Option<(&'static str, Udf)> {
    REGISTRY.iter().find(|(n, _)| *n == name).copied()
}

/// Evaluate a function by name. `arg` is ignored by agent functions; UPIDs
/// are accepted as `asid:pid:start_ts` or as the packed decimal value.
pub fn call(ctx: &FunctionContext, name: &str, arg: &str) -> ApiResult<Value> {
    let (function, udf) = lookup(name).ok_or_else(|| ApiError::UnknownFunction(name.to_string()))?;
    trace!(function, arg, "evaluating metadata function");
    Ok(match udf {
        Udf::Agent(f) => f(ctx),
        Udf::Upid(f) => {
            let upid: Upid = arg.parse().map_err(|source| ApiError::BadUpid { function, source })?;
            f(ctx, upid)
        }
        Udf::Text(f) => f(ctx, arg),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_are_unique() {
        let mut names: Vec<_> = REGISTRY.iter().map(|(n, _)| *n).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn dispatch_errors() {
        let ctx = FunctionContext::new(Arc::new(AgentMetadataState::default()));
        assert!(matches!(call(&ctx, "nope", ""), Err(ApiError::UnknownFunction(_))));
        assert!(matches!(call(&ctx, "upid_to_pid", "1:2"), Err(ApiError::BadUpid { .. })));
        assert_eq!(call(&ctx, "upid_to_pid", "1:2:3").unwrap(), Value::from(2u32));
        assert_eq!(call(&ctx, "pod_id_to_pod_name", "missing").unwrap(), Value::from(""));
        assert_eq!(lookup("asid").map(|(_, u)| u.arg_kind()), Some(ArgKind::None));
    }
}
