//! kmeta core types: process identities, mirrored entity records and the
//! update events that feed the metadata state.

#![forbid(unsafe_code)]

pub mod records;
pub mod update;
pub mod upid;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use records::{
    ContainerInfo, ContainerState, ContainerStatus, Lifecycle, NamespaceInfo, PidInfo, PodInfo, PodPhase,
    PodStatus, QosClass, ServiceInfo,
};
pub use update::{
    ContainerUpdate, NamespaceUpdate, PodUpdate, ResourceObject, ResourceUpdate, ServiceUpdate, UpdateError,
    UpdateEvent,
};
pub use upid::{ParseUpidError, Upid};

/// Stable object identifier assigned by the control plane. Never reused.
pub type Uid = String;

/// `namespace/name`, the display form used for pods and services.
pub fn display_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Split a display name into `(namespace, name)`. No `/` means no namespace.
pub fn split_display_name(s: &str) -> (&str, &str) {
    match s.split_once('/') {
        Some((ns, name)) => (ns, name),
        None => ("", s),
    }
}
