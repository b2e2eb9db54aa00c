//! Canned update events shared by tests across the workspace.
//!
//! Two pods in namespace `pl`: `1_uid` (running, container
//! `pod1_container_1`, backed by service `3_uid`) and `2_uid` (terminating,
//! container `pod2_container_1`, backed by service `4_uid`). Later helpers
//! terminate the second set and add a second service on the first pod.

use smallvec::smallvec;

use crate::records::{ContainerState, ContainerStatus, PodPhase, PodStatus, QosClass};
use crate::update::{ContainerUpdate, PodUpdate, ResourceObject, ResourceUpdate, ServiceUpdate, UpdateEvent};

pub fn running_container() -> ResourceUpdate {
    ResourceUpdate::new(1, UpdateEvent::Running, ResourceObject::Container(ContainerUpdate {
        uid: "pod1_container_1".into(),
        name: "running_container".into(),
        pod_uid: Some("1_uid".into()),
        status: ContainerStatus {
            state: ContainerState::Running,
            message: "Running message".into(),
            reason: "Running reason".into(),
        },
        start_ts: 6,
        stop_ts: None,
    }))
}

pub fn running_pod() -> ResourceUpdate {
    ResourceUpdate::new(2, UpdateEvent::Running, ResourceObject::Pod(PodUpdate {
        uid: "1_uid".into(),
        name: "running_pod".into(),
        namespace: "pl".into(),
        ip: Some("1.1.1.1".into()),
        qos: QosClass::Guaranteed,
        status: PodStatus {
            phase: PodPhase::Running,
            message: "Running message".into(),
            reason: "Running reason".into(),
            ready: true,
        },
        start_ts: 5,
        stop_ts: None,
        containers: smallvec!["pod1_container_1".into()],
        node_name: "test_node".into(),
        hostname: "test_host".into(),
    }))
}

pub fn running_service() -> ResourceUpdate {
    ResourceUpdate::new(3, UpdateEvent::Running, ResourceObject::Service(ServiceUpdate {
        uid: "3_uid".into(),
        name: "running_service".into(),
        namespace: "pl".into(),
        pods: smallvec!["1_uid".into()],
        start_ts: 7,
        stop_ts: None,
    }))
}

fn pod2_container(version: u64, event: UpdateEvent, stop_ts: Option<u64>) -> ResourceUpdate {
    ResourceUpdate::new(version, event, ResourceObject::Container(ContainerUpdate {
        uid: "pod2_container_1".into(),
        name: "terminating_container".into(),
        pod_uid: Some("2_uid".into()),
        status: ContainerStatus {
            state: ContainerState::Terminated,
            message: "Terminating message pending".into(),
            reason: "Terminating reason pending".into(),
        },
        start_ts: 7,
        stop_ts,
    }))
}

fn pod2(version: u64, event: UpdateEvent) -> ResourceUpdate {
    ResourceUpdate::new(version, event, ResourceObject::Pod(PodUpdate {
        uid: "2_uid".into(),
        name: "terminating_pod".into(),
        namespace: "pl".into(),
        ip: None,
        qos: QosClass::BestEffort,
        status: PodStatus {
            phase: PodPhase::Failed,
            message: "Failed message terminated".into(),
            reason: "Failed reason terminated".into(),
            ready: false,
        },
        start_ts: 10,
        stop_ts: Some(15),
        containers: smallvec!["pod2_container_1".into()],
        node_name: "test_node_tbt".into(),
        hostname: "test_host_tbt".into(),
    }))
}

fn service4(version: u64, event: UpdateEvent, stop_ts: Option<u64>) -> ResourceUpdate {
    ResourceUpdate::new(version, event, ResourceObject::Service(ServiceUpdate {
        uid: "4_uid".into(),
        name: "terminating_service".into(),
        namespace: "pl".into(),
        pods: smallvec!["2_uid".into()],
        start_ts: 7,
        stop_ts,
    }))
}

pub fn terminating_container() -> ResourceUpdate { pod2_container(4, UpdateEvent::Terminating, None) }
pub fn terminating_pod() -> ResourceUpdate { pod2(5, UpdateEvent::Terminating) }
pub fn terminating_service() -> ResourceUpdate { service4(6, UpdateEvent::Terminating, None) }

pub fn terminated_container() -> ResourceUpdate { pod2_container(7, UpdateEvent::Terminated, Some(14)) }
pub fn terminated_pod() -> ResourceUpdate { pod2(8, UpdateEvent::Terminated) }
pub fn terminated_service() -> ResourceUpdate { service4(9, UpdateEvent::Terminated, Some(15)) }

/// A second service selecting `1_uid`.
pub fn service_with_same_pod() -> ResourceUpdate {
    ResourceUpdate::new(10, UpdateEvent::Running, ResourceObject::Service(ServiceUpdate {
        uid: "5_uid".into(),
        name: "other_service_with_pod".into(),
        namespace: "pl".into(),
        pods: smallvec!["1_uid".into()],
        start_ts: 11,
        stop_ts: None,
    }))
}

/// The six events every metadata test starts from, in producer order.
pub fn initial_updates() -> Vec<ResourceUpdate> {
    vec![
        running_container(),
        running_pod(),
        running_service(),
        terminating_container(),
        terminating_pod(),
        terminating_service(),
    ]
}
