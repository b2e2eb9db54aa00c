//! Removal of historical records. The policy (how long terminated objects are
//! kept) belongs to the caller; these primitives only guarantee that a removed
//! object disappears from every index family.

use kmeta_core::{ContainerInfo, NamespaceInfo, PodInfo, ServiceInfo, Uid, Upid};
use serde::Serialize;
use tracing::debug;

use super::mutate::{release_name, unlink};
use super::{AgentMetadataState, Tracked};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionStats {
    pub namespaces: usize,
    pub pods: usize,
    pub containers: usize,
    pub services: usize,
    pub upids: usize,
    /// UIDs removed, so the caller can drop their filter marks.
    pub uids: Vec<Uid>,
}

impl EvictionStats {
    pub fn is_empty(&self) -> bool { self.uids.is_empty() && self.upids == 0 }
}

impl AgentMetadataState {
    pub fn remove_namespace(&mut self, uid: &str) -> bool {
        let Some(rec) = self.namespaces.remove(uid) else { return false };
        release_name(&mut self.namespace_names, &rec.name, uid);
        self.uid_names.remove(uid);
        true
    }

    pub fn remove_pod(&mut self, uid: &str) -> bool {
        let Some(rec) = self.pods.remove(uid) else { return false };
        release_name(&mut self.pod_names, &rec.display_name(), uid);
        self.uid_names.remove(uid);
        if let Some(ip) = &rec.ip {
            unlink(&mut self.pod_ips, ip, uid);
        }
        // The record is gone, so this clears the pod's liveness entries and
        // those of every process in its containers.
        self.refresh_pod_links(uid);
        self.services_by_pod.remove(uid);
        if let Some(containers) = self.containers_by_pod.remove(uid) {
            for c in containers {
                if self.container_pod.get(&c).is_some_and(|p| p == uid) {
                    self.container_pod.remove(&c);
                }
            }
        }
        true
    }

    pub fn remove_container(&mut self, uid: &str) -> bool {
        let Some(rec) = self.containers.remove(uid) else { return false };
        release_name(&mut self.container_names, &rec.name, uid);
        self.uid_names.remove(uid);
        if let Some(pod) = self.container_pod.remove(uid) {
            unlink(&mut self.containers_by_pod, &pod, uid);
        }
        self.refresh_container_links(uid);
        self.container_upids.remove(uid);
        true
    }

    pub fn remove_service(&mut self, uid: &str) -> bool {
        let Some(rec) = self.services.remove(uid) else { return false };
        release_name(&mut self.service_names, &rec.display_name(), uid);
        self.uid_names.remove(uid);
        for p in &rec.pods {
            unlink(&mut self.services_by_pod, p, uid);
            self.refresh_pod_links(p);
        }
        self.service_pods.remove(uid);
        true
    }

    pub fn remove_upid(&mut self, upid: &Upid) -> bool {
        let Some(rec) = self.pids.remove(upid) else { return false };
        if let Some(c) = &rec.container_uid {
            let empty = match self.container_upids.get_mut(c) {
                Some(set) => {
                    set.remove(upid);
                    set.is_empty()
                }
                None => false,
            };
            if empty {
                self.container_upids.remove(c);
            }
        }
        self.upid_containers.remove(upid);
        self.upid_pods.remove(upid);
        self.upid_services.remove(upid);
        true
    }

    /// Remove every terminated object, and every stopped process, whose stop
    /// time is before `cutoff_ts`.
    pub fn evict_terminated_before(&mut self, cutoff_ts: u64) -> EvictionStats {
        fn expired<T: Tracked>(r: &T, cutoff_ts: u64) -> bool {
            r.lifecycle().is_terminated() && r.stop_ts().unwrap_or(0) < cutoff_ts
        }

        let services: Vec<Uid> =
            self.services.values().filter(|r| expired::<ServiceInfo>(r, cutoff_ts)).map(|r| r.uid.clone()).collect();
        let pods: Vec<Uid> =
            self.pods.values().filter(|r| expired::<PodInfo>(r, cutoff_ts)).map(|r| r.uid.clone()).collect();
        let containers: Vec<Uid> =
            self.containers.values().filter(|r| expired::<ContainerInfo>(r, cutoff_ts)).map(|r| r.uid.clone()).collect();
        let namespaces: Vec<Uid> =
            self.namespaces.values().filter(|r| expired::<NamespaceInfo>(r, cutoff_ts)).map(|r| r.uid.clone()).collect();
        let upids: Vec<Upid> = self
            .pids
            .values()
            .filter(|p| p.stop_ts.is_some_and(|t| t < cutoff_ts))
            .map(|p| p.upid)
            .collect();

        let mut stats = EvictionStats::default();
        for uid in services {
            if self.remove_service(&uid) {
                stats.services += 1;
                stats.uids.push(uid);
            }
        }
        for uid in pods {
            if self.remove_pod(&uid) {
                stats.pods += 1;
                stats.uids.push(uid);
            }
        }
        for uid in containers {
            if self.remove_container(&uid) {
                stats.containers += 1;
                stats.uids.push(uid);
            }
        }
        for uid in namespaces {
            if self.remove_namespace(&uid) {
                stats.namespaces += 1;
                stats.uids.push(uid);
            }
        }
        for upid in upids {
            if self.remove_upid(&upid) {
                stats.upids += 1;
            }
        }
        if !stats.is_empty() {
            debug!(
                cutoff_ts,
                pods = stats.pods,
                containers = stats.containers,
                services = stats.services,
                upids = stats.upids,
                "evicted terminated objects"
            );
        }
        stats
    }
}
