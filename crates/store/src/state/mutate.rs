use std::sync::Arc;

use kmeta_core::{
    display_name, ContainerInfo, ContainerStatus, ContainerUpdate, Lifecycle, NamespaceInfo, NamespaceUpdate,
    PidInfo, PodInfo, PodStatus, PodUpdate, ServiceInfo, ServiceUpdate, Uid, UpdateEvent, Upid,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use super::{is_live, AgentMetadataState, Tracked};

/// Take `name` for `uid` unless it is held by a record created later.
/// On equal start times only a first sighting of `uid` takes the name, so a
/// late update of a superseded object never steals it back.
fn claim_name<T: Tracked>(
    names: &mut FxHashMap<String, Uid>,
    records: &FxHashMap<Uid, Arc<T>>,
    name: &str,
    uid: &str,
    start_ts: u64,
) {
    let created = !records.contains_key(uid);
    if let Some(holder) = names.get(name) {
        let keep = holder != uid
            && records.get(holder).is_some_and(|h| start_ts < h.start_ts() || (start_ts == h.start_ts() && !created));
        if keep {
            trace!(name, uid, holder = %holder, "name held by a newer object");
            return;
        }
    }
    names.insert(name.to_string(), uid.to_string());
}

pub(super) fn release_name(names: &mut FxHashMap<String, Uid>, name: &str, uid: &str) {
    if names.get(name).is_some_and(|h| h == uid) {
        names.remove(name);
    }
}

pub(super) fn unlink(index: &mut FxHashMap<Uid, FxHashSet<Uid>>, key: &str, member: &str) {
    let empty = match index.get_mut(key) {
        Some(set) => {
            set.remove(member);
            set.is_empty()
        }
        None => false,
    };
    if empty {
        index.remove(key);
    }
}

fn lifecycle_after<T: Tracked>(prev: Option<&Arc<T>>, event: UpdateEvent) -> Lifecycle {
    prev.map_or(Lifecycle::Active, |p| p.lifecycle()).advance(event.lifecycle())
}

/// Stop time after an update: the event's, else the one already recorded.
/// A terminated record always has one; with nothing better known it stopped
/// no earlier than it started.
fn stop_after<T: Tracked>(prev: Option<&Arc<T>>, stop_ts: Option<u64>, lifecycle: Lifecycle, start_ts: u64) -> Option<u64> {
    stop_ts
        .or_else(|| prev.and_then(|p| p.stop_ts()))
        .or_else(|| lifecycle.is_terminated().then_some(start_ts))
}

impl AgentMetadataState {
    // ---- registries ----

    pub fn upsert_namespace(&mut self, u: &NamespaceUpdate, version: u64, event: UpdateEvent) {
        let prev = self.namespaces.get(&u.uid).cloned();
        if let Some(p) = &prev {
            if p.name != u.name {
                release_name(&mut self.namespace_names, &p.name, &u.uid);
            }
        }
        claim_name(&mut self.namespace_names, &self.namespaces, &u.name, &u.uid, u.start_ts);
        let lifecycle = lifecycle_after(prev.as_ref(), event);
        let info = NamespaceInfo {
            uid: u.uid.clone(),
            name: u.name.clone(),
            start_ts: u.start_ts,
            stop_ts: stop_after(prev.as_ref(), u.stop_ts, lifecycle, u.start_ts),
            lifecycle,
            resource_version: version,
        };
        self.uid_names.insert(u.uid.clone(), u.name.clone());
        self.namespaces.insert(u.uid.clone(), Arc::new(info));
    }

    pub fn upsert_pod(&mut self, u: &PodUpdate, version: u64, event: UpdateEvent) {
        let prev = self.pods.get(&u.uid).cloned();
        let display = display_name(&u.namespace, &u.name);
        let ip = u.ip.clone().filter(|ip| !ip.is_empty());
        if let Some(p) = &prev {
            let old = p.display_name();
            if old != display {
                release_name(&mut self.pod_names, &old, &u.uid);
            }
            if let Some(old_ip) = &p.ip {
                if ip.as_ref() != Some(old_ip) {
                    unlink(&mut self.pod_ips, old_ip, &u.uid);
                }
            }
        }
        claim_name(&mut self.pod_names, &self.pods, &display, &u.uid, u.start_ts);

        let mut containers = prev.as_ref().map(|p| p.containers.clone()).unwrap_or_default();
        for c in &u.containers {
            containers.insert(c.clone());
            self.link_container(c, &u.uid);
        }
        let lifecycle = lifecycle_after(prev.as_ref(), event);
        let info = PodInfo {
            uid: u.uid.clone(),
            name: u.name.clone(),
            namespace: u.namespace.clone(),
            ip,
            qos: u.qos,
            status: u.status.clone(),
            start_ts: u.start_ts,
            stop_ts: stop_after(prev.as_ref(), u.stop_ts, lifecycle, u.start_ts),
            containers,
            node_name: u.node_name.clone(),
            hostname: u.hostname.clone(),
            lifecycle,
            resource_version: version,
        };
        self.uid_names.insert(u.uid.clone(), display);
        self.pods.insert(u.uid.clone(), Arc::new(info));
        self.sync_pod(&u.uid);
    }

    pub fn upsert_container(&mut self, u: &ContainerUpdate, version: u64, event: UpdateEvent) {
        let prev = self.containers.get(&u.uid).cloned();
        if let Some(p) = &prev {
            if p.name != u.name {
                release_name(&mut self.container_names, &p.name, &u.uid);
            }
        }
        claim_name(&mut self.container_names, &self.containers, &u.name, &u.uid, u.start_ts);
        if let Some(pod) = &u.pod_uid {
            self.link_container(&u.uid, pod);
        }
        let lifecycle = lifecycle_after(prev.as_ref(), event);
        let info = ContainerInfo {
            uid: u.uid.clone(),
            name: u.name.clone(),
            pod_uid: u.pod_uid.clone().or_else(|| prev.as_ref().and_then(|p| p.pod_uid.clone())),
            status: u.status.clone(),
            start_ts: u.start_ts,
            stop_ts: stop_after(prev.as_ref(), u.stop_ts, lifecycle, u.start_ts),
            lifecycle,
            resource_version: version,
        };
        self.uid_names.insert(u.uid.clone(), u.name.clone());
        self.containers.insert(u.uid.clone(), Arc::new(info));
        self.refresh_container_links(&u.uid);
    }

    /// The update's pod list replaces the previous one.
    pub fn upsert_service(&mut self, u: &ServiceUpdate, version: u64, event: UpdateEvent) {
        let prev = self.services.get(&u.uid).cloned();
        let display = display_name(&u.namespace, &u.name);
        if let Some(p) = &prev {
            let old = p.display_name();
            if old != display {
                release_name(&mut self.service_names, &old, &u.uid);
            }
        }
        claim_name(&mut self.service_names, &self.services, &display, &u.uid, u.start_ts);

        let pods: FxHashSet<Uid> = u.pods.iter().cloned().collect();
        let old_pods = prev.as_ref().map(|p| p.pods.clone()).unwrap_or_default();
        for p in old_pods.difference(&pods) {
            unlink(&mut self.services_by_pod, p, &u.uid);
        }
        for p in &pods {
            self.services_by_pod.entry(p.clone()).or_default().insert(u.uid.clone());
        }
        let touched: Vec<Uid> = old_pods.union(&pods).cloned().collect();
        let lifecycle = lifecycle_after(prev.as_ref(), event);
        let info = ServiceInfo {
            uid: u.uid.clone(),
            name: u.name.clone(),
            namespace: u.namespace.clone(),
            pods,
            start_ts: u.start_ts,
            stop_ts: stop_after(prev.as_ref(), u.stop_ts, lifecycle, u.start_ts),
            lifecycle,
            resource_version: version,
        };
        self.uid_names.insert(u.uid.clone(), display);
        self.services.insert(u.uid.clone(), Arc::new(info));
        for p in &touched {
            self.refresh_pod_links(p);
        }
    }

    /// Terminate a known pod in place and drop it from every liveness index.
    pub fn mark_pod_terminated(&mut self, uid: &str, stop_ts: u64, status: Option<PodStatus>) -> bool {
        let Some(rec) = self.pods.get_mut(uid) else { return false };
        let rec = Arc::make_mut(rec);
        rec.lifecycle = Lifecycle::Terminated;
        rec.stop_ts = Some(stop_ts);
        if let Some(status) = status {
            rec.status = status;
        }
        self.sync_pod(uid);
        true
    }

    pub fn mark_container_terminated(&mut self, uid: &str, stop_ts: u64, status: Option<ContainerStatus>) -> bool {
        let Some(rec) = self.containers.get_mut(uid) else { return false };
        let rec = Arc::make_mut(rec);
        rec.lifecycle = Lifecycle::Terminated;
        rec.stop_ts = Some(stop_ts);
        if let Some(status) = status {
            rec.status = status;
        }
        self.refresh_container_links(uid);
        true
    }

    pub fn mark_service_terminated(&mut self, uid: &str, stop_ts: u64) -> bool {
        let Some(rec) = self.services.get_mut(uid) else { return false };
        let rec = Arc::make_mut(rec);
        rec.lifecycle = Lifecycle::Terminated;
        rec.stop_ts = Some(stop_ts);
        let pods: Vec<Uid> = rec.pods.iter().cloned().collect();
        for p in &pods {
            self.refresh_pod_links(p);
        }
        true
    }

    // ---- processes ----

    /// Register a process. Last write wins; no version gating.
    pub fn add_upid(&mut self, upid: Upid, info: PidInfo) {
        let old_container = self.pids.get(&upid).and_then(|p| p.container_uid.clone());
        if old_container != info.container_uid {
            if let Some(c) = &old_container {
                let empty = match self.container_upids.get_mut(c) {
                    Some(set) => {
                        set.remove(&upid);
                        set.is_empty()
                    }
                    None => false,
                };
                if empty {
                    self.container_upids.remove(c);
                }
            }
        }
        if let Some(c) = &info.container_uid {
            self.container_upids.entry(c.clone()).or_default().insert(upid);
        }
        self.pids.insert(upid, Arc::new(info));
        self.refresh_upid(upid);
    }

    pub fn mark_upid_stopped(&mut self, upid: &Upid, stop_ts: u64) -> bool {
        match self.pids.get_mut(upid) {
            Some(p) => {
                Arc::make_mut(p).stop_ts = Some(stop_ts);
                true
            }
            None => false,
        }
    }

    // ---- link maintenance ----

    fn link_container(&mut self, container: &str, pod: &str) {
        if let Some(old) = self.container_pod.insert(container.to_string(), pod.to_string()) {
            if old != pod {
                unlink(&mut self.containers_by_pod, &old, container);
            }
        }
        self.containers_by_pod.entry(pod.to_string()).or_default().insert(container.to_string());
    }

    /// Bring the pod IP index and every link of the pod in line with its record.
    fn sync_pod(&mut self, uid: &str) {
        let (ip, live) = match self.pods.get(uid) {
            Some(p) => (p.ip.clone(), !p.lifecycle.is_terminated()),
            None => (None, false),
        };
        if let Some(ip) = ip {
            if live {
                self.pod_ips.entry(ip).or_default().insert(uid.to_string());
            } else {
                unlink(&mut self.pod_ips, &ip, uid);
            }
        }
        self.refresh_pod_links(uid);
    }

    /// Recompute the pod <-> service liveness entries for `pod`, then every
    /// process running in one of its containers.
    pub(super) fn refresh_pod_links(&mut self, pod: &str) {
        let wanted: FxHashSet<Uid> = if is_live(&self.pods, pod) {
            self.services_by_pod
                .get(pod)
                .map(|ss| ss.iter().filter(|s| is_live(&self.services, s)).cloned().collect())
                .unwrap_or_default()
        } else {
            FxHashSet::default()
        };
        let current = self.pod_services.remove(pod).unwrap_or_default();
        for s in current.difference(&wanted) {
            unlink(&mut self.service_pods, s, pod);
        }
        for s in &wanted {
            self.service_pods.entry(s.clone()).or_default().insert(pod.to_string());
        }
        if !wanted.is_empty() {
            self.pod_services.insert(pod.to_string(), wanted);
        }

        let containers: Vec<Uid> = self
            .containers_by_pod
            .get(pod)
            .map(|cs| cs.iter().cloned().collect())
            .unwrap_or_default();
        for c in &containers {
            self.refresh_container_links(c);
        }
    }

    pub(super) fn refresh_container_links(&mut self, container: &str) {
        let upids: Vec<Upid> = self
            .container_upids
            .get(container)
            .map(|us| us.iter().copied().collect())
            .unwrap_or_default();
        for upid in upids {
            self.refresh_upid(upid);
        }
    }

    /// Resolve UPID -> container -> pod -> services through live records only.
    pub(super) fn refresh_upid(&mut self, upid: Upid) {
        let container = self
            .pids
            .get(&upid)
            .and_then(|p| p.container_uid.clone())
            .filter(|c| is_live(&self.containers, c));
        let pod = container
            .as_ref()
            .and_then(|c| self.container_pod.get(c).cloned())
            .filter(|p| is_live(&self.pods, p));
        let services = pod
            .as_ref()
            .and_then(|p| self.pod_services.get(p).cloned())
            .filter(|ss| !ss.is_empty());

        set_or_clear(&mut self.upid_containers, upid, container);
        set_or_clear(&mut self.upid_pods, upid, pod);
        set_or_clear(&mut self.upid_services, upid, services);
    }
}

fn set_or_clear<V>(index: &mut FxHashMap<Upid, V>, upid: Upid, value: Option<V>) {
    match value {
        Some(v) => {
            index.insert(upid, v);
        }
        None => {
            index.remove(&upid);
        }
    }
}

#[cfg(test)]
mod tests {
    use kmeta_core::fixtures;
    use kmeta_core::{ResourceObject, ResourceUpdate};

    use super::*;
    use crate::AgentInfo;

    fn apply(state: &mut AgentMetadataState, u: &ResourceUpdate) {
        match &u.object {
            ResourceObject::Namespace(n) => state.upsert_namespace(n, u.resource_version, u.event),
            ResourceObject::Pod(p) => state.upsert_pod(p, u.resource_version, u.event),
            ResourceObject::Container(c) => state.upsert_container(c, u.resource_version, u.event),
            ResourceObject::Service(s) => state.upsert_service(s, u.resource_version, u.event),
        }
    }

    fn seeded() -> AgentMetadataState {
        let mut s = AgentMetadataState::new(AgentInfo::default());
        for u in fixtures::initial_updates() {
            apply(&mut s, &u);
        }
        s.add_upid(Upid::new(123, 567, 89101), PidInfo::new(Upid::new(123, 567, 89101), "test", "pod1_container_1"));
        s
    }

    #[test]
    fn mark_pod_terminated_purges_liveness_but_keeps_record() {
        let mut s = seeded();
        let upid = Upid::new(123, 567, 89101);
        assert_eq!(s.pod_for_upid(&upid).map(|p| p.uid.as_str()), Some("1_uid"));
        assert_eq!(s.pod_uid_by_ip("1.1.1.1"), Some("1_uid"));

        assert!(s.mark_pod_terminated("1_uid", 42, None));
        assert!(s.pod_for_upid(&upid).is_none());
        assert!(s.services_for_upid(&upid).is_empty());
        assert!(s.services_for_pod("1_uid").is_empty());
        assert!(s.pod_uid_by_ip("1.1.1.1").is_none());
        // container is still live; only the pod hop is broken
        assert!(s.container_for_upid(&upid).is_some());
        let rec = s.pod("1_uid").unwrap();
        assert_eq!(rec.stop_ts, Some(42));
        assert_eq!(s.pod_uid_by_name("pl/running_pod"), Some("1_uid"));
        s.check_invariants().unwrap();

        assert!(!s.mark_pod_terminated("nope", 1, None));
    }

    #[test]
    fn container_termination_breaks_the_whole_chain() {
        let mut s = seeded();
        let upid = Upid::new(123, 567, 89101);
        assert!(s.mark_container_terminated("pod1_container_1", 9, None));
        assert!(s.container_for_upid(&upid).is_none());
        assert!(s.pod_for_upid(&upid).is_none());
        assert_eq!(s.pid_info(&upid).map(|p| p.cmdline.as_str()), Some("test"));
        s.check_invariants().unwrap();
    }

    #[test]
    fn service_termination_unlinks_pods() {
        let mut s = seeded();
        assert_eq!(s.pods_for_service("3_uid").len(), 1);
        assert!(s.mark_service_terminated("3_uid", 20));
        assert!(s.pods_for_service("3_uid").is_empty());
        assert!(s.services_for_pod("1_uid").is_empty());
        s.check_invariants().unwrap();
    }

    #[test]
    fn upid_registered_before_its_container_resolves_later() {
        let mut s = AgentMetadataState::new(AgentInfo::default());
        let upid = Upid::new(1, 2, 3);
        s.add_upid(upid, PidInfo::new(upid, "early", "pod1_container_1"));
        assert!(s.container_for_upid(&upid).is_none());
        apply(&mut s, &fixtures::running_container());
        assert_eq!(s.container_for_upid(&upid).map(|c| c.name.as_str()), Some("running_container"));
        assert!(s.pod_for_upid(&upid).is_none(), "pod not seen yet");
        apply(&mut s, &fixtures::running_pod());
        assert_eq!(s.pod_for_upid(&upid).map(|p| p.uid.as_str()), Some("1_uid"));
        apply(&mut s, &fixtures::running_service());
        assert_eq!(s.services_for_upid(&upid).len(), 1);
        s.check_invariants().unwrap();
    }

    #[test]
    fn re_registering_a_upid_moves_it() {
        let mut s = seeded();
        let upid = Upid::new(123, 567, 89101);
        s.add_upid(upid, PidInfo::new(upid, "moved", "pod2_container_1"));
        assert_eq!(s.container_for_upid(&upid).map(|c| c.uid.as_str()), Some("pod2_container_1"));
        assert_eq!(s.pod_for_upid(&upid).map(|p| p.uid.as_str()), Some("2_uid"));
        s.check_invariants().unwrap();
    }

    #[test]
    fn recreated_name_goes_to_newer_object() {
        let mut s = seeded();
        let mut newer = match fixtures::running_pod().object {
            ResourceObject::Pod(p) => p,
            _ => unreachable!(),
        };
        newer.uid = "1b_uid".into();
        newer.start_ts = 50;
        newer.ip = Some("1.1.1.2".into());
        s.upsert_pod(&newer, 1, UpdateEvent::Running);
        assert_eq!(s.pod_uid_by_name("pl/running_pod"), Some("1b_uid"));

        // a late update of the old pod keeps the record current but not the name
        let old = match fixtures::running_pod().object {
            ResourceObject::Pod(p) => p,
            _ => unreachable!(),
        };
        s.upsert_pod(&old, 99, UpdateEvent::Updated);
        assert_eq!(s.pod_uid_by_name("pl/running_pod"), Some("1b_uid"));
        assert_eq!(s.pod("1_uid").unwrap().resource_version, 99);
        assert_eq!(s.name_of("1_uid"), Some("pl/running_pod"));
    }

    #[test]
    fn stop_timestamp_is_sticky() {
        let mut s = seeded();
        let mut u = match fixtures::terminated_pod().object {
            ResourceObject::Pod(p) => p,
            _ => unreachable!(),
        };
        u.stop_ts = None;
        s.upsert_pod(&u, 100, UpdateEvent::Terminated);
        assert_eq!(s.pod("2_uid").unwrap().stop_ts, Some(15));
    }
}
