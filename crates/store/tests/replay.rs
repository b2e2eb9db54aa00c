#![forbid(unsafe_code)]

use std::collections::VecDeque;

use kmeta_core::{fixtures, Lifecycle, PidInfo, PodUpdate, ResourceObject, ResourceUpdate, UpdateEvent, Upid};
use kmeta_store::{apply_updates, AgentInfo, AgentMetadataState, ApplyStats, JsonLines, UpdateFilter};

fn pod(uid: &str, name: &str, ip: &str, start_ts: u64, version: u64, event: UpdateEvent) -> ResourceUpdate {
    ResourceUpdate::new(version, event, ResourceObject::Pod(PodUpdate {
        uid: uid.into(),
        name: name.into(),
        namespace: "ns".into(),
        ip: Some(ip.into()),
        start_ts,
        stop_ts: if event == UpdateEvent::Terminated { Some(start_ts + 100) } else { None },
        ..Default::default()
    }))
}

fn replay(state: &mut AgentMetadataState, filter: &mut UpdateFilter, batch_seq: u64, events: Vec<ResourceUpdate>) -> ApplyStats {
    let mut q: VecDeque<ResourceUpdate> = events.into();
    apply_updates(batch_seq, state, filter, &mut q)
}

fn all_fixtures() -> Vec<ResourceUpdate> {
    let mut all = fixtures::initial_updates();
    all.extend([
        fixtures::terminated_container(),
        fixtures::terminated_pod(),
        fixtures::terminated_service(),
        fixtures::service_with_same_pod(),
    ]);
    all
}

#[test]
fn replaying_the_same_stream_is_a_no_op() {
    let mut state = AgentMetadataState::new(AgentInfo::default());
    let mut filter = UpdateFilter::new();
    let first = replay(&mut state, &mut filter, 1, all_fixtures());
    assert_eq!(first.applied, 10);
    let before = state.stats();

    let second = replay(&mut state, &mut filter, 2, all_fixtures());
    assert_eq!(second, ApplyStats { applied: 0, stale: 10, malformed: 0 });
    let after = state.stats();
    assert_eq!((before.pods, before.live_pods, before.services), (after.pods, after.live_pods, after.services));
    assert_eq!(before.resource_version, after.resource_version);
    assert_eq!(after.epoch, 2);
    state.check_invariants().unwrap();
}

#[test]
fn older_event_after_newer_is_dropped() {
    let mut state = AgentMetadataState::default();
    let mut filter = UpdateFilter::new();
    let stats = replay(&mut state, &mut filter, 1, vec![fixtures::terminated_pod(), fixtures::terminating_pod()]);
    assert_eq!((stats.applied, stats.stale), (1, 1));
    let p = state.pod("2_uid").unwrap();
    assert_eq!(p.lifecycle, Lifecycle::Terminated);
    assert_eq!(p.resource_version, 8);
    assert_eq!(filter.high_water("2_uid"), Some(8));
}

#[test]
fn version_never_goes_backwards() {
    let mut state = AgentMetadataState::default();
    let mut filter = UpdateFilter::new();
    let mut last = 0;
    for (seq, u) in all_fixtures().into_iter().rev().enumerate() {
        replay(&mut state, &mut filter, seq as u64 + 1, vec![u]);
        assert!(state.resource_version() >= last);
        last = state.resource_version();
    }
    assert_eq!(last, 10);
}

#[test]
fn terminated_without_history_is_kept_as_history() {
    let mut state = AgentMetadataState::default();
    let mut filter = UpdateFilter::new();
    replay(&mut state, &mut filter, 1, vec![pod("ghost", "ghost", "9.9.9.9", 40, 3, UpdateEvent::Terminated)]);

    let p = state.pod("ghost").unwrap();
    assert_eq!(p.lifecycle, Lifecycle::Terminated);
    assert_eq!(p.stop_ts, Some(140));
    assert_eq!(state.pod_uid_by_name("ns/ghost"), Some("ghost"));
    assert!(state.pod_uid_by_ip("9.9.9.9").is_none());
    state.check_invariants().unwrap();
}

#[test]
fn terminated_is_absorbing() {
    let mut state = AgentMetadataState::default();
    let mut filter = UpdateFilter::new();
    replay(&mut state, &mut filter, 1, vec![
        pod("p", "web", "10.0.0.1", 1, 1, UpdateEvent::Running),
        pod("p", "web", "10.0.0.1", 1, 2, UpdateEvent::Terminated),
    ]);
    // newer version, stale content
    replay(&mut state, &mut filter, 2, vec![pod("p", "web", "10.0.0.2", 1, 3, UpdateEvent::Running)]);

    let p = state.pod("p").unwrap();
    assert_eq!(p.lifecycle, Lifecycle::Terminated);
    assert_eq!(p.ip.as_deref(), Some("10.0.0.2"));
    assert!(state.pod_uid_by_ip("10.0.0.1").is_none());
    assert!(state.pod_uid_by_ip("10.0.0.2").is_none());
    state.check_invariants().unwrap();
}

#[test]
fn reused_ip_points_at_the_live_pod() {
    let mut state = AgentMetadataState::default();
    let mut filter = UpdateFilter::new();
    replay(&mut state, &mut filter, 1, vec![
        pod("a", "a", "10.1.1.1", 1, 1, UpdateEvent::Running),
        pod("b", "b", "10.1.1.1", 2, 2, UpdateEvent::Running),
    ]);
    assert_eq!(state.pod_uid_by_ip("10.1.1.1"), Some("b"));

    // the old owner going away must not clear the new owner's entry
    replay(&mut state, &mut filter, 2, vec![pod("a", "a", "10.1.1.1", 1, 3, UpdateEvent::Terminated)]);
    assert_eq!(state.pod_uid_by_ip("10.1.1.1"), Some("b"));

    replay(&mut state, &mut filter, 3, vec![pod("b", "b", "10.1.1.1", 2, 4, UpdateEvent::Terminated)]);
    assert!(state.pod_uid_by_ip("10.1.1.1").is_none());
    state.check_invariants().unwrap();
}

#[test]
fn shared_ip_survives_one_holder_leaving() {
    let mut state = AgentMetadataState::default();
    let mut filter = UpdateFilter::new();
    replay(&mut state, &mut filter, 1, vec![
        pod("a", "a", "10.0.0.5", 1, 1, UpdateEvent::Running),
        pod("b", "b", "10.0.0.5", 2, 2, UpdateEvent::Running),
    ]);
    assert_eq!(state.pod_uid_by_ip("10.0.0.5"), Some("b"));

    // an update of the older holder does not take the IP over
    replay(&mut state, &mut filter, 2, vec![pod("a", "a", "10.0.0.5", 1, 3, UpdateEvent::Updated)]);
    assert_eq!(state.pod_uid_by_ip("10.0.0.5"), Some("b"));

    replay(&mut state, &mut filter, 3, vec![pod("b", "b", "10.0.0.5", 2, 4, UpdateEvent::Terminated)]);
    assert_eq!(state.pod_uid_by_ip("10.0.0.5"), Some("a"));
    state.check_invariants().unwrap();

    // moving to another IP releases the old one
    replay(&mut state, &mut filter, 4, vec![pod("a", "a", "10.0.0.6", 1, 5, UpdateEvent::Updated)]);
    assert!(state.pod_uid_by_ip("10.0.0.5").is_none());
    assert_eq!(state.pod_uid_by_ip("10.0.0.6"), Some("a"));
    state.check_invariants().unwrap();
}

#[test]
fn terminated_event_without_stop_time_is_stamped() {
    let mut state = AgentMetadataState::default();
    let mut filter = UpdateFilter::new();
    let mut ended = pod("p", "web", "10.3.0.1", 30, 1, UpdateEvent::Terminated);
    if let ResourceObject::Pod(p) = &mut ended.object {
        p.stop_ts = None;
    }
    replay(&mut state, &mut filter, 1, vec![ended]);
    assert_eq!(state.pod("p").and_then(|p| p.stop_ts), Some(30));

    // a terminating pod has no stop time yet
    replay(&mut state, &mut filter, 2, vec![pod("q", "q", "10.3.0.2", 7, 2, UpdateEvent::Terminating)]);
    assert_eq!(state.pod("q").and_then(|p| p.stop_ts), None);
}

#[test]
fn equal_start_times_keep_the_current_name_holder() {
    let mut state = AgentMetadataState::default();
    let mut filter = UpdateFilter::new();
    replay(&mut state, &mut filter, 1, vec![
        pod("old", "web", "10.4.0.1", 0, 1, UpdateEvent::Running),
        pod("new", "web", "10.4.0.2", 0, 2, UpdateEvent::Running),
    ]);
    assert_eq!(state.pod_uid_by_name("ns/web"), Some("new"));

    replay(&mut state, &mut filter, 2, vec![pod("old", "web", "10.4.0.1", 0, 3, UpdateEvent::Updated)]);
    assert_eq!(state.pod_uid_by_name("ns/web"), Some("new"));
}

#[test]
fn recreated_pod_keeps_the_name() {
    let mut state = AgentMetadataState::default();
    let mut filter = UpdateFilter::new();
    replay(&mut state, &mut filter, 1, vec![
        pod("old", "web", "10.2.0.1", 10, 1, UpdateEvent::Running),
        pod("new", "web", "10.2.0.2", 20, 2, UpdateEvent::Running),
    ]);
    assert_eq!(state.pod_uid_by_name("ns/web"), Some("new"));

    // a late termination of the replaced pod does not take the name back
    replay(&mut state, &mut filter, 2, vec![pod("old", "web", "10.2.0.1", 10, 3, UpdateEvent::Terminated)]);
    assert_eq!(state.pod_uid_by_name("ns/web"), Some("new"));
    assert_eq!(state.name_of("old"), Some("ns/web"));
    assert_eq!(state.pod("old").map(|p| p.lifecycle), Some(Lifecycle::Terminated));
}

#[test]
fn process_liveness_follows_its_chain() {
    let mut state = AgentMetadataState::default();
    let mut filter = UpdateFilter::new();
    replay(&mut state, &mut filter, 1, fixtures::initial_updates());
    let upid = Upid::new(123, 567, 89101);
    state.add_upid(upid, PidInfo::new(upid, "test", "pod1_container_1"));
    assert_eq!(state.pod_for_upid(&upid).map(|p| p.uid.as_str()), Some("1_uid"));
    assert_eq!(state.services_for_upid(&upid).len(), 1);

    // a second service joins, then the first one goes away
    replay(&mut state, &mut filter, 2, vec![fixtures::service_with_same_pod()]);
    assert_eq!(state.services_for_upid(&upid).len(), 2);
    let mut gone = fixtures::running_service();
    gone.resource_version = 20;
    gone.event = UpdateEvent::Terminated;
    replay(&mut state, &mut filter, 3, vec![gone]);
    let names: Vec<_> = state.services_for_upid(&upid).into_iter().map(|s| s.name.clone()).collect();
    assert_eq!(names, vec!["other_service_with_pod".to_string()]);

    // the container ends: every UPID-keyed lookup goes dark, the record stays
    let mut ended = fixtures::running_container();
    ended.resource_version = 21;
    ended.event = UpdateEvent::Terminated;
    replay(&mut state, &mut filter, 4, vec![ended]);
    assert!(state.container_for_upid(&upid).is_none());
    assert!(state.pod_for_upid(&upid).is_none());
    assert!(state.services_for_upid(&upid).is_empty());
    assert_eq!(state.pid_info(&upid).map(|p| p.cmdline.as_str()), Some("test"));
    assert!(state.container("pod1_container_1").is_some());
    state.check_invariants().unwrap();
}

#[test]
fn json_lines_replay_skips_bad_lines() {
    let mut text = String::new();
    for u in fixtures::initial_updates() {
        text.push_str(&serde_json::to_string(&u).unwrap());
        text.push('\n');
    }
    text.push_str("{\"resource_version\": 1}\n");
    text.push_str(r#"{"resource_version":0,"event":"Running","object":{"kind":"Pod","uid":"x","name":"x","namespace":"ns"}}"#);
    text.push('\n');

    let mut state = AgentMetadataState::default();
    let mut filter = UpdateFilter::new();
    let stats = apply_updates(1, &mut state, &mut filter, &mut JsonLines::new(text.as_bytes()));
    assert_eq!(stats, ApplyStats { applied: 6, stale: 0, malformed: 2 });
    assert_eq!(state.pod_uid_by_name("pl/running_pod"), Some("1_uid"));
}
