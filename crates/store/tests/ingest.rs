#![forbid(unsafe_code)]

use std::time::Duration;

use kmeta_core::{fixtures, PidInfo, Upid};
use kmeta_store::{spawn_ingest, AgentInfo, AgentMetadataState, IngestConfig, IngestMsg, MetadataHandle};
use uuid::Uuid;

async fn wait_for_epoch(handle: &MetadataHandle, at_least: u64) {
    let mut rx = handle.subscribe_epoch();
    let wait = async {
        while *rx.borrow_and_update() < at_least {
            if rx.changed().await.is_err() {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait).await.expect("epoch not published in time");
}

fn agent() -> AgentInfo {
    AgentInfo::new(123, Uuid::new_v4(), "test_host", "pl/agent").with_node_name("test_node")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publishes_snapshots_and_keeps_old_ones_valid() {
    let (tx, handle) = spawn_ingest(AgentMetadataState::new(agent()), IngestConfig::default());
    let empty = handle.current();
    assert_eq!(empty.agent().asid, 123);

    for u in fixtures::initial_updates() {
        tx.send(u.into()).unwrap();
    }
    let upid = Upid::new(123, 567, 89101);
    tx.send(IngestMsg::Upid(upid, PidInfo::new(upid, "test", "pod1_container_1"))).unwrap();
    wait_for_epoch(&handle, 1).await;

    // readers may need several epochs to see everything; poll until settled
    let snap = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let s = handle.current();
            if s.pod_for_upid(&upid).is_some() && s.services_for_upid(&upid).len() == 1 {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state never settled");
    assert_eq!(snap.pod_uid_by_ip("1.1.1.1"), Some("1_uid"));

    // an older snapshot is untouched by later publications
    assert!(empty.pod("1_uid").is_none());
    let before = snap.epoch();
    tx.send(fixtures::terminated_pod().into()).unwrap();
    wait_for_epoch(&handle, before + 1).await;
    assert!(snap.pod("2_uid").is_some_and(|p| !p.lifecycle.is_terminated()));
    assert!(handle.current().pod("2_uid").is_some_and(|p| p.lifecycle.is_terminated()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_readers_see_consistent_snapshots() {
    let (tx, handle) = spawn_ingest(AgentMetadataState::new(agent()), IngestConfig::default());
    let upid = Upid::new(123, 567, 89101);
    tx.send(IngestMsg::Upid(upid, PidInfo::new(upid, "test", "pod1_container_1"))).unwrap();

    let mut readers = Vec::new();
    for _ in 0..4 {
        let h = handle.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..200 {
                let s = h.current();
                s.check_invariants().expect("published snapshot violates an invariant");
                // a live pod for the process always comes with its live container
                if s.pod_for_upid(&upid).is_some() {
                    assert!(s.container_for_upid(&upid).is_some());
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    let mut all = fixtures::initial_updates();
    all.extend([fixtures::terminated_container(), fixtures::terminated_pod(), fixtures::service_with_same_pod()]);
    for u in all {
        tx.send(u.into()).unwrap();
        tokio::task::yield_now().await;
    }
    for r in readers {
        r.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_ends_the_loop() {
    let (tx, handle) = spawn_ingest(AgentMetadataState::default(), IngestConfig::default());
    tx.send(fixtures::running_pod().into()).unwrap();
    wait_for_epoch(&handle, 1).await;
    handle.stop();
    tokio::time::timeout(Duration::from_secs(2), tx.closed()).await.expect("loop did not exit");
    assert!(tx.send(fixtures::running_service().into()).is_err());
    assert!(handle.current().pod("1_uid").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retention_evicts_old_terminated_objects() {
    let config = IngestConfig { retention: Some(Duration::from_secs(60)) };
    let (tx, handle) = spawn_ingest(AgentMetadataState::default(), config);
    for u in fixtures::initial_updates() {
        tx.send(u.into()).unwrap();
    }
    // stop times in the fixtures are nanoseconds after the epoch, far past any cutoff
    tx.send(fixtures::terminated_pod().into()).unwrap();
    tx.send(fixtures::terminated_service().into()).unwrap();
    let settled = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let s = handle.current();
            if s.pod("1_uid").is_some() && s.pod("2_uid").is_none() && s.service("4_uid").is_none() {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("terminated objects were not evicted");
    assert!(settled.pod_uid_by_name("pl/terminating_pod").is_none());
    settled.check_invariants().unwrap();
}
