//! kmeta kubehub: turns Kubernetes watch streams into update events for the
//! ingest loop.

#![forbid(unsafe_code)]

pub mod convert;

use std::fmt::Debug;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Pod};
use kmeta_core::ResourceUpdate;
use kmeta_store::{IngestMsg, IngestSender};
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

pub use convert::{deleted_update, namespace_update, pod_updates, service_update};

type Convert<K> = fn(&K) -> Result<Vec<ResourceUpdate>>;

fn send(tx: &IngestSender, updates: Vec<ResourceUpdate>) -> Result<()> {
    for u in updates {
        tx.send(IngestMsg::Update(u)).context("ingest loop is gone")?;
    }
    Ok(())
}

/// Run one list+watch and forward every converted object. Objects that fail
/// conversion are logged and skipped.
async fn watch_kind<K>(what: &'static str, api: Api<K>, cfg: watcher::Config, convert: Convert<K>, tx: IngestSender) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(kind = what, "watcher started");
    let forward = |obj: &K, deleted: bool| -> Result<()> {
        match convert(obj) {
            Ok(mut updates) => {
                if deleted {
                    let now = convert::now_ns();
                    updates = updates.into_iter().map(|u| convert::deleted_update(u, now)).collect();
                }
                send(&tx, updates)
            }
            Err(e) => {
                warn!(kind = what, error = %e, "skipping unconvertible object");
                counter!("kubehub_convert_errors_total", 1u64, "kind" => what);
                Ok(())
            }
        }
    };
    while let Some(ev) = stream.try_next().await.with_context(|| format!("watching {}", what))? {
        match ev {
            Event::Applied(o) => forward(&o, false)?,
            Event::Deleted(o) => forward(&o, true)?,
            Event::Restarted(list) => {
                debug!(kind = what, count = list.len(), "watch restart");
                for o in list.iter() {
                    forward(o, false)?;
                }
            }
        }
    }
    warn!(kind = what, "watcher stream ended");
    Ok(())
}

fn endpoints_updates(ep: &Endpoints) -> Result<Vec<ResourceUpdate>> { Ok(vec![service_update(ep)?]) }

fn namespace_updates(ns: &Namespace) -> Result<Vec<ResourceUpdate>> { Ok(vec![namespace_update(ns)?]) }

/// Watch pods scheduled on `node_name`, plus every endpoints object and
/// namespace in the cluster. Returns when any watcher fails or the ingest loop
/// goes away.
pub async fn start_watchers(node_name: &str, tx: IngestSender) -> Result<()> {
    let client = Client::try_default().await.context("building kube client")?;
    let pods: Api<Pod> = Api::all(client.clone());
    let endpoints: Api<Endpoints> = Api::all(client.clone());
    let namespaces: Api<Namespace> = Api::all(client);

    let pod_cfg = watcher::Config::default().fields(&format!("spec.nodeName={}", node_name));
    info!(node = node_name, "starting metadata watchers");
    futures::try_join!(
        watch_kind("pod", pods, pod_cfg, pod_updates, tx.clone()),
        watch_kind("endpoints", endpoints, watcher::Config::default(), endpoints_updates, tx.clone()),
        watch_kind("namespace", namespaces, watcher::Config::default(), namespace_updates, tx),
    )?;
    Ok(())
}
