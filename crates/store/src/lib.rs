//! kmeta store: update filter, metadata state, and the single-writer ingest
//! loop that publishes immutable snapshots to concurrent readers.

#![forbid(unsafe_code)]

pub mod filter;
pub mod manager;
pub mod state;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use kmeta_core::{PidInfo, ResourceUpdate, Upid};
use metrics::gauge;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub use filter::UpdateFilter;
pub use manager::{apply_update, apply_updates, ApplyStats, EventSource, JsonLines};
pub use state::{AgentInfo, AgentMetadataState, EvictionStats, InvariantViolation, StateStats};

/// Messages accepted by the ingest loop. Everything that mutates the state
/// goes through here so the loop stays the only writer.
#[derive(Debug, Clone)]
pub enum IngestMsg {
    Update(ResourceUpdate),
    Upid(Upid, PidInfo),
    UpidStopped(Upid, u64),
}

impl From<ResourceUpdate> for IngestMsg {
    fn from(u: ResourceUpdate) -> Self { IngestMsg::Update(u) }
}

pub type IngestSender = mpsc::UnboundedSender<IngestMsg>;

#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    /// Keep terminated objects this long after their stop time; `None` keeps them forever.
    pub retention: Option<Duration>,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let retention = std::env::var("KMETA_RETENTION_SECS")
            .ok()
            .and_then(|s| match s.trim().parse::<u64>() {
                Ok(secs) => Some(secs),
                Err(_) => {
                    warn!(value = %s, "ignoring invalid KMETA_RETENTION_SECS");
                    None
                }
            })
            .map(Duration::from_secs);
        Self { retention }
    }
}

/// Read side of the ingest loop.
#[derive(Clone)]
pub struct MetadataHandle {
    snap: Arc<ArcSwap<AgentMetadataState>>,
    epoch_rx: watch::Receiver<u64>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl MetadataHandle {
    /// The latest published snapshot. Hold the `Arc` for the whole query.
    pub fn current(&self) -> Arc<AgentMetadataState> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
    /// Ask the loop to exit after its current drain cycle.
    pub fn stop(&self) { let _ = self.stop_tx.send(true); }
}

struct Writer {
    state: AgentMetadataState,
    filter: UpdateFilter,
    batch_seq: u64,
    retention: Option<Duration>,
}

impl Writer {
    fn drain(&mut self, first: IngestMsg, rx: &mut mpsc::UnboundedReceiver<IngestMsg>) -> ApplyStats {
        let mut updates: VecDeque<ResourceUpdate> = VecDeque::new();
        let mut pids: Vec<IngestMsg> = Vec::new();
        let mut next = Some(first);
        while let Some(msg) = next {
            match msg {
                IngestMsg::Update(u) => updates.push_back(u),
                other => pids.push(other),
            }
            next = rx.try_recv().ok();
        }

        self.batch_seq += 1;
        let stats = apply_updates(self.batch_seq, &mut self.state, &mut self.filter, &mut updates);
        // process registrations after the batch so they link against its containers
        for msg in pids {
            match msg {
                IngestMsg::Upid(upid, info) => self.state.add_upid(upid, info),
                IngestMsg::UpidStopped(upid, ts) => {
                    if !self.state.mark_upid_stopped(&upid, ts) {
                        debug!(%upid, "stop for unknown process");
                    }
                }
                IngestMsg::Update(_) => {}
            }
        }
        self.evict();
        stats
    }

    fn evict(&mut self) {
        let Some(keep) = self.retention else { return };
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX).max(0) as u64;
        let cutoff = now.saturating_sub(keep.as_nanos().min(u64::MAX as u128) as u64);
        let evicted = self.state.evict_terminated_before(cutoff);
        for uid in &evicted.uids {
            self.filter.forget(uid);
        }
    }

    fn publish(&self, snap: &ArcSwap<AgentMetadataState>, epoch_tx: &watch::Sender<u64>) {
        snap.store(Arc::new(self.state.clone()));
        let _ = epoch_tx.send(self.batch_seq);
        let st = self.state.stats();
        gauge!("metadata_pods", st.pods as f64);
        gauge!("metadata_containers", st.containers as f64);
        gauge!("metadata_services", st.services as f64);
        gauge!("metadata_upids", st.upids as f64);
    }
}

/// Spawn the ingest loop over `initial`. Returns the queue sender and a read handle.
///
/// The loop waits while the queue is empty, then drains whatever is available,
/// applies it to its private copy, and swaps in a fresh snapshot. It exits when
/// `stop()` is called, every handle is dropped, or every sender is dropped.
pub fn spawn_ingest(initial: AgentMetadataState, config: IngestConfig) -> (IngestSender, MetadataHandle) {
    let (tx, mut rx) = mpsc::unbounded_channel::<IngestMsg>();
    let snap = Arc::new(ArcSwap::from_pointee(initial.clone()));
    let (epoch_tx, epoch_rx) = watch::channel(initial.epoch());
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut writer =
            Writer { batch_seq: initial.epoch(), state: initial, filter: UpdateFilter::new(), retention: config.retention };
        let mut total = ApplyStats::default();
        loop {
            let first = tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        debug!("stop requested");
                        break;
                    }
                    continue;
                }
                maybe = rx.recv() => match maybe {
                    Some(m) => m,
                    None => {
                        debug!("ingest channel closed; exiting ingest loop");
                        break;
                    }
                },
            };
            let stats = writer.drain(first, &mut rx);
            total.merge(stats);
            writer.publish(&snap_clone, &epoch_tx);
        }
        info!(
            epoch = writer.batch_seq,
            applied = total.applied,
            stale = total.stale,
            malformed = total.malformed,
            "ingest loop stopped"
        );
    });

    (tx, MetadataHandle { snap, epoch_rx, stop_tx: Arc::new(stop_tx) })
}
