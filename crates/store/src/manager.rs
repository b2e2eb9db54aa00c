//! Update application protocol: drain a source, gate each event through the
//! filter, dispatch to the registries, advance the state version.

use std::collections::VecDeque;
use std::io::BufRead;
use std::time::Instant;

use kmeta_core::{ResourceObject, ResourceUpdate, UpdateError};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::filter::UpdateFilter;
use crate::state::AgentMetadataState;

/// Non-blocking view of an update queue. `None` means nothing is available right now.
pub trait EventSource {
    fn try_next(&mut self) -> Option<Result<ResourceUpdate, UpdateError>>;
}

impl EventSource for VecDeque<ResourceUpdate> {
    fn try_next(&mut self) -> Option<Result<ResourceUpdate, UpdateError>> { self.pop_front().map(Ok) }
}

impl EventSource for VecDeque<Result<ResourceUpdate, UpdateError>> {
    fn try_next(&mut self) -> Option<Result<ResourceUpdate, UpdateError>> { self.pop_front() }
}

impl EventSource for tokio::sync::mpsc::UnboundedReceiver<ResourceUpdate> {
    fn try_next(&mut self) -> Option<Result<ResourceUpdate, UpdateError>> { self.try_recv().ok().map(Ok) }
}

impl EventSource for std::sync::mpsc::Receiver<ResourceUpdate> {
    fn try_next(&mut self) -> Option<Result<ResourceUpdate, UpdateError>> { self.try_recv().ok().map(Ok) }
}

/// JSON-lines reader; blank lines are skipped, undecodable ones surface as errors.
pub struct JsonLines<R> {
    reader: R,
    line: String,
    lineno: usize,
}

impl<R: BufRead> JsonLines<R> {
    pub fn new(reader: R) -> Self { Self { reader, line: String::new(), lineno: 0 } }
}

impl<R: BufRead> EventSource for JsonLines<R> {
    fn try_next(&mut self) -> Option<Result<ResourceUpdate, UpdateError>> {
        loop {
            self.line.clear();
            self.lineno += 1;
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) if self.line.trim().is_empty() => continue,
                Ok(_) => {
                    return Some(
                        ResourceUpdate::from_json(self.line.trim())
                            .map_err(|e| UpdateError::Decode(format!("line {}: {}", self.lineno, e))),
                    )
                }
                Err(e) => return Some(Err(UpdateError::Decode(format!("line {}: {}", self.lineno, e)))),
            }
        }
    }
}

/// Outcome counts of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub applied: u64,
    pub stale: u64,
    pub malformed: u64,
}

impl ApplyStats {
    pub fn total(&self) -> u64 { self.applied + self.stale + self.malformed }

    pub fn merge(&mut self, other: ApplyStats) {
        self.applied += other.applied;
        self.stale += other.stale;
        self.malformed += other.malformed;
    }
}

/// Apply one event that already passed the filter.
pub fn apply_update(state: &mut AgentMetadataState, u: &ResourceUpdate) {
    let v = u.resource_version;
    match &u.object {
        ResourceObject::Namespace(n) => state.upsert_namespace(n, v, u.event),
        ResourceObject::Pod(p) => state.upsert_pod(p, v, u.event),
        ResourceObject::Container(c) => state.upsert_container(c, v, u.event),
        ResourceObject::Service(s) => state.upsert_service(s, v, u.event),
    }
    state.advance_version(v);
}

/// Drain every event currently available from `source` into `state`.
///
/// Malformed events are logged and skipped; stale or duplicate ones are
/// dropped by `filter`. Neither stops the batch. `batch_seq` is recorded as the
/// state epoch; it is a diagnostic marker, per-object ordering is the filter's job.
pub fn apply_updates<S: EventSource + ?Sized>(
    batch_seq: u64,
    state: &mut AgentMetadataState,
    filter: &mut UpdateFilter,
    source: &mut S,
) -> ApplyStats {
    let started = Instant::now();
    if batch_seq <= state.epoch() && state.epoch() != 0 {
        warn!(batch_seq, last = state.epoch(), "batch sequence did not advance");
    }
    let mut stats = ApplyStats::default();
    while let Some(next) = source.try_next() {
        let update = match next.and_then(|u| u.validate().map(|_| u)) {
            Ok(u) => u,
            Err(e) => {
                warn!(batch_seq, error = %e, "skipping malformed update");
                stats.malformed += 1;
                continue;
            }
        };
        if !filter.accept(update.uid(), update.resource_version) {
            debug!(
                kind = update.object.kind(),
                uid = update.uid(),
                rv = update.resource_version,
                "dropping stale update"
            );
            stats.stale += 1;
            continue;
        }
        trace!(kind = update.object.kind(), uid = update.uid(), event = ?update.event, "applying update");
        apply_update(state, &update);
        stats.applied += 1;
    }
    state.set_epoch(batch_seq);

    if cfg!(debug_assertions) {
        if let Err(e) = state.check_invariants() {
            panic!("metadata state invariant violated after batch {}: {}", batch_seq, e);
        }
    }

    counter!("metadata_updates_applied_total", stats.applied);
    counter!("metadata_updates_stale_total", stats.stale);
    counter!("metadata_updates_malformed_total", stats.malformed);
    histogram!("metadata_apply_batch_ms", started.elapsed().as_secs_f64() * 1000.0);
    if stats.total() > 0 {
        debug!(
            batch_seq,
            applied = stats.applied,
            stale = stats.stale,
            malformed = stats.malformed,
            rv = state.resource_version(),
            "applied update batch"
        );
    }
    stats
}
