//! Per-UID version gate for incoming updates.

use rustc_hash::FxHashMap;

use kmeta_core::Uid;

/// Tracks the highest resource version accepted for each UID.
///
/// Owned by the single writer; no internal synchronization. Accepting is
/// idempotent for duplicates and replays, but it cannot repair causal order:
/// an event accepted with a newer version always wins even if its content is
/// older.
#[derive(Debug, Default, Clone)]
pub struct UpdateFilter {
    marks: FxHashMap<Uid, u64>,
}

impl UpdateFilter {
    pub fn new() -> Self { Self::default() }

    /// Accept `version` for `uid` iff it is strictly newer than the last accepted one.
    pub fn accept(&mut self, uid: &str, version: u64) -> bool {
        match self.marks.get_mut(uid) {
            Some(mark) if *mark >= version => false,
            Some(mark) => {
                *mark = version;
                true
            }
            None => {
                self.marks.insert(uid.to_string(), version);
                true
            }
        }
    }

    pub fn high_water(&self, uid: &str) -> Option<u64> { self.marks.get(uid).copied() }

    /// Drop the mark for an evicted object.
    pub fn forget(&mut self, uid: &str) -> bool { self.marks.remove(uid).is_some() }

    pub fn len(&self) -> usize { self.marks.len() }
    pub fn is_empty(&self) -> bool { self.marks.is_empty() }
}
