/// DialBackoff: exponential retry windows for failed relay dials.
///
/// Pure bookkeeping: the first failure opens a window of one unit, each
/// further failure doubles it. A dial is permitted once the window since
/// the last failure has elapsed.
use std::collections::HashMap;

use crate::types::NodeId;

#[derive(Debug, Clone, Copy)]
struct Entry {
    stamp_ms: u64,
    wait: u64,
}

pub struct DialBackoff {
    entries: HashMap<NodeId, Entry>,
    unit_ms: u64,
}

impl DialBackoff {
    pub fn new(unit_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            unit_ms: unit_ms.max(1),
        }
    }

    /// Record a failed dial and return the new window, in units.
    pub fn record_failure(&mut self, id: NodeId, now: u64) -> u64 {
        let entry = self
            .entries
            .entry(id)
            .and_modify(|e| {
                e.wait = e.wait.saturating_mul(2);
                e.stamp_ms = now;
            })
            .or_insert(Entry {
                stamp_ms: now,
                wait: 1,
            });
        entry.wait
    }

    /// Whether a dial to `id` may go ahead at `now`.
    pub fn permits(&self, id: &NodeId, now: u64) -> bool {
        match self.entries.get(id) {
            None => true,
            Some(e) => now.saturating_sub(e.stamp_ms) > e.wait.saturating_mul(self.unit_ms),
        }
    }

    /// Current window for `id`, in units.
    pub fn wait_window(&self, id: &NodeId) -> Option<u64> {
        self.entries.get(id).map(|e| e.wait)
    }

    /// Forget a relay once a link to it succeeds.
    pub fn clear(&mut self, id: &NodeId) {
        self.entries.remove(id);
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
