//! Per-source in-flight accounting.

use dashmap::DashMap;

/// Tracks in-flight calls per source against each source's declared
/// concurrency budget.
///
/// The invariant `in_flight <= max_concurrent` holds at every instant:
/// a claim only succeeds under the map entry's exclusive shard lock, and
/// the matching release is tied to a guard's `Drop`.
#[derive(Debug, Default)]
pub struct SourceSlots {
    slots: DashMap<String, SlotState>,
}

#[derive(Debug)]
struct SlotState {
    max_concurrent: usize,
    in_flight: usize,
}

impl SourceSlots {
    /// Creates an empty slot table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a source's concurrency budget (clamped to at least 1).
    pub fn register(&self, source_id: &str, max_concurrent: usize) {
        self.slots.insert(
            source_id.to_string(),
            SlotState {
                max_concurrent: max_concurrent.max(1),
                in_flight: 0,
            },
        );
    }

    /// Attempts to claim one in-flight slot for the source.
    ///
    /// Returns a guard that releases the slot on drop, or `None` when the
    /// source is at its budget. Unknown sources get a budget of 1.
    #[must_use]
    pub fn try_claim<'a>(&'a self, source_id: &str) -> Option<SlotGuard<'a>> {
        let mut entry = self
            .slots
            .entry(source_id.to_string())
            .or_insert_with(|| SlotState {
                max_concurrent: 1,
                in_flight: 0,
            });

        if entry.in_flight < entry.max_concurrent {
            entry.in_flight += 1;
            drop(entry);
            Some(SlotGuard {
                slots: self,
                source_id: source_id.to_string(),
            })
        } else {
            None
        }
    }

    /// Returns the source's current in-flight count.
    #[must_use]
    pub fn in_flight(&self, source_id: &str) -> usize {
        self.slots.get(source_id).map_or(0, |s| s.in_flight)
    }

    fn release(&self, source_id: &str) {
        if let Some(mut entry) = self.slots.get_mut(source_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }
}

/// RAII claim on one source slot; dropping it releases the slot.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    slots: &'a SourceSlots,
    source_id: String,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots.release(&self.source_id);
    }
}
