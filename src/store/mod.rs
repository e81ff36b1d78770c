//! Concurrent observation store.
//!
//! Two maps back the fusion engine:
//!
//! - `observations`: `(cell quadkey, sender id)` → latest observation.
//!   One slot per pair, so memory is bounded by active cells × active
//!   senders. Last write wins by arrival order.
//! - `present`: cell quadkey → latest-seen timestamp across all senders.
//!   Updated monotonically; used to size output grids and to
//!   garbage-collect cells that aged out of the window.
//!
//! Both maps use short `parking_lot::RwLock` critical sections. The
//! reducer works on a snapshot taken under the read lock, so a sweep
//! never skips or duplicates entries relative to its own start while
//! ingest keeps writing.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::core::{CellObservation, Nanos};

/// Store key: (grid-level cell quadkey, sender id).
pub type ObsKey = (String, i32);

#[derive(Default)]
pub struct ObservationStore {
    observations: RwLock<HashMap<ObsKey, CellObservation>>,
    present: RwLock<HashMap<String, Nanos>>,
}

impl ObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional upsert of the `(cell, sender)` slot.
    pub fn put(&self, cell_key: &str, sender_id: i32, obs: CellObservation) {
        self.observations
            .write()
            .insert((cell_key.to_owned(), sender_id), obs);
    }

    /// Snapshot of every `(cell key, observation)` entry at call time.
    pub fn snapshot(&self) -> Vec<(String, CellObservation)> {
        self.observations
            .read()
            .iter()
            .map(|((cell_key, _), obs)| (cell_key.clone(), obs.clone()))
            .collect()
    }

    /// Delete observations older than `max_age`. Returns the number
    /// evicted. Run after every reducer pass so the map never grows
    /// monotonically.
    pub fn evict_expired(&self, now: Nanos, max_age: Nanos) -> usize {
        let mut observations = self.observations.write();
        let before = observations.len();
        observations.retain(|_, obs| now.saturating_sub(obs.timestamp) <= max_age);
        before - observations.len()
    }

    /// Monotone present-cells update: keep the later timestamp.
    pub fn observe_latest(&self, cell_key: &str, ts: Nanos) {
        let mut present = self.present.write();
        match present.get_mut(cell_key) {
            Some(latest) if *latest >= ts => {}
            Some(latest) => *latest = ts,
            None => {
                present.insert(cell_key.to_owned(), ts);
            }
        }
    }

    /// Number of present cells under `parent_key` whose latest-seen
    /// timestamp is within `max_age`. Deletes stale entries under the
    /// parent as a side effect.
    pub fn sweep(&self, parent_key: &str, now: Nanos, max_age: Nanos) -> usize {
        let mut present = self.present.write();
        let mut fresh = 0;
        present.retain(|cell_key, latest| {
            if !cell_key.starts_with(parent_key) {
                return true;
            }
            if now.saturating_sub(*latest) <= max_age {
                fresh += 1;
                true
            } else {
                false
            }
        });
        fresh
    }

    pub fn len(&self) -> usize {
        self.observations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.read().is_empty()
    }

    #[cfg(test)]
    pub fn latest_seen(&self, cell_key: &str) -> Option<Nanos> {
        self.present.read().get(cell_key).copied()
    }
}
