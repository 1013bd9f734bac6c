//! Per-key in-flight guard for lazy computations
//!
//! Two callers asking for the same missing (cluster, field) at once must not
//! both compute it. Each key gets a slot mutex; the first caller holds it
//! while computing and later callers block on it, then find the value cached.

use clusterstore_core::ClusterId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

type Slot = Arc<Mutex<()>>;

/// Slot registry keyed by (cluster, field)
#[derive(Debug, Default)]
pub struct InFlight {
    slots: Mutex<FxHashMap<(ClusterId, String), Slot>>,
}

impl InFlight {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for a key, created on first use
    ///
    /// Lock the returned mutex for the duration of the computation.
    pub fn slot(&self, cluster: ClusterId, field: &str) -> Slot {
        let mut slots = self.slots.lock();
        slots
            .entry((cluster, field.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Check if a key is being computed right now
    pub fn is_busy(&self, cluster: ClusterId, field: &str) -> bool {
        self.slots
            .lock()
            .get(&(cluster, field.to_string()))
            .map_or(false, |slot| slot.is_locked())
    }

    /// Drop the idle slots of a cluster
    pub fn forget(&self, cluster: ClusterId) {
        self.slots
            .lock()
            .retain(|(c, _), slot| *c != cluster || slot.is_locked());
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Check if no slot exists
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
