use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use crate::models::intent::IntentKind;

/// Intents that have been queued for dispatch but not yet committed.
///
/// The evaluator is level-triggered, so until the dispatcher commits an
/// intent's key every tick recomputes it. Claims here keep those repeats off
/// the queue.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<Mutex<HashSet<(String, IntentKind)>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the intent is already queued or being delivered.
    pub fn try_claim(&self, trip_id: &str, kind: IntentKind) -> bool {
        self.lock().insert((trip_id.to_string(), kind))
    }

    pub fn release(&self, trip_id: &str, kind: IntentKind) {
        self.lock().remove(&(trip_id.to_string(), kind));
    }

    pub fn is_claimed(&self, trip_id: &str, kind: IntentKind) -> bool {
        self.lock().contains(&(trip_id.to_string(), kind))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<(String, IntentKind)>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
