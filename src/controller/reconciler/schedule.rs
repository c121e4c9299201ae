//! # Schedule
//!
//! In-memory record of when each Kustomization is next due.
//!
//! Writing a status produces a watch event for the same resource. Without a
//! guard that event would start a full sync long before `spec.interval` has
//! elapsed. The watch loop consults this schedule for events that carry no
//! spec change and defers them until the resource is due, unless the event
//! was raised by a change to the referenced source or by a new `syncAt`
//! annotation value.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Events arriving this close to the due time run immediately
const DUE_TOLERANCE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
pub struct ReconcileSchedule {
    next_runs: Mutex<HashMap<String, Instant>>,
    source_triggers: Mutex<HashSet<String>>,
    sync_requests: Mutex<HashMap<String, String>>,
}

impl ReconcileSchedule {
    /// Record that `key` is next due after `delay`
    ///
    /// A delay too large to represent as an instant leaves the key unscheduled.
    pub fn schedule(&self, key: &str, delay: Duration) {
        let Ok(mut next_runs) = self.next_runs.lock() else {
            return;
        };
        match Instant::now().checked_add(delay) {
            Some(due) => {
                next_runs.insert(key.to_string(), due);
            }
            None => {
                next_runs.remove(key);
            }
        }
    }

    /// Forget the due time, e.g. when only a future change should trigger a run
    pub fn clear(&self, key: &str) {
        if let Ok(mut next_runs) = self.next_runs.lock() {
            next_runs.remove(key);
        }
    }

    /// Time left until `key` is due, `None` when it is due now or unknown
    #[must_use]
    pub fn time_until_due(&self, key: &str) -> Option<Duration> {
        let next_runs = self.next_runs.lock().ok()?;
        let due = *next_runs.get(key)?;
        let remaining = due.checked_duration_since(Instant::now())?;
        (remaining > DUE_TOLERANCE).then_some(remaining)
    }

    /// Mark `key` as triggered by its source
    pub fn mark_source_trigger(&self, key: &str) {
        if let Ok(mut triggers) = self.source_triggers.lock() {
            triggers.insert(key.to_string());
        }
    }

    /// Record the `syncAt` value seen for `key`
    ///
    /// Returns true when `value` is set and differs from the last one handled.
    pub fn observe_sync_request(&self, key: &str, value: Option<&str>) -> bool {
        let Ok(mut requests) = self.sync_requests.lock() else {
            return false;
        };
        match value {
            Some(value) => requests
                .insert(key.to_string(), value.to_string())
                .map_or(true, |previous| previous != value),
            None => {
                requests.remove(key);
                false
            }
        }
    }

    /// Consume a pending source trigger for `key`
    pub fn take_source_trigger(&self, key: &str) -> bool {
        self.source_triggers
            .lock()
            .map(|mut triggers| triggers.remove(key))
            .unwrap_or(false)
    }
}
