//! Cooldown-deduplicated attendance writes.

use crate::db::{Store, StoreError};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Guards the `last_seen` map and the attendance insert behind one lock:
/// multiple recognition workers call [`mark`](AttendanceLedger::mark)
/// concurrently, possibly for the same identity.
///
/// The map is process-local and resets on restart; the attendance table
/// remains the source of truth. [`seed_from_store`](AttendanceLedger::seed_from_store)
/// preloads the latest row per guest to avoid duplicate bursts after a crash.
pub struct AttendanceLedger {
    store: Arc<Store>,
    cooldown: Duration,
    last_seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AttendanceLedger {
    pub fn new(store: Arc<Store>, cooldown: Duration) -> Self {
        Self {
            store,
            cooldown,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Preload the cooldown map from the most recent persisted row per guest.
    pub fn seed_from_store(&self) -> Result<usize, StoreError> {
        let latest = self.store.latest_attendance()?;
        let mut map = self.last_seen.lock().expect("ledger lock poisoned");
        let count = latest.len();
        for (guest_id, ts) in latest {
            map.insert(guest_id, ts);
        }
        tracing::info!(count, "seeded attendance cooldown map");
        Ok(count)
    }

    /// Record attendance for `guest_id` at `timestamp`, unless a record for
    /// the same identity was accepted within the cooldown window. The window
    /// is judged by the submitted timestamp against the previously *recorded*
    /// one, not by wall clock at insert, so backfilled submissions still
    /// dedup correctly.
    ///
    /// Returns `true` when a row was persisted, `false` on a cooldown no-op.
    pub fn mark(
        &self,
        guest_id: &str,
        timestamp: DateTime<Utc>,
        device_id: &str,
        method: &str,
    ) -> Result<bool, StoreError> {
        let mut map = self.last_seen.lock().expect("ledger lock poisoned");

        if let Some(prev) = map.get(guest_id) {
            if timestamp - *prev < self.cooldown {
                tracing::debug!(guest_id, "attendance within cooldown, skipping");
                return Ok(false);
            }
        }

        self.store.insert_attendance(guest_id, device_id, method, timestamp)?;
        map.insert(guest_id.to_string(), timestamp);
        tracing::info!(guest_id, %timestamp, device_id, method, "attendance marked");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ledger() -> AttendanceLedger {
        let store = Arc::new(Store::open_in_memory().unwrap());
        AttendanceLedger::new(store, Duration::seconds(30))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_within_cooldown_single_record() {
        let ledger = ledger();
        assert!(ledger.mark("g1", at(0), "LIFT", "Face").unwrap());
        assert!(!ledger.mark("g1", at(10), "LIFT", "Face").unwrap());

        let rows = ledger.store.recent_attendance(10).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_past_cooldown_two_records() {
        let ledger = ledger();
        assert!(ledger.mark("g1", at(0), "LIFT", "Face").unwrap());
        assert!(ledger.mark("g1", at(30), "LIFT", "Face").unwrap());

        let rows = ledger.store.recent_attendance(10).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_cooldown_is_per_identity() {
        let ledger = ledger();
        assert!(ledger.mark("g1", at(0), "LIFT", "Face").unwrap());
        assert!(ledger.mark("g2", at(1), "LIFT", "Face").unwrap());
    }

    #[test]
    fn test_backfilled_timestamp_honors_previous_record() {
        let ledger = ledger();
        assert!(ledger.mark("g1", at(100), "LIFT", "Face").unwrap());
        // Older than the recorded timestamp: difference is negative, well
        // inside the cooldown window.
        assert!(!ledger.mark("g1", at(80), "LIFT", "Face").unwrap());
    }

    #[test]
    fn test_seed_from_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.insert_attendance("g1", "LIFT", "Face", at(0)).unwrap();
        let ledger = AttendanceLedger::new(store, Duration::seconds(30));
        assert_eq!(ledger.seed_from_store().unwrap(), 1);
        // Seeded entry enforces the cooldown as if the process never restarted.
        assert!(!ledger.mark("g1", at(10), "LIFT", "Face").unwrap());
        assert!(ledger.mark("g1", at(40), "LIFT", "Face").unwrap());
    }

    #[test]
    fn test_unknown_identity_is_still_logged() {
        let ledger = ledger();
        assert!(ledger.mark("unknown", at(0), "LIFT", "Face").unwrap());
        let rows = ledger.store.recent_attendance(10).unwrap();
        assert_eq!(rows[0].guest_id, "unknown");
    }
}
