use crate::events::{Event, EventSink};
use crate::snapshot::FleetSnapshot;
use std::collections::HashMap;
use std::time::Duration;

/// A submitted bid whose request ID has not yet appeared in a snapshot
/// (spec section 3).
#[derive(Debug, Clone)]
pub struct InFlightRecord {
    pub request_id: String,
    pub worker_type: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub bid_price: f64,
    pub submitted_at: i64,
}

/// Process-local set bridging the eventual-consistency gap between "bid
/// submitted" and "bid visible" (spec section 4.3). Owned exclusively by the
/// reconciler; never persisted (spec section 1's non-goals).
#[derive(Default)]
pub struct InFlightTracker {
    entries: HashMap<String, InFlightRecord>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: InFlightRecord) {
        self.entries.insert(record.request_id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn for_worker_type<'a>(&'a self, worker_type: &'a str) -> impl Iterator<Item = &'a InFlightRecord> {
        self.entries.values().filter(move |r| r.worker_type == worker_type)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    /// Drops a single entry immediately, for when the reconciler decides to
    /// kill an in-flight bid itself rather than waiting for the next sweep
    /// to notice it never showed up.
    pub fn remove(&mut self, request_id: &str) -> Option<InFlightRecord> {
        self.entries.remove(request_id)
    }

    /// Distinct worker-types with at least one in-flight bid. Used by the
    /// rogue killer, which needs to know about worker-types the tracker
    /// knows about even before they show up in a snapshot.
    pub fn worker_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.values().map(|r| r.worker_type.clone()).collect();
        types.sort();
        types.dedup();
        types
    }

    /// Removes every entry that either (a) now appears in `current` - the
    /// "it became visible" transition, emitting `bid_visibility_lag` - or
    /// (b) has outlived `timeout`, also emitting `bid_visibility_lag` with
    /// `did_show=false`. Removal is idempotent: calling this twice on an
    /// unchanged snapshot has no further effect.
    ///
    /// Builds the next-state map rather than splicing the current one in
    /// place, per the source's "mutation-during-iteration" pitfall (spec
    /// section 9) - the live set is swapped in only once the sweep is done.
    pub async fn sweep(&mut self, current: &FleetSnapshot, timeout: Duration, now_ms: i64, sink: &dyn EventSink) {
        let mut next = HashMap::new();
        for (id, record) in self.entries.drain() {
            if current.find_request(&id).is_some() {
                let lag_ms = now_ms.saturating_sub(record.submitted_at);
                sink.emit(Event::BidVisibilityLag {
                    request_id: id,
                    worker_type: record.worker_type,
                    lag_ms,
                    did_show: true,
                    at_ms: now_ms,
                })
                .await;
                continue;
            }

            let age_ms = now_ms.saturating_sub(record.submitted_at);
            if age_ms > timeout.as_millis() as i64 {
                sink.emit(Event::BidVisibilityLag {
                    request_id: id,
                    worker_type: record.worker_type,
                    lag_ms: age_ms,
                    did_show: false,
                    at_ms: now_ms,
                })
                .await;
                continue;
            }

            next.insert(id, record);
        }
        self.entries = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::RecordingEventSink;
    use crate::snapshot::SpotRequest;
    use crate::cloud::{RequestState, StatusCode};

    fn record(id: &str, submitted_at: i64) -> InFlightRecord {
        InFlightRecord {
            request_id: id.to_string(),
            worker_type: "w".to_string(),
            region: "us-east-1".to_string(),
            zone: "us-east-1a".to_string(),
            instance_type: "t.small".to_string(),
            bid_price: 0.05,
            submitted_at,
        }
    }

    fn snapshot_with(ids: &[&str]) -> FleetSnapshot {
        let requests = ids
            .iter()
            .map(|id| SpotRequest {
                request_id: id.to_string(),
                region: "us-east-1".to_string(),
                zone: "us-east-1a".to_string(),
                worker_type: "w".to_string(),
                instance_type: "t.small".to_string(),
                image_id: "ami-1".to_string(),
                create_time: 0,
                state: RequestState::Open,
                status_code: StatusCode::PendingEvaluation,
                status_update_time: 0,
                bid_price: 0.05,
                instance_id: None,
            })
            .collect();
        FleetSnapshot::new(Vec::new(), requests)
    }

    #[tokio::test]
    async fn visible_entries_are_removed_and_emit_lag() {
        let mut tracker = InFlightTracker::new();
        tracker.insert(record("sir-1", 0));
        tracker.insert(record("sir-2", 0));
        let snap = snapshot_with(&["sir-1"]);
        let sink = RecordingEventSink::default();

        tracker.sweep(&snap, Duration::from_secs(900), 1000, &sink).await;

        assert_eq!(tracker.len(), 1);
        assert!(tracker.contains("sir-2"));
        assert_eq!(sink.events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn timed_out_entries_are_dropped() {
        let mut tracker = InFlightTracker::new();
        tracker.insert(record("sir-1", 0));
        let snap = snapshot_with(&[]);
        let sink = RecordingEventSink::default();

        tracker
            .sweep(&snap, Duration::from_secs(60), 120_000, &sink)
            .await;

        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn sweeping_twice_is_idempotent() {
        let mut tracker = InFlightTracker::new();
        tracker.insert(record("sir-1", 0));
        let snap = snapshot_with(&["sir-1"]);
        let sink = RecordingEventSink::default();

        tracker.sweep(&snap, Duration::from_secs(900), 1000, &sink).await;
        tracker.sweep(&snap, Duration::from_secs(900), 2000, &sink).await;

        assert!(tracker.is_empty());
        // Second sweep found nothing left to act on.
        assert_eq!(sink.events.lock().await.len(), 1);
    }
}
