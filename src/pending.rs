use std::collections::HashMap;

/// An instance or request awaiting terminal metadata the dead snapshot
/// hasn't surfaced yet (spec section 3). Matching against the dead snapshot
/// is always by ID field equality, never by comparing this record to a bare
/// ID (spec section 9's resolved open question).
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub first_seen_at: i64,
    pub iterations: u32,
}

/// Two bounded sets - instances awaiting a termination reason, and requests
/// awaiting a fulfillment/failure classification - each entry retained for a
/// maximum iteration count (spec section 3, 4.2). A third bounded set tracks
/// instances whose `instance_terminated` has already fired but whose
/// matching spot request hasn't surfaced in `dead` yet, so the dependent
/// `spot_price_floor` event (spec section 8 invariant 3) is retried rather
/// than lost.
#[derive(Default)]
pub struct PendingResolutionTracker {
    instances: HashMap<String, PendingEntry>,
    requests: HashMap<String, PendingEntry>,
    price_floors: HashMap<String, PendingEntry>,
}

impl PendingResolutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_instance(&mut self, instance_id: String, now_ms: i64) {
        self.instances
            .entry(instance_id)
            .or_insert(PendingEntry { first_seen_at: now_ms, iterations: 0 });
    }

    pub fn enqueue_request(&mut self, request_id: String, now_ms: i64) {
        self.requests
            .entry(request_id)
            .or_insert(PendingEntry { first_seen_at: now_ms, iterations: 0 });
    }

    /// Enqueues an instance whose termination is already classified but whose
    /// `spot_price_floor` bid price isn't resolvable yet (its spot request
    /// hasn't appeared in `dead`). `now_ms` here is the original termination
    /// timestamp, not the enqueue time, so the eventual event keeps the time
    /// the instance actually departed.
    pub fn enqueue_price_floor(&mut self, instance_id: String, now_ms: i64) {
        self.price_floors
            .entry(instance_id)
            .or_insert(PendingEntry { first_seen_at: now_ms, iterations: 0 });
    }

    pub fn instance_entries(&self) -> impl Iterator<Item = (&String, &PendingEntry)> {
        self.instances.iter()
    }

    pub fn request_entries(&self) -> impl Iterator<Item = (&String, &PendingEntry)> {
        self.requests.iter()
    }

    pub fn price_floor_entries(&self) -> impl Iterator<Item = (&String, &PendingEntry)> {
        self.price_floors.iter()
    }

    /// Advances every entry's iteration count, dropping any that have
    /// outlived `max_iterations`. Resolved IDs (found with terminal metadata
    /// this round) are removed regardless of age. Builds the next-state maps
    /// rather than splicing in place (spec section 9).
    pub fn advance(&mut self, resolved_instances: &[String], resolved_requests: &[String], max_iterations: u32) {
        self.instances = Self::advance_one(std::mem::take(&mut self.instances), resolved_instances, max_iterations);
        self.requests = Self::advance_one(std::mem::take(&mut self.requests), resolved_requests, max_iterations);
    }

    /// Same discipline as `advance`, applied to the price-floor retry set.
    pub fn advance_price_floors(&mut self, resolved: &[String], max_iterations: u32) {
        self.price_floors = Self::advance_one(std::mem::take(&mut self.price_floors), resolved, max_iterations);
    }

    fn advance_one(
        current: HashMap<String, PendingEntry>,
        resolved: &[String],
        max_iterations: u32,
    ) -> HashMap<String, PendingEntry> {
        let mut next = HashMap::new();
        for (id, mut entry) in current {
            if resolved.contains(&id) {
                continue;
            }
            entry.iterations += 1;
            if entry.iterations > max_iterations {
                continue;
            }
            next.insert(id, entry);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_entries_are_dropped_regardless_of_age() {
        let mut tracker = PendingResolutionTracker::new();
        tracker.enqueue_instance("i-1".to_string(), 0);
        tracker.advance(&["i-1".to_string()], &[], 20);
        assert_eq!(tracker.instance_entries().count(), 0);
    }

    #[test]
    fn entries_drop_silently_past_the_retry_budget() {
        let mut tracker = PendingResolutionTracker::new();
        tracker.enqueue_request("sir-1".to_string(), 0);
        for _ in 0..20 {
            tracker.advance(&[], &[], 20);
        }
        assert_eq!(tracker.request_entries().count(), 0);
    }

    #[test]
    fn price_floor_entries_resolve_and_drop_independently_of_the_instance_set() {
        let mut tracker = PendingResolutionTracker::new();
        tracker.enqueue_price_floor("i-1".to_string(), 500);
        tracker.enqueue_instance("i-2".to_string(), 500);

        tracker.advance_price_floors(&["i-1".to_string()], 20);
        assert_eq!(tracker.price_floor_entries().count(), 0);
        // The unrelated instance-resolution entry is untouched by this call.
        assert_eq!(tracker.instance_entries().count(), 1);
    }

    #[test]
    fn entries_survive_within_budget() {
        let mut tracker = PendingResolutionTracker::new();
        tracker.enqueue_instance("i-1".to_string(), 0);
        for _ in 0..5 {
            tracker.advance(&[], &[], 20);
        }
        assert_eq!(tracker.instance_entries().count(), 1);
        let (_, entry) = tracker.instance_entries().next().unwrap();
        assert_eq!(entry.first_seen_at, 0);
        assert_eq!(entry.iterations, 5);
    }
}
