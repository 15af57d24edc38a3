use crate::in_flight::InFlightTracker;
use crate::snapshot::FleetSnapshot;
use crate::worker_type::WorkerTypeDef;

/// Current provisioned capacity for a worker-type: instances + open
/// requests + in-flight bids, each counted via the worker-type's
/// `capacity_of` (which itself falls back to 1 for unknown instance types)
/// (spec section 4.4).
pub fn current_capacity(def: &WorkerTypeDef, snapshot: &FleetSnapshot, in_flight: &InFlightTracker) -> u32 {
    let from_instances: u32 = snapshot
        .instances_for(&def.name)
        .map(|i| def.capacity_of(&i.instance_type))
        .sum();
    let from_requests: u32 = snapshot
        .requests_for(&def.name)
        .map(|r| def.capacity_of(&r.instance_type))
        .sum();
    let from_in_flight: u32 = in_flight
        .for_worker_type(&def.name)
        .map(|r| def.capacity_of(&r.instance_type))
        .sum();
    from_instances + from_requests + from_in_flight
}

/// Target capacity per spec section 4.4: `ceil(pending_tasks /
/// scaling_ratio)` when `scaling_ratio > 0`, else `pending_tasks` directly;
/// clamped to `[min_capacity, max_capacity]`. This follows the formula as
/// stated (and its restatement in section 3's "target pending-tasks ~= r *
/// provisioned-capacity" definition of `scaling_ratio`) rather than the
/// worked cold-start example's arithmetic, which divides by the ratio
/// instead and does not reduce to the same number; see the grounding
/// ledger for the recorded decision.
pub fn target_capacity(def: &WorkerTypeDef, pending_tasks: u64) -> u32 {
    let raw = if def.scaling_ratio > 0.0 {
        (pending_tasks as f64 / def.scaling_ratio).ceil() as u64
    } else {
        pending_tasks
    };
    let clamped = raw.clamp(def.min_capacity as u64, def.max_capacity as u64);
    clamped as u32
}

/// `max(0, target - current)`.
pub fn delta_to_provision(current: u32, target: u32) -> u32 {
    target.saturating_sub(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_type::test_support::fixture;

    #[test]
    fn target_uses_ceil_division_by_scaling_ratio() {
        let def = fixture("w", 2, 10, 0.5);
        assert_eq!(target_capacity(&def, 10), 10); // ceil(10/0.5)=20 clamped to 10
        let def2 = fixture("w", 2, 50, 0.5);
        assert_eq!(target_capacity(&def2, 9), 18);
    }

    #[test]
    fn target_clamps_to_min_when_pending_is_zero() {
        let def = fixture("w", 2, 10, 0.5);
        assert_eq!(target_capacity(&def, 0), 2);
    }

    #[test]
    fn zero_scaling_ratio_targets_pending_tasks_directly() {
        let def = fixture("w", 0, 100, 0.0);
        assert_eq!(target_capacity(&def, 7), 7);
    }

    #[test]
    fn delta_never_negative() {
        assert_eq!(delta_to_provision(10, 5), 0);
        assert_eq!(delta_to_provision(2, 5), 3);
    }
}
