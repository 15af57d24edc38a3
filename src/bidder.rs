use crate::cloud::{CloudAdapter, SpotRequestParams};
use crate::error::Result;
use crate::events::{Event, EventSink};
use crate::in_flight::{InFlightRecord, InFlightTracker};
use crate::pricing::PricingOracle;
use crate::worker_type::WorkerTypeDef;
use rand::seq::SliceRandom;
use std::cmp::Ordering;

/// One (region, zone, instance-type) the bidder can choose to bid into,
/// already priced and utility-normalized (spec section 4.4).
///
/// Validity and ranking both operate on `effective_price = raw_price /
/// utility`: the contract that `min_price`/`max_price` are expressed in
/// utility-normalized units means a candidate is valid exactly when
/// `min_price <= effective_price <= max_price`, and the actual dollar
/// amount submitted to the cloud is the *raw* price - multiplying the
/// normalized price back out by utility recovers it, which is the "actual
/// bid = price_bound * utility" contract spelled out in the spec.
#[derive(Debug, Clone)]
struct Candidate {
    region: String,
    zone: String,
    instance_type: String,
    capacity: u32,
    raw_price: f64,
    effective_price: f64,
    key_name: String,
}

fn zones_for(region_overrides: &serde_json::Value, region: &str) -> Vec<String> {
    region_overrides
        .get("zones")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|z| z.as_str().map(str::to_string)).collect())
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| vec![format!("{region}a")])
}

async fn build_candidates(
    def: &WorkerTypeDef,
    key_name: &str,
    pricing: &dyn PricingOracle,
) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();
    for region_spec in &def.regions {
        let zones = zones_for(&region_spec.overrides, &region_spec.region);
        for zone in &zones {
            for it in &def.instance_types {
                let raw_price = match pricing.recent_spot(&region_spec.region, &it.instance_type, zone).await? {
                    Some(p) => p,
                    None => def.max_price * it.utility,
                };
                let effective_price = raw_price / it.utility;
                if effective_price < def.min_price || effective_price > def.max_price {
                    continue;
                }
                out.push(Candidate {
                    region: region_spec.region.clone(),
                    zone: zone.clone(),
                    instance_type: it.instance_type.clone(),
                    capacity: it.capacity,
                    raw_price,
                    effective_price,
                    key_name: key_name.to_string(),
                });
            }
        }
    }
    Ok(out)
}

/// Minimizes effective price, ties broken by lower instance-type capacity
/// first (granular bids), then region alphabetically.
fn pick_best(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().min_by(|a, b| {
        a.effective_price
            .partial_cmp(&b.effective_price)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.capacity.cmp(&b.capacity))
            .then_with(|| a.region.cmp(&b.region))
    })
}

/// Places bids one at a time until `delta` capacity units are covered,
/// recording each into the In-Flight Tracker immediately after submission
/// (spec section 4.4, invariant 2). Returns the number of bids placed.
#[allow(clippy::too_many_arguments)]
pub async fn bid_to_cover_delta(
    adapter: &dyn CloudAdapter,
    def: &WorkerTypeDef,
    key_name: &str,
    mut delta: u32,
    pricing: &dyn PricingOracle,
    in_flight: &mut InFlightTracker,
    now_ms: i64,
    dry_run: bool,
    sink: &dyn EventSink,
) -> Result<usize> {
    if delta == 0 {
        return Ok(0);
    }

    let candidates = build_candidates(def, key_name, pricing).await?;
    if candidates.is_empty() {
        tracing::warn!(worker_type = %def.name, "no valid (region, zone, instance-type) candidate within price bounds");
        return Ok(0);
    }

    let mut placed = 0usize;
    while delta > 0 {
        let Some(best) = pick_best(&candidates) else {
            break;
        };

        if dry_run {
            tracing::info!(
                worker_type = %def.name,
                region = %best.region,
                zone = %best.zone,
                instance_type = %best.instance_type,
                bid_price = best.raw_price,
                "DRY RUN: would submit spot bid"
            );
            delta = delta.saturating_sub(best.capacity);
            placed += 1;
            continue;
        }

        let params = SpotRequestParams {
            region: best.region.clone(),
            zone: best.zone.clone(),
            instance_type: best.instance_type.clone(),
            image_id: def
                .shared_launch_spec
                .get("imageId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            bid_price: best.raw_price,
            key_name: best.key_name.clone(),
            launch_spec: def.shared_launch_spec.clone(),
        };

        let request_id = adapter.request_spot(&params).await?;

        in_flight.insert(InFlightRecord {
            request_id: request_id.clone(),
            worker_type: def.name.clone(),
            region: best.region.clone(),
            zone: best.zone.clone(),
            instance_type: best.instance_type.clone(),
            bid_price: best.raw_price,
            submitted_at: now_ms,
        });

        sink.emit(Event::RequestSubmitted {
            request_id,
            worker_type: def.name.clone(),
            region: best.region.clone(),
            zone: best.zone.clone(),
            instance_type: best.instance_type.clone(),
            bid_price: best.raw_price,
            at_ms: now_ms,
        })
        .await;

        if !params.image_id.is_empty() {
            sink.emit(Event::AmiUsage {
                worker_type: def.name.clone(),
                region: best.region.clone(),
                image_id: params.image_id.clone(),
                at_ms: now_ms,
            })
            .await;
        }

        delta = delta.saturating_sub(best.capacity);
        placed += 1;
    }

    Ok(placed)
}

/// A batched kill plan for one worker-type's excess capacity, grouped per
/// region so the caller issues one `cancelSpotRequests` and one
/// `terminateInstances` call per region (spec section 4.4).
#[derive(Debug, Default)]
pub struct KillPlan {
    pub in_flight_request_ids: Vec<String>,
    pub requests_by_region: std::collections::HashMap<String, Vec<String>>,
    pub instances_by_region: std::collections::HashMap<String, Vec<String>>,
}

pub struct KillCandidateInstance {
    pub instance_id: String,
    pub region: String,
    pub capacity: u32,
}

pub struct KillCandidateRequest {
    pub request_id: String,
    pub region: String,
    pub capacity: u32,
}

/// Builds the kill order (in-flight first, then shuffled open requests, then
/// shuffled instances) and stops as soon as removing the next candidate
/// would push capacity below `min_capacity`, unless `full_shutdown` is set
/// (spec section 4.4). Shuffling uses a uniform random order so kills don't
/// systematically drain one zone/region (spec section 9).
pub fn plan_kill(
    def: &WorkerTypeDef,
    current_capacity: u32,
    in_flight: &[(String, u32)], // (request_id, capacity)
    mut open_requests: Vec<KillCandidateRequest>,
    mut instances: Vec<KillCandidateInstance>,
    full_shutdown: bool,
) -> KillPlan {
    let mut rng = rand::thread_rng();
    open_requests.shuffle(&mut rng);
    instances.shuffle(&mut rng);

    let floor = if full_shutdown { 0 } else { def.min_capacity };
    let target_max = if full_shutdown { 0 } else { def.max_capacity };

    let mut plan = KillPlan::default();
    let mut remaining = current_capacity;

    for (request_id, capacity) in in_flight {
        if remaining <= target_max {
            break;
        }
        if remaining.saturating_sub(*capacity) < floor && !full_shutdown {
            break;
        }
        plan.in_flight_request_ids.push(request_id.clone());
        remaining = remaining.saturating_sub(*capacity);
    }

    for req in &open_requests {
        if remaining <= target_max {
            break;
        }
        if remaining.saturating_sub(req.capacity) < floor && !full_shutdown {
            break;
        }
        plan.requests_by_region.entry(req.region.clone()).or_default().push(req.request_id.clone());
        remaining = remaining.saturating_sub(req.capacity);
    }

    for inst in &instances {
        if remaining <= target_max {
            break;
        }
        if remaining.saturating_sub(inst.capacity) < floor && !full_shutdown {
            break;
        }
        plan.instances_by_region.entry(inst.region.clone()).or_default().push(inst.instance_id.clone());
        remaining = remaining.saturating_sub(inst.capacity);
    }

    plan
}

/// Executes a kill plan: one batched `cancelSpotRequests` and one batched
/// `terminateInstances` call per region. In-flight request cancellation
/// leaves tracker cleanup to the caller (the in-flight tracker is swept by
/// the reconciler, not mutated here, keeping the build-then-swap discipline
/// in one place).
pub async fn execute_kill_plan(adapter: &dyn CloudAdapter, plan: &KillPlan, dry_run: bool) -> Result<()> {
    if dry_run {
        tracing::info!(
            in_flight = plan.in_flight_request_ids.len(),
            requests = plan.requests_by_region.values().map(|v| v.len()).sum::<usize>(),
            instances = plan.instances_by_region.values().map(|v| v.len()).sum::<usize>(),
            "DRY RUN: would execute kill plan"
        );
        return Ok(());
    }

    for (region, ids) in &plan.requests_by_region {
        if let Err(e) = adapter.cancel_spot_requests(region, ids).await {
            tracing::warn!(region, error = %e, count = ids.len(), "cancelSpotRequests failed; will retry next iteration");
        }
    }
    for (region, ids) in &plan.instances_by_region {
        if let Err(e) = adapter.terminate_instances(region, ids).await {
            tracing::warn!(region, error = %e, count = ids.len(), "terminateInstances failed; will retry next iteration");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloudAdapter;
    use crate::events::test_support::RecordingEventSink;
    use crate::pricing::test_support::FixedPricing;
    use crate::worker_type::test_support::fixture;

    #[tokio::test]
    async fn cold_start_places_five_one_capacity_bids() {
        // A delta of 5, one capacity unit per instance-type, should place exactly 5 bids.
        let def = fixture("w", 2, 5, 0.5);
        let adapter = MockCloudAdapter::new();
        let pricing = FixedPricing::new();
        pricing.set("us-east-1", "t.small", "us-east-1a", 0.02).await;
        let sink = RecordingEventSink::default();
        let mut in_flight = InFlightTracker::new();

        let placed = bid_to_cover_delta(&adapter, &def, "fleet-w", 5, &pricing, &mut in_flight, 1000, false, &sink)
            .await
            .unwrap();

        assert_eq!(placed, 5);
        assert_eq!(in_flight.len(), 5);
        assert_eq!(adapter.bids_submitted.lock().unwrap().len(), 5);
        assert_eq!(sink.events.lock().await.len(), 5);
    }

    #[tokio::test]
    async fn dry_run_does_not_submit_or_track() {
        let def = fixture("w", 2, 5, 0.5);
        let adapter = MockCloudAdapter::new();
        let pricing = FixedPricing::new();
        let sink = RecordingEventSink::default();
        let mut in_flight = InFlightTracker::new();

        let placed = bid_to_cover_delta(&adapter, &def, "fleet-w", 3, &pricing, &mut in_flight, 1000, true, &sink)
            .await
            .unwrap();

        assert_eq!(placed, 3);
        assert!(in_flight.is_empty());
        assert!(adapter.bids_submitted.lock().unwrap().is_empty());
    }

    #[test]
    fn kill_plan_stops_before_dropping_below_min_capacity() {
        let def = fixture("w", 3, 3, 0.5); // max == min, so any excess must be trimmed to exactly 3
        let instances = vec![
            KillCandidateInstance { instance_id: "i-1".into(), region: "us-east-1".into(), capacity: 1 },
            KillCandidateInstance { instance_id: "i-2".into(), region: "us-east-1".into(), capacity: 1 },
        ];
        let plan = plan_kill(&def, 4, &[], vec![], instances, false);
        assert_eq!(plan.instances_by_region.values().map(|v| v.len()).sum::<usize>(), 1);
    }

    #[test]
    fn full_shutdown_ignores_min_capacity() {
        let def = fixture("w", 3, 3, 0.5);
        let instances = vec![
            KillCandidateInstance { instance_id: "i-1".into(), region: "us-east-1".into(), capacity: 1 },
            KillCandidateInstance { instance_id: "i-2".into(), region: "us-east-1".into(), capacity: 1 },
        ];
        let plan = plan_kill(&def, 2, &[], vec![], instances, true);
        assert_eq!(plan.instances_by_region.values().map(|v| v.len()).sum::<usize>(), 2);
    }

    #[test]
    fn kill_order_prefers_in_flight_then_requests_then_instances() {
        let def = fixture("w", 0, 0, 0.5);
        let in_flight = vec![("sir-if".to_string(), 1u32)];
        let requests = vec![KillCandidateRequest { request_id: "sir-1".into(), region: "us-east-1".into(), capacity: 1 }];
        let instances = vec![KillCandidateInstance { instance_id: "i-1".into(), region: "us-east-1".into(), capacity: 1 }];
        let plan = plan_kill(&def, 1, &in_flight, requests, instances, true);
        assert_eq!(plan.in_flight_request_ids, vec!["sir-if".to_string()]);
        assert!(plan.requests_by_region.is_empty());
        assert!(plan.instances_by_region.is_empty());
    }
}
