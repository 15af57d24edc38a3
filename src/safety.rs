use crate::bidder::execute_kill_plan;
use crate::cloud::CloudAdapter;
use crate::error::Result;
use crate::in_flight::InFlightTracker;
use crate::keypair::KeyPairManager;
use crate::snapshot::FleetSnapshot;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Every worker-type observed in snapshot state (instances, requests, or
/// in-flight) that is not in `configured` is rogue (spec section 4.6). An
/// empty `configured` set means every observed worker-type is rogue - the
/// documented global-stop behavior.
fn rogue_worker_types(snapshot: &FleetSnapshot, in_flight: &InFlightTracker, configured: &HashSet<String>) -> HashSet<String> {
    let mut observed = HashSet::new();
    for i in snapshot.instances() {
        observed.insert(i.worker_type.clone());
    }
    for r in snapshot.requests() {
        observed.insert(r.worker_type.clone());
    }
    for r in in_flight_worker_types(in_flight) {
        observed.insert(r);
    }
    observed.difference(configured).cloned().collect()
}

fn in_flight_worker_types(in_flight: &InFlightTracker) -> Vec<String> {
    // InFlightTracker doesn't expose a flat iterator by design (callers are
    // expected to go through `for_worker_type`); the rogue killer is one of
    // the few places that needs every worker-type it currently knows about.
    in_flight.worker_types()
}

/// Cancels every rogue worker-type's requests, terminates its instances, and
/// deletes its key pair in every allowed region. Kill/cancel failures are
/// logged and left for the next iteration to retry (spec section 7).
pub async fn run_rogue_killer(
    adapter: &dyn CloudAdapter,
    key_prefix: &str,
    allowed_regions: &[String],
    snapshot: &FleetSnapshot,
    in_flight: &InFlightTracker,
    configured: &HashSet<String>,
    key_pairs: &KeyPairManager,
    dry_run: bool,
) -> Result<usize> {
    let rogue = rogue_worker_types(snapshot, in_flight, configured);

    for worker_type in &rogue {
        let mut requests_by_region: HashMap<String, Vec<String>> = HashMap::new();
        for r in snapshot.requests_for(worker_type) {
            requests_by_region.entry(r.region.clone()).or_default().push(r.request_id.clone());
        }
        let mut instances_by_region: HashMap<String, Vec<String>> = HashMap::new();
        for i in snapshot.instances_for(worker_type) {
            instances_by_region.entry(i.region.clone()).or_default().push(i.instance_id.clone());
        }

        let plan = crate::bidder::KillPlan {
            in_flight_request_ids: Vec::new(),
            requests_by_region,
            instances_by_region,
        };
        execute_kill_plan(adapter, &plan, dry_run).await?;

        let key_name = format!("{key_prefix}{worker_type}");
        if dry_run {
            tracing::info!(worker_type, "DRY RUN: would delete key pair in all allowed regions");
        } else {
            for region in allowed_regions {
                if let Err(e) = adapter.delete_key_pair(region, &key_name).await {
                    tracing::warn!(worker_type, region, error = %e, "deleteKeyPair failed; will retry next iteration");
                }
            }
            key_pairs.forget(worker_type).await;
        }

        tracing::warn!(worker_type, "rogue worker-type cleaned up");
    }

    Ok(rogue.len())
}

/// Terminates instances whose `launch_time` precedes `now - max_instance_life`;
/// instances with no `launch_time` are ignored (spec section 4.6).
pub async fn run_age_killer(
    adapter: &dyn CloudAdapter,
    snapshot: &FleetSnapshot,
    max_instance_life: Duration,
    now_ms: i64,
    dry_run: bool,
) -> Result<usize> {
    let cutoff_ms = now_ms.saturating_sub(max_instance_life.as_millis() as i64);

    let mut by_region: HashMap<String, Vec<String>> = HashMap::new();
    for i in snapshot.instances() {
        let Some(launch_time) = i.launch_time else { continue };
        if launch_time < cutoff_ms {
            by_region.entry(i.region.clone()).or_default().push(i.instance_id.clone());
        }
    }

    let total: usize = by_region.values().map(|v| v.len()).sum();
    if total == 0 {
        return Ok(0);
    }

    if dry_run {
        tracing::info!(count = total, "DRY RUN: would terminate over-age instances");
        return Ok(total);
    }

    for (region, ids) in &by_region {
        if let Err(e) = adapter.terminate_instances(region, ids).await {
            tracing::warn!(region, error = %e, count = ids.len(), "age killer terminateInstances failed; will retry next iteration");
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloudAdapter;
    use crate::cloud::{InstanceState, RequestState, StatusCode};
    use crate::snapshot::{Instance, SpotRequest};

    fn instance(id: &str, worker_type: &str, region: &str, launch_time: Option<i64>) -> Instance {
        Instance {
            instance_id: id.to_string(),
            region: region.to_string(),
            zone: format!("{region}a"),
            worker_type: worker_type.to_string(),
            instance_type: "t.small".to_string(),
            image_id: "ami-1".to_string(),
            launch_time,
            state: InstanceState::Running,
            spot_request_id: None,
            state_reason: None,
            key_name: format!("fleet-{worker_type}"),
        }
    }

    fn request(id: &str, worker_type: &str, region: &str) -> SpotRequest {
        SpotRequest {
            request_id: id.to_string(),
            region: region.to_string(),
            zone: format!("{region}a"),
            worker_type: worker_type.to_string(),
            instance_type: "t.small".to_string(),
            image_id: "ami-1".to_string(),
            create_time: 0,
            state: RequestState::Open,
            status_code: StatusCode::PendingEvaluation,
            status_update_time: 0,
            bid_price: 0.05,
            instance_id: None,
        }
    }

    #[tokio::test]
    async fn rogue_worker_type_is_fully_cleaned_up() {
        let snapshot = FleetSnapshot::new(
            vec![instance("i-1", "legacy", "us-east-1", Some(0))],
            vec![request("sir-1", "legacy", "us-east-1")],
        );
        let adapter = MockCloudAdapter::new();
        adapter.key_pairs.lock().unwrap().insert("us-east-1".to_string(), vec!["fleet-legacy".to_string()]);
        let in_flight = InFlightTracker::new();
        let configured: HashSet<String> = ["modern".to_string()].into_iter().collect();
        let key_pairs = KeyPairManager::new();

        let count = run_rogue_killer(
            &adapter,
            "fleet-",
            &["us-east-1".to_string()],
            &snapshot,
            &in_flight,
            &configured,
            &key_pairs,
            false,
        )
        .await
        .unwrap();

        assert_eq!(count, 1);
        assert_eq!(adapter.terminated.lock().unwrap().len(), 1);
        assert_eq!(adapter.cancelled.lock().unwrap().len(), 1);
        assert_eq!(adapter.keys_deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_configured_set_kills_everything() {
        let snapshot = FleetSnapshot::new(vec![instance("i-1", "anything", "us-east-1", Some(0))], vec![]);
        let adapter = MockCloudAdapter::new();
        let in_flight = InFlightTracker::new();
        let configured = HashSet::new();
        let key_pairs = KeyPairManager::new();

        let count = run_rogue_killer(&adapter, "fleet-", &["us-east-1".to_string()], &snapshot, &in_flight, &configured, &key_pairs, false)
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(adapter.terminated.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rogue_killer_is_idempotent() {
        let snapshot = FleetSnapshot::new(vec![], vec![]);
        let adapter = MockCloudAdapter::new();
        let in_flight = InFlightTracker::new();
        let configured: HashSet<String> = ["modern".to_string()].into_iter().collect();
        let key_pairs = KeyPairManager::new();

        let first = run_rogue_killer(&adapter, "fleet-", &[], &snapshot, &in_flight, &configured, &key_pairs, false).await.unwrap();
        let second = run_rogue_killer(&adapter, "fleet-", &[], &snapshot, &in_flight, &configured, &key_pairs, false).await.unwrap();

        assert_eq!(first, 0);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn age_killer_only_terminates_over_age_instances() {
        let hundred_hours_ago = -(100 * 3600 * 1000);
        let twenty_hours_ago = -(20 * 3600 * 1000);
        let snapshot = FleetSnapshot::new(
            vec![
                instance("i-old", "w", "us-east-1", Some(hundred_hours_ago)),
                instance("i-young", "w", "us-east-1", Some(twenty_hours_ago)),
            ],
            vec![],
        );
        let adapter = MockCloudAdapter::new();

        let count = run_age_killer(&adapter, &snapshot, Duration::from_secs(96 * 3600), 0, false).await.unwrap();

        assert_eq!(count, 1);
        let terminated = adapter.terminated.lock().unwrap();
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0].1, "i-old");
    }

    #[tokio::test]
    async fn age_killer_ignores_instances_with_no_launch_time() {
        let snapshot = FleetSnapshot::new(vec![instance("i-1", "w", "us-east-1", None)], vec![]);
        let adapter = MockCloudAdapter::new();

        let count = run_age_killer(&adapter, &snapshot, Duration::from_secs(1), 1_000_000, false).await.unwrap();

        assert_eq!(count, 0);
    }
}
