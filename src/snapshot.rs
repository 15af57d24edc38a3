use crate::cloud::{
    CloudAdapter, InstanceState, RawInstance, RawSpotRequest, RequestState, StateReason, StatusCode,
};
use crate::config::ProvisionerConfig;
use crate::error::{ProvisionerError, Result};
use futures::stream::{self, StreamExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Instance {
    pub instance_id: String,
    pub region: String,
    pub zone: String,
    pub worker_type: String,
    pub instance_type: String,
    pub image_id: String,
    pub launch_time: Option<i64>,
    pub state: InstanceState,
    pub spot_request_id: Option<String>,
    pub state_reason: Option<StateReason>,
    pub key_name: String,
}

#[derive(Debug, Clone)]
pub struct SpotRequest {
    pub request_id: String,
    pub region: String,
    pub zone: String,
    pub worker_type: String,
    pub instance_type: String,
    pub image_id: String,
    pub create_time: i64,
    pub state: RequestState,
    pub status_code: StatusCode,
    pub status_update_time: i64,
    pub bid_price: f64,
    pub instance_id: Option<String>,
}

/// Strips `key_prefix` from `key_name`, returning `None` when it doesn't
/// match (spec 3: "an instance/request whose `key_name` does not match the
/// prefix is not in the snapshot").
fn worker_type_of<'a>(key_name: &'a str, key_prefix: &str) -> Option<&'a str> {
    key_name.strip_prefix(key_prefix).filter(|s| !s.is_empty())
}

fn classify_instance(raw: RawInstance, key_prefix: &str) -> Option<Instance> {
    let worker_type = worker_type_of(&raw.key_name, key_prefix)?.to_string();
    Some(Instance {
        instance_id: raw.instance_id,
        region: raw.region,
        zone: raw.zone,
        worker_type,
        instance_type: raw.instance_type,
        image_id: raw.image_id,
        launch_time: raw.launch_time,
        state: raw.state,
        spot_request_id: raw.spot_request_id,
        state_reason: raw.state_reason,
        key_name: raw.key_name,
    })
}

fn classify_request(raw: RawSpotRequest, key_prefix: &str) -> Option<SpotRequest> {
    let worker_type = worker_type_of(&raw.key_name, key_prefix)?.to_string();
    Some(SpotRequest {
        request_id: raw.request_id,
        region: raw.region,
        zone: raw.zone,
        worker_type,
        instance_type: raw.instance_type,
        image_id: raw.image_id,
        create_time: raw.create_time,
        state: raw.state,
        status_code: raw.status_code,
        status_update_time: raw.status_update_time,
        bid_price: raw.bid_price,
        instance_id: raw.instance_id,
    })
}

/// Immutable normalized view of one cloud observation (spec section 3).
/// Built once per iteration and never mutated afterward; only the most
/// recent two snapshots are retained by the caller.
#[derive(Debug, Clone, Default)]
pub struct FleetSnapshot {
    instances: Vec<Instance>,
    requests: Vec<SpotRequest>,
}

impl FleetSnapshot {
    pub fn new(instances: Vec<Instance>, requests: Vec<SpotRequest>) -> Self {
        Self { instances, requests }
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn requests(&self) -> &[SpotRequest] {
        &self.requests
    }

    pub fn instances_for(&self, worker_type: &str) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(move |i| i.worker_type == worker_type)
    }

    pub fn requests_for(&self, worker_type: &str) -> impl Iterator<Item = &SpotRequest> {
        self.requests.iter().filter(move |r| r.worker_type == worker_type)
    }

    pub fn find_instance(&self, instance_id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.instance_id == instance_id)
    }

    pub fn find_request(&self, request_id: &str) -> Option<&SpotRequest> {
        self.requests.iter().find(|r| r.request_id == request_id)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

/// A request bisected out of the open set for being unlikely to fill (spec 4.1).
pub fn is_stalled(req: &RawSpotRequest, stall_timeout: Duration) -> bool {
    if req.status_code.is_bad() {
        return true;
    }
    let age_ms = now_ms().saturating_sub(req.create_time);
    age_ms > stall_timeout.as_millis() as i64
}

/// Result of one round of the four parallel cloud-API queries + classification
/// + stalled-request bisection, across every allowed region.
pub struct RawObservation {
    pub live: Vec<RawInstance>,
    pub dead: Vec<RawInstance>,
    pub open: Vec<RawSpotRequest>,
    pub resolved: Vec<RawSpotRequest>,
    pub stalled: Vec<RawSpotRequest>,
}

/// Per-region fan-out bounded by `max_concurrency`, with a per-call timeout.
/// A region whose call fails after its retry budget is dropped from the
/// aggregate and logged; per spec 4.1 this does not abort the refresh unless
/// every region fails to answer a given query.
async fn fan_out_regions<T, F, Fut>(
    regions: &[String],
    max_concurrency: usize,
    call_timeout: Duration,
    api: &'static str,
    call: F,
) -> Result<Vec<T>>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<T>>> + Send,
    T: Send,
{
    let results: Vec<(String, Result<Vec<T>>)> = stream::iter(regions.iter().cloned())
        .map(|region| {
            let call = &call;
            async move {
                let region_for_log = region.clone();
                let fut = call(region.clone());
                let result = match tokio::time::timeout(call_timeout, fut).await {
                    Ok(r) => r,
                    Err(_) => Err(ProvisionerError::TransientRemote {
                        region: region.clone(),
                        api,
                        source: anyhow::anyhow!("call timed out after {call_timeout:?}"),
                    }),
                };
                (region_for_log, result)
            }
        })
        .buffer_unordered(max_concurrency.max(1))
        .collect()
        .await;

    let mut out = Vec::new();
    let mut failures = 0usize;
    for (region, result) in &results {
        match result {
            Ok(items) => out.extend_from_slice(items),
            Err(e) if e.is_retryable() => {
                failures += 1;
                tracing::warn!(region = %region, api, error = %e, "region call failed; skipping region this iteration");
            }
            Err(e) => return Err(fresh_credential_error(api, region, e)),
        }
    }

    if !results.is_empty() && failures == results.len() {
        return Err(ProvisionerError::TransientRemote {
            region: "all".to_string(),
            api,
            source: anyhow::anyhow!("every region failed"),
        });
    }

    Ok(out)
}

fn fresh_credential_error(api: &'static str, region: &str, e: &ProvisionerError) -> ProvisionerError {
    ProvisionerError::Credential {
        api,
        source: anyhow::anyhow!("{region}: {e}"),
    }
}

/// Runs the four cloud-API queries (section 4.1) in parallel, with parallel
/// per-region fan-out inside each, then bisects the open-request set into
/// good and stalled.
pub async fn observe(adapter: &dyn CloudAdapter, cfg: &ProvisionerConfig) -> Result<RawObservation> {
    let regions = &cfg.allowed_regions;
    let mc = cfg.max_concurrency;
    let timeout = cfg.region_call_timeout;

    let live_fut = fan_out_regions(regions, mc, timeout, "describeInstances(live)", |region| async move {
        adapter.describe_instances(&region, InstanceState::LIVE).await
    });
    let dead_fut = fan_out_regions(regions, mc, timeout, "describeInstances(dead)", |region| async move {
        adapter.describe_instances(&region, InstanceState::DEAD).await
    });
    let open_fut = fan_out_regions(regions, mc, timeout, "describeSpotRequests(open)", |region| async move {
        adapter.describe_spot_requests(&region, RequestState::OPEN).await
    });
    let resolved_fut = fan_out_regions(regions, mc, timeout, "describeSpotRequests(resolved)", |region| async move {
        adapter.describe_spot_requests(&region, RequestState::RESOLVED).await
    });

    let (live, dead, open_all, resolved) = tokio::try_join!(live_fut, dead_fut, open_fut, resolved_fut)?;

    let mut open = Vec::new();
    let mut stalled = Vec::new();
    for req in open_all {
        if is_stalled(&req, cfg.stall_timeout) {
            stalled.push(req);
        } else {
            open.push(req);
        }
    }

    Ok(RawObservation {
        live,
        dead,
        open,
        resolved,
        stalled,
    })
}

/// Classifies a raw observation's live/open sets into the current
/// `FleetSnapshot`, and its dead/resolved sets into the "dead" snapshot the
/// diff engine consults for terminal metadata.
pub fn classify(obs: &RawObservation, key_prefix: &str) -> (FleetSnapshot, FleetSnapshot) {
    let live = obs
        .live
        .iter()
        .cloned()
        .filter_map(|i| classify_instance(i, key_prefix))
        .collect();
    let open = obs
        .open
        .iter()
        .cloned()
        .filter_map(|r| classify_request(r, key_prefix))
        .collect();
    let current = FleetSnapshot::new(live, open);

    let dead_instances = obs
        .dead
        .iter()
        .cloned()
        .filter_map(|i| classify_instance(i, key_prefix))
        .collect();
    let dead_requests = obs
        .resolved
        .iter()
        .cloned()
        .filter_map(|r| classify_request(r, key_prefix))
        .collect();
    let dead = FleetSnapshot::new(dead_instances, dead_requests);

    (current, dead)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{InstanceState as IS, RequestState as RS};

    fn raw_instance(key_name: &str) -> RawInstance {
        RawInstance {
            instance_id: "i-1".into(),
            region: "us-east-1".into(),
            zone: "us-east-1a".into(),
            instance_type: "t.small".into(),
            image_id: "ami-1".into(),
            launch_time: Some(0),
            state: IS::Running,
            spot_request_id: None,
            state_reason: None,
            key_name: key_name.to_string(),
        }
    }

    #[test]
    fn classification_strips_prefix_and_drops_unmatched() {
        assert_eq!(worker_type_of("fleet-worker-a", "fleet-"), Some("worker-a"));
        assert_eq!(worker_type_of("other-worker-a", "fleet-"), None);
        assert_eq!(worker_type_of("fleet-", "fleet-"), None);
    }

    #[test]
    fn classify_instance_partitions_by_prefix() {
        let matching = classify_instance(raw_instance("fleet-w"), "fleet-");
        assert!(matching.is_some());
        assert_eq!(matching.unwrap().worker_type, "w");

        let non_matching = classify_instance(raw_instance("rogue-w"), "fleet-");
        assert!(non_matching.is_none());
    }

    #[test]
    fn stalled_by_bad_status_regardless_of_age() {
        let req = RawSpotRequest {
            request_id: "sir-1".into(),
            region: "us-east-1".into(),
            zone: "us-east-1a".into(),
            instance_type: "t.small".into(),
            image_id: "ami-1".into(),
            create_time: now_ms(),
            state: RS::Open,
            status_code: StatusCode::PriceTooLow,
            status_update_time: now_ms(),
            bid_price: 0.01,
            instance_id: None,
            key_name: "fleet-w".into(),
        };
        assert!(is_stalled(&req, Duration::from_secs(1200)));
    }

    #[test]
    fn stalled_by_age() {
        let req = RawSpotRequest {
            request_id: "sir-2".into(),
            region: "us-east-1".into(),
            zone: "us-east-1a".into(),
            instance_type: "t.small".into(),
            image_id: "ami-1".into(),
            create_time: now_ms() - Duration::from_secs(25 * 60).as_millis() as i64,
            state: RS::Open,
            status_code: StatusCode::PendingEvaluation,
            status_update_time: now_ms(),
            bid_price: 0.01,
            instance_id: None,
            key_name: "fleet-w".into(),
        };
        assert!(is_stalled(&req, Duration::from_secs(1200)));
    }

    #[test]
    fn not_stalled_when_young_and_healthy() {
        let req = RawSpotRequest {
            request_id: "sir-3".into(),
            region: "us-east-1".into(),
            zone: "us-east-1a".into(),
            instance_type: "t.small".into(),
            image_id: "ami-1".into(),
            create_time: now_ms(),
            state: RS::Open,
            status_code: StatusCode::PendingEvaluation,
            status_update_time: now_ms(),
            bid_price: 0.01,
            instance_id: None,
            key_name: "fleet-w".into(),
        };
        assert!(!is_stalled(&req, Duration::from_secs(1200)));
    }
}
