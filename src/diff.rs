use crate::cloud::{RequestState, StateReason};
use crate::events::{Event, EventSink};
use crate::pending::PendingResolutionTracker;
use crate::snapshot::{FleetSnapshot, Instance, SpotRequest};

#[derive(Debug, Default, Clone, Copy)]
pub struct DiffStats {
    pub departed_instances: usize,
    pub departed_requests: usize,
    pub resolved_from_pending: usize,
}

fn find_bid_price(instance: &Instance, dead: &FleetSnapshot) -> Option<f64> {
    let request_id = instance.spot_request_id.as_deref()?;
    dead.find_request(request_id).map(|r| r.bid_price)
}

async fn emit_spot_price_floor_if_available(instance: &Instance, at_ms: i64, dead: &FleetSnapshot, sink: &dyn EventSink) -> bool {
    match find_bid_price(instance, dead) {
        Some(price) => {
            sink.emit(Event::SpotPriceFloor {
                instance_id: instance.instance_id.clone(),
                worker_type: instance.worker_type.clone(),
                region: instance.region.clone(),
                price,
                at_ms,
            })
            .await;
            true
        }
        None => false,
    }
}

/// Emits `instance_terminated` and, for a spot-terminated instance, either
/// `spot_price_floor` immediately (its request is already in `dead`) or
/// enqueues it on `pending` for a later iteration to retry - spot requests
/// resolve asynchronously, so the matching bid price can lag the instance's
/// own termination metadata (spec section 8 invariant 3).
async fn emit_terminated(
    instance: &Instance,
    reason: &StateReason,
    at_ms: i64,
    dead: &FleetSnapshot,
    pending: &mut PendingResolutionTracker,
    sink: &dyn EventSink,
) {
    sink.emit(Event::InstanceTerminated {
        instance_id: instance.instance_id.clone(),
        worker_type: instance.worker_type.clone(),
        region: instance.region.clone(),
        reason_code: reason.code.clone(),
        reason_message: reason.message.clone(),
        at_ms,
    })
    .await;

    if reason.code == StateReason::SPOT_TERMINATION && !emit_spot_price_floor_if_available(instance, at_ms, dead, sink).await {
        tracing::debug!(
            instance_id = %instance.instance_id,
            "spot termination with no matching bid price yet; retrying spot_price_floor in a later iteration"
        );
        pending.enqueue_price_floor(instance.instance_id.clone(), at_ms);
    }
}

async fn classify_departed_request(req: &SpotRequest, at_ms: i64, sink: &dyn EventSink) -> RequestVerdict {
    match (req.state, req.status_code.clone()) {
        (RequestState::Active, code) if code == crate::cloud::StatusCode::Fulfilled => {
            sink.emit(Event::RequestFulfilled {
                request_id: req.request_id.clone(),
                worker_type: req.worker_type.clone(),
                region: req.region.clone(),
                instance_id: req.instance_id.clone(),
                at_ms,
            })
            .await;
            RequestVerdict::Resolved
        }
        (RequestState::Open, _) => RequestVerdict::StillOpen,
        _ => {
            sink.emit(Event::RequestDied {
                request_id: req.request_id.clone(),
                worker_type: req.worker_type.clone(),
                region: req.region.clone(),
                status_code: format!("{:?}", req.status_code),
                message: None,
                bid_price: req.bid_price,
                at_ms,
            })
            .await;
            RequestVerdict::Resolved
        }
    }
}

enum RequestVerdict {
    Resolved,
    StillOpen,
}

/// Runs the Diff Engine (spec section 4.2) for one iteration: detects
/// departed instances/requests between `previous` and `current`, resolves
/// each against `dead` for terminal metadata, classifies and emits events,
/// then revisits the Pending-Resolution tracker's carryover entries against
/// the same `dead` snapshot. `previous` is `None` on the very first
/// iteration, in which case there is nothing to diff yet.
pub async fn run(
    previous: Option<&FleetSnapshot>,
    current: &FleetSnapshot,
    dead: &FleetSnapshot,
    pending: &mut PendingResolutionTracker,
    max_iterations_for_state_resolution: u32,
    now_ms: i64,
    sink: &dyn EventSink,
) -> DiffStats {
    let mut stats = DiffStats::default();

    if let Some(previous) = previous {
        for instance in previous.instances() {
            if current.find_instance(&instance.instance_id).is_some() {
                continue;
            }
            stats.departed_instances += 1;
            let richer = dead.find_instance(&instance.instance_id).unwrap_or(instance);
            match &richer.state_reason {
                Some(reason) => emit_terminated(richer, reason, now_ms, dead, pending, sink).await,
                None => pending.enqueue_instance(instance.instance_id.clone(), now_ms),
            }
        }

        for request in previous.requests() {
            if current.find_request(&request.request_id).is_some() {
                continue;
            }
            stats.departed_requests += 1;
            let richer = dead.find_request(&request.request_id).unwrap_or(request);
            match classify_departed_request(richer, now_ms, sink).await {
                RequestVerdict::StillOpen => pending.enqueue_request(request.request_id.clone(), now_ms),
                RequestVerdict::Resolved => {}
            }
        }
    }

    let mut resolved_instances = Vec::new();
    let pending_instance_ids: Vec<(String, i64)> = pending
        .instance_entries()
        .map(|(id, entry)| (id.clone(), entry.first_seen_at))
        .collect();
    for (id, first_seen_at) in pending_instance_ids {
        if let Some(richer) = dead.find_instance(&id) {
            if let Some(reason) = &richer.state_reason {
                emit_terminated(richer, reason, first_seen_at, dead, pending, sink).await;
                resolved_instances.push(id);
                stats.resolved_from_pending += 1;
            }
        }
    }

    let mut resolved_requests = Vec::new();
    let pending_request_ids: Vec<(String, i64)> = pending
        .request_entries()
        .map(|(id, entry)| (id.clone(), entry.first_seen_at))
        .collect();
    for (id, first_seen_at) in pending_request_ids {
        if let Some(richer) = dead.find_request(&id) {
            if !matches!(richer.state, RequestState::Open) {
                if let RequestVerdict::Resolved = classify_departed_request(richer, first_seen_at, sink).await {
                    resolved_requests.push(id);
                    stats.resolved_from_pending += 1;
                }
            }
        }
    }

    pending.advance(&resolved_instances, &resolved_requests, max_iterations_for_state_resolution);

    let mut resolved_price_floors = Vec::new();
    let price_floor_ids: Vec<(String, i64)> = pending
        .price_floor_entries()
        .map(|(id, entry)| (id.clone(), entry.first_seen_at))
        .collect();
    for (id, first_seen_at) in price_floor_ids {
        if let Some(richer) = dead.find_instance(&id) {
            if emit_spot_price_floor_if_available(richer, first_seen_at, dead, sink).await {
                resolved_price_floors.push(id);
                stats.resolved_from_pending += 1;
            }
        }
    }
    pending.advance_price_floors(&resolved_price_floors, max_iterations_for_state_resolution);

    stats
}
