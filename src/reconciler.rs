use crate::bidder::{bid_to_cover_delta, execute_kill_plan, plan_kill, KillCandidateInstance, KillCandidateRequest};
use crate::capacity::{current_capacity, delta_to_provision, target_capacity};
use crate::cloud::CloudAdapter;
use crate::config::ProvisionerConfig;
use crate::diff;
use crate::error::Result;
use crate::events::EventSink;
use crate::in_flight::InFlightTracker;
use crate::keypair::KeyPairManager;
use crate::pending::PendingResolutionTracker;
use crate::pricing::PricingOracle;
use crate::queue::TaskQueue;
use crate::safety::{run_age_killer, run_rogue_killer};
use crate::snapshot::{self, FleetSnapshot};
use crate::tags;
use crate::worker_type::Store;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Everything the reconciler mutates across iterations; owned by the caller
/// and threaded through one iteration at a time (spec section 5: these are
/// process-private, mutated only on the reconciliation task). The In-Flight
/// Tracker is `Mutex`-guarded rather than taken `&mut` because step 5 fans
/// out bidding across worker-types in parallel and each bid must record
/// itself immediately on submission (spec section 4.4, invariant 2); every
/// other step in the iteration runs with exclusive access already, so the
/// lock is never contended outside step 5.
pub struct ReconcilerState {
    pub previous_snapshot: Option<FleetSnapshot>,
    pub in_flight: Mutex<InFlightTracker>,
    pub pending: PendingResolutionTracker,
    pub key_pairs: KeyPairManager,
}

impl ReconcilerState {
    pub fn new() -> Self {
        Self {
            previous_snapshot: None,
            in_flight: Mutex::new(InFlightTracker::new()),
            pending: PendingResolutionTracker::new(),
            key_pairs: KeyPairManager::new(),
        }
    }
}

impl Default for ReconcilerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs `e` and, per spec section 7, either swallows it (retryable - the
/// caller continues this iteration or tries again next tick) or propagates
/// it (a credential/permission error, the only kind that aborts the
/// process - `main` sees the `Err` and exits non-zero).
fn handle_or_propagate(context: &'static str, e: crate::error::ProvisionerError) -> Result<()> {
    if e.is_retryable() {
        tracing::warn!(error = %e, context, "non-fatal error; continuing");
        Ok(())
    } else {
        tracing::error!(error = %e, context, "credential error; aborting process");
        Err(e)
    }
}

/// One pass of the 8-step cycle in spec section 4.7. Returns `Ok(())` after
/// skipping the rest of the iteration if the snapshot refresh fails with a
/// retryable error, leaving all trackers untouched so the next tick retries
/// from the same state. Returns `Err` only for a credential/permission
/// error, which the caller treats as fatal.
#[allow(clippy::too_many_arguments)]
pub async fn run_iteration(
    adapter: &dyn CloudAdapter,
    store: &dyn Store,
    queue: &dyn TaskQueue,
    pricing: &dyn PricingOracle,
    sink: &dyn EventSink,
    cfg: &ProvisionerConfig,
    state: &mut ReconcilerState,
) -> Result<()> {
    let now = now_ms();

    // Step 1: refresh the fleet snapshot.
    let observation = match snapshot::observe(adapter, cfg).await {
        Ok(obs) => obs,
        Err(e) => {
            let context = "snapshot refresh";
            if e.is_retryable() {
                tracing::warn!(error = %e, context, "snapshot refresh failed; skipping this iteration");
                return Ok(());
            }
            return handle_or_propagate(context, e);
        }
    };
    let (current, dead) = snapshot::classify(&observation, &cfg.key_prefix);

    // Step 2: diff engine, guarded against panics/self-inconsistency per
    // spec section 7's "snapshot diff throws" example. A caught panic is
    // treated as an empty diff; steps 3-8 still run.
    let diff_result = std::panic::AssertUnwindSafe(diff::run(
        state.previous_snapshot.as_ref(),
        &current,
        &dead,
        &mut state.pending,
        cfg.max_iterations_for_state_resolution,
        now,
        sink,
    ))
    .catch_unwind()
    .await;
    match diff_result {
        Ok(stats) => {
            tracing::debug!(
                departed_instances = stats.departed_instances,
                departed_requests = stats.departed_requests,
                resolved_from_pending = stats.resolved_from_pending,
                "diff engine completed"
            );
        }
        Err(_) => {
            tracing::error!(alert = true, "diff engine panicked; treating this iteration's diff as empty");
        }
    }

    // Step 3: cancel the stalled set synchronously. Stalled requests are
    // already excluded from `current` (spec section 4.1); a stalled request
    // not yet reflected as resolved in `dead` surfaces as pending next tick
    // rather than fully classified this one.
    let mut stalled_by_region: HashMap<String, Vec<String>> = HashMap::new();
    for req in &observation.stalled {
        stalled_by_region.entry(req.region.clone()).or_default().push(req.request_id.clone());
    }
    for (region, ids) in &stalled_by_region {
        if let Err(e) = adapter.cancel_spot_requests(region, ids).await {
            handle_or_propagate("cancelSpotRequests (stalled)", e)?;
        }
    }

    // Step 4: reconcile the in-flight tracker against what just became visible.
    {
        let mut guard = state.in_flight.lock().await;
        guard.sweep(&current, cfg.in_flight_timeout, now, sink).await;
    }

    // Step 5: per worker-type key-pair ensure + capacity reconciliation, fanned out in parallel.
    let worker_type_names = match store.list_worker_types().await {
        Ok(names) => names,
        Err(e) => {
            if e.is_retryable() {
                tracing::warn!(error = %e, "listWorkerTypes failed; skipping capacity reconciliation this iteration");
                Vec::new()
            } else {
                return handle_or_propagate("listWorkerTypes", e);
            }
        }
    };
    let configured: HashSet<String> = worker_type_names.iter().cloned().collect();

    let results = futures::future::join_all(worker_type_names.iter().map(|name| {
        reconcile_worker_type(adapter, store, queue, pricing, sink, cfg, &state.key_pairs, &current, &state.in_flight, name, now)
    }))
    .await;
    for (name, result) in worker_type_names.iter().zip(results) {
        if let Err(e) = result {
            handle_or_propagate("worker-type reconciliation", e)?;
        }
    }

    // Step 6: rogue killer.
    {
        let guard = state.in_flight.lock().await;
        if let Err(e) = run_rogue_killer(
            adapter,
            &cfg.key_prefix,
            &cfg.allowed_regions,
            &current,
            &guard,
            &configured,
            &state.key_pairs,
            cfg.dry_run,
        )
        .await
        {
            handle_or_propagate("rogue killer", e)?;
        }
    }

    // Step 7: age killer.
    if let Err(e) = run_age_killer(adapter, &current, cfg.max_instance_life, now, cfg.dry_run).await {
        handle_or_propagate("age killer", e)?;
    }

    // Step 8: best-effort tagging.
    tags::apply(adapter, &current, &cfg.provisioner_id).await;

    state.previous_snapshot = Some(current);
    Ok(())
}

/// Step 5b for a single worker-type: ensure its key pair, then either bid to
/// cover a capacity shortfall or plan/execute termination of the excess.
/// Key-pair check happens-before bid submission within this worker-type
/// (spec section 5); there is no ordering guarantee against any other
/// worker-type's reconciliation running concurrently.
#[allow(clippy::too_many_arguments)]
async fn reconcile_worker_type(
    adapter: &dyn CloudAdapter,
    store: &dyn Store,
    queue: &dyn TaskQueue,
    pricing: &dyn PricingOracle,
    sink: &dyn EventSink,
    cfg: &ProvisionerConfig,
    key_pairs: &KeyPairManager,
    current: &FleetSnapshot,
    in_flight: &Mutex<InFlightTracker>,
    worker_type: &str,
    now: i64,
) -> Result<()> {
    let def = store.load_worker_type(worker_type).await?;
    let key_name = format!("{}{}", cfg.key_prefix, worker_type);

    key_pairs
        .ensure(adapter, &cfg.key_prefix, worker_type, &cfg.allowed_regions, &cfg.public_key_body, cfg.dry_run)
        .await?;

    let pending_tasks = queue.pending_tasks(worker_type).await?;
    let target = target_capacity(&def, pending_tasks);

    let existing = current_capacity(&def, current, &*in_flight.lock().await);
    let delta = delta_to_provision(existing, target);

    if delta > 0 {
        let mut guard = in_flight.lock().await;
        bid_to_cover_delta(adapter, &def, &key_name, delta, pricing, &mut guard, now, cfg.dry_run, sink).await?;
        return Ok(());
    }

    if existing <= target {
        return Ok(());
    }

    let in_flight_candidates: Vec<(String, u32)> = {
        let guard = in_flight.lock().await;
        guard
            .for_worker_type(worker_type)
            .map(|r| (r.request_id.clone(), def.capacity_of(&r.instance_type)))
            .collect()
    };
    let open_requests: Vec<KillCandidateRequest> = current
        .requests_for(worker_type)
        .map(|r| KillCandidateRequest {
            request_id: r.request_id.clone(),
            region: r.region.clone(),
            capacity: def.capacity_of(&r.instance_type),
        })
        .collect();
    let instances: Vec<KillCandidateInstance> = current
        .instances_for(worker_type)
        .map(|i| KillCandidateInstance {
            instance_id: i.instance_id.clone(),
            region: i.region.clone(),
            capacity: def.capacity_of(&i.instance_type),
        })
        .collect();

    let plan = plan_kill(&def, existing, &in_flight_candidates, open_requests, instances, false);
    execute_kill_plan(adapter, &plan, cfg.dry_run).await?;

    if !cfg.dry_run {
        let mut guard = in_flight.lock().await;
        for id in &plan.in_flight_request_ids {
            guard.remove(id);
        }
    }

    Ok(())
}
