//! Thin HTTP clients for the three out-of-scope external systems (store,
//! queue, telemetry sink), used when the corresponding `--*-endpoint` flag is
//! given. Each is a direct `reqwest` call per trait method; none of them
//! retry internally; a failed call is wrapped into a `ProvisionerError` and
//! left to the reconciler's own retry-at-next-tick policy (spec section 7).

use crate::error::{ProvisionerError, Result};
use crate::events::{Event, EventSink};
use crate::queue::TaskQueue;
use crate::worker_type::{Store, WorkerTypeDef};
use async_trait::async_trait;
use serde::Serialize;

fn wrap(api: &'static str, e: reqwest::Error) -> ProvisionerError {
    if e.status().map(|s| s.as_u16()) == Some(401) || e.status().map(|s| s.as_u16()) == Some(403) {
        ProvisionerError::Credential {
            api,
            source: anyhow::anyhow!(e),
        }
    } else {
        ProvisionerError::Other(anyhow::anyhow!(e).context(api))
    }
}

pub struct HttpStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpStore {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Store for HttpStore {
    async fn list_worker_types(&self) -> Result<Vec<String>> {
        self.client
            .get(format!("{}/worker-types", self.base_url))
            .send()
            .await
            .map_err(|e| wrap("listWorkerTypes", e))?
            .error_for_status()
            .map_err(|e| wrap("listWorkerTypes", e))?
            .json::<Vec<String>>()
            .await
            .map_err(|e| wrap("listWorkerTypes", e))
    }

    async fn load_worker_type(&self, name: &str) -> Result<WorkerTypeDef> {
        self.client
            .get(format!("{}/worker-types/{name}", self.base_url))
            .send()
            .await
            .map_err(|e| wrap("loadWorkerType", e))?
            .error_for_status()
            .map_err(|e| wrap("loadWorkerType", e))?
            .json::<WorkerTypeDef>()
            .await
            .map_err(|e| wrap("loadWorkerType", e))
    }
}

#[derive(serde::Deserialize)]
struct PendingTasksResponse {
    pending_tasks: u64,
}

pub struct HttpQueue {
    base_url: String,
    client: reqwest::Client,
}

impl HttpQueue {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TaskQueue for HttpQueue {
    async fn pending_tasks(&self, worker_type: &str) -> Result<u64> {
        let resp = self
            .client
            .get(format!("{}/worker-types/{worker_type}/pending-tasks", self.base_url))
            .send()
            .await
            .map_err(|e| wrap("pendingTasks", e))?
            .error_for_status()
            .map_err(|e| wrap("pendingTasks", e))?
            .json::<PendingTasksResponse>()
            .await
            .map_err(|e| wrap("pendingTasks", e))?;
        Ok(resp.pending_tasks)
    }
}

/// Serializable mirror of `Event`. Kept separate from the core `Event` type
/// so the domain model doesn't carry a wire format it otherwise has no use
/// for (every other `EventSink` just matches on `Event` directly).
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireEvent<'a> {
    RequestSubmitted {
        request_id: &'a str,
        worker_type: &'a str,
        region: &'a str,
        zone: &'a str,
        instance_type: &'a str,
        bid_price: f64,
        at_ms: i64,
    },
    RequestFulfilled {
        request_id: &'a str,
        worker_type: &'a str,
        region: &'a str,
        instance_id: &'a Option<String>,
        at_ms: i64,
    },
    RequestDied {
        request_id: &'a str,
        worker_type: &'a str,
        region: &'a str,
        status_code: &'a str,
        message: &'a Option<String>,
        bid_price: f64,
        at_ms: i64,
    },
    InstanceTerminated {
        instance_id: &'a str,
        worker_type: &'a str,
        region: &'a str,
        reason_code: &'a str,
        reason_message: &'a str,
        at_ms: i64,
    },
    SpotPriceFloor {
        instance_id: &'a str,
        worker_type: &'a str,
        region: &'a str,
        price: f64,
        at_ms: i64,
    },
    AmiUsage {
        worker_type: &'a str,
        region: &'a str,
        image_id: &'a str,
        at_ms: i64,
    },
    BidVisibilityLag {
        request_id: &'a str,
        worker_type: &'a str,
        lag_ms: i64,
        did_show: bool,
        at_ms: i64,
    },
}

fn to_wire(event: &Event) -> WireEvent<'_> {
    match event {
        Event::RequestSubmitted { request_id, worker_type, region, zone, instance_type, bid_price, at_ms } => {
            WireEvent::RequestSubmitted {
                request_id,
                worker_type,
                region,
                zone,
                instance_type,
                bid_price: *bid_price,
                at_ms: *at_ms,
            }
        }
        Event::RequestFulfilled { request_id, worker_type, region, instance_id, at_ms } => {
            WireEvent::RequestFulfilled { request_id, worker_type, region, instance_id, at_ms: *at_ms }
        }
        Event::RequestDied { request_id, worker_type, region, status_code, message, bid_price, at_ms } => {
            WireEvent::RequestDied {
                request_id,
                worker_type,
                region,
                status_code,
                message,
                bid_price: *bid_price,
                at_ms: *at_ms,
            }
        }
        Event::InstanceTerminated { instance_id, worker_type, region, reason_code, reason_message, at_ms } => {
            WireEvent::InstanceTerminated { instance_id, worker_type, region, reason_code, reason_message, at_ms: *at_ms }
        }
        Event::SpotPriceFloor { instance_id, worker_type, region, price, at_ms } => {
            WireEvent::SpotPriceFloor { instance_id, worker_type, region, price: *price, at_ms: *at_ms }
        }
        Event::AmiUsage { worker_type, region, image_id, at_ms } => {
            WireEvent::AmiUsage { worker_type, region, image_id, at_ms: *at_ms }
        }
        Event::BidVisibilityLag { request_id, worker_type, lag_ms, did_show, at_ms } => {
            WireEvent::BidVisibilityLag { request_id, worker_type, lag_ms: *lag_ms, did_show: *did_show, at_ms: *at_ms }
        }
    }
}

/// Posts each event to the telemetry endpoint. A delivery failure is logged
/// and dropped rather than retried: events are diagnostic, not authoritative
/// state, so losing one to a transient network blip is acceptable (spec
/// section 6).
pub struct HttpEventSink {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEventSink {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn emit(&self, event: Event) {
        let wire = to_wire(&event);
        let result = self.client.post(format!("{}/events", self.base_url)).json(&wire).send().await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(status = %resp.status(), "telemetry endpoint rejected event")
            }
            Err(e) => tracing::warn!(error = %e, "failed to deliver event to telemetry endpoint"),
            Ok(_) => {}
        }
    }
}
