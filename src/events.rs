use async_trait::async_trait;

/// Structured events the reconciler publishes (spec section 6). Timestamps
/// are always epoch milliseconds - the spec's open question about
/// `spot_price_floor`'s inconsistent time representation is resolved in
/// favor of this, uniformly, rather than an ISO string (spec section 9).
#[derive(Debug, Clone)]
pub enum Event {
    RequestSubmitted {
        request_id: String,
        worker_type: String,
        region: String,
        zone: String,
        instance_type: String,
        bid_price: f64,
        at_ms: i64,
    },
    RequestFulfilled {
        request_id: String,
        worker_type: String,
        region: String,
        instance_id: Option<String>,
        at_ms: i64,
    },
    RequestDied {
        request_id: String,
        worker_type: String,
        region: String,
        status_code: String,
        message: Option<String>,
        bid_price: f64,
        at_ms: i64,
    },
    InstanceTerminated {
        instance_id: String,
        worker_type: String,
        region: String,
        reason_code: String,
        reason_message: String,
        at_ms: i64,
    },
    SpotPriceFloor {
        instance_id: String,
        worker_type: String,
        region: String,
        price: f64,
        at_ms: i64,
    },
    AmiUsage {
        worker_type: String,
        region: String,
        image_id: String,
        at_ms: i64,
    },
    BidVisibilityLag {
        request_id: String,
        worker_type: String,
        lag_ms: i64,
        did_show: bool,
        at_ms: i64,
    },
}

/// Transport-agnostic sink for structured events; the actual telemetry
/// backend (spec section 1) is out of scope and reached only through this
/// trait.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Default sink: logs every event via `tracing` at the level appropriate to
/// its kind. This is the operator-facing path; a telemetry-backed `EventSink`
/// can be layered in without this crate changing (spec section 1's
/// out-of-scope telemetry sink).
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: Event) {
        match event {
            Event::RequestSubmitted {
                request_id,
                worker_type,
                region,
                zone,
                instance_type,
                bid_price,
                at_ms,
            } => tracing::info!(
                kind = "request_submitted",
                request_id,
                worker_type,
                region,
                zone,
                instance_type,
                bid_price,
                at_ms,
                "bid submitted"
            ),
            Event::RequestFulfilled {
                request_id,
                worker_type,
                region,
                instance_id,
                at_ms,
            } => tracing::info!(
                kind = "request_fulfilled",
                request_id,
                worker_type,
                region,
                instance_id,
                at_ms,
                "request fulfilled"
            ),
            Event::RequestDied {
                request_id,
                worker_type,
                region,
                status_code,
                message,
                bid_price,
                at_ms,
            } => tracing::warn!(
                kind = "request_died",
                request_id,
                worker_type,
                region,
                status_code,
                message,
                bid_price,
                at_ms,
                "request died"
            ),
            Event::InstanceTerminated {
                instance_id,
                worker_type,
                region,
                reason_code,
                reason_message,
                at_ms,
            } => tracing::info!(
                kind = "instance_terminated",
                instance_id,
                worker_type,
                region,
                reason_code,
                reason_message,
                at_ms,
                "instance terminated"
            ),
            Event::SpotPriceFloor {
                instance_id,
                worker_type,
                region,
                price,
                at_ms,
            } => tracing::info!(
                kind = "spot_price_floor",
                instance_id,
                worker_type,
                region,
                price,
                at_ms,
                "spot price floor hit"
            ),
            Event::AmiUsage {
                worker_type,
                region,
                image_id,
                at_ms,
            } => tracing::info!(
                kind = "ami_usage",
                worker_type,
                region,
                image_id,
                at_ms,
                "ami usage"
            ),
            Event::BidVisibilityLag {
                request_id,
                worker_type,
                lag_ms,
                did_show,
                at_ms,
            } => tracing::info!(
                kind = "bid_visibility_lag",
                request_id,
                worker_type,
                lag_ms,
                did_show,
                at_ms,
                "in-flight bid visibility resolved"
            ),
        }
    }
}
