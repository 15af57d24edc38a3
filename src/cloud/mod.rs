pub mod ec2;
#[cfg(test)]
pub mod mock;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Terminated,
}

impl InstanceState {
    /// States describeInstances is asked for in the "live" query (section 4.1).
    pub const LIVE: &'static [InstanceState] =
        &[InstanceState::Pending, InstanceState::Running, InstanceState::Stopping];

    /// States describeInstances is asked for in the "dead" query.
    pub const DEAD: &'static [InstanceState] =
        &[InstanceState::ShuttingDown, InstanceState::Terminated];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestState {
    Open,
    Active,
    Cancelled,
    Failed,
    Closed,
}

impl RequestState {
    pub const OPEN: &'static [RequestState] = &[RequestState::Open];
    pub const RESOLVED: &'static [RequestState] = &[
        RequestState::Active,
        RequestState::Cancelled,
        RequestState::Failed,
        RequestState::Closed,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCode {
    Fulfilled,
    PendingEvaluation,
    PendingFulfillment,
    PriceTooLow,
    CapacityNotAvailable,
    CapacityOversubscribed,
    LaunchGroupConstraint,
    AzGroupConstraint,
    PlacementGroupConstraint,
    NotScheduledYet,
    ConstraintNotFulfillable,
    /// Catch-all for status codes the cloud API introduces that this crate
    /// does not special-case; never silently dropped.
    Other(String),
}

impl StatusCode {
    /// The bad-status set from section 4.1: an open request with one of
    /// these is stalled regardless of age.
    pub fn is_bad(&self) -> bool {
        matches!(
            self,
            StatusCode::CapacityNotAvailable
                | StatusCode::CapacityOversubscribed
                | StatusCode::PriceTooLow
                | StatusCode::NotScheduledYet
                | StatusCode::LaunchGroupConstraint
                | StatusCode::AzGroupConstraint
                | StatusCode::PlacementGroupConstraint
                | StatusCode::ConstraintNotFulfillable
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReason {
    pub code: String,
    pub message: String,
}

impl StateReason {
    /// The reason code that also triggers a `spot_price_floor` event.
    pub const SPOT_TERMINATION: &'static str = "Server.SpotInstanceTermination";
}

/// One instance as returned by the adapter, before key-prefix classification
/// resolves its `worker_type`.
#[derive(Debug, Clone)]
pub struct RawInstance {
    pub instance_id: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub image_id: String,
    pub launch_time: Option<i64>,
    pub state: InstanceState,
    pub spot_request_id: Option<String>,
    pub state_reason: Option<StateReason>,
    pub key_name: String,
}

/// One spot request as returned by the adapter, before key-prefix
/// classification resolves its `worker_type`.
#[derive(Debug, Clone)]
pub struct RawSpotRequest {
    pub request_id: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub image_id: String,
    pub create_time: i64,
    pub state: RequestState,
    pub status_code: StatusCode,
    pub status_update_time: i64,
    pub bid_price: f64,
    pub instance_id: Option<String>,
    pub key_name: String,
}

#[derive(Debug, Clone)]
pub struct SpotRequestParams {
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub image_id: String,
    pub bid_price: f64,
    pub key_name: String,
    pub launch_spec: serde_json::Value,
}

/// Thin, uniform wrapper over per-region cloud APIs (spec section 2).
/// Every method is region-parameterized; the adapter itself is stateless.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    async fn describe_instances(&self, region: &str, states: &[InstanceState]) -> Result<Vec<RawInstance>>;
    async fn describe_spot_requests(&self, region: &str, states: &[RequestState]) -> Result<Vec<RawSpotRequest>>;
    async fn request_spot(&self, params: &SpotRequestParams) -> Result<String>;
    async fn terminate_instances(&self, region: &str, instance_ids: &[String]) -> Result<()>;
    async fn cancel_spot_requests(&self, region: &str, request_ids: &[String]) -> Result<()>;
    async fn import_key_pair(&self, region: &str, key_name: &str, public_key_body: &[u8]) -> Result<()>;
    async fn describe_key_pairs(&self, region: &str) -> Result<Vec<String>>;
    async fn delete_key_pair(&self, region: &str, key_name: &str) -> Result<()>;
    async fn create_tags(&self, region: &str, resource_ids: &[String], tags: &[(String, String)]) -> Result<()>;
}
