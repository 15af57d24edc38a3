//! Production `CloudAdapter` over the EC2-family wire surface (spot
//! instances, spot requests, key pairs, tags). One `aws_sdk_ec2::Client` is
//! cached per region; clients are cheap to clone internally but expensive to
//! construct (they each resolve credentials/region config), so the cache
//! avoids re-resolving those on every call the way the teacher's keeper
//! avoids re-importing a key pair it already confirmed exists.

use super::{
    CloudAdapter, InstanceState, RawInstance, RawSpotRequest, RequestState, SpotRequestParams,
    StateReason, StatusCode,
};
use crate::error::{ProvisionerError, Result};
use async_trait::async_trait;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types as ec2;
use aws_types::region::Region;
use std::collections::HashMap;
use tokio::sync::RwLock;

pub struct Ec2Adapter {
    clients: RwLock<HashMap<String, aws_sdk_ec2::Client>>,
}

impl Ec2Adapter {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    async fn client_for(&self, region: &str) -> aws_sdk_ec2::Client {
        if let Some(c) = self.clients.read().await.get(region) {
            return c.clone();
        }
        let mut guard = self.clients.write().await;
        if let Some(c) = guard.get(region) {
            return c.clone();
        }
        let sdk_config = aws_config::from_env()
            .region(Region::new(region.to_string()))
            .load()
            .await;
        let client = aws_sdk_ec2::Client::new(&sdk_config);
        guard.insert(region.to_string(), client.clone());
        client
    }
}

impl Default for Ec2Adapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Classifies an EC2 SDK error per spec section 7: permission/credential
/// errors abort the iteration, everything else is treated as transient and
/// retried next tick.
fn classify<E: ProvideErrorMetadata + std::fmt::Debug>(api: &'static str, region: &str, err: E) -> ProvisionerError {
    let code = err.code().unwrap_or_default();
    if matches!(
        code,
        "AuthFailure" | "UnauthorizedOperation" | "OptInRequired" | "AccessDenied" | "InvalidClientTokenId"
    ) {
        ProvisionerError::Credential {
            api,
            source: anyhow::anyhow!("{region}: {err:?}"),
        }
    } else {
        ProvisionerError::TransientRemote {
            region: region.to_string(),
            api,
            source: anyhow::anyhow!("{err:?}"),
        }
    }
}

fn instance_state(s: &ec2::InstanceStateName) -> Option<InstanceState> {
    use ec2::InstanceStateName as S;
    Some(match s {
        S::Pending => InstanceState::Pending,
        S::Running => InstanceState::Running,
        S::ShuttingDown => InstanceState::ShuttingDown,
        S::Stopping => InstanceState::Stopping,
        S::Terminated => InstanceState::Terminated,
        // `Stopped` has no counterpart in the spot-instance lifecycle this
        // crate models; callers never request it so this arm is defensive.
        _ => return None,
    })
}

fn request_state(s: &ec2::SpotInstanceState) -> Option<RequestState> {
    use ec2::SpotInstanceState as S;
    Some(match s {
        S::Open => RequestState::Open,
        S::Active => RequestState::Active,
        S::Cancelled => RequestState::Cancelled,
        S::Failed => RequestState::Failed,
        S::Closed => RequestState::Closed,
        _ => return None,
    })
}

fn status_code(s: &str) -> StatusCode {
    match s {
        "fulfilled" => StatusCode::Fulfilled,
        "pending-evaluation" => StatusCode::PendingEvaluation,
        "pending-fulfillment" => StatusCode::PendingFulfillment,
        "price-too-low" => StatusCode::PriceTooLow,
        "capacity-not-available" => StatusCode::CapacityNotAvailable,
        "capacity-oversubscribed" => StatusCode::CapacityOversubscribed,
        "launch-group-constraint" => StatusCode::LaunchGroupConstraint,
        "az-group-constraint" => StatusCode::AzGroupConstraint,
        "placement-group-constraint" => StatusCode::PlacementGroupConstraint,
        "not-scheduled-yet" => StatusCode::NotScheduledYet,
        "constraint-not-fulfillable" => StatusCode::ConstraintNotFulfillable,
        other => StatusCode::Other(other.to_string()),
    }
}

fn region_state_filter_instances(states: &[InstanceState]) -> ec2::Filter {
    let values: Vec<String> = states
        .iter()
        .map(|s| {
            match s {
                InstanceState::Pending => "pending",
                InstanceState::Running => "running",
                InstanceState::ShuttingDown => "shutting-down",
                InstanceState::Stopping => "stopping",
                InstanceState::Terminated => "terminated",
            }
            .to_string()
        })
        .collect();
    ec2::Filter::builder()
        .name("instance-state-name")
        .set_values(Some(values))
        .build()
}

fn region_state_filter_requests(states: &[RequestState]) -> ec2::Filter {
    let values: Vec<String> = states
        .iter()
        .map(|s| {
            match s {
                RequestState::Open => "open",
                RequestState::Active => "active",
                RequestState::Cancelled => "cancelled",
                RequestState::Failed => "failed",
                RequestState::Closed => "closed",
            }
            .to_string()
        })
        .collect();
    ec2::Filter::builder()
        .name("state")
        .set_values(Some(values))
        .build()
}

#[async_trait]
impl CloudAdapter for Ec2Adapter {
    async fn describe_instances(&self, region: &str, states: &[InstanceState]) -> Result<Vec<RawInstance>> {
        let client = self.client_for(region).await;
        let resp = client
            .describe_instances()
            .filters(region_state_filter_instances(states))
            .into_paginator()
            .send()
            .collect::<std::result::Result<Vec<_>, _>>()
            .await
            .map_err(|e| classify("describeInstances", region, e.into_service_error()))?;

        let mut out = Vec::new();
        for page in resp {
            for reservation in page.reservations() {
                for inst in reservation.instances() {
                    let Some(instance_id) = inst.instance_id() else {
                        continue;
                    };
                    let Some(state) = inst.state().and_then(|s| s.name()).and_then(instance_state) else {
                        continue;
                    };
                    let key_name = inst.key_name().unwrap_or_default().to_string();
                    out.push(RawInstance {
                        instance_id: instance_id.to_string(),
                        region: region.to_string(),
                        zone: inst
                            .placement()
                            .and_then(|p| p.availability_zone())
                            .unwrap_or_default()
                            .to_string(),
                        instance_type: inst.instance_type().map(|t| t.as_str().to_string()).unwrap_or_default(),
                        image_id: inst.image_id().unwrap_or_default().to_string(),
                        launch_time: inst.launch_time().map(|t| t.as_millis()),
                        state,
                        spot_request_id: inst.spot_instance_request_id().map(|s| s.to_string()),
                        state_reason: inst.state_reason().map(|r| StateReason {
                            code: r.code().unwrap_or_default().to_string(),
                            message: r.message().unwrap_or_default().to_string(),
                        }),
                        key_name,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn describe_spot_requests(&self, region: &str, states: &[RequestState]) -> Result<Vec<RawSpotRequest>> {
        let client = self.client_for(region).await;
        let resp = client
            .describe_spot_instance_requests()
            .filters(region_state_filter_requests(states))
            .send()
            .await
            .map_err(|e| classify("describeSpotInstanceRequests", region, e.into_service_error()))?;

        let mut out = Vec::new();
        for req in resp.spot_instance_requests() {
            let Some(request_id) = req.spot_instance_request_id() else {
                continue;
            };
            let Some(state) = req.state().and_then(request_state) else {
                continue;
            };
            let status = req.status();
            out.push(RawSpotRequest {
                request_id: request_id.to_string(),
                region: region.to_string(),
                zone: req
                    .launched_availability_zone()
                    .or_else(|| req.launch_specification().and_then(|l| l.placement()).and_then(|p| p.availability_zone()))
                    .unwrap_or_default()
                    .to_string(),
                instance_type: req
                    .launch_specification()
                    .and_then(|l| l.instance_type())
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_default(),
                image_id: req
                    .launch_specification()
                    .and_then(|l| l.image_id())
                    .unwrap_or_default()
                    .to_string(),
                create_time: req.create_time().map(|t| t.as_millis()).unwrap_or(0),
                state,
                status_code: status
                    .and_then(|s| s.code())
                    .map(status_code)
                    .unwrap_or(StatusCode::PendingEvaluation),
                status_update_time: status.and_then(|s| s.update_time()).map(|t| t.as_millis()).unwrap_or(0),
                bid_price: req
                    .spot_price()
                    .and_then(|p| p.parse::<f64>().ok())
                    .unwrap_or(0.0),
                instance_id: req.instance_id().map(|s| s.to_string()),
                key_name: req
                    .launch_specification()
                    .and_then(|l| l.key_name())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(out)
    }

    async fn request_spot(&self, params: &SpotRequestParams) -> Result<String> {
        let client = self.client_for(&params.region).await;
        let placement = ec2::SpotPlacement::builder().availability_zone(&params.zone).build();
        let launch_spec = ec2::RequestSpotLaunchSpecification::builder()
            .image_id(&params.image_id)
            .instance_type(ec2::InstanceType::from(params.instance_type.as_str()))
            .key_name(&params.key_name)
            .placement(placement)
            .build();

        let resp = client
            .request_spot_instances()
            .spot_price(format!("{:.6}", params.bid_price))
            .instance_count(1)
            .r#type(ec2::SpotInstanceType::OneTime)
            .launch_specification(launch_spec)
            .send()
            .await
            .map_err(|e| classify("requestSpotInstances", &params.region, e.into_service_error()))?;

        resp.spot_instance_requests()
            .first()
            .and_then(|r| r.spot_instance_request_id())
            .map(|s| s.to_string())
            .ok_or(ProvisionerError::MalformedResponse {
                api: "requestSpotInstances",
                field: "spotInstanceRequestId",
            })
    }

    async fn terminate_instances(&self, region: &str, instance_ids: &[String]) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        let client = self.client_for(region).await;
        client
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify("terminateInstances", region, e.into_service_error()))?;
        Ok(())
    }

    async fn cancel_spot_requests(&self, region: &str, request_ids: &[String]) -> Result<()> {
        if request_ids.is_empty() {
            return Ok(());
        }
        let client = self.client_for(region).await;
        client
            .cancel_spot_instance_requests()
            .set_spot_instance_request_ids(Some(request_ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify("cancelSpotInstanceRequests", region, e.into_service_error()))?;
        Ok(())
    }

    async fn import_key_pair(&self, region: &str, key_name: &str, public_key_body: &[u8]) -> Result<()> {
        let client = self.client_for(region).await;
        client
            .import_key_pair()
            .key_name(key_name)
            .public_key_material(aws_sdk_ec2::primitives::Blob::new(public_key_body))
            .send()
            .await
            .map_err(|e| classify("importKeyPair", region, e.into_service_error()))?;
        Ok(())
    }

    async fn describe_key_pairs(&self, region: &str) -> Result<Vec<String>> {
        let client = self.client_for(region).await;
        let resp = client
            .describe_key_pairs()
            .send()
            .await
            .map_err(|e| classify("describeKeyPairs", region, e.into_service_error()))?;
        Ok(resp
            .key_pairs()
            .iter()
            .filter_map(|k| k.key_name().map(|s| s.to_string()))
            .collect())
    }

    async fn delete_key_pair(&self, region: &str, key_name: &str) -> Result<()> {
        let client = self.client_for(region).await;
        client
            .delete_key_pair()
            .key_name(key_name)
            .send()
            .await
            .map_err(|e| classify("deleteKeyPair", region, e.into_service_error()))?;
        Ok(())
    }

    async fn create_tags(&self, region: &str, resource_ids: &[String], tags: &[(String, String)]) -> Result<()> {
        if resource_ids.is_empty() {
            return Ok(());
        }
        let client = self.client_for(region).await;
        let ec2_tags: Vec<ec2::Tag> = tags
            .iter()
            .map(|(k, v)| ec2::Tag::builder().key(k).value(v).build())
            .collect();
        client
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .set_tags(Some(ec2_tags))
            .send()
            .await
            .map_err(|e| classify("createTags", region, e.into_service_error()))?;
        Ok(())
    }
}
