//! In-memory `CloudAdapter` used by the reconciler's scenario tests
//! (spec section 8, S1-S6). Mutation methods record what was called rather
//! than simulating full cloud-side effects, so a test can assert "a bid was
//! submitted" without the mock also having to emulate EC2 fulfillment
//! timing - that belongs to the scenario's test code.

use super::{CloudAdapter, InstanceState, RawInstance, RawSpotRequest, RequestState, SpotRequestParams};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MockCloudAdapter {
    pub instances: Mutex<HashMap<String, Vec<RawInstance>>>,
    pub requests: Mutex<HashMap<String, Vec<RawSpotRequest>>>,
    pub key_pairs: Mutex<HashMap<String, Vec<String>>>,

    pub bids_submitted: Mutex<Vec<SpotRequestParams>>,
    pub terminated: Mutex<Vec<(String, String)>>,
    pub cancelled: Mutex<Vec<(String, String)>>,
    pub keys_imported: Mutex<Vec<(String, String)>>,
    pub keys_deleted: Mutex<Vec<(String, String)>>,
    pub tags_applied: Mutex<Vec<(String, String)>>,
    pub next_request_id: Mutex<u64>,
}

impl MockCloudAdapter {
    pub fn new() -> Self {
        Self {
            next_request_id: Mutex::new(1),
            ..Default::default()
        }
    }

    pub fn set_instances(&self, region: &str, instances: Vec<RawInstance>) {
        self.instances.lock().unwrap().insert(region.to_string(), instances);
    }

    pub fn set_requests(&self, region: &str, requests: Vec<RawSpotRequest>) {
        self.requests.lock().unwrap().insert(region.to_string(), requests);
    }
}

#[async_trait]
impl CloudAdapter for MockCloudAdapter {
    async fn describe_instances(&self, region: &str, states: &[InstanceState]) -> Result<Vec<RawInstance>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(region)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|i| states.contains(&i.state))
            .collect())
    }

    async fn describe_spot_requests(&self, region: &str, states: &[RequestState]) -> Result<Vec<RawSpotRequest>> {
        Ok(self
            .requests
            .lock()
            .unwrap()
            .get(region)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| states.contains(&r.state))
            .collect())
    }

    async fn request_spot(&self, params: &SpotRequestParams) -> Result<String> {
        let mut n = self.next_request_id.lock().unwrap();
        let id = format!("sir-{:08x}", *n);
        *n += 1;
        self.bids_submitted.lock().unwrap().push(params.clone());
        Ok(id)
    }

    async fn terminate_instances(&self, region: &str, instance_ids: &[String]) -> Result<()> {
        let mut t = self.terminated.lock().unwrap();
        for id in instance_ids {
            t.push((region.to_string(), id.clone()));
        }
        Ok(())
    }

    async fn cancel_spot_requests(&self, region: &str, request_ids: &[String]) -> Result<()> {
        let mut c = self.cancelled.lock().unwrap();
        for id in request_ids {
            c.push((region.to_string(), id.clone()));
        }
        Ok(())
    }

    async fn import_key_pair(&self, region: &str, key_name: &str, _public_key_body: &[u8]) -> Result<()> {
        self.key_pairs
            .lock()
            .unwrap()
            .entry(region.to_string())
            .or_default()
            .push(key_name.to_string());
        self.keys_imported
            .lock()
            .unwrap()
            .push((region.to_string(), key_name.to_string()));
        Ok(())
    }

    async fn describe_key_pairs(&self, region: &str) -> Result<Vec<String>> {
        Ok(self.key_pairs.lock().unwrap().get(region).cloned().unwrap_or_default())
    }

    async fn delete_key_pair(&self, region: &str, key_name: &str) -> Result<()> {
        if let Some(keys) = self.key_pairs.lock().unwrap().get_mut(region) {
            keys.retain(|k| k != key_name);
        }
        self.keys_deleted
            .lock()
            .unwrap()
            .push((region.to_string(), key_name.to_string()));
        Ok(())
    }

    async fn create_tags(&self, region: &str, resource_ids: &[String], _tags: &[(String, String)]) -> Result<()> {
        let mut applied = self.tags_applied.lock().unwrap();
        for id in resource_ids {
            applied.push((region.to_string(), id.clone()));
        }
        Ok(())
    }
}
