use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One instance-type choice available to a worker-type, with the
/// price-normalization multiplier and per-region override payload that the
/// (out-of-scope) launch-spec generator merges in later.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeSpec {
    #[serde(rename = "type")]
    pub instance_type: String,
    /// Tasks-per-instance.
    pub capacity: u32,
    /// Unitless multiplier used to normalize spot prices across heterogeneous types.
    pub utility: f64,
    #[serde(default)]
    pub overrides: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSpec {
    pub region: String,
    #[serde(default)]
    pub overrides: serde_json::Value,
}

/// Read-only input to the core, normally loaded from the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTypeDef {
    pub name: String,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub scaling_ratio: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub instance_types: Vec<InstanceTypeSpec>,
    pub regions: Vec<RegionSpec>,
    #[serde(default)]
    pub shared_launch_spec: serde_json::Value,
}

impl WorkerTypeDef {
    /// `capacity_of` with the spec's documented fallback: unknown instance
    /// types count as 1 capacity unit rather than failing accounting.
    pub fn capacity_of(&self, instance_type: &str) -> u32 {
        self.instance_types
            .iter()
            .find(|it| it.instance_type == instance_type)
            .map(|it| it.capacity)
            .unwrap_or(1)
    }

    pub fn utility_of(&self, instance_type: &str) -> f64 {
        self.instance_types
            .iter()
            .find(|it| it.instance_type == instance_type)
            .map(|it| it.utility)
            .unwrap_or(1.0)
    }

    pub fn region_names(&self) -> Vec<String> {
        self.regions.iter().map(|r| r.region.clone()).collect()
    }
}

/// Read interface and enumeration operation the core borrows from the
/// external, persistent store. The store's CRUD surface and persistence are
/// out of scope for this crate (spec section 1).
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_worker_types(&self) -> Result<Vec<String>>;
    async fn load_worker_type(&self, name: &str) -> Result<WorkerTypeDef>;
}
