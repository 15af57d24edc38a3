use crate::error::Result;
use async_trait::async_trait;

/// Recent spot price observations, out of scope to produce (spec section 1)
/// but consumed by the bidder. `None` means no recent observation; the
/// bidder falls back to a configured uniform price rather than excluding
/// the candidate (spec section 6).
#[async_trait]
pub trait PricingOracle: Send + Sync {
    async fn recent_spot(&self, region: &str, instance_type: &str, zone: &str) -> Result<Option<f64>>;
}

/// Always reports no recent observation, forcing every candidate through the
/// uniform-price fallback. Useful for cold-start deployments with no pricing
/// history yet.
pub struct NoPricingHistory;

#[async_trait]
impl PricingOracle for NoPricingHistory {
    async fn recent_spot(&self, _region: &str, _instance_type: &str, _zone: &str) -> Result<Option<f64>> {
        Ok(None)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct FixedPricing {
        prices: RwLock<HashMap<(String, String, String), f64>>,
    }

    impl FixedPricing {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn set(&self, region: &str, instance_type: &str, zone: &str, price: f64) {
            self.prices
                .write()
                .await
                .insert((region.to_string(), instance_type.to_string(), zone.to_string()), price);
        }
    }

    #[async_trait]
    impl PricingOracle for FixedPricing {
        async fn recent_spot(&self, region: &str, instance_type: &str, zone: &str) -> Result<Option<f64>> {
            Ok(self
                .prices
                .read()
                .await
                .get(&(region.to_string(), instance_type.to_string(), zone.to_string()))
                .copied())
        }
    }
}
