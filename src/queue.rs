use crate::error::Result;
use async_trait::async_trait;

/// The external pending-task queue (spec section 1 - out of scope to
/// implement, consumed read-only).
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn pending_tasks(&self, worker_type: &str) -> Result<u64>;
}

/// Used when no `--queue-endpoint` is configured: every worker-type reports
/// zero pending tasks, so capacity reconciliation only ever bids up to each
/// worker-type's `min_capacity` floor.
pub struct NoQueueConfigured;

#[async_trait]
impl TaskQueue for NoQueueConfigured {
    async fn pending_tasks(&self, _worker_type: &str) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct FixedQueue {
        counts: RwLock<HashMap<String, u64>>,
    }

    impl FixedQueue {
        pub fn new(counts: HashMap<String, u64>) -> Self {
            Self {
                counts: RwLock::new(counts),
            }
        }
    }

    #[async_trait]
    impl TaskQueue for FixedQueue {
        async fn pending_tasks(&self, worker_type: &str) -> Result<u64> {
            Ok(self.counts.read().await.get(worker_type).copied().unwrap_or(0))
        }
    }
}
