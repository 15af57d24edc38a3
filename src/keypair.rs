use crate::cloud::CloudAdapter;
use crate::error::Result;
use futures::future::join_all;
use std::collections::HashSet;
use tokio::sync::Mutex;

/// Ensures each worker-type's key pair exists in every allowed region (spec
/// section 4.5). The known-good cache is process-local and never persisted:
/// restarting always re-checks every worker-type once, which is exactly what
/// guarantees correctness when `allowed_regions` grows across a restart (a
/// newly-added region was never checked before, cache or no cache).
pub struct KeyPairManager {
    known_good: Mutex<HashSet<String>>,
}

impl KeyPairManager {
    pub fn new() -> Self {
        Self {
            known_good: Mutex::new(HashSet::new()),
        }
    }

    fn key_name(key_prefix: &str, worker_type: &str) -> String {
        format!("{key_prefix}{worker_type}")
    }

    /// Ensures `worker_type`'s key pair exists in every region in
    /// `allowed_regions`, importing it into whichever are missing it. A
    /// worker-type already in the known-good cache is skipped entirely.
    pub async fn ensure(
        &self,
        adapter: &dyn CloudAdapter,
        key_prefix: &str,
        worker_type: &str,
        allowed_regions: &[String],
        public_key_body: &[u8],
        dry_run: bool,
    ) -> Result<()> {
        if self.known_good.lock().await.contains(worker_type) {
            return Ok(());
        }

        let key_name = Self::key_name(key_prefix, worker_type);

        let checks = allowed_regions.iter().map(|region| {
            let key_name = key_name.clone();
            async move {
                let existing = adapter.describe_key_pairs(region).await?;
                Ok::<_, crate::error::ProvisionerError>((region.clone(), existing.contains(&key_name)))
            }
        });
        let results = join_all(checks).await;

        let mut missing_regions = Vec::new();
        for result in results {
            let (region, present) = result?;
            if !present {
                missing_regions.push(region);
            }
        }

        if missing_regions.is_empty() {
            self.known_good.lock().await.insert(worker_type.to_string());
            return Ok(());
        }

        if dry_run {
            tracing::info!(worker_type, regions = ?missing_regions, "DRY RUN: would import key pair");
            return Ok(());
        }

        let imports = missing_regions.iter().map(|region| {
            let key_name = key_name.clone();
            async move { adapter.import_key_pair(region, &key_name, public_key_body).await }
        });
        let results = join_all(imports).await;
        for result in results {
            result?;
        }

        self.known_good.lock().await.insert(worker_type.to_string());
        Ok(())
    }

    /// Drops `worker_type` from the known-good cache, forcing a re-check on
    /// its next `ensure` call. Used by the rogue killer after it deletes a
    /// worker-type's key pairs, so a worker-type that reappears under the
    /// configured set gets re-imported rather than silently trusted.
    pub async fn forget(&self, worker_type: &str) {
        self.known_good.lock().await.remove(worker_type);
    }
}

impl Default for KeyPairManager {
    fn default() -> Self {
        Self::new()
    }
}
