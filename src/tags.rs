use crate::cloud::CloudAdapter;
use crate::snapshot::FleetSnapshot;
use std::collections::HashMap;

/// Builds the tag set applied to every instance/request belonging to
/// `worker_type` (spec section 7): `Name`, `Owner`, and a `WorkerType` tag
/// scoped by provisioner so two provisioners sharing an account don't
/// collide on the same worker-type name.
fn tags_for(worker_type: &str, provisioner_id: &str) -> Vec<(String, String)> {
    vec![
        ("Name".to_string(), worker_type.to_string()),
        ("Owner".to_string(), provisioner_id.to_string()),
        ("WorkerType".to_string(), format!("{provisioner_id}/{worker_type}")),
    ]
}

/// Applies tags to every instance and request in `snapshot`, one batched
/// `createTags` call per region. Tagging is best-effort: a region's failure
/// is logged and does not fail the iteration, since an untagged resource
/// just gets retried next time around (spec section 7).
pub async fn apply(adapter: &dyn CloudAdapter, snapshot: &FleetSnapshot, provisioner_id: &str) {
    let mut by_region: HashMap<&str, Vec<(&str, &str)>> = HashMap::new();

    for instance in snapshot.instances() {
        by_region
            .entry(&instance.region)
            .or_default()
            .push((&instance.instance_id, &instance.worker_type));
    }
    for request in snapshot.requests() {
        by_region
            .entry(&request.region)
            .or_default()
            .push((&request.request_id, &request.worker_type));
    }

    for (region, resources) in by_region {
        for (resource_id, worker_type) in resources {
            let tags = tags_for(worker_type, provisioner_id);
            if let Err(e) = adapter.create_tags(region, std::slice::from_ref(&resource_id.to_string()), &tags).await {
                tracing::warn!(region, resource_id, error = %e, "createTags failed; will retry next iteration");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloudAdapter;
    use crate::cloud::{InstanceState, RequestState, StatusCode};
    use crate::snapshot::{Instance, SpotRequest};

    fn instance(id: &str, worker_type: &str, region: &str) -> Instance {
        Instance {
            instance_id: id.to_string(),
            region: region.to_string(),
            zone: format!("{region}a"),
            worker_type: worker_type.to_string(),
            instance_type: "t.small".to_string(),
            image_id: "ami-1".to_string(),
            launch_time: Some(0),
            state: InstanceState::Running,
            spot_request_id: None,
            state_reason: None,
            key_name: format!("fleet-{worker_type}"),
        }
    }

    fn request(id: &str, worker_type: &str, region: &str) -> SpotRequest {
        SpotRequest {
            request_id: id.to_string(),
            region: region.to_string(),
            zone: format!("{region}a"),
            worker_type: worker_type.to_string(),
            instance_type: "t.small".to_string(),
            image_id: "ami-1".to_string(),
            create_time: 0,
            state: RequestState::Open,
            status_code: StatusCode::PendingEvaluation,
            status_update_time: 0,
            bid_price: 0.05,
            instance_id: None,
        }
    }

    #[test]
    fn tags_include_owner_and_scoped_worker_type() {
        let tags = tags_for("gpu-heavy", "prov-1");
        assert!(tags.contains(&("Name".to_string(), "gpu-heavy".to_string())));
        assert!(tags.contains(&("Owner".to_string(), "prov-1".to_string())));
        assert!(tags.contains(&("WorkerType".to_string(), "prov-1/gpu-heavy".to_string())));
    }

    #[tokio::test]
    async fn applies_tags_to_every_instance_and_request() {
        let snapshot = FleetSnapshot::new(
            vec![instance("i-1", "w", "us-east-1"), instance("i-2", "w", "us-west-2")],
            vec![request("sir-1", "w", "us-east-1")],
        );
        let adapter = MockCloudAdapter::new();

        apply(&adapter, &snapshot, "prov-1").await;

        let applied = adapter.tags_applied.lock().unwrap();
        assert_eq!(applied.len(), 3);
        assert!(applied.contains(&("us-east-1".to_string(), "i-1".to_string())));
        assert!(applied.contains(&("us-west-2".to_string(), "i-2".to_string())));
        assert!(applied.contains(&("us-east-1".to_string(), "sir-1".to_string())));
    }
}
