//! Version bump for ClusterClass-based clusters.
//!
//! The topology reconciler owns the control plane, worker groups and their
//! templates, so the only write is `spec.topology.version` on the root.

use serde_json::json;
use tracing::info;

use super::UpgradeTimings;
use super::context::UpgradeContext;
use crate::capi::Cluster;
use crate::error::Result;
use crate::k8s::{PatchBody, ResourceClient};
use crate::poll::retry_transient;

/// Patch the topology version unless it already matches. Returns whether a
/// patch was sent.
pub async fn patch_topology_version<C: ResourceClient>(
    client: &C,
    cluster: &Cluster,
    ctx: &UpgradeContext,
    timings: &UpgradeTimings,
) -> Result<bool> {
    let current = cluster.spec.topology.as_ref().map(|t| t.version.as_str());
    if current == Some(ctx.target_version()) {
        info!(cluster = %ctx.cluster, version = %ctx.target_version(), "Topology already at target, skipping patch");
        return Ok(false);
    }
    let patch = PatchBody::Merge(json!({
        "spec": { "topology": { "version": ctx.target_version() } }
    }));
    retry_transient(
        "patch cluster topology",
        timings.retry_interval,
        timings.retry_timeout,
        || client.patch::<Cluster>(&ctx.cluster, &ctx.namespace, &patch),
    )
    .await?;
    info!(
        cluster = %ctx.cluster,
        from = %current.unwrap_or_default(),
        to = %ctx.target_version(),
        "Cluster topology version patched"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capi::cluster::Topology;
    use crate::k8s::fake::{FakeResourceClient, Verb};
    use crate::release::ComponentConfiguration;
    use crate::snapshot::fixtures::*;

    fn context() -> UpgradeContext {
        UpgradeContext {
            cluster: "wc-1".to_string(),
            namespace: NAMESPACE.to_string(),
            is_management: false,
            edition: String::new(),
            skip_addon_upgrade: false,
            class_based: true,
            current_version: "v1.20.5+vmware.2".to_string(),
            target: ComponentConfiguration {
                release_version: "v1.21.2+vmware.1-capup.1".to_string(),
                kubernetes_version: "v1.21.2+vmware.1".to_string(),
                ..Default::default()
            },
            image_repository: String::new(),
            custom_image_repository: false,
            provider: None,
            os: None,
            image: None,
        }
    }

    fn timings() -> UpgradeTimings {
        UpgradeTimings {
            retry_interval: Duration::from_secs(30),
            retry_timeout: Duration::from_secs(300),
            ..UpgradeTimings::default()
        }
    }

    fn class_based(version: &str) -> Cluster {
        let mut c = cluster("wc-1");
        c.spec.topology = Some(Topology {
            class: "tkg-vsphere-default".to_string(),
            version: version.to_string(),
            ..Default::default()
        });
        c
    }

    #[tokio::test]
    async fn test_patch_skipped_when_version_matches() {
        let fake = FakeResourceClient::new();
        let c = class_based("v1.21.2+vmware.1");
        fake.insert(&c);

        let patched = patch_topology_version(&fake, &c, &context(), &timings())
            .await
            .unwrap();
        assert!(!patched);
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_bumps_version_and_keeps_class() {
        let fake = FakeResourceClient::new();
        let c = class_based("v1.20.5+vmware.2");
        fake.insert(&c);
        fake.fail_times(Verb::Patch, "Cluster", 1, "conflict");

        let patched = patch_topology_version(&fake, &c, &context(), &timings())
            .await
            .unwrap();
        assert!(patched);
        assert_eq!(fake.calls_for(Verb::Patch, "Cluster").len(), 2);
        let stored: Cluster = fake.object("wc-1", NAMESPACE).unwrap();
        let topology = stored.spec.topology.unwrap();
        assert_eq!(topology.version, "v1.21.2+vmware.1");
        assert_eq!(topology.class, "tkg-vsphere-default");
    }
}
