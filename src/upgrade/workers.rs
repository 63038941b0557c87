//! Worker group version and template patches.

use kube::ResourceExt;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::UpgradeTimings;
use super::context::UpgradeContext;
use super::control_plane::reference_patch;
use crate::capi::{MachineDeployment, ObjectReference};
use crate::error::Result;
use crate::k8s::{PatchBody, ResourceClient};
use crate::poll::retry_transient;

pub fn is_up_to_date(md: &MachineDeployment, ctx: &UpgradeContext, template: &ObjectReference) -> bool {
    md.version() == Some(ctx.target_version()) && md.infrastructure_ref().name == template.name
}

/// Merge patch moving one worker group to the target version and template.
pub fn worker_patch(ctx: &UpgradeContext, template: &ObjectReference) -> Value {
    json!({
        "spec": {
            "template": {
                "spec": {
                    "version": ctx.target_version(),
                    "infrastructureRef": reference_patch(template),
                }
            }
        }
    })
}

/// Patch `md` unless it is already up to date. Returns whether a patch was sent.
pub async fn patch_worker<C: ResourceClient>(
    client: &C,
    md: &MachineDeployment,
    ctx: &UpgradeContext,
    template: &ObjectReference,
    timings: &UpgradeTimings,
) -> Result<bool> {
    let name = md.name_any();
    if is_up_to_date(md, ctx, template) {
        debug!(name = %name, "Worker group already at target, skipping patch");
        return Ok(false);
    }
    let patch = PatchBody::Merge(worker_patch(ctx, template));
    retry_transient(
        "patch worker group",
        timings.retry_interval,
        timings.retry_timeout,
        || client.patch::<MachineDeployment>(&name, &ctx.namespace, &patch),
    )
    .await?;
    info!(
        name = %name,
        version = %ctx.target_version(),
        template = %template.name,
        "Worker group patched"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
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
            class_based: false,
            current_version: "v1.20.5+vmware.2".to_string(),
            target: ComponentConfiguration {
                release_version: "v1.21.2+vmware.1-capup.1".to_string(),
                kubernetes_version: "v1.21.2+vmware.1".to_string(),
                image_repository: "registry.example.com/capup".to_string(),
                ..Default::default()
            },
            image_repository: "registry.example.com/capup".to_string(),
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

    fn worker(version: &str, template: &str) -> MachineDeployment {
        let mut md = machine_deployment("wc-1", "wc-1-md-0", version, 2);
        md.spec.template.spec.infrastructure_ref = template_ref("DockerMachineTemplate", template);
        md
    }

    #[test]
    fn test_up_to_date_needs_version_and_template() {
        let ctx = context();
        let new_template = template_ref("DockerMachineTemplate", "wc-1-md-0-new");

        assert!(is_up_to_date(&worker("v1.21.2+vmware.1", "wc-1-md-0-new"), &ctx, &new_template));
        assert!(!is_up_to_date(&worker("v1.21.2+vmware.1", "wc-1-md-0"), &ctx, &new_template));
        assert!(!is_up_to_date(&worker("v1.20.5+vmware.2", "wc-1-md-0-new"), &ctx, &new_template));
    }

    #[tokio::test]
    async fn test_patch_skipped_when_up_to_date() {
        let fake = FakeResourceClient::new();
        let md = worker("v1.21.2+vmware.1", "wc-1-md-0-new");
        fake.insert(&md);
        let template = md.infrastructure_ref().clone();

        let patched = patch_worker(&fake, &md, &context(), &template, &timings())
            .await
            .unwrap();
        assert!(!patched);
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_retries_conflicts() {
        let fake = FakeResourceClient::new();
        let md = worker("v1.20.5+vmware.2", "wc-1-md-0");
        fake.insert(&md);
        fake.fail_times(Verb::Patch, "MachineDeployment", 2, "conflict");
        let template = template_ref("DockerMachineTemplate", "wc-1-md-0-new");

        let patched = patch_worker(&fake, &md, &context(), &template, &timings())
            .await
            .unwrap();
        assert!(patched);
        assert_eq!(fake.calls_for(Verb::Patch, "MachineDeployment").len(), 3);
        let stored: MachineDeployment = fake.object("wc-1-md-0", NAMESPACE).unwrap();
        assert_eq!(stored.version(), Some("v1.21.2+vmware.1"));
        assert_eq!(stored.infrastructure_ref().name, "wc-1-md-0-new");
        assert_eq!(stored.spec_replicas(), 2);
    }
}
