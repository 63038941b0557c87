//! Control-plane version and template patch.

use kube::ResourceExt;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::UpgradeTimings;
use super::context::UpgradeContext;
use crate::capi::{KubeadmControlPlane, ObjectReference};
use crate::error::Result;
use crate::k8s::{PatchBody, ResourceClient};
use crate::poll::retry_transient;

/// True when the control plane already declares the target version and
/// references `template`.
pub fn is_up_to_date(kcp: &KubeadmControlPlane, ctx: &UpgradeContext, template: &ObjectReference) -> bool {
    kcp.spec.version == ctx.target_version() && kcp.infrastructure_ref().name == template.name
}

pub(crate) fn reference_patch(template: &ObjectReference) -> Value {
    let mut reference = Map::new();
    reference.insert("name".to_string(), Value::String(template.name.clone()));
    if !template.namespace.is_empty() {
        reference.insert(
            "namespace".to_string(),
            Value::String(template.namespace.clone()),
        );
    }
    Value::Object(reference)
}

/// Merge patch moving the control plane to the target release.
pub fn control_plane_patch(kcp: &KubeadmControlPlane, ctx: &UpgradeContext, template: &ObjectReference) -> Value {
    let mut extra_args = kcp.local_etcd().extra_args;
    extra_args.extend(ctx.target.etcd_extra_args.clone());

    let mut local = json!({
        "imageRepository": ctx.image_repository,
        "imageTag": ctx.target.etcd_image_tag,
    });
    if !extra_args.is_empty() {
        local["extraArgs"] = json!(extra_args);
    }
    if let Some(data_dir) = ctx.target.etcd_data_dir.as_deref() {
        local["dataDir"] = Value::String(data_dir.to_string());
    }

    json!({
        "spec": {
            "version": ctx.target_version(),
            "machineTemplate": { "infrastructureRef": reference_patch(template) },
            "kubeadmConfigSpec": {
                "clusterConfiguration": {
                    "imageRepository": ctx.image_repository,
                    "dns": {
                        "imageRepository": ctx.image_repository,
                        "imageTag": ctx.target.core_dns_image_tag,
                    },
                    "etcd": { "local": local },
                }
            }
        }
    })
}

/// Patch the control plane unless it is already up to date. Returns whether
/// a patch was sent.
pub async fn patch_control_plane<C: ResourceClient>(
    client: &C,
    kcp: &KubeadmControlPlane,
    ctx: &UpgradeContext,
    template: &ObjectReference,
    timings: &UpgradeTimings,
) -> Result<bool> {
    let name = kcp.name_any();
    if is_up_to_date(kcp, ctx, template) {
        info!(name = %name, version = %ctx.target_version(), "Control plane already at target, skipping patch");
        return Ok(false);
    }

    let patch = PatchBody::Merge(control_plane_patch(kcp, ctx, template));
    debug!(name = %name, patch = ?patch, "Patching control plane");
    retry_transient(
        "patch control plane",
        timings.retry_interval,
        timings.retry_timeout,
        || client.patch::<KubeadmControlPlane>(&name, &ctx.namespace, &patch),
    )
    .await?;
    info!(name = %name, from = %kcp.spec.version, to = %ctx.target_version(), "Control plane patched");
    Ok(true)
}
