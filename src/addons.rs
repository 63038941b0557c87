//! Add-on upgrade sequencer.
//!
//! Runs before the node upgrade (controllers that must tolerate the new
//! version) and after it (metadata and package repositories). Every add-on
//! in a sequence is attempted; failures are collected and returned together.

pub mod catalog;
pub mod render;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use tracing::{info, warn};

use crate::capi::{CLUSTER_NAME_LABEL, ClusterResourceSet, ClusterResourceSetSpec, LabelSelector, ResourceRef};
use crate::error::{CapupError, Result};
use crate::k8s::ResourceClient;

pub use catalog::{ApplyMode, ApplyTarget, post_node_addons, pre_node_addons};
pub use render::{AddonRenderer, DirectoryRenderer, RenderContext};

const APPLY_ONCE: &str = "ApplyOnce";

fn short_name(addon: &str) -> &str {
    addon.rsplit('/').next().unwrap_or(addon)
}

/// ConfigMap plus `ApplyOnce` ClusterResourceSet delivering `rendered` to the
/// cluster named in `ctx`.
pub fn declarative_manifest(addon: &str, rendered: &str, ctx: &RenderContext) -> Result<String> {
    let name = format!("{}-{}", ctx.cluster_name, short_name(addon));
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ctx.cluster_namespace.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("value".to_string(), rendered.to_string())])),
        ..Default::default()
    };
    let mut crs = ClusterResourceSet::new(
        &name,
        ClusterResourceSetSpec {
            cluster_selector: LabelSelector {
                match_labels: BTreeMap::from([(
                    CLUSTER_NAME_LABEL.to_string(),
                    ctx.cluster_name.clone(),
                )]),
            },
            resources: vec![ResourceRef {
                name: name.clone(),
                kind: "ConfigMap".to_string(),
            }],
            strategy: APPLY_ONCE.to_string(),
        },
    );
    crs.metadata.namespace = Some(ctx.cluster_namespace.clone());

    let encode = |e: serde_yaml::Error| CapupError::InvalidInput(format!("encode {addon}: {e}"));
    let config_map = serde_yaml::to_string(&config_map).map_err(encode)?;
    let crs = serde_yaml::to_string(&crs).map_err(encode)?;
    Ok(format!("{config_map}---\n{crs}"))
}

async fn upgrade_addon<M, W>(
    management: &M,
    current: &W,
    renderer: &dyn AddonRenderer,
    ctx: &RenderContext,
    addon: &str,
) -> Result<()>
where
    M: ResourceClient,
    W: ResourceClient,
{
    let policy = catalog::policy(addon).ok_or_else(|| {
        CapupError::InvalidInput(format!("upgrade of '{addon}' is not supported"))
    })?;
    if policy.management_only && !ctx.is_management {
        return Err(CapupError::Precondition(format!(
            "upgrade of '{addon}' is only supported on a management cluster"
        )));
    }

    let mut item_ctx = ctx.clone();
    if let Some(namespace) = policy.namespace {
        item_ctx.target_namespace = namespace.to_string();
    }
    let rendered = renderer.render(addon, &item_ctx)?;
    let manifest = match policy.mode {
        ApplyMode::Direct => rendered,
        ApplyMode::Declarative => declarative_manifest(addon, &rendered, &item_ctx)?,
    };

    info!(addon = %addon, cluster = %ctx.cluster_name, "Upgrading add-on");
    match policy.target {
        ApplyTarget::Management => management.apply_manifest(&manifest).await,
        ApplyTarget::Current => current.apply_manifest(&manifest).await,
    }
}

/// Upgrade `addons` in order, attempting every one of them.
pub async fn upgrade_addons<M, W>(
    management: &M,
    current: &W,
    renderer: &dyn AddonRenderer,
    ctx: &RenderContext,
    addons: &[&str],
) -> Result<()>
where
    M: ResourceClient,
    W: ResourceClient,
{
    let mut errors = Vec::new();
    for addon in addons {
        if let Err(e) = upgrade_addon(management, current, renderer, ctx, addon).await {
            warn!(addon = %addon, error = %e, "Add-on upgrade failed");
            errors.push(e.in_step(format!("upgrade add-on '{addon}'")));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CapupError::Aggregate(errors))
    }
}
