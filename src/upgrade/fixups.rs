//! Correctness patches on the workload cluster that are unrelated to the
//! version itself.

use std::collections::BTreeMap;

use json_patch::{
    AddOperation, Patch, PatchOperation, RemoveOperation, ReplaceOperation, TestOperation,
};
use jsonptr::PointerBuf;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, PodSpec};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{CapupError, Result};
use crate::k8s::{ClusterObject, PatchBody, ResourceClient};

pub const KUBE_SYSTEM: &str = "kube-system";
pub const CALICO_NODE: &str = "calico-node";
pub const CALICO_KUBE_CONTROLLERS: &str = "calico-kube-controllers";
pub const KUBE_PROXY: &str = "kube-proxy";
pub const KUBEADM_CONFIG: &str = "kubeadm-config";

const OS_SELECTOR: &str = "kubernetes.io/os";
const BETA_OS_SELECTOR: &str = "beta.kubernetes.io/os";
const NODE_SELECTOR_TOKENS: [&str; 4] = ["spec", "template", "spec", "nodeSelector"];
const CLUSTER_CONFIGURATION_KEY: &str = "ClusterConfiguration";

/// JSON patch moving a pod template to the `kubernetes.io/os: linux` node
/// selector, or `None` when it is already there.
pub fn node_selector_migration(selector: Option<&BTreeMap<String, String>>) -> Option<Patch> {
    let path =
        |key: Option<&str>| PointerBuf::from_tokens(NODE_SELECTOR_TOKENS.into_iter().chain(key));
    let Some(selector) = selector else {
        return Some(Patch(vec![PatchOperation::Add(AddOperation {
            path: path(None),
            value: json!({ OS_SELECTOR: "linux" }),
        })]));
    };
    let migrated = selector.get(OS_SELECTOR).is_some_and(|v| v == "linux");
    if migrated && !selector.contains_key(BETA_OS_SELECTOR) {
        return None;
    }
    let mut ops = Vec::new();
    if selector.contains_key(BETA_OS_SELECTOR) {
        ops.push(PatchOperation::Remove(RemoveOperation {
            path: path(Some(BETA_OS_SELECTOR)),
        }));
    }
    if !migrated {
        ops.push(PatchOperation::Add(AddOperation {
            path: path(Some(OS_SELECTOR)),
            value: Value::String("linux".to_string()),
        }));
    }
    Some(Patch(ops))
}

async fn migrate_node_selector<C, K>(
    client: &C,
    name: &str,
    pod_spec: impl Fn(&K) -> Option<&PodSpec>,
) -> Result<()>
where
    C: ResourceClient,
    K: ClusterObject,
{
    let Some(obj) = client.get_opt::<K>(name, KUBE_SYSTEM).await? else {
        debug!(kind = %K::kind(&()), name = %name, "Not installed, skipping node selector migration");
        return Ok(());
    };
    let selector = pod_spec(&obj).and_then(|spec| spec.node_selector.as_ref());
    let Some(ops) = node_selector_migration(selector) else {
        debug!(kind = %K::kind(&()), name = %name, "Node selector already migrated");
        return Ok(());
    };
    info!(kind = %K::kind(&()), name = %name, "Migrating node selector to {OS_SELECTOR}");
    client
        .patch::<K>(name, KUBE_SYSTEM, &PatchBody::Json(ops))
        .await?;
    Ok(())
}

/// Move calico off the deprecated `beta.kubernetes.io/os` node label.
pub async fn migrate_calico_node_selectors<C: ResourceClient>(client: &C) -> Result<()> {
    migrate_node_selector::<C, DaemonSet>(client, CALICO_NODE, |ds| {
        ds.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    })
    .await?;
    migrate_node_selector::<C, Deployment>(client, CALICO_KUBE_CONTROLLERS, |d| {
        d.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    })
    .await
}

/// Kubeadm `ClusterConfiguration` YAML with `dns.imageRepository` set to
/// `repository`, or `None` when it already is.
pub fn with_dns_image_repository(cluster_configuration: &str, repository: &str) -> Result<Option<String>> {
    let invalid = |msg: String| CapupError::InvalidInput(format!("{KUBEADM_CONFIG}: {msg}"));
    let mut doc: Value = serde_yaml::from_str(cluster_configuration).map_err(|e| invalid(e.to_string()))?;
    let root = doc
        .as_object_mut()
        .ok_or_else(|| invalid(format!("{CLUSTER_CONFIGURATION_KEY} is not a mapping")))?;
    let dns = root
        .entry("dns")
        .or_insert_with(|| Value::Object(serde_json::Map::new()))
        .as_object_mut()
        .ok_or_else(|| invalid("dns is not a mapping".to_string()))?;
    if dns.get("imageRepository").and_then(Value::as_str) == Some(repository) {
        return Ok(None);
    }
    dns.insert(
        "imageRepository".to_string(),
        Value::String(repository.to_string()),
    );
    serde_yaml::to_string(&doc)
        .map(Some)
        .map_err(|e| invalid(e.to_string()))
}

/// Point CoreDNS at `repository` in the kubeadm ConfigMap so nodes can pull
/// the new image before the rollout starts.
pub async fn stage_coredns_image_repository<C: ResourceClient>(client: &C, repository: &str) -> Result<()> {
    let Some(cm) = client.get_opt::<ConfigMap>(KUBEADM_CONFIG, KUBE_SYSTEM).await? else {
        debug!("No {KUBEADM_CONFIG} ConfigMap, skipping CoreDNS repository");
        return Ok(());
    };
    let Some(raw) = cm
        .data
        .as_ref()
        .and_then(|d| d.get(CLUSTER_CONFIGURATION_KEY))
    else {
        return Ok(());
    };
    let Some(updated) = with_dns_image_repository(raw, repository)? else {
        debug!(repository = %repository, "CoreDNS image repository already staged");
        return Ok(());
    };
    info!(repository = %repository, "Staging CoreDNS image repository in {KUBEADM_CONFIG}");
    let patch = PatchBody::Merge(json!({ "data": { CLUSTER_CONFIGURATION_KEY: updated } }));
    client
        .patch::<ConfigMap>(KUBEADM_CONFIG, KUBE_SYSTEM, &patch)
        .await?;
    Ok(())
}

/// `image` with everything before its last path segment replaced by `repository`.
pub fn with_repository(image: &str, repository: &str) -> String {
    let name = image.rsplit('/').next().unwrap_or(image);
    format!("{}/{name}", repository.trim_end_matches('/'))
}

/// Re-point the kube-proxy container at `repository`.
pub async fn repoint_kube_proxy<C: ResourceClient>(client: &C, repository: &str) -> Result<()> {
    let Some(ds) = client.get_opt::<DaemonSet>(KUBE_PROXY, KUBE_SYSTEM).await? else {
        debug!("No {KUBE_PROXY} DaemonSet, skipping image repository update");
        return Ok(());
    };
    let containers = ds
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| p.containers.as_slice())
        .unwrap_or_default();
    let Some((index, image)) = containers
        .iter()
        .enumerate()
        .find(|(_, c)| c.name == KUBE_PROXY)
        .and_then(|(i, c)| c.image.as_deref().map(|image| (i, image)))
    else {
        return Ok(());
    };
    let updated = with_repository(image, repository);
    if updated == image {
        return Ok(());
    }
    info!(from = %image, to = %updated, "Updating {KUBE_PROXY} image repository");
    let index = index.to_string();
    let path = PointerBuf::from_tokens([
        "spec",
        "template",
        "spec",
        "containers",
        index.as_str(),
        "image",
    ]);
    let ops = Patch(vec![
        PatchOperation::Test(TestOperation {
            path: path.clone(),
            value: Value::String(image.to_string()),
        }),
        PatchOperation::Replace(ReplaceOperation {
            path,
            value: Value::String(updated),
        }),
    ]);
    client
        .patch::<DaemonSet>(KUBE_PROXY, KUBE_SYSTEM, &PatchBody::Json(ops))
        .await?;
    Ok(())
}
