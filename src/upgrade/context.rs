//! Everything an upgrade run needs, resolved once up front.
//!
//! Nothing here mutates the cluster: a bad release, a downgrade or an
//! unsupported upgrade path fails before the first write.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::addons::catalog::RELEASE_NAMESPACE;
use crate::capi::control_plane::ImageMeta;
use crate::capi::{ObjectReference, Provider};
use crate::error::{CapupError, Result, StepContext};
use crate::k8s::ResourceClient;
use crate::release::version::verify_upgrade;
use crate::release::{
    ComponentConfiguration, ImageIdentity, OS_INFO_ANNOTATION, OsInfo, ReleaseMetadataProvider,
};
use crate::snapshot::ClusterSnapshot;

/// ConfigMap on the management cluster that overrides the image repository.
pub const RELEASE_CONTROLLER_CONFIG: &str = "release-controller-config";

/// Explicit OS selection from the command line. Unset fields fall back to
/// the cluster's recorded OS, then the release default, then the provider's.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OsOptions {
    pub name: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
}

impl OsOptions {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.version.is_none() && self.arch.is_none()
    }

    fn over(&self, fallback: OsInfo) -> OsInfo {
        OsInfo {
            name: self.name.clone().unwrap_or(fallback.name),
            version: self.version.clone().unwrap_or(fallback.version),
            arch: self.arch.clone().unwrap_or(fallback.arch),
        }
    }
}

/// What to upgrade and to which release.
#[derive(Clone, Debug, Default)]
pub struct UpgradeRequest {
    pub cluster: String,
    pub namespace: String,
    /// Release version as listed in the catalog.
    pub release: String,
    pub is_management: bool,
    pub edition: String,
    pub skip_addon_upgrade: bool,
    pub os: OsOptions,
    /// AWS region used to pick the AMI.
    pub region: Option<String>,
}

/// Resolved state threaded through every upgrade step.
#[derive(Clone, Debug)]
pub struct UpgradeContext {
    pub cluster: String,
    pub namespace: String,
    pub is_management: bool,
    pub edition: String,
    pub skip_addon_upgrade: bool,
    pub class_based: bool,
    pub current_version: String,
    pub target: ComponentConfiguration,
    /// Repository the cluster pulls images from: the catalog's, unless the
    /// management cluster overrides it.
    pub image_repository: String,
    pub custom_image_repository: bool,
    pub provider: Option<Provider>,
    pub os: Option<OsInfo>,
    /// Machine image for new templates. Class-based clusters leave it unset.
    pub image: Option<ImageIdentity>,
}

impl UpgradeContext {
    pub fn target_version(&self) -> &str {
        &self.target.kubernetes_version
    }
}

/// Worker group as it is declared today.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfiguration {
    pub name: String,
    pub version: Option<String>,
    pub template: ObjectReference,
}

/// Component versions and templates the cluster currently declares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActualConfiguration {
    pub kubernetes_version: String,
    pub image_repository: String,
    pub dns: ImageMeta,
    pub etcd_image_repository: String,
    pub etcd_image_tag: String,
    pub control_plane_template: ObjectReference,
    pub workers: Vec<WorkerConfiguration>,
}

impl ActualConfiguration {
    pub fn from_snapshot(snapshot: &ClusterSnapshot) -> Result<Self> {
        let kcp = snapshot.control_plane.as_ref().ok_or_else(|| {
            CapupError::not_found(
                "KubeadmControlPlane",
                &snapshot.namespace(),
                &format!("{}-control-plane", snapshot.name()),
            )
        })?;
        let cluster_configuration = &kcp.spec.kubeadm_config_spec.cluster_configuration;
        let etcd = kcp.local_etcd();
        Ok(Self {
            kubernetes_version: kcp.spec.version.clone(),
            image_repository: cluster_configuration.image_repository.clone(),
            dns: cluster_configuration.dns.clone(),
            etcd_image_repository: etcd.image_repository,
            etcd_image_tag: etcd.image_tag,
            control_plane_template: kcp.infrastructure_ref().clone(),
            workers: snapshot
                .machine_deployments
                .iter()
                .map(|md| WorkerConfiguration {
                    name: md.name_any(),
                    version: md.version().map(ToString::to_string),
                    template: md.infrastructure_ref().clone(),
                })
                .collect(),
        })
    }
}

/// Image repository from the release controller's ConfigMap, if set.
pub async fn image_repository_override<C: ResourceClient>(client: &C) -> Result<Option<String>> {
    let cm = client
        .get_opt::<ConfigMap>(RELEASE_CONTROLLER_CONFIG, RELEASE_NAMESPACE)
        .await?;
    Ok(cm
        .and_then(|cm| cm.data)
        .and_then(|data| data.get("imageRepository").cloned())
        .filter(|repo| !repo.is_empty()))
}

/// Pick the node OS. Explicit options win field by field over the fallback.
pub fn resolve_os(
    options: &OsOptions,
    annotation: Option<&str>,
    release_default: Option<&OsInfo>,
    provider: Option<Provider>,
) -> Option<OsInfo> {
    let fallback = annotation
        .and_then(OsInfo::parse)
        .or_else(|| release_default.cloned())
        .or_else(|| provider.map(OsInfo::provider_default));
    match fallback {
        Some(fallback) => Some(options.over(fallback)),
        None if options.is_empty() => None,
        None => Some(options.over(OsInfo::default())),
    }
}

fn current_version(snapshot: &ClusterSnapshot) -> Result<String> {
    if let Some(topology) = snapshot.cluster.spec.topology.as_ref() {
        return Ok(topology.version.clone());
    }
    snapshot
        .control_plane
        .as_ref()
        .map(|kcp| kcp.spec.version.clone())
        .ok_or_else(|| {
            CapupError::not_found(
                "KubeadmControlPlane",
                &snapshot.namespace(),
                &format!("{}-control-plane", snapshot.name()),
            )
        })
}

/// Resolve the target release and everything derived from it.
pub async fn resolve<M: ResourceClient>(
    management: &M,
    releases: &dyn ReleaseMetadataProvider,
    request: &UpgradeRequest,
    snapshot: &ClusterSnapshot,
) -> Result<UpgradeContext> {
    let target = releases
        .resolve_component_configuration(&request.release)
        .step("resolve release")?;
    let current = current_version(snapshot).step("read current version")?;
    verify_upgrade(&current, &target.kubernetes_version).step("verify upgrade path")?;

    let class_based = snapshot.cluster.is_class_based();
    let provider = snapshot
        .control_plane
        .as_ref()
        .and_then(|kcp| Provider::from_template_kind(&kcp.infrastructure_ref().kind));
    if provider.is_none() && !class_based {
        let kind = snapshot
            .control_plane
            .as_ref()
            .map(|kcp| kcp.infrastructure_ref().kind.clone())
            .unwrap_or_default();
        return Err(CapupError::InvalidInput(format!(
            "unsupported infrastructure template kind '{kind}'"
        ))
        .in_step("detect provider"));
    }

    let os = resolve_os(
        &request.os,
        snapshot
            .cluster
            .annotations()
            .get(OS_INFO_ANNOTATION)
            .map(String::as_str),
        target.default_os.as_ref(),
        provider,
    );

    let image = match (class_based, provider, os.as_ref()) {
        (false, Some(provider), Some(os)) => Some(
            releases
                .resolve_provider_image_identity(
                    &request.release,
                    provider,
                    request.region.as_deref(),
                    os,
                )
                .step("resolve machine image")?,
        ),
        _ => None,
    };

    let override_repo = image_repository_override(management)
        .await
        .step("read image repository override")?;
    let custom_image_repository = override_repo
        .as_ref()
        .is_some_and(|repo| *repo != target.image_repository);
    let image_repository = override_repo.unwrap_or_else(|| target.image_repository.clone());
    if custom_image_repository {
        debug!(repository = %image_repository, "Using custom image repository");
    }

    info!(
        cluster = %request.cluster,
        namespace = %request.namespace,
        from = %current,
        to = %target.kubernetes_version,
        release = %target.release_version,
        class_based,
        "Resolved upgrade target"
    );

    Ok(UpgradeContext {
        cluster: request.cluster.clone(),
        namespace: request.namespace.clone(),
        is_management: request.is_management,
        edition: request.edition.clone(),
        skip_addon_upgrade: request.skip_addon_upgrade,
        class_based,
        current_version: current,
        target,
        image_repository,
        custom_image_repository,
        provider,
        os,
        image,
    })
}
