//! YAML release catalog backing [`ReleaseMetadataProvider`].
//!
//! ```yaml
//! releases:
//!   - version: v1.21.2+vmware.1-tkg.1
//!     kubernetesVersion: v1.21.2+vmware.1
//!     imageRepository: projects.registry.vmware.com/tkg
//!     coreDns: { imageTag: v1.8.0_vmware.5 }
//!     etcd: { imageTag: v3.4.13_vmware.15, dataDir: /var/lib/etcd }
//!     os: { name: photon, version: "3", arch: amd64 }
//!     aws:
//!       - { region: us-west-2, id: ami-0abc }
//!     vsphere:
//!       - { template: /dc0/vm/photon-3-kube-v1.21.2, moid: vm-42 }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use super::{
    AzureImageIdentity, ComponentConfiguration, ImageIdentity, OsInfo, ReleaseMetadataProvider,
};
use crate::capi::Provider;
use crate::capi::infra::{AzureMarketplaceImage, AzureSharedGalleryImage};
use crate::error::{CapupError, Result};

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseCatalog {
    #[serde(default)]
    pub releases: Vec<ReleaseEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseEntry {
    pub version: String,
    pub kubernetes_version: String,
    pub image_repository: String,
    #[serde(default)]
    pub core_dns: ImageTag,
    #[serde(default)]
    pub etcd: EtcdEntry,
    #[serde(default)]
    pub os: Option<OsInfo>,
    #[serde(default)]
    pub aws: Vec<AwsImage>,
    #[serde(default)]
    pub vsphere: Vec<VSphereImage>,
    #[serde(default)]
    pub azure: Vec<AzureImageEntry>,
    #[serde(default)]
    pub docker: Vec<DockerImage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageTag {
    #[serde(default)]
    pub image_tag: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdEntry {
    #[serde(default)]
    pub image_tag: String,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct AwsImage {
    pub region: String,
    pub id: String,
    #[serde(default)]
    pub os: Option<OsInfo>,
}

#[derive(Debug, Deserialize)]
pub struct VSphereImage {
    pub template: String,
    pub moid: String,
    #[serde(default)]
    pub os: Option<OsInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureImageEntry {
    #[serde(default)]
    pub marketplace: Option<AzureMarketplaceImage>,
    #[serde(default)]
    pub shared_gallery: Option<AzureSharedGalleryImage>,
    #[serde(default)]
    pub os: Option<OsInfo>,
}

#[derive(Debug, Deserialize)]
pub struct DockerImage {
    pub image: String,
    #[serde(default)]
    pub os: Option<OsInfo>,
}

impl ReleaseCatalog {
    /// Load a catalog from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            CapupError::InvalidInput(format!("failed to read catalog {}: {e}", path.display()))
        })?;
        let catalog = Self::from_yaml(&content)
            .map_err(|e| CapupError::InvalidInput(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), releases = catalog.releases.len(), "Loaded release catalog");
        Ok(catalog)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let catalog: Self = serde_yaml::from_str(content)
            .map_err(|e| CapupError::InvalidInput(format!("failed to parse catalog: {e}")))?;
        if catalog.releases.is_empty() {
            return Err(CapupError::InvalidInput(
                "no releases found in catalog".to_string(),
            ));
        }
        Ok(catalog)
    }

    /// Match on the release version first, then on the kubernetes version.
    fn release(&self, version: &str) -> Result<&ReleaseEntry> {
        self.releases
            .iter()
            .find(|r| r.version == version)
            .or_else(|| self.releases.iter().find(|r| r.kubernetes_version == version))
            .ok_or_else(|| {
                CapupError::Precondition(format!("release {version} not found in catalog"))
            })
    }
}

/// An image entry without its own OS inherits the release default.
fn os_matches(entry: Option<&OsInfo>, release_default: Option<&OsInfo>, wanted: &OsInfo) -> bool {
    entry.or(release_default).is_none_or(|os| os == wanted)
}

impl ReleaseMetadataProvider for ReleaseCatalog {
    fn resolve_component_configuration(&self, version: &str) -> Result<ComponentConfiguration> {
        let release = self.release(version)?;
        Ok(ComponentConfiguration {
            release_version: release.version.clone(),
            kubernetes_version: release.kubernetes_version.clone(),
            image_repository: release.image_repository.clone(),
            core_dns_image_tag: release.core_dns.image_tag.clone(),
            etcd_image_tag: release.etcd.image_tag.clone(),
            etcd_data_dir: release.etcd.data_dir.clone(),
            etcd_extra_args: release.etcd.extra_args.clone(),
            default_os: release.os.clone(),
        })
    }

    fn resolve_provider_image_identity(
        &self,
        version: &str,
        provider: Provider,
        location: Option<&str>,
        os: &OsInfo,
    ) -> Result<ImageIdentity> {
        let release = self.release(version)?;
        let default_os = release.os.as_ref();
        let found = match provider {
            Provider::Aws => {
                let region = location.ok_or_else(|| {
                    CapupError::Precondition("an AWS region is required to resolve the AMI".to_string())
                })?;
                release
                    .aws
                    .iter()
                    .find(|i| i.region == region && os_matches(i.os.as_ref(), default_os, os))
                    .map(|i| ImageIdentity::Aws {
                        ami_id: i.id.clone(),
                    })
            }
            Provider::VSphere => release
                .vsphere
                .iter()
                .find(|i| os_matches(i.os.as_ref(), default_os, os))
                .map(|i| ImageIdentity::VSphere {
                    template: i.template.clone(),
                    moid: i.moid.clone(),
                }),
            Provider::Azure => release
                .azure
                .iter()
                .filter(|i| os_matches(i.os.as_ref(), default_os, os))
                .find_map(|i| match (&i.marketplace, &i.shared_gallery) {
                    (_, Some(gallery)) => Some(ImageIdentity::Azure(
                        AzureImageIdentity::SharedGallery(gallery.clone()),
                    )),
                    (Some(market), None) => Some(ImageIdentity::Azure(
                        AzureImageIdentity::Marketplace(market.clone()),
                    )),
                    (None, None) => None,
                }),
            Provider::Docker => release
                .docker
                .iter()
                .find(|i| os_matches(i.os.as_ref(), default_os, os))
                .map(|i| ImageIdentity::Docker {
                    image: i.image.clone(),
                }),
        };
        found.ok_or_else(|| {
            CapupError::Precondition(format!(
                "no {provider} image for release {} with os {os}{}",
                release.version,
                location.map(|l| format!(" in {l}")).unwrap_or_default()
            ))
        })
    }
}
