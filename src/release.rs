//! Release metadata: what a release version resolves to.

pub mod catalog;
pub mod version;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::capi::Provider;
use crate::capi::infra::{AzureMarketplaceImage, AzureSharedGalleryImage};
use crate::error::Result;

pub use catalog::ReleaseCatalog;

/// Cluster annotation carrying the OS the nodes were last upgraded to.
pub const OS_INFO_ANNOTATION: &str = "osInfo";

/// Cluster label carrying the release a cluster runs.
pub const RELEASE_LABEL: &str = "capup.io/release";

/// Component versions and images a release pins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComponentConfiguration {
    pub release_version: String,
    pub kubernetes_version: String,
    pub image_repository: String,
    pub core_dns_image_tag: String,
    pub etcd_image_tag: String,
    pub etcd_data_dir: Option<String>,
    pub etcd_extra_args: BTreeMap<String, String>,
    pub default_os: Option<OsInfo>,
}

impl ComponentConfiguration {
    /// Label-safe release name (`+` is not allowed in label values).
    pub fn release_name(&self) -> String {
        release_name(&self.release_version)
    }
}

pub fn release_name(version: &str) -> String {
    version.replace('+', "---")
}

/// Node operating system selector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub name: String,
    pub version: String,
    pub arch: String,
}

impl OsInfo {
    pub fn new(name: &str, version: &str, arch: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            arch: arch.to_string(),
        }
    }

    /// Parse the `name,version,arch` annotation form. Anything other than
    /// exactly three fields is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [name, version, arch] => Some(Self::new(name, version, arch)),
            _ => None,
        }
    }

    pub fn provider_default(provider: Provider) -> Self {
        match provider {
            Provider::VSphere => Self::new("photon", "3", "amd64"),
            Provider::Aws => Self::new("amazon", "2", "amd64"),
            Provider::Azure => Self::new("ubuntu", "18.04", "amd64"),
            Provider::Docker => Self::new("ubuntu", "20.04", "amd64"),
        }
    }
}

impl std::fmt::Display for OsInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.name, self.version, self.arch)
    }
}

/// Azure images come either from the marketplace or a shared gallery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AzureImageIdentity {
    Marketplace(AzureMarketplaceImage),
    SharedGallery(AzureSharedGalleryImage),
}

/// Provider-specific machine image a release resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageIdentity {
    VSphere { template: String, moid: String },
    Aws { ami_id: String },
    Azure(AzureImageIdentity),
    Docker { image: String },
}

impl ImageIdentity {
    pub const fn provider(&self) -> Provider {
        match self {
            Self::VSphere { .. } => Provider::VSphere,
            Self::Aws { .. } => Provider::Aws,
            Self::Azure(_) => Provider::Azure,
            Self::Docker { .. } => Provider::Docker,
        }
    }
}

impl std::fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VSphere { template, moid } => write!(f, "{template} ({moid})"),
            Self::Aws { ami_id } => write!(f, "{ami_id}"),
            Self::Azure(AzureImageIdentity::Marketplace(m)) => {
                write!(f, "{}:{}:{}:{}", m.publisher, m.offer, m.sku, m.version)
            }
            Self::Azure(AzureImageIdentity::SharedGallery(g)) => {
                write!(f, "{}/{}/{}:{}", g.resource_group, g.gallery, g.name, g.version)
            }
            Self::Docker { image } => write!(f, "{image}"),
        }
    }
}

/// Source of per-release component metadata.
pub trait ReleaseMetadataProvider: Send + Sync {
    fn resolve_component_configuration(&self, version: &str) -> Result<ComponentConfiguration>;

    /// `location` is the AWS region; other providers ignore it.
    fn resolve_provider_image_identity(
        &self,
        version: &str,
        provider: Provider,
        location: Option<&str>,
        os: &OsInfo,
    ) -> Result<ImageIdentity>;
}
