//! Provider machine templates (vSphere, AWS, Azure, Docker).
//!
//! Each template is typed down to its image identity field; every sibling
//! field is carried in `extra` so copies keep sizing, networking and the rest.

#![allow(clippy::upper_case_acronyms)]

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Annotation holding the vCenter managed object id of the VM template.
pub const VM_TEMPLATE_MOID_ANNOTATION: &str = "vmTemplateMoid";

/// Supported infrastructure providers, keyed by machine template kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Provider {
    VSphere,
    Aws,
    Azure,
    Docker,
}

impl Provider {
    pub fn from_template_kind(kind: &str) -> Option<Self> {
        match kind {
            "VSphereMachineTemplate" => Some(Self::VSphere),
            "AWSMachineTemplate" => Some(Self::Aws),
            "AzureMachineTemplate" => Some(Self::Azure),
            "DockerMachineTemplate" => Some(Self::Docker),
            _ => None,
        }
    }

    pub const fn template_kind(self) -> &'static str {
        match self {
            Self::VSphere => "VSphereMachineTemplate",
            Self::Aws => "AWSMachineTemplate",
            Self::Azure => "AzureMachineTemplate",
            Self::Docker => "DockerMachineTemplate",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VSphere => "vsphere",
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Docker => "docker",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// vSphere
// ============================================================================

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VSphereMachineTemplate",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineTemplateSpec {
    #[serde(default)]
    pub template: VSphereMachineTemplateResource,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineTemplateResource {
    #[serde(default)]
    pub spec: VSphereMachineSpec,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineSpec {
    /// VM template (OVA) name the machines are cloned from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// ============================================================================
// AWS
// ============================================================================

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2",
    kind = "AWSMachineTemplate",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AWSMachineTemplateSpec {
    #[serde(default)]
    pub template: AWSMachineTemplateResource,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AWSMachineTemplateResource {
    #[serde(default)]
    pub spec: AWSMachineSpec,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AWSMachineSpec {
    #[serde(default)]
    pub ami: AmiReference,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AmiReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// ============================================================================
// Azure
// ============================================================================

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "AzureMachineTemplate",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AzureMachineTemplateSpec {
    #[serde(default)]
    pub template: AzureMachineTemplateResource,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureMachineTemplateResource {
    #[serde(default)]
    pub spec: AzureMachineSpec,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureMachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<AzureImage>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Azure VM image: either a marketplace image or a shared gallery image.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketplace: Option<AzureMarketplaceImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_gallery: Option<AzureSharedGalleryImage>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureMarketplaceImage {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
    #[serde(default)]
    pub third_party_image: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureSharedGalleryImage {
    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,
    pub resource_group: String,
    pub gallery: String,
    pub name: String,
    pub version: String,
}

// ============================================================================
// Docker
// ============================================================================

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "DockerMachineTemplate",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DockerMachineTemplateSpec {
    #[serde(default)]
    pub template: DockerMachineTemplateResource,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DockerMachineTemplateResource {
    #[serde(default)]
    pub spec: DockerMachineSpec,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DockerMachineSpec {
    /// Node container image, e.g. `kindest/node:v1.21.2`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom_image: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}
