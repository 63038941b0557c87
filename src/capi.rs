//! Typed views of the Cluster API objects capup reads and writes.
//!
//! Only the fields the classifier and the upgrade flow touch are typed.
//! Provider templates keep every other field in a flattened map so a
//! deep copy round-trips through serde without losing data.

pub mod addons;
pub mod cluster;
pub mod control_plane;
pub mod infra;
pub mod machine;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use addons::{ClusterResourceSet, ClusterResourceSetSpec, LabelSelector, ResourceRef};
pub use cluster::{Cluster, ClusterSpec, ClusterStatus, Condition};
pub use control_plane::KubeadmControlPlane;
pub use infra::{
    AWSMachineTemplate, AzureMachineTemplate, DockerMachineTemplate, Provider,
    VSphereMachineTemplate,
};
pub use machine::{Machine, MachineDeployment};

/// Label joining every dependent object to its cluster root.
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label present on control-plane Machines.
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Label present on Machines owned by a MachineDeployment.
pub const DEPLOYMENT_NAME_LABEL: &str = "cluster.x-k8s.io/deployment-name";

/// Reference to a provider machine template.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}
