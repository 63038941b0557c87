//! Per-cluster views joined from independently listed CAPI objects.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::debug;

use crate::capi::{
    CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL, Cluster, KubeadmControlPlane, Machine,
    MachineDeployment,
};
use crate::error::Result;
use crate::k8s::{ListScope, ResourceClient};

/// A cluster root object and everything that belongs to it.
#[derive(Clone, Debug)]
pub struct ClusterSnapshot {
    pub cluster: Cluster,
    pub control_plane: Option<KubeadmControlPlane>,
    pub machine_deployments: Vec<MachineDeployment>,
    pub machines: Vec<Machine>,
}

/// Replica counts summed across every worker group of a cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerCounts {
    pub spec: i32,
    pub replicas: i32,
    pub ready: i32,
    pub updated: i32,
}

impl ClusterSnapshot {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            control_plane: None,
            machine_deployments: Vec::new(),
            machines: Vec::new(),
        }
    }

    pub fn name(&self) -> String {
        self.cluster.name_any()
    }

    pub fn namespace(&self) -> String {
        self.cluster.namespace().unwrap_or_default()
    }

    /// Unset desired replicas count as zero here, unlike [`MachineDeployment::spec_replicas`].
    pub fn worker_counts(&self) -> WorkerCounts {
        self.machine_deployments
            .iter()
            .fold(WorkerCounts::default(), |acc, md| {
                let status = md.status_or_default();
                WorkerCounts {
                    spec: acc.spec + md.spec.replicas.unwrap_or(0),
                    replicas: acc.replicas + status.replicas,
                    ready: acc.ready + status.ready_replicas,
                    updated: acc.updated + status.updated_replicas,
                }
            })
    }

    pub fn control_plane_machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines
            .iter()
            .filter(|m| m.labels().contains_key(CONTROL_PLANE_LABEL))
    }

    pub fn worker_machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines
            .iter()
            .filter(|m| !m.labels().contains_key(CONTROL_PLANE_LABEL))
    }
}

fn cluster_key<K: ResourceExt>(obj: &K) -> Option<(String, String)> {
    let cluster = obj.labels().get(CLUSTER_NAME_LABEL)?;
    Some((obj.namespace().unwrap_or_default(), cluster.clone()))
}

fn owning_snapshot<'a, K: ResourceExt>(
    snapshots: &'a mut BTreeMap<(String, String), ClusterSnapshot>,
    obj: &K,
    kind: &str,
) -> Option<&'a mut ClusterSnapshot> {
    let Some(key) = cluster_key(obj) else {
        debug!(kind, name = %obj.name_any(), "Skipping object without {CLUSTER_NAME_LABEL} label");
        return None;
    };
    let found = snapshots.get_mut(&key);
    if found.is_none() {
        debug!(kind, name = %obj.name_any(), cluster = %key.1, "Skipping object for unknown cluster");
    }
    found
}

/// Join listed objects into one snapshot per cluster root.
///
/// Dependents without the cluster label, or pointing at a cluster that is not
/// in `clusters`, are skipped.
pub fn join(
    clusters: Vec<Cluster>,
    control_planes: Vec<KubeadmControlPlane>,
    machine_deployments: Vec<MachineDeployment>,
    machines: Vec<Machine>,
) -> Vec<ClusterSnapshot> {
    let mut snapshots: BTreeMap<(String, String), ClusterSnapshot> = clusters
        .into_iter()
        .map(|c| ((c.namespace().unwrap_or_default(), c.name_any()), ClusterSnapshot::new(c)))
        .collect();

    for kcp in control_planes {
        if let Some(snapshot) = owning_snapshot(&mut snapshots, &kcp, "KubeadmControlPlane") {
            snapshot.control_plane = Some(kcp);
        }
    }
    for md in machine_deployments {
        if let Some(snapshot) = owning_snapshot(&mut snapshots, &md, "MachineDeployment") {
            snapshot.machine_deployments.push(md);
        }
    }
    for machine in machines {
        if let Some(snapshot) = owning_snapshot(&mut snapshots, &machine, "Machine") {
            snapshot.machines.push(machine);
        }
    }

    snapshots.into_values().collect()
}

/// List every cluster in `scope` and build its snapshot.
pub async fn collect<C: ResourceClient>(
    client: &C,
    scope: &ListScope,
) -> Result<Vec<ClusterSnapshot>> {
    let clusters: Vec<Cluster> = client.list(scope).await?;
    let control_planes: Vec<KubeadmControlPlane> = client.list(scope).await?;
    let machine_deployments: Vec<MachineDeployment> = client.list(scope).await?;
    let machines: Vec<Machine> = client.list(scope).await?;
    Ok(join(clusters, control_planes, machine_deployments, machines))
}

/// Build the snapshot of a single named cluster.
pub async fn collect_one<C: ResourceClient>(
    client: &C,
    name: &str,
    namespace: &str,
) -> Result<ClusterSnapshot> {
    let cluster: Cluster = client.get(name, namespace).await?;
    let scope = ListScope::in_namespace(Some(namespace)).with_label(CLUSTER_NAME_LABEL, name);
    let control_planes: Vec<KubeadmControlPlane> = client.list(&scope).await?;
    let machine_deployments: Vec<MachineDeployment> = client.list(&scope).await?;
    let machines: Vec<Machine> = client.list(&scope).await?;
    let mut snapshots = join(vec![cluster.clone()], control_planes, machine_deployments, machines);
    Ok(snapshots.pop().unwrap_or_else(|| ClusterSnapshot::new(cluster)))
}
