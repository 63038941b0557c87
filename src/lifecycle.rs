//! Cluster lifecycle: phase classification and stall detection.

pub mod operation;
pub mod phase;

use chrono::{DateTime, Utc};

use crate::snapshot::ClusterSnapshot;

pub use operation::{OperationKind, is_stalled};
pub use phase::{LifecyclePhase, classify};

/// One row of `capup status` output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterSummary {
    pub name: String,
    pub namespace: String,
    pub phase: LifecyclePhase,
    /// `ready/desired` control-plane replicas, empty when unknown.
    pub control_plane: String,
    /// `ready/desired` worker replicas, empty when no worker group declares replicas.
    pub workers: String,
    pub kubernetes_version: String,
}

impl ClusterSummary {
    pub fn from_snapshot(snapshot: &ClusterSnapshot, now: DateTime<Utc>) -> Self {
        let control_plane = snapshot.control_plane.as_ref().map_or_else(String::new, |kcp| {
            kcp.spec.replicas.map_or_else(String::new, |desired| {
                format!("{}/{desired}", kcp.status_or_default().ready_replicas)
            })
        });
        let counts = snapshot.worker_counts();
        let workers = if counts.spec == 0 {
            String::new()
        } else {
            format!("{}/{}", counts.ready, counts.spec)
        };
        Self {
            name: snapshot.name(),
            namespace: snapshot.namespace(),
            phase: classify(snapshot, now),
            control_plane,
            workers,
            kubernetes_version: snapshot
                .control_plane
                .as_ref()
                .map(|kcp| kcp.spec.version.clone())
                .unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ClusterSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<24} {:<16} {:<14} {:<8} {:<8} {}",
            self.name,
            self.namespace,
            self.phase,
            self.control_plane,
            self.workers,
            self.kubernetes_version
        )
    }
}
