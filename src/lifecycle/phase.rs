//! Lifecycle phase classification.

use chrono::{DateTime, Utc};

use super::operation::{OperationKind, is_stalled};
use crate::snapshot::ClusterSnapshot;

/// Single authoritative phase of a managed cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    Creating,
    CreationStalled,
    Running,
    Updating,
    UpdateStalled,
    Deleting,
}

impl LifecyclePhase {
    pub const ALL: [Self; 6] = [
        Self::Creating,
        Self::CreationStalled,
        Self::Running,
        Self::Updating,
        Self::UpdateStalled,
        Self::Deleting,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::CreationStalled => "createStalled",
            Self::Running => "running",
            Self::Updating => "updating",
            Self::UpdateStalled => "updateStalled",
            Self::Deleting => "deleting",
        }
    }

    pub const fn is_stalled(self) -> bool {
        matches!(self, Self::CreationStalled | Self::UpdateStalled)
    }

    /// Operation whose stall this phase reports.
    pub const fn stalled_operation(self) -> Option<OperationKind> {
        match self {
            Self::CreationStalled => Some(OperationKind::Create),
            Self::UpdateStalled => Some(OperationKind::Upgrade),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any Machine declaring a version other than the control plane's means an
/// upgrade, rather than a scale operation, is under way.
pub fn is_upgrade_in_progress(snapshot: &ClusterSnapshot) -> bool {
    let Some(kcp) = snapshot.control_plane.as_ref() else {
        return false;
    };
    snapshot.machines.iter().any(|m| {
        m.spec
            .version
            .as_deref()
            .is_some_and(|v| v != kcp.spec.version)
    })
}

/// Classify a snapshot into exactly one [`LifecyclePhase`].
pub fn classify(snapshot: &ClusterSnapshot, now: DateTime<Utc>) -> LifecyclePhase {
    let cluster = &snapshot.cluster;
    if cluster.phase().eq_ignore_ascii_case("deleting") {
        return LifecyclePhase::Deleting;
    }

    let (infra_ready, cp_ready) = cluster
        .status
        .as_ref()
        .map_or((false, false), |s| (s.infrastructure_ready, s.control_plane_ready));
    let workers = snapshot.worker_counts();
    let cp_status = snapshot
        .control_plane
        .as_ref()
        .map(|kcp| kcp.status_or_default())
        .unwrap_or_default();

    let creation_complete = infra_ready && cp_ready && cp_status.ready_replicas > 0;
    if !creation_complete {
        return if is_stalled(OperationKind::Create, cluster, now) {
            LifecyclePhase::CreationStalled
        } else {
            LifecyclePhase::Creating
        };
    }

    let cp_spec = snapshot
        .control_plane
        .as_ref()
        .map_or(0, |kcp| kcp.spec_replicas());
    let upgrading = is_upgrade_in_progress(snapshot);
    let running = cp_ready
        && cp_spec == cp_status.replicas
        && cp_spec == cp_status.ready_replicas
        && cp_spec == cp_status.updated_replicas
        && workers.spec == workers.replicas
        && workers.spec == workers.ready
        && workers.spec == workers.updated
        && !upgrading;
    if running {
        return LifecyclePhase::Running;
    }

    if upgrading && is_stalled(OperationKind::Upgrade, cluster, now) {
        LifecyclePhase::UpdateStalled
    } else {
        LifecyclePhase::Updating
    }
}
