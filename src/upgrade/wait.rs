//! Convergence waits after the control-plane and worker patches.
//!
//! Each poll re-reads the cluster snapshot and reduces it to an
//! [`Observation`]. While the fingerprint keeps changing the rollout is
//! making progress and the last-observed annotation is refreshed, which is
//! what keeps the stall detector quiet. A wait gives up when nothing has
//! changed for the operation timeout, or after three times that overall.

use chrono::Utc;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::UpgradeTimings;
use super::context::UpgradeContext;
use crate::capi::Cluster;
use crate::error::{CapupError, Result};
use crate::k8s::ResourceClient;
use crate::lifecycle::operation::touch_last_observed;
use crate::poll::wait_until;
use crate::snapshot::{ClusterSnapshot, collect_one};

/// Result of looking at a snapshot once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    Converged,
    /// Not there yet; the string summarises how far the rollout got.
    Pending(String),
}

fn machines_at(versions: impl Iterator<Item = Option<String>>, target: &str) -> (usize, usize) {
    versions.fold((0, 0), |(at, total), v| {
        (at + usize::from(v.as_deref() == Some(target)), total + 1)
    })
}

pub fn control_plane_observation(snapshot: &ClusterSnapshot, target: &str) -> Observation {
    let Some(kcp) = snapshot.control_plane.as_ref() else {
        return Observation::Pending("control plane not found".to_string());
    };
    let spec = kcp.spec_replicas();
    let status = kcp.status_or_default();
    let (at_target, machines) = machines_at(
        snapshot.control_plane_machines().map(|m| m.spec.version.clone()),
        target,
    );
    if at_target == machines
        && status.replicas == spec
        && status.ready_replicas == spec
        && status.updated_replicas == spec
    {
        return Observation::Converged;
    }
    Observation::Pending(format!(
        "machines {at_target}/{machines} at {target}, replicas {}/{} ready {} updated {}",
        status.replicas, spec, status.ready_replicas, status.updated_replicas
    ))
}

pub fn worker_observation(snapshot: &ClusterSnapshot, target: &str) -> Observation {
    let mut converged = true;
    let mut groups = Vec::with_capacity(snapshot.machine_deployments.len());
    for md in &snapshot.machine_deployments {
        let desired = md.spec_replicas();
        let status = md.status_or_default();
        converged &= status.ready_replicas == desired
            && status.updated_replicas == desired
            && status.replicas == desired;
        groups.push(format!(
            "{}={}/{}/{}/{desired}",
            md.name_any(),
            status.ready_replicas,
            status.updated_replicas,
            status.replicas
        ));
    }
    let (at_target, machines) = machines_at(
        snapshot.worker_machines().map(|m| m.spec.version.clone()),
        target,
    );
    if converged && at_target == machines {
        return Observation::Converged;
    }
    Observation::Pending(format!(
        "machines {at_target}/{machines} at {target}, groups {}",
        groups.join(",")
    ))
}

/// Reason the cluster reports a terminal failure, if it does.
pub fn unhealthy_reason(cluster: &Cluster) -> Option<String> {
    let ready = cluster.condition("Ready")?;
    if ready.status != "False" || ready.severity.as_deref() != Some("Error") {
        return None;
    }
    Some(
        ready
            .message
            .clone()
            .or_else(|| ready.reason.clone())
            .unwrap_or_else(|| "Ready condition is False".to_string()),
    )
}

struct Progress {
    fingerprint: Option<String>,
    changed_at: Instant,
}

/// Poll until `observe` reports convergence for the target version.
pub async fn wait_for<C, F>(
    client: &C,
    ctx: &UpgradeContext,
    what: &str,
    observe: F,
    timings: &UpgradeTimings,
) -> Result<()>
where
    C: ResourceClient,
    F: Fn(&ClusterSnapshot, &str) -> Observation,
{
    info!(cluster = %ctx.cluster, "Waiting for {what} to reach {}", ctx.target_version());
    let progress = Mutex::new(Progress {
        fingerprint: None,
        changed_at: Instant::now(),
    });
    let operation = format!("wait for {what}");
    let (progress, observe, op_name) = (&progress, &observe, &operation);

    wait_until(
        &operation,
        timings.poll_interval,
        timings.operation_timeout * 3,
        || async move {
            let snapshot = collect_one(client, &ctx.cluster, &ctx.namespace).await?;
            if let Some(reason) = unhealthy_reason(&snapshot.cluster) {
                return Err(CapupError::Unhealthy {
                    cluster: ctx.cluster.clone(),
                    reason,
                });
            }
            let fingerprint = match observe(&snapshot, ctx.target_version()) {
                Observation::Converged => return Ok(true),
                Observation::Pending(fingerprint) => fingerprint,
            };

            let mut state = progress.lock().await;
            if state.fingerprint.as_deref() == Some(fingerprint.as_str()) {
                if state.changed_at.elapsed() >= timings.operation_timeout {
                    return Err(CapupError::Timeout {
                        operation: op_name.clone(),
                        details: format!(
                            "no progress for {}s: {fingerprint}",
                            timings.operation_timeout.as_secs()
                        ),
                    });
                }
                return Ok(false);
            }
            let first = state.fingerprint.is_none();
            debug!(cluster = %ctx.cluster, progress = %fingerprint, "Rollout progressed");
            state.fingerprint = Some(fingerprint);
            state.changed_at = Instant::now();
            drop(state);

            if !first
                && let Err(e) =
                    touch_last_observed(client, &ctx.cluster, &ctx.namespace, Utc::now()).await
            {
                warn!(cluster = %ctx.cluster, error = %e, "Failed to refresh last observed timestamp");
            }
            Ok(false)
        },
    )
    .await?;
    info!(cluster = %ctx.cluster, "{what} reached {}", ctx.target_version());
    Ok(())
}
