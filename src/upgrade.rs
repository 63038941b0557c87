//! Cluster upgrade orchestration.
//!
//! Steps run strictly in order: templates, release label, pre-node add-ons,
//! fix-ups, control plane, wait, workers, wait, post-node add-ons, OS
//! annotation. Every write is skipped when the cluster already matches the
//! target, so re-running after a failure is the recovery path.

pub mod cleanup;
pub mod context;
pub mod control_plane;
pub mod fixups;
pub mod topology;
pub mod wait;
pub mod workers;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::addons::render::{ip_family, proxy_settings};
use crate::addons::{AddonRenderer, RenderContext, post_node_addons, pre_node_addons, upgrade_addons};
use crate::capi::{Cluster, ObjectReference};
use crate::error::{CapupError, Result, StepContext};
use crate::k8s::{PatchBody, ResourceClient};
use crate::lifecycle::operation::{OperationKind, UPGRADE_OPERATION_TIMEOUT, record_operation_start};
use crate::lifecycle::classify;
use crate::release::{OS_INFO_ANNOTATION, RELEASE_LABEL, ReleaseMetadataProvider};
use crate::snapshot::{ClusterSnapshot, collect_one};
use crate::telemetry::metrics::Metrics;
use crate::template::{TemplateScope, ensure_template};

use cleanup::CleanupList;
pub use context::{ActualConfiguration, OsOptions, UpgradeContext, UpgradeRequest};
use wait::{control_plane_observation, wait_for, worker_observation};

/// Milestones of an upgrade run, logged and counted as they are reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeProgress {
    Initiated,
    InfraTemplatesCreated,
    ControlPlanePatched,
    ControlPlaneConverged,
    WorkersPatched,
    Success,
}

impl UpgradeProgress {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::InfraTemplatesCreated => "infraTemplatesCreated",
            Self::ControlPlanePatched => "controlPlanePatched",
            Self::ControlPlaneConverged => "controlPlaneConverged",
            Self::WorkersPatched => "workersPatched",
            Self::Success => "success",
        }
    }
}

impl std::fmt::Display for UpgradeProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Poll and retry cadence of an upgrade run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeTimings {
    pub poll_interval: Duration,
    /// A wait fails after this long without progress.
    pub operation_timeout: Duration,
    pub retry_interval: Duration,
    pub retry_timeout: Duration,
}

impl Default for UpgradeTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            operation_timeout: Duration::from_secs(30 * 60),
            retry_interval: Duration::from_secs(30),
            retry_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Template references the control plane and each worker group move to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplatePlan {
    pub control_plane: ObjectReference,
    /// Keyed by MachineDeployment name.
    pub workers: BTreeMap<String, ObjectReference>,
    pub created: usize,
}

/// Drives one cluster to a target release.
///
/// `management` holds the Cluster API objects; `workload` is the cluster
/// being upgraded (the same cluster when upgrading a management cluster).
pub struct Upgrader<'a, M, W> {
    management: &'a M,
    workload: &'a W,
    releases: &'a dyn ReleaseMetadataProvider,
    renderer: &'a dyn AddonRenderer,
    metrics: Option<&'a Metrics>,
    timings: UpgradeTimings,
}

impl<'a, M, W> Upgrader<'a, M, W>
where
    M: ResourceClient,
    W: ResourceClient,
{
    pub fn new(
        management: &'a M,
        workload: &'a W,
        releases: &'a dyn ReleaseMetadataProvider,
        renderer: &'a dyn AddonRenderer,
    ) -> Self {
        Self {
            management,
            workload,
            releases,
            renderer,
            metrics: None,
            timings: UpgradeTimings::default(),
        }
    }

    #[must_use]
    pub const fn with_metrics(mut self, metrics: &'a Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_timings(mut self, timings: UpgradeTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Upgrade the cluster named in `request`.
    ///
    /// Cleanup actions run on every exit path and never change the result.
    pub async fn upgrade_cluster(&self, request: &UpgradeRequest) -> Result<()> {
        let mut cleanup = CleanupList::new();
        cleanup.push("cluster diagnostics", self.diagnostics(request).boxed());

        let result = self.run(request).await;
        if let Err(e) = &result {
            error!(
                cluster = %request.cluster,
                namespace = %request.namespace,
                kind = %e.kind(),
                error = %e,
                "Upgrade failed"
            );
        }
        cleanup.run().await;

        if let Some(metrics) = self.metrics {
            metrics.record_upgrade_result(&request.cluster, &request.namespace, result.is_ok());
        }
        result
    }

    async fn run(&self, request: &UpgradeRequest) -> Result<()> {
        let snapshot = collect_one(self.management, &request.cluster, &request.namespace)
            .await
            .step("read cluster")?;
        let ctx = context::resolve(self.management, self.releases, request, &snapshot).await?;
        self.progress(&ctx, UpgradeProgress::Initiated);

        let plan = if ctx.class_based {
            None
        } else {
            let actual = ActualConfiguration::from_snapshot(&snapshot)
                .step("read actual configuration")?;
            let plan = self
                .ensure_templates(&ctx, &actual)
                .await
                .step("ensure infrastructure templates")?;
            self.progress(&ctx, UpgradeProgress::InfraTemplatesCreated);
            Some(plan)
        };

        self.label_release(&ctx, &snapshot.cluster)
            .await
            .step("label cluster with release")?;

        let render_ctx = if ctx.skip_addon_upgrade {
            info!(cluster = %ctx.cluster, "Skipping add-on upgrade");
            None
        } else {
            let render_ctx = self
                .render_context(&ctx, &snapshot.cluster)
                .await
                .step("build add-on render context")?;
            upgrade_addons(
                self.management,
                self.workload,
                self.renderer,
                &render_ctx,
                &pre_node_addons(ctx.is_management),
            )
            .await
            .step("upgrade add-ons before nodes")?;
            Some(render_ctx)
        };

        self.pre_patch_fixups(&ctx)
            .await
            .step("apply pre-patch fix-ups")?;

        let patched = match (&plan, snapshot.control_plane.as_ref()) {
            (Some(plan), Some(kcp)) => {
                control_plane::patch_control_plane(
                    self.management,
                    kcp,
                    &ctx,
                    &plan.control_plane,
                    &self.timings,
                )
                .await
            }
            (Some(_), None) => Err(CapupError::not_found(
                "KubeadmControlPlane",
                &ctx.namespace,
                &format!("{}-control-plane", ctx.cluster),
            )),
            (None, _) => {
                topology::patch_topology_version(
                    self.management,
                    &snapshot.cluster,
                    &ctx,
                    &self.timings,
                )
                .await
            }
        }
        .step("patch control plane")?;
        self.progress(&ctx, UpgradeProgress::ControlPlanePatched);

        if patched
            && let Err(e) = record_operation_start(
                self.management,
                &ctx.cluster,
                &ctx.namespace,
                OperationKind::Upgrade,
                UPGRADE_OPERATION_TIMEOUT,
                Utc::now(),
            )
            .await
        {
            warn!(cluster = %ctx.cluster, error = %e, "Failed to record upgrade operation");
        }

        if ctx.custom_image_repository {
            fixups::repoint_kube_proxy(self.workload, &ctx.image_repository)
                .await
                .step("update kube-proxy image repository")?;
        }

        wait_for(
            self.management,
            &ctx,
            "control plane",
            control_plane_observation,
            &self.timings,
        )
        .await
        .step("wait for control plane")?;
        self.progress(&ctx, UpgradeProgress::ControlPlaneConverged);

        if let Some(plan) = &plan {
            for md in &snapshot.machine_deployments {
                let name = md.name_any();
                let Some(template) = plan.workers.get(&name) else {
                    warn!(
                        cluster = %ctx.cluster,
                        worker = %name,
                        "Worker group has no planned template, leaving it unpatched"
                    );
                    continue;
                };
                workers::patch_worker(self.management, md, &ctx, template, &self.timings)
                    .await
                    .step(&format!("patch worker group {name}"))?;
            }
            self.progress(&ctx, UpgradeProgress::WorkersPatched);
        }

        wait_for(
            self.management,
            &ctx,
            "workers",
            worker_observation,
            &self.timings,
        )
        .await
        .step("wait for workers")?;

        if let Some(render_ctx) = &render_ctx {
            upgrade_addons(
                self.management,
                self.workload,
                self.renderer,
                render_ctx,
                &post_node_addons(&ctx.edition),
            )
            .await
            .step("upgrade add-ons after nodes")?;
        }

        self.annotate_os(&ctx, &snapshot.cluster)
            .await
            .step("record OS information")?;
        self.progress(&ctx, UpgradeProgress::Success);
        Ok(())
    }

    fn progress(&self, ctx: &UpgradeContext, progress: UpgradeProgress) {
        info!(
            cluster = %ctx.cluster,
            namespace = %ctx.namespace,
            progress = %progress,
            "Upgrade progress"
        );
        if let Some(metrics) = self.metrics {
            metrics.record_upgrade_progress(&ctx.cluster, &ctx.namespace, progress.as_str());
        }
    }

    async fn ensure_templates(
        &self,
        ctx: &UpgradeContext,
        actual: &ActualConfiguration,
    ) -> Result<TemplatePlan> {
        let image = ctx.image.as_ref().ok_or_else(|| {
            CapupError::Precondition(format!(
                "no machine image resolved for cluster {}",
                ctx.cluster
            ))
        })?;

        let control_plane = ensure_template(
            self.management,
            TemplateScope::ControlPlane {
                cluster: &ctx.cluster,
            },
            &actual.control_plane_template,
            &ctx.namespace,
            Some(actual.kubernetes_version.as_str()),
            ctx.target_version(),
            image,
        )
        .await
        .step("control plane template")?;

        let mut plan = TemplatePlan {
            created: usize::from(control_plane.created),
            control_plane: control_plane.reference,
            workers: BTreeMap::new(),
        };
        for worker in &actual.workers {
            let decision = ensure_template(
                self.management,
                TemplateScope::Worker,
                &worker.template,
                &ctx.namespace,
                worker.version.as_deref(),
                ctx.target_version(),
                image,
            )
            .await
            .step(&format!("worker template for {}", worker.name))?;
            plan.created += usize::from(decision.created);
            plan.workers.insert(worker.name.clone(), decision.reference);
        }
        info!(
            cluster = %ctx.cluster,
            created = plan.created,
            workers = plan.workers.len(),
            "Infrastructure templates ready"
        );
        Ok(plan)
    }

    async fn label_release(&self, ctx: &UpgradeContext, cluster: &Cluster) -> Result<()> {
        let release = ctx.target.release_name();
        if cluster.labels().get(RELEASE_LABEL) == Some(&release) {
            debug!(cluster = %ctx.cluster, release = %release, "Release label already set");
            return Ok(());
        }
        let patch = PatchBody::Merge(json!({ "metadata": { "labels": { RELEASE_LABEL: release } } }));
        self.management
            .patch::<Cluster>(&ctx.cluster, &ctx.namespace, &patch)
            .await?;
        Ok(())
    }

    async fn render_context(&self, ctx: &UpgradeContext, cluster: &Cluster) -> Result<RenderContext> {
        Ok(RenderContext {
            cluster_name: ctx.cluster.clone(),
            cluster_namespace: ctx.namespace.clone(),
            target_namespace: ctx.namespace.clone(),
            is_management: ctx.is_management,
            edition: ctx.edition.clone(),
            kubernetes_version: ctx.target_version().to_string(),
            release_version: ctx.target.release_version.clone(),
            image_repository: ctx.image_repository.clone(),
            proxy: proxy_settings(self.workload).await?,
            pod_cidrs: cluster.pod_cidrs(),
            service_cidrs: cluster.service_cidrs(),
            ip_family: ip_family(cluster)?,
        })
    }

    async fn pre_patch_fixups(&self, ctx: &UpgradeContext) -> Result<()> {
        fixups::migrate_calico_node_selectors(self.workload).await?;
        if ctx.custom_image_repository {
            fixups::stage_coredns_image_repository(self.workload, &ctx.image_repository).await?;
        }
        Ok(())
    }

    async fn annotate_os(&self, ctx: &UpgradeContext, cluster: &Cluster) -> Result<()> {
        let Some(os) = ctx.os.as_ref() else {
            return Ok(());
        };
        let value = os.to_string();
        if cluster.annotations().get(OS_INFO_ANNOTATION) == Some(&value) {
            return Ok(());
        }
        let patch = PatchBody::Merge(json!({ "metadata": { "annotations": { OS_INFO_ANNOTATION: value } } }));
        self.management
            .patch::<Cluster>(&ctx.cluster, &ctx.namespace, &patch)
            .await?;
        Ok(())
    }

    async fn diagnostics(&self, request: &UpgradeRequest) -> Result<()> {
        let snapshot: ClusterSnapshot =
            collect_one(self.management, &request.cluster, &request.namespace).await?;
        let phase = classify(&snapshot, Utc::now());
        let workers = snapshot.worker_counts();
        let cp = snapshot
            .control_plane
            .as_ref()
            .map(|kcp| kcp.status_or_default())
            .unwrap_or_default();
        info!(
            cluster = %request.cluster,
            namespace = %request.namespace,
            phase = %phase,
            control_plane_ready = cp.ready_replicas,
            control_plane_updated = cp.updated_replicas,
            workers_ready = workers.ready,
            workers_updated = workers.updated,
            workers_desired = workers.spec,
            "Cluster state after upgrade run"
        );
        Ok(())
    }
}
