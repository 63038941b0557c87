//! Watch mode: classify every cluster in scope on an interval, export the
//! phases as metrics and alert when a cluster enters a stalled phase.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::k8s::{ListScope, ResourceClient};
use crate::lifecycle::operation::OperationRecord;
use crate::lifecycle::{ClusterSummary, LifecyclePhase};
use crate::notify::{Notifier, build_recovered_message, build_stalled_message};
use crate::snapshot::{ClusterSnapshot, collect};
use crate::telemetry::health::HealthState;
use crate::telemetry::metrics::Metrics;

type ClusterKey = (String, String);

pub struct Watcher<'a, C> {
    client: &'a C,
    scope: ListScope,
    metrics: &'a Metrics,
    notifier: Option<&'a dyn Notifier>,
    health: HealthState,
    /// Phase seen on the previous pass, per `(namespace, name)`.
    last_phase: BTreeMap<ClusterKey, LifecyclePhase>,
}

impl<'a, C: ResourceClient> Watcher<'a, C> {
    pub fn new(
        client: &'a C,
        scope: ListScope,
        metrics: &'a Metrics,
        notifier: Option<&'a dyn Notifier>,
        health: HealthState,
    ) -> Self {
        Self {
            client,
            scope,
            metrics,
            notifier,
            health,
            last_phase: BTreeMap::new(),
        }
    }

    /// Classify every cluster once. Readiness is set after the first pass
    /// that could list the clusters.
    pub async fn pass(&mut self, now: DateTime<Utc>) -> Result<Vec<ClusterSummary>> {
        let start = Instant::now();
        let snapshots = match collect(self.client, &self.scope).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                self.metrics
                    .record_classify("error", start.elapsed().as_secs_f64());
                return Err(e);
            }
        };

        let mut seen = BTreeMap::new();
        let mut summaries = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            let summary = ClusterSummary::from_snapshot(snapshot, now);
            self.metrics
                .set_cluster_phase(&summary.name, &summary.namespace, summary.phase);
            let key = (summary.namespace.clone(), summary.name.clone());
            let previous = self.last_phase.get(&key).copied();
            self.on_transition(snapshot, &summary, previous, now).await;
            seen.insert(key, summary.phase);
            summaries.push(summary);
        }
        for (namespace, name) in self.last_phase.keys().filter(|k| !seen.contains_key(*k)) {
            info!(cluster = %name, namespace = %namespace, "Cluster gone, dropping its phase");
            self.metrics.forget_cluster(name, namespace);
        }
        self.last_phase = seen;

        self.metrics
            .record_classify("success", start.elapsed().as_secs_f64());
        self.health.set_ready(true);
        Ok(summaries)
    }

    async fn on_transition(
        &self,
        snapshot: &ClusterSnapshot,
        summary: &ClusterSummary,
        previous: Option<LifecyclePhase>,
        now: DateTime<Utc>,
    ) {
        if previous == Some(summary.phase) {
            return;
        }
        if let Some(operation) = summary.phase.stalled_operation() {
            warn!(
                cluster = %summary.name,
                namespace = %summary.namespace,
                operation = %operation,
                "Cluster operation stalled"
            );
            self.metrics
                .record_stall(&summary.name, &summary.namespace, operation.as_str());
            if let Some(notifier) = self.notifier {
                let record = OperationRecord::from_annotations(snapshot.cluster.annotations());
                let message = build_stalled_message(summary, record.as_ref(), now);
                notifier.notify(&summary.name, &message).await;
            }
        } else if previous.is_some_and(LifecyclePhase::is_stalled) {
            info!(
                cluster = %summary.name,
                namespace = %summary.namespace,
                phase = %summary.phase,
                "Cluster no longer stalled"
            );
            if let Some(notifier) = self.notifier {
                notifier
                    .notify(&summary.name, &build_recovered_message(summary))
                    .await;
            }
        }
    }

    /// Run passes every `interval` until the task is dropped. A failed pass
    /// is logged and retried on the next tick.
    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.pass(Utc::now()).await {
                Ok(summaries) => info!(clusters = summaries.len(), "Classification pass finished"),
                Err(e) => error!(error = %e, "Classification pass failed"),
            }
        }
    }
}
