//! Prometheus metrics for capup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::lifecycle::LifecyclePhase;

/// Labels identifying a single cluster.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub cluster: String,
    pub namespace: String,
}

/// Labels for the lifecycle phase gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub cluster: String,
    pub namespace: String,
    pub phase: String,
}

/// Labels for classification pass outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: String,
}

/// Labels for detected stalls.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StallLabels {
    pub cluster: String,
    pub namespace: String,
    pub operation: String,
}

/// Labels for upgrade progress transitions and step durations.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProgressLabels {
    pub cluster: String,
    pub namespace: String,
    pub progress: String,
}

type ClusterKey = (String, String);

/// All Prometheus metrics exported by watch mode and the upgrade flow.
pub struct Metrics {
    pub cluster_phase_info: Family<PhaseLabels, Gauge>,
    pub classify_total: Family<ResultLabels, Counter>,
    pub classify_duration_seconds: Histogram,
    pub stall_detected_total: Family<StallLabels, Counter>,
    pub upgrade_progress_total: Family<ProgressLabels, Counter>,
    pub upgrade_step_duration_seconds: Family<ProgressLabels, Histogram>,
    pub upgrade_completed_total: Family<ClusterLabels, Counter>,
    pub upgrade_failed_total: Family<ClusterLabels, Counter>,
    /// When the current upgrade step started, per cluster.
    step_start_times: Mutex<HashMap<ClusterKey, Instant>>,
}

const CLASSIFY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Node rollouts take tens of minutes, so steps are bucketed up to 2h.
const STEP_DURATION_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let cluster_phase_info = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "capup_cluster_phase_info",
            "Current lifecycle phase of each cluster (1=current, 0=other)",
            cluster_phase_info.clone(),
        );

        let classify_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "capup_classify",
            "Total number of classification passes",
            classify_total.clone(),
        );

        let classify_duration_seconds = Histogram::new(CLASSIFY_BUCKETS.iter().copied());
        registry.register(
            "capup_classify_duration_seconds",
            "Duration of a classification pass in seconds",
            classify_duration_seconds.clone(),
        );

        let stall_detected_total = Family::<StallLabels, Counter>::default();
        registry.register(
            "capup_stall_detected",
            "Total number of transitions into a stalled phase",
            stall_detected_total.clone(),
        );

        let upgrade_progress_total = Family::<ProgressLabels, Counter>::default();
        registry.register(
            "capup_upgrade_progress",
            "Total number of upgrade progress transitions",
            upgrade_progress_total.clone(),
        );

        let upgrade_step_duration_seconds =
            Family::<ProgressLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(STEP_DURATION_BUCKETS.iter().copied())
            });
        registry.register(
            "capup_upgrade_step_duration_seconds",
            "Time spent reaching each upgrade progress state in seconds",
            upgrade_step_duration_seconds.clone(),
        );

        let upgrade_completed_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "capup_upgrade_completed",
            "Total number of upgrades that finished successfully",
            upgrade_completed_total.clone(),
        );

        let upgrade_failed_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "capup_upgrade_failed",
            "Total number of upgrades that failed",
            upgrade_failed_total.clone(),
        );

        Self {
            cluster_phase_info,
            classify_total,
            classify_duration_seconds,
            stall_detected_total,
            upgrade_progress_total,
            upgrade_step_duration_seconds,
            upgrade_completed_total,
            upgrade_failed_total,
            step_start_times: Mutex::new(HashMap::new()),
        }
    }

    fn start_times(&self) -> MutexGuard<'_, HashMap<ClusterKey, Instant>> {
        self.step_start_times
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Set the phase gauge to 1 for `phase` and 0 for every other phase.
    pub fn set_cluster_phase(&self, cluster: &str, namespace: &str, phase: LifecyclePhase) {
        for candidate in LifecyclePhase::ALL {
            self.cluster_phase_info
                .get_or_create(&PhaseLabels {
                    cluster: cluster.to_string(),
                    namespace: namespace.to_string(),
                    phase: candidate.as_str().to_string(),
                })
                .set(i64::from(candidate == phase));
        }
    }

    /// Drop every phase series of a cluster that no longer exists.
    pub fn forget_cluster(&self, cluster: &str, namespace: &str) {
        for phase in LifecyclePhase::ALL {
            self.cluster_phase_info.remove(&PhaseLabels {
                cluster: cluster.to_string(),
                namespace: namespace.to_string(),
                phase: phase.as_str().to_string(),
            });
        }
    }

    pub fn record_classify(&self, result: &str, seconds: f64) {
        self.classify_total
            .get_or_create(&ResultLabels {
                result: result.to_string(),
            })
            .inc();
        self.classify_duration_seconds.observe(seconds);
    }

    pub fn record_stall(&self, cluster: &str, namespace: &str, operation: &str) {
        self.stall_detected_total
            .get_or_create(&StallLabels {
                cluster: cluster.to_string(),
                namespace: namespace.to_string(),
                operation: operation.to_string(),
            })
            .inc();
    }

    /// Count a progress transition and observe how long it took to reach it.
    pub fn record_upgrade_progress(&self, cluster: &str, namespace: &str, progress: &str) {
        let labels = ProgressLabels {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            progress: progress.to_string(),
        };
        self.upgrade_progress_total.get_or_create(&labels).inc();

        let key = (cluster.to_string(), namespace.to_string());
        let previous = self.start_times().insert(key, Instant::now());
        if let Some(start) = previous {
            self.upgrade_step_duration_seconds
                .get_or_create(&labels)
                .observe(start.elapsed().as_secs_f64());
        }
    }

    /// Count the outcome of an upgrade and forget its step timer.
    pub fn record_upgrade_result(&self, cluster: &str, namespace: &str, success: bool) {
        let labels = ClusterLabels {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
        };
        self.start_times()
            .remove(&(cluster.to_string(), namespace.to_string()));
        if success {
            self.upgrade_completed_total.get_or_create(&labels).inc();
        } else {
            self.upgrade_failed_total.get_or_create(&labels).inc();
        }
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
