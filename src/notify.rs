//! Notifications for cluster lifecycle transitions.

pub mod slack;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use slack::{SlackMessage, SlackNotifier};

use crate::lifecycle::ClusterSummary;
use crate::lifecycle::operation::OperationRecord;

/// Delivers a message somewhere a human will see it. Delivery failures are
/// the implementation's to log; callers never branch on them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, source: &str, message: &SlackMessage);
}

fn format_age(seconds: i64) -> String {
    let secs = seconds.unsigned_abs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m {}s", secs % 60)
    }
}

fn cluster_fields(summary: &ClusterSummary) -> Vec<(String, String)> {
    let or_unknown = |s: &str| {
        if s.is_empty() {
            "unknown".to_string()
        } else {
            s.to_string()
        }
    };
    vec![
        ("Cluster".to_string(), summary.name.clone()),
        ("Namespace".to_string(), summary.namespace.clone()),
        ("Phase".to_string(), summary.phase.to_string()),
        ("Version".to_string(), or_unknown(&summary.kubernetes_version)),
        ("Control Plane".to_string(), or_unknown(&summary.control_plane)),
        ("Workers".to_string(), or_unknown(&summary.workers)),
    ]
}

/// Build the alert sent when a cluster enters a stalled phase.
pub fn build_stalled_message(
    summary: &ClusterSummary,
    record: Option<&OperationRecord>,
    now: DateTime<Utc>,
) -> SlackMessage {
    let operation = summary
        .phase
        .stalled_operation()
        .map_or("unknown", |op| op.as_str());
    let mut fields = cluster_fields(summary);
    fields.push(("Operation".to_string(), operation.to_string()));
    if let Some(record) = record {
        fields.push((
            "No Progress For".to_string(),
            format_age((now - record.last_observed_at).num_seconds()),
        ));
        fields.push((
            "Timeout".to_string(),
            format_age(record.timeout_seconds),
        ));
    }

    SlackMessage {
        header: format!("Cluster {} Stalled", capitalize(operation)),
        fields,
        context: format!("Sent by capup watch for {}/{}", summary.namespace, summary.name),
    }
}

/// Build the notice sent when a stalled cluster makes progress again.
pub fn build_recovered_message(summary: &ClusterSummary) -> SlackMessage {
    SlackMessage {
        header: "Cluster Progressing Again".to_string(),
        fields: cluster_fields(summary),
        context: format!("Sent by capup watch for {}/{}", summary.namespace, summary.name),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}
