//! Operation record annotations on the cluster root object.
//!
//! The upgrade flow writes `{operation, start, timeout}` plus a
//! last-observed timestamp; the stall check reads them back. Reading is
//! conservative: anything absent or malformed means "not stalled".

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::capi::Cluster;
use crate::error::{CapupError, Result};
use crate::k8s::{PatchBody, ResourceClient};

pub const OPERATION_INFO_ANNOTATION: &str = "capup.io/operation-info";
pub const LAST_OBSERVED_ANNOTATION: &str = "capup.io/operation-last-observed-timestamp";

/// Timeout recorded with an upgrade operation.
pub const UPGRADE_OPERATION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Kind of long-running operation tracked on a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Upgrade,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Upgrade => "upgrade",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON payload of the operation-info annotation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub operation: String,
    #[serde(default)]
    pub operation_start_timestamp: String,
    /// Seconds.
    pub operation_timeout: i64,
}

/// Operation record as read back from annotations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationRecord {
    pub kind: String,
    pub started_at: Option<DateTime<Utc>>,
    pub last_observed_at: DateTime<Utc>,
    pub timeout_seconds: i64,
}

/// Render a timestamp as `2006-01-02 15:04:05.123 +0000 UTC`.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.f +0000 UTC").to_string()
}

/// Parse a timestamp written by [`format_timestamp`], or an RFC 2822/1123 date.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    // Drop the trailing zone abbreviation; the numeric offset is authoritative.
    if let Some((prefix, zone)) = raw.rsplit_once(' ')
        && zone.chars().all(|c| c.is_ascii_alphabetic())
        && let Ok(t) = DateTime::parse_from_str(prefix, "%Y-%m-%d %H:%M:%S%.f %z")
    {
        return Some(t.with_timezone(&Utc));
    }
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl OperationRecord {
    /// Read the record from cluster annotations. `None` when either
    /// annotation is missing or does not parse.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Option<Self> {
        let info = annotations.get(OPERATION_INFO_ANNOTATION)?;
        let last_observed = annotations.get(LAST_OBSERVED_ANNOTATION)?;
        let info = info.replace("\\\"", "\"");
        let status: OperationStatus = serde_json::from_str(&info)
            .map_err(|e| debug!(error = %e, "Ignoring unparsable operation record"))
            .ok()?;
        let last_observed_at = parse_timestamp(last_observed)?;
        Some(Self {
            kind: status.operation,
            started_at: parse_timestamp(&status.operation_start_timestamp),
            last_observed_at,
            timeout_seconds: status.operation_timeout,
        })
    }
}

/// True iff the cluster records an operation of `kind` whose last observed
/// progress is older than its timeout.
pub fn is_stalled(kind: OperationKind, cluster: &Cluster, now: DateTime<Utc>) -> bool {
    let Some(annotations) = cluster.metadata.annotations.as_ref() else {
        return false;
    };
    let Some(record) = OperationRecord::from_annotations(annotations) else {
        return false;
    };
    if record.kind != kind.as_str() {
        return false;
    }
    (now - record.last_observed_at).num_seconds() > record.timeout_seconds
}

/// Merge patch that starts an operation record.
pub fn operation_started_patch(
    kind: OperationKind,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Result<PatchBody> {
    let timestamp = format_timestamp(now);
    let status = OperationStatus {
        operation: kind.as_str().to_string(),
        operation_start_timestamp: timestamp.clone(),
        operation_timeout: i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX),
    };
    let info = serde_json::to_string(&status)
        .map_err(|e| CapupError::InvalidInput(format!("{OPERATION_INFO_ANNOTATION}: {e}")))?;
    Ok(PatchBody::Merge(json!({
        "metadata": {
            "annotations": {
                OPERATION_INFO_ANNOTATION: info,
                LAST_OBSERVED_ANNOTATION: timestamp,
            }
        }
    })))
}

pub async fn record_operation_start<C: ResourceClient>(
    client: &C,
    cluster: &str,
    namespace: &str,
    kind: OperationKind,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Result<()> {
    let patch = operation_started_patch(kind, timeout, now)?;
    debug!(cluster = %cluster, operation = %kind, "Recording operation start");
    client.patch::<Cluster>(cluster, namespace, &patch).await?;
    Ok(())
}

/// Refresh the last-observed timestamp while an operation makes progress.
pub async fn touch_last_observed<C: ResourceClient>(
    client: &C,
    cluster: &str,
    namespace: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let patch = PatchBody::Merge(json!({
        "metadata": { "annotations": { LAST_OBSERVED_ANNOTATION: format_timestamp(now) } }
    }));
    client.patch::<Cluster>(cluster, namespace, &patch).await?;
    Ok(())
}
