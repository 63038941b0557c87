//! Custom error types for capup.

use thiserror::Error;

/// Stable classification of a [`CapupError`], independent of its message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or unmet precondition; nothing was mutated.
    Precondition,
    /// A get/list/create/update/patch/delete call failed.
    ResourceAccess,
    NotFound,
    Conflict,
    Timeout,
    /// The cluster reports a terminal failure condition.
    Unhealthy,
    /// Several independent failures collected together.
    Aggregate,
    InvalidInput,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Precondition => write!(f, "Precondition"),
            Self::ResourceAccess => write!(f, "ResourceAccess"),
            Self::NotFound => write!(f, "NotFound"),
            Self::Conflict => write!(f, "Conflict"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Unhealthy => write!(f, "Unhealthy"),
            Self::Aggregate => write!(f, "Aggregate"),
            Self::InvalidInput => write!(f, "InvalidInput"),
        }
    }
}

/// Errors that can occur while classifying or upgrading clusters.
#[derive(Error, Debug)]
pub enum CapupError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("Conflict updating {kind} {namespace}/{name}: {message}")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
        message: String,
    },

    #[error("Timeout waiting for {operation}: {details}")]
    Timeout { operation: String, details: String },

    #[error("Cluster {cluster} is unhealthy: {reason}")]
    Unhealthy { cluster: String, reason: String },

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<CapupError>,
    },

    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<CapupError>),
}

fn format_aggregate(errors: &[CapupError]) -> String {
    match errors {
        [single] => single.to_string(),
        _ => format!(
            "[{}]",
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

impl CapupError {
    /// Map a `kube::Error` for the given object into the crate taxonomy.
    pub fn from_kube(kind: &str, namespace: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: ae.message.clone(),
            },
            other => Self::KubernetesApi(format!("{kind} {namespace}/{name}: {other}")),
        }
    }

    pub fn not_found(kind: &str, namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Wrap this error with the step that produced it.
    pub fn in_step(self, step: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// Stable kind of this error. Step wrappers report the kind of their cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Precondition(_) | Self::InvalidVersion(_) => ErrorKind::Precondition,
            Self::KubernetesApi(_) => ErrorKind::ResourceAccess,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Unhealthy { .. } => ErrorKind::Unhealthy,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Step { source, .. } => source.kind(),
            Self::Aggregate(_) => ErrorKind::Aggregate,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true if this error is transient and should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceAccess | ErrorKind::Conflict
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CapupError>;

/// Attach step context to a fallible result.
pub trait StepContext<T> {
    fn step(self, step: &str) -> Result<T>;
}

impl<T> StepContext<T> for Result<T> {
    fn step(self, step: &str) -> Result<T> {
        self.map_err(|e| e.in_step(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_precondition() {
        let err = CapupError::Precondition("downgrade is not allowed".to_string());
        assert_eq!(err.to_string(), "Precondition failed: downgrade is not allowed");
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_error_display_not_found() {
        let err = CapupError::not_found("Cluster", "default", "wc-1");
        assert_eq!(err.to_string(), "Cluster default/wc-1 not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_step_wrapping_keeps_kind() {
        let err = CapupError::KubernetesApi("connection refused".to_string())
            .in_step("patch control plane");
        assert_eq!(
            err.to_string(),
            "patch control plane: Kubernetes API error: connection refused"
        );
        assert_eq!(err.kind(), ErrorKind::ResourceAccess);
    }

    #[test]
    fn test_step_context_on_result() {
        let res: Result<()> = Err(CapupError::InvalidVersion("abc".to_string()));
        let err = res.step("verify version").unwrap_err();
        assert!(err.to_string().starts_with("verify version: "));
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_aggregate_lists_every_error() {
        let err = CapupError::Aggregate(vec![
            CapupError::InvalidInput("a".to_string()),
            CapupError::InvalidInput("b".to_string()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("Invalid input: a"));
        assert!(msg.contains("Invalid input: b"));
        assert_eq!(err.kind(), ErrorKind::Aggregate);
    }

    #[test]
    fn test_aggregate_single_error_is_unwrapped() {
        let err = CapupError::Aggregate(vec![CapupError::InvalidInput("a".to_string())]);
        assert_eq!(err.to_string(), "Invalid input: a");
    }

    #[test]
    fn test_is_transient() {
        assert!(CapupError::KubernetesApi("x".into()).is_transient());
        assert!(
            CapupError::Conflict {
                kind: "KubeadmControlPlane".into(),
                namespace: "default".into(),
                name: "cp".into(),
                message: "object has been modified".into(),
            }
            .is_transient()
        );
        assert!(!CapupError::Precondition("x".into()).is_transient());
        assert!(!CapupError::not_found("Cluster", "ns", "n").is_transient());
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::ResourceAccess.to_string(), "ResourceAccess");
        assert_eq!(ErrorKind::Timeout.to_string(), "Timeout");
    }
}
