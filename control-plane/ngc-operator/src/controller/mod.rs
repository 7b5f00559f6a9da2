pub mod apply;
pub mod drift;
pub mod finalizer;
pub mod kind;
pub mod planner;
pub mod publish;
pub mod queue;
pub mod readiness;
pub mod reconcile;
pub mod retry;
pub mod status;
pub mod watch;
pub mod workers;

use std::sync::Arc;
use std::time::Duration;

use ngc_cluster::{ApiError, ClusterRegistry};
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
pub use kind::DeclaredKind;
use publish::ExternalPublisher;
use retry::RetryConfig;

/// Identity of one declared object on one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkKey {
    pub cluster: String,
    pub kind: DeclaredKind,
    pub namespace: String,
    pub name: String,
}

impl WorkKey {
    pub fn new(cluster: &str, kind: DeclaredKind, namespace: &str, name: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for WorkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}/{}", self.cluster, self.kind, self.namespace, self.name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("transient api error: {0}")]
    Transient(ApiError),
    #[error("{failed} of {total} children not applied")]
    ChildApply { failed: usize, total: usize },
    #[error("cluster {cluster} unreachable: {reason}")]
    Unreachable { cluster: String, reason: String },
    #[error("cleanup blocked at {step}: {reason}")]
    Cleanup { step: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("shutting down")]
    Cancelled,
}

/// How the worker pool requeues a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Wait for a spec change
    Terminal,
    /// Exponential backoff
    Backoff,
    /// Retry on the resync interval, after the health checker had a chance
    Unreachable,
    /// Drop without requeue
    Shutdown,
}

impl ReconcileErr {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileErr::Validation(_) | ReconcileErr::Serialization(_) => ErrorClass::Terminal,
            ReconcileErr::Transient(_) | ReconcileErr::ChildApply { .. } | ReconcileErr::Cleanup { .. } => {
                ErrorClass::Backoff
            }
            ReconcileErr::Unreachable { .. } => ErrorClass::Unreachable,
            ReconcileErr::Cancelled => ErrorClass::Shutdown,
        }
    }

    /// Short label for metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            ReconcileErr::Validation(_) => "validation",
            ReconcileErr::Transient(_) => "transient",
            ReconcileErr::ChildApply { .. } => "child_apply",
            ReconcileErr::Unreachable { .. } => "unreachable",
            ReconcileErr::Cleanup { .. } => "cleanup",
            ReconcileErr::Serialization(_) => "serialization",
            ReconcileErr::Cancelled => "cancelled",
        }
    }

    /// Classify a failed call against `cluster`.
    pub fn api(cluster: &str, err: ApiError) -> Self {
        match err {
            ApiError::Unreachable(reason) => ReconcileErr::Unreachable {
                cluster: cluster.to_string(),
                reason,
            },
            ApiError::Invalid(msg) => ReconcileErr::Validation(msg),
            other => ReconcileErr::Transient(other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReconcileSettings {
    /// Requeue delay after a successful pass
    pub resync: Duration,
    pub apply_retry: RetryConfig,
    /// Compare-and-swap attempts for one status write
    pub status_attempts: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            resync: Duration::from_secs(60),
            apply_retry: RetryConfig::default(),
            status_attempts: 5,
        }
    }
}

/// Shared state handed to every reconciler.
pub struct ControllerContext {
    pub registry: Arc<ClusterRegistry>,
    pub publisher: Arc<dyn ExternalPublisher>,
    pub metrics: Arc<Metrics>,
    pub settings: ReconcileSettings,
    pub token: CancellationToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_onto_classes() {
        let c = |e| ReconcileErr::api("east", e).class();
        assert_eq!(c(ApiError::Unreachable("down".into())), ErrorClass::Unreachable);
        assert_eq!(c(ApiError::Invalid("bad".into())), ErrorClass::Terminal);
        assert_eq!(c(ApiError::Conflict("rv".into())), ErrorClass::Backoff);
        assert_eq!(c(ApiError::Internal("500".into())), ErrorClass::Backoff);
    }

    #[test]
    fn work_key_display() {
        let k = WorkKey::new("east", DeclaredKind::GatewayBundle, "ns", "edge");
        assert_eq!(k.to_string(), "east/GatewayBundle/ns/edge");
    }
}
