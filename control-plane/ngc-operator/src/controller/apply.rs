//! Applying a plan: create what is missing, overwrite what drifted, delete
//! what is no longer planned.

use std::collections::HashSet;

use kube::core::DynamicObject;
use ngc_cluster::{ApiError, ClusterApi, api_resource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::drift;
use super::planner::{ChildDescriptor, OwnerInfo};
use super::readiness;
use super::retry::{RetryConfig, retry_transient};
use super::status::PassError;
use crate::crd::common::{ChildRef, ChildStatus};
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOp {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ChildFailure {
    pub child: ChildRef,
    pub error: ApiError,
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// One entry per planned child, in plan order
    pub children: Vec<ChildStatus>,
    /// Children known to exist and still ours to delete
    pub applied: Vec<ChildRef>,
    pub failures: Vec<ChildFailure>,
    /// Planned children not attempted because a prerequisite failed
    pub skipped: Vec<ChildRef>,
    pub live: Vec<(ChildDescriptor, DynamicObject)>,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ApplyOutcome {
    /// Every planned child was applied and every stale child removed.
    pub fn complete(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }

    pub fn pass_error(&self) -> Option<PassError> {
        if let Some(f) = self.failures.iter().find(|f| f.error.is_invalid()) {
            return Some(PassError::terminal(
                "ChildRejected",
                format!("{}/{} rejected: {}", f.child.kind, f.child.name, f.error),
            ));
        }
        if self.failures.is_empty() {
            return None;
        }
        let listing = self
            .failures
            .iter()
            .map(|f| format!("{}/{}: {}", f.child.kind, f.child.name, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        Some(PassError::retryable(
            "ChildApplyFailed",
            format!("{} child operations failed: {listing}", self.failures.len()),
        ))
    }
}

/// Why a pass was abandoned before every child was visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyAbort {
    Unreachable(String),
    Cancelled,
}

pub struct Applier<'a> {
    pub api: &'a dyn ClusterApi,
    pub namespace: &'a str,
    pub owner: &'a OwnerInfo,
    pub retry: &'a RetryConfig,
    pub token: &'a CancellationToken,
    pub metrics: &'a Metrics,
}

impl Applier<'_> {
    async fn sync_child(&self, desc: &ChildDescriptor) -> Result<(SyncOp, DynamicObject), ApiError> {
        let api = self.api;
        let ns = self.namespace;
        let owner = self.owner;
        let op_name = format!("apply {}/{}", desc.kind, desc.name);
        retry_transient(self.retry, &op_name, self.token, || async move {
            let res = desc.resource();
            match api.get(&res, ns, &desc.name).await? {
                None => {
                    let created = api.create(&res, ns, &desc.to_object(owner)).await?;
                    Ok((SyncOp::Created, created))
                }
                Some(live) if drift::child_drifted(desc, &live) => {
                    info!(
                        child_kind = %desc.kind,
                        child = %desc.name,
                        live_hash = %drift::live_hash(desc, &live),
                        desired_hash = %drift::desired_hash(desc),
                        "child drifted, overwriting"
                    );
                    let updated = api.replace(&res, ns, &drift::overwrite_owned(desc, &live)).await?;
                    Ok((SyncOp::Updated, updated))
                }
                Some(live) => Ok((SyncOp::Unchanged, live)),
            }
        })
        .await
    }

    async fn delete_child(&self, child: &ChildRef) -> Result<(), ApiError> {
        let res = api_resource(&child.api_version, &child.kind);
        let op_name = format!("delete {}/{}", child.kind, child.name);
        let api = self.api;
        let ns = self.namespace;
        retry_transient(self.retry, &op_name, self.token, || api.delete(&res, ns, &child.name)).await
    }

    /// Apply `plan` in order, then delete children from `previously` that
    /// the plan no longer contains. A failed child blocks only the children
    /// that depend on it.
    pub async fn apply(&self, plan: &[ChildDescriptor], previously: &[ChildRef]) -> Result<ApplyOutcome, ApplyAbort> {
        let mut out = ApplyOutcome::default();
        let mut blocked: HashSet<&str> = HashSet::new();

        for desc in plan {
            if self.token.is_cancelled() {
                return Err(ApplyAbort::Cancelled);
            }
            let child = desc.child_ref();
            if let Some(dep) = desc.depends_on.iter().find(|d| blocked.contains(d.as_str())) {
                debug!(child_kind = %desc.kind, child = %desc.name, %dep, "skipping, prerequisite failed");
                out.children.push(ChildStatus {
                    kind: desc.kind.clone(),
                    name: desc.name.clone(),
                    ready: false,
                    message: format!("waiting for {dep}"),
                });
                blocked.insert(desc.name.as_str());
                if previously.contains(&child) {
                    out.applied.push(child.clone());
                }
                out.skipped.push(child);
                continue;
            }

            match self.sync_child(desc).await {
                Ok((op, live)) => {
                    match op {
                        SyncOp::Created => {
                            out.created += 1;
                            self.metrics.child_op(&desc.kind, "create");
                            info!(child_kind = %desc.kind, child = %desc.name, "child created");
                        }
                        SyncOp::Updated => {
                            out.updated += 1;
                            self.metrics.child_op(&desc.kind, "update");
                        }
                        SyncOp::Unchanged => {}
                    }
                    let verdict = readiness::evaluate(desc, &live);
                    out.children.push(ChildStatus {
                        kind: desc.kind.clone(),
                        name: desc.name.clone(),
                        ready: verdict.ready,
                        message: verdict.message,
                    });
                    out.applied.push(child);
                    out.live.push((desc.clone(), live));
                }
                Err(ApiError::Unreachable(reason)) => return Err(ApplyAbort::Unreachable(reason)),
                Err(error) => {
                    warn!(child_kind = %desc.kind, child = %desc.name, %error, "child apply failed");
                    out.children.push(ChildStatus {
                        kind: desc.kind.clone(),
                        name: desc.name.clone(),
                        ready: false,
                        message: error.to_string(),
                    });
                    blocked.insert(desc.name.as_str());
                    if previously.contains(&child) {
                        out.applied.push(child.clone());
                    }
                    out.failures.push(ChildFailure { child, error });
                }
            }
        }

        let planned: HashSet<ChildRef> = plan.iter().map(ChildDescriptor::child_ref).collect();
        for stale in previously.iter().rev().filter(|c| !planned.contains(*c)) {
            if self.token.is_cancelled() {
                return Err(ApplyAbort::Cancelled);
            }
            match self.delete_child(stale).await {
                Ok(()) => {
                    out.deleted += 1;
                    self.metrics.child_op(&stale.kind, "delete");
                    info!(child_kind = %stale.kind, child = %stale.name, "deleted child no longer planned");
                }
                Err(ApiError::Unreachable(reason)) => return Err(ApplyAbort::Unreachable(reason)),
                Err(error) => {
                    warn!(child_kind = %stale.kind, child = %stale.name, %error, "stale child delete failed");
                    out.applied.push(stale.clone());
                    out.failures.push(ChildFailure {
                        child: stale.clone(),
                        error,
                    });
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ngc_cluster::memory::MemoryClusterApi;
    use serde_json::json;

    fn owner() -> OwnerInfo {
        OwnerInfo {
            api_version: "ngf-console.f5.com/v1alpha1".into(),
            kind: "InferenceStack".into(),
            name: "s".into(),
            namespace: "ns".into(),
            uid: Some("uid-0".into()),
            owner_label: "ngf-console.f5.com/stack",
        }
    }

    fn cm(name: &str) -> ChildDescriptor {
        ChildDescriptor::new(&owner(), "v1", "ConfigMap", name.into()).field("data", json!({"k": name}))
    }

    async fn run(api: &MemoryClusterApi, plan: &[ChildDescriptor], prev: &[ChildRef]) -> Result<ApplyOutcome, ApplyAbort> {
        let metrics = Metrics::new().unwrap();
        let token = CancellationToken::new();
        let retry = RetryConfig::no_delay(1);
        let o = owner();
        let applier = Applier {
            api,
            namespace: "ns",
            owner: &o,
            retry: &retry,
            token: &token,
            metrics: &metrics,
        };
        applier.apply(plan, prev).await
    }

    #[tokio::test]
    async fn creates_then_is_a_no_op() {
        let api = MemoryClusterApi::new();
        let plan = vec![cm("a"), cm("b")];
        let first = run(&api, &plan, &[]).await.unwrap();
        assert_eq!(first.created, 2);
        assert!(first.complete());
        api.clear_calls();
        let second = run(&api, &plan, &first.applied).await.unwrap();
        assert_eq!((second.created, second.updated, second.deleted), (0, 0, 0));
        assert!(api.mutations().is_empty());
    }

    #[tokio::test]
    async fn failed_prerequisite_skips_dependents_only() {
        let api = MemoryClusterApi::new();
        api.fail_writes("ConfigMap", "a", ApiError::Internal("boom".into()));
        let plan = vec![cm("a"), cm("b").depends_on("a"), cm("c")];
        let out = run(&api, &plan, &[]).await.unwrap();
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.created, 1);
        assert_eq!(out.children[1].message, "waiting for a");
        assert!(!out.pass_error().unwrap().terminal);
    }

    #[tokio::test]
    async fn rejected_child_is_terminal() {
        let api = MemoryClusterApi::new();
        api.fail_writes("ConfigMap", "a", ApiError::Invalid("schema".into()));
        let out = run(&api, &[cm("a")], &[]).await.unwrap();
        assert!(out.pass_error().unwrap().terminal);
    }

    #[tokio::test]
    async fn stale_children_are_deleted() {
        let api = MemoryClusterApi::new();
        let first = run(&api, &[cm("a"), cm("b")], &[]).await.unwrap();
        let out = run(&api, &[cm("a")], &first.applied).await.unwrap();
        assert_eq!(out.deleted, 1);
        assert_eq!(out.applied, vec![cm("a").child_ref()]);
        assert!(api.object(&cm("b").resource(), "ns", "b").is_none());
    }

    #[tokio::test]
    async fn unreachable_aborts_the_pass() {
        let api = MemoryClusterApi::new();
        api.set_reachable(false);
        let err = run(&api, &[cm("a")], &[]).await.unwrap_err();
        assert!(matches!(err, ApplyAbort::Unreachable(_)));
    }
}
