//! Pre-delete cleanup, run while the finalizer holds the declared object.
//!
//! Steps form a dependency graph where "A depends on B" means A references
//! B and must be torn down first. Execution stops at the first failing step
//! so nothing a later step relies on is removed early.

use std::collections::HashMap;

use ngc_cluster::{ApiError, ClusterApi, api_resource};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::planner::ChildDescriptor;
use super::publish::{ExternalPublisher, PublishError};
use super::retry::{RetryConfig, retry_transient};
use crate::crd::common::ChildRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    DeleteHttpLoadBalancer {
        tenant: String,
        namespace: String,
        name: String,
    },
    DeleteOriginPool {
        tenant: String,
        namespace: String,
        name: String,
    },
    DeleteChild(ChildRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupStep {
    pub id: String,
    pub depends_on: Vec<String>,
    pub action: CleanupAction,
}

pub fn child_step_id(child: &ChildRef) -> String {
    format!("child:{}/{}", child.kind, child.name)
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CleanupError {
    #[error("cleanup steps form a cycle through {0}")]
    Cycle(String),
    #[error("cleanup step {step} failed: {reason}")]
    Step {
        step: String,
        reason: String,
        /// The target could not be reached at all
        unreachable: bool,
    },
}

/// Order steps so every step runs before the steps it depends on. Ties keep
/// input order. Dependencies on ids not in `steps` are ignored.
pub fn teardown_order(steps: Vec<CleanupStep>) -> Result<Vec<CleanupStep>, CleanupError> {
    let index: HashMap<&str, usize> = steps.iter().enumerate().map(|(i, s)| (s.id.as_str(), i)).collect();
    // Number of not-yet-emitted steps that depend on each step.
    let mut dependents = vec![0usize; steps.len()];
    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
    for s in &steps {
        let mut mine: Vec<usize> = s
            .depends_on
            .iter()
            .filter_map(|d| index.get(d.as_str()).copied())
            .collect();
        mine.sort_unstable();
        mine.dedup();
        for &d in &mine {
            dependents[d] += 1;
        }
        deps.push(mine);
    }

    let mut emitted = vec![false; steps.len()];
    let mut order = Vec::with_capacity(steps.len());
    while order.len() < steps.len() {
        let Some(next) = (0..steps.len()).find(|&i| !emitted[i] && dependents[i] == 0) else {
            let stuck = (0..steps.len()).find(|&i| !emitted[i]).map(|i| steps[i].id.clone());
            return Err(CleanupError::Cycle(stuck.unwrap_or_default()));
        };
        emitted[next] = true;
        for &d in &deps[next] {
            dependents[d] -= 1;
        }
        order.push(next);
    }

    let mut slots: Vec<Option<CleanupStep>> = steps.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

/// Deletion steps for applied children. Dependencies come from the current
/// plan where it knows the child.
pub fn child_steps(applied: &[ChildRef], plan: &[ChildDescriptor]) -> Vec<CleanupStep> {
    let ids: HashMap<&str, String> = applied
        .iter()
        .map(|c| (c.name.as_str(), child_step_id(c)))
        .collect();
    applied
        .iter()
        .rev()
        .map(|c| {
            let depends_on = plan
                .iter()
                .find(|d| d.kind == c.kind && d.name == c.name)
                .map(|d| d.depends_on.iter().filter_map(|n| ids.get(n.as_str()).cloned()).collect())
                .unwrap_or_default();
            CleanupStep {
                id: child_step_id(c),
                depends_on,
                action: CleanupAction::DeleteChild(c.clone()),
            }
        })
        .collect()
}

fn publish_failure(step: &str, err: PublishError) -> CleanupError {
    CleanupError::Step {
        step: step.to_string(),
        unreachable: err.is_unreachable(),
        reason: err.to_string(),
    }
}

fn api_failure(step: &str, err: ApiError) -> CleanupError {
    CleanupError::Step {
        step: step.to_string(),
        unreachable: err.is_unreachable(),
        reason: err.to_string(),
    }
}

/// Execute `steps` in order, pushing each completed id onto `done`. The
/// first failure stops execution and names the blocking step.
pub async fn run_cleanup(
    steps: &[CleanupStep],
    api: &dyn ClusterApi,
    namespace: &str,
    publisher: &dyn ExternalPublisher,
    retry: &RetryConfig,
    token: &CancellationToken,
    done: &mut Vec<String>,
) -> Result<(), CleanupError> {
    for step in steps {
        match &step.action {
            CleanupAction::DeleteHttpLoadBalancer {
                tenant,
                namespace,
                name,
            } => publisher
                .delete_http_load_balancer(tenant, namespace, name)
                .await
                .map_err(|e| publish_failure(&step.id, e))?,
            CleanupAction::DeleteOriginPool {
                tenant,
                namespace,
                name,
            } => publisher
                .delete_origin_pool(tenant, namespace, name)
                .await
                .map_err(|e| publish_failure(&step.id, e))?,
            CleanupAction::DeleteChild(child) => {
                let res = api_resource(&child.api_version, &child.kind);
                retry_transient(retry, &step.id, token, || api.delete(&res, namespace, &child.name))
                    .await
                    .map_err(|e| {
                        warn!(step = %step.id, error = %e, "child deletion failed");
                        api_failure(&step.id, e)
                    })?
            }
        }
        info!(step = %step.id, "cleanup step done");
        done.push(step.id.clone());
    }
    Ok(())
}
