//! Status aggregation and optimistic status writes.

use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use ngc_cluster::{ApiError, ClusterApi};
use serde_json::{Map, Value};
use tracing::debug;

use crate::crd::common::{ChildStatus, Condition, ConditionStatus, ConditionType, Phase};

/// Why a pass did not fully succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassError {
    pub reason: String,
    pub message: String,
    /// Retrying without a spec change cannot help
    pub terminal: bool,
}

impl PassError {
    pub fn terminal(reason: &str, message: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            message: message.into(),
            terminal: true,
        }
    }

    pub fn retryable(reason: &str, message: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            message: message.into(),
            terminal: false,
        }
    }
}

fn cond(type_: ConditionType, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Condition {
    let message = message.into();
    Condition {
        type_,
        status,
        reason: Some(reason.to_string()),
        message: (!message.is_empty()).then_some(message),
        last_transition_time: None,
    }
}

/// Map per-child readiness and the pass error onto a phase and conditions.
///
/// Returned conditions carry no transition time; see [`merge_conditions`].
pub fn aggregate(children: &[ChildStatus], error: Option<&PassError>) -> (Phase, Vec<Condition>) {
    use ConditionStatus::{False, True};
    use ConditionType::{Degraded, Ready, Reconciled};

    if let Some(err) = error.filter(|e| e.terminal) {
        return (
            Phase::Error,
            vec![
                cond(Ready, False, &err.reason, err.message.clone()),
                cond(Reconciled, False, &err.reason, err.message.clone()),
            ],
        );
    }
    if children.is_empty() {
        return (
            Phase::Pending,
            vec![cond(Ready, ConditionStatus::Unknown, "Pending", "no children planned yet")],
        );
    }

    let reconciled = match error {
        Some(err) => cond(Reconciled, False, &err.reason, err.message.clone()),
        None => cond(Reconciled, True, "ReconcileSucceeded", ""),
    };
    let pending: Vec<&ChildStatus> = children.iter().filter(|c| !c.ready).collect();
    if pending.is_empty() {
        return (
            Phase::Ready,
            vec![
                cond(Ready, True, "AllChildrenReady", ""),
                reconciled,
                cond(Degraded, False, "AllChildrenReady", ""),
            ],
        );
    }

    let listing = pending
        .iter()
        .map(|c| {
            if c.message.is_empty() {
                format!("{}/{}", c.kind, c.name)
            } else {
                format!("{}/{}: {}", c.kind, c.name, c.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ");
    (
        Phase::Degraded,
        vec![
            cond(
                Ready,
                False,
                "ChildrenNotReady",
                format!("{} of {} children not ready", pending.len(), children.len()),
            ),
            reconciled,
            cond(Degraded, True, "ChildrenNotReady", listing),
        ],
    )
}

fn rank(t: ConditionType) -> u8 {
    match t {
        ConditionType::Ready => 0,
        ConditionType::Reconciled => 1,
        ConditionType::Degraded => 2,
        ConditionType::CleanupBlocked => 3,
        ConditionType::Unknown => 4,
    }
}

/// Combine freshly computed conditions with the previous set. A condition
/// keeps its old `lastTransitionTime` unless status, reason or message
/// changed. Types absent from `fresh` are dropped. One entry per type.
pub fn merge_conditions(previous: &[Condition], fresh: Vec<Condition>, now: &str) -> Vec<Condition> {
    let mut out: Vec<Condition> = Vec::with_capacity(fresh.len());
    for mut c in fresh {
        if out.iter().any(|o| o.type_ == c.type_) {
            continue;
        }
        let old = previous.iter().find(|p| p.type_ == c.type_);
        c.last_transition_time = match old {
            Some(p) if p.status == c.status && p.reason == c.reason && p.message == c.message => {
                p.last_transition_time.clone().or_else(|| Some(now.to_string()))
            }
            _ => Some(now.to_string()),
        };
        out.push(c);
    }
    out.sort_by_key(|c| rank(c.type_));
    out
}

/// Re-read, recompute, write. `compute` gets the freshly read object and
/// returns the status to store. A version conflict starts over, at most
/// `attempts` times in total. Returns `Ok(None)` if the object is gone.
pub async fn write_status_cas<F>(
    api: &dyn ClusterApi,
    res: &ApiResource,
    ns: &str,
    name: &str,
    attempts: u32,
    mut compute: F,
) -> Result<Option<DynamicObject>, ApiError>
where
    F: FnMut(&DynamicObject) -> Result<Value, ApiError> + Send,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let Some(current) = api.get(res, ns, name).await? else {
            return Ok(None);
        };
        let status = compute(&current)?;
        let mut next = current;
        if !next.data.is_object() {
            next.data = Value::Object(Map::new());
        }
        next.data["status"] = status;
        match api.replace_status(res, ns, &next).await {
            Ok(stored) => return Ok(Some(stored)),
            Err(ApiError::Conflict(msg)) if attempt < attempts.max(1) => {
                debug!(%name, attempt, %msg, "status write conflicted, re-reading");
            }
            Err(e) => return Err(e),
        }
    }
}
