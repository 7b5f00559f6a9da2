use kube::core::DynamicObject;
use serde_json::Value;

use super::planner::ChildDescriptor;
use super::planner::inference_stack::REPLICAS_ANNOTATION;

/// Readiness verdict for one live child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub message: String,
}

impl Readiness {
    fn ready(msg: impl Into<String>) -> Self {
        Self {
            ready: true,
            message: msg.into(),
        }
    }

    fn waiting(msg: impl Into<String>) -> Self {
        Self {
            ready: false,
            message: msg.into(),
        }
    }
}

fn conditions(v: Option<&Value>) -> &[Value] {
    v.and_then(|c| c.as_array()).map(Vec::as_slice).unwrap_or(&[])
}

fn condition_status<'a>(conds: &'a [Value], type_: &str) -> Option<&'a str> {
    conds
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
        .and_then(|c| c.get("status").and_then(Value::as_str))
}

/// Every parent in `status.parents` has accepted the object.
fn parents_accepted(status: &Value) -> Option<bool> {
    let parents = status.get("parents")?.as_array()?;
    if parents.is_empty() {
        return None;
    }
    Some(
        parents
            .iter()
            .all(|p| condition_status(conditions(p.get("conditions")), "Accepted") == Some("True")),
    )
}

/// Evaluate a live child against what was planned for it.
pub fn evaluate(desired: &ChildDescriptor, live: &DynamicObject) -> Readiness {
    let status = live.data.get("status");
    match desired.kind.as_str() {
        "InferencePool" => pool(desired, status),
        "HTTPRoute" => match status.and_then(parents_accepted) {
            Some(true) => Readiness::ready("accepted by gateway"),
            Some(false) => Readiness::waiting("not accepted by every parent gateway"),
            None => Readiness::waiting("waiting for gateway to accept route"),
        },
        "DaemonSet" => {
            let n = status
                .and_then(|s| s.get("numberReady"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if n > 0 {
                Readiness::ready(format!("{n} pods ready"))
            } else {
                Readiness::waiting(format!("waiting for pods ({n} ready)"))
            }
        }
        "ScaledObject" => match condition_status(conditions(status.and_then(|s| s.get("conditions"))), "Ready") {
            Some("True") => Readiness::ready("scaler active"),
            _ => Readiness::waiting("waiting for scaler to become ready"),
        },
        "Gateway" => {
            let conds = conditions(status.and_then(|s| s.get("conditions")));
            let accepted = condition_status(conds, "Accepted");
            let programmed = condition_status(conds, "Programmed");
            if accepted == Some("False") {
                Readiness::waiting("gateway not accepted")
            } else if programmed == Some("True") {
                Readiness::ready("programmed")
            } else {
                Readiness::waiting("waiting for gateway controller")
            }
        }
        "SnippetsFilter" => {
            let conds = conditions(status.and_then(|s| s.get("conditions")));
            if condition_status(conds, "Accepted") == Some("False") {
                Readiness::waiting("snippets rejected")
            } else {
                Readiness::ready("in sync")
            }
        }
        "ConfigMap" | "NginxProxy" => Readiness::ready("in sync"),
        other => Readiness::waiting(format!("no readiness rule for {other}")),
    }
}

fn pool(desired: &ChildDescriptor, status: Option<&Value>) -> Readiness {
    let Some(status) = status else {
        return Readiness::waiting("waiting for pool status");
    };
    let want = desired
        .annotations
        .get(REPLICAS_ANNOTATION)
        .and_then(|r| r.parse::<i64>().ok())
        .unwrap_or(0);
    if let Some(have) = status.get("readyReplicas").and_then(Value::as_i64) {
        return if have >= want {
            Readiness::ready(format!("{have}/{want} replicas ready"))
        } else {
            Readiness::waiting(format!("{have}/{want} replicas ready"))
        };
    }
    match parents_accepted(status) {
        Some(true) => Readiness::ready("accepted"),
        _ => Readiness::waiting("waiting for pool status"),
    }
}

/// First address a Gateway reports, if any.
pub fn gateway_address(live: &DynamicObject) -> Option<String> {
    live.data
        .get("status")?
        .get("addresses")?
        .as_array()?
        .first()?
        .get("value")?
        .as_str()
        .map(str::to_string)
}
