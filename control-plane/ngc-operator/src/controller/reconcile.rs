//! One reconcile pass for one declared object.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use kube::core::DynamicObject;
use ngc_cluster::{ApiError, ClusterApi, Reachability};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::apply::{ApplyAbort, Applier};
use super::finalizer::{self, CleanupError, child_step_id};
use super::kind::{DeclaredKind, DeclaredObject};
use super::planner::OwnerInfo;
use super::status::{self, PassError, merge_conditions};
use super::{ControllerContext, ReconcileErr, WorkKey, drift};
use crate::crd::common::{API_VERSION, Condition, ConditionStatus, ConditionType, Phase, ReconcileStatus};
use crate::crd::gateway_bundle::GatewayBundle;
use crate::crd::inference_stack::InferenceStack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
    Never,
}

#[async_trait]
pub trait KindHandler: Send + Sync {
    async fn reconcile(&self, key: &WorkKey) -> Result<Requeue, ReconcileErr>;
}

/// Explicit kind-to-handler table built at startup.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<DeclaredKind, Arc<dyn KindHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: DeclaredKind, handler: Arc<dyn KindHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Handlers for every declared kind.
    pub fn standard(ctx: Arc<ControllerContext>) -> Self {
        let mut d = Self::new();
        d.register(
            DeclaredKind::InferenceStack,
            Arc::new(Reconciler::<InferenceStack>::new(ctx.clone())),
        );
        d.register(
            DeclaredKind::GatewayBundle,
            Arc::new(Reconciler::<GatewayBundle>::new(ctx)),
        );
        d
    }

    pub fn kinds(&self) -> Vec<DeclaredKind> {
        let mut k: Vec<_> = self.handlers.keys().copied().collect();
        k.sort();
        k
    }

    pub async fn dispatch(&self, key: &WorkKey) -> Result<Requeue, ReconcileErr> {
        match self.handlers.get(&key.kind) {
            Some(h) => h.reconcile(key).await,
            None => Err(ReconcileErr::Validation(format!("no handler for {}", key.kind))),
        }
    }
}

pub struct Reconciler<K> {
    ctx: Arc<ControllerContext>,
    _kind: PhantomData<fn() -> K>,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn read_status<K: DeclaredObject>(obj: &DynamicObject) -> K::Status {
    match obj.data.get("status") {
        None | Some(Value::Null) => K::Status::default(),
        Some(v) => serde_json::from_value(v.clone()).unwrap_or_else(|e| {
            warn!(error = %e, "unreadable status, starting over");
            K::Status::default()
        }),
    }
}

fn has_finalizer<K: DeclaredObject>(obj: &DynamicObject) -> bool {
    obj.finalizers().iter().any(|f| f == K::FINALIZER)
}

fn terminating_conditions(blocked: Option<&str>) -> Vec<Condition> {
    let mut out = vec![Condition {
        type_: ConditionType::Ready,
        status: ConditionStatus::False,
        reason: Some("Terminating".into()),
        message: Some("cleanup in progress".into()),
        last_transition_time: None,
    }];
    if let Some(msg) = blocked {
        out.push(Condition {
            type_: ConditionType::CleanupBlocked,
            status: ConditionStatus::True,
            reason: Some("CleanupStepFailed".into()),
            message: Some(msg.to_string()),
            last_transition_time: None,
        });
    }
    out
}

impl<K: DeclaredObject> Reconciler<K> {
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self {
            ctx,
            _kind: PhantomData,
        }
    }

    fn owner(&self, obj: &DynamicObject, ns: &str) -> OwnerInfo {
        OwnerInfo {
            api_version: API_VERSION.to_string(),
            kind: K::KIND.as_str().to_string(),
            name: obj.name_any(),
            namespace: ns.to_string(),
            uid: obj.metadata.uid.clone(),
            owner_label: K::OWNER_LABEL,
        }
    }

    /// Compare-and-swap status write; `update` maps the freshly read status
    /// to the one to store.
    async fn write_status<F>(&self, api: &dyn ClusterApi, key: &WorkKey, mut update: F) -> Result<(), ReconcileErr>
    where
        F: FnMut(K::Status) -> K::Status + Send,
    {
        let res = K::KIND.resource();
        status::write_status_cas(
            api,
            &res,
            &key.namespace,
            &key.name,
            self.ctx.settings.status_attempts,
            |current| {
                serde_json::to_value(update(read_status::<K>(current))).map_err(|e| ApiError::Internal(e.to_string()))
            },
        )
        .await
        .map(|_| ())
        .map_err(|e| ReconcileErr::api(&key.cluster, e))
    }

    async fn write_failure(&self, api: &dyn ClusterApi, key: &WorkKey, err: &PassError) -> Result<(), ReconcileErr> {
        let (phase, fresh) = status::aggregate(&[], Some(err));
        let at = now();
        self.write_status(api, key, |current| {
            let core = K::core(&current).clone();
            let next = ReconcileStatus {
                phase: Some(phase),
                conditions: merge_conditions(&core.conditions, fresh.clone(), &at),
                ..core
            };
            K::replace_core(current, next)
        })
        .await
    }

    async fn add_finalizer(&self, api: &dyn ClusterApi, key: &WorkKey, obj: &DynamicObject) -> Result<(), ReconcileErr> {
        let res = K::KIND.resource();
        let mut finalizers = obj.finalizers().to_vec();
        finalizers.push(K::FINALIZER.to_string());
        api.set_finalizers(&res, &key.namespace, &key.name, &finalizers)
            .await
            .map_err(|e| ReconcileErr::api(&key.cluster, e))?;
        info!(finalizer = K::FINALIZER, "finalizer added");

        if K::core(&read_status::<K>(obj)).phase.is_none() {
            let (phase, fresh) = status::aggregate(&[], None);
            let at = now();
            self.write_status(api, key, |current| {
                let core = K::core(&current).clone();
                let next = ReconcileStatus {
                    phase: Some(phase),
                    conditions: merge_conditions(&core.conditions, fresh.clone(), &at),
                    ..core
                };
                K::replace_core(current, next)
            })
            .await?;
        }
        Ok(())
    }

    async fn converge(&self, api: &dyn ClusterApi, key: &WorkKey, obj: &DynamicObject) -> Result<Requeue, ReconcileErr> {
        let owner = self.owner(obj, &key.namespace);
        let spec: K::Spec = match serde_json::from_value(obj.data.get("spec").cloned().unwrap_or(Value::Null)) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "spec cannot be decoded");
                self.write_failure(api, key, &PassError::terminal("InvalidSpec", e.to_string()))
                    .await?;
                return Err(ReconcileErr::Validation(e.to_string()));
            }
        };
        let spec_hash = drift::spec_hash(&spec)?;
        let plan = match K::plan(&owner, &spec) {
            Ok(p) => p,
            Err(e) => {
                warn!(%spec_hash, error = %e, "spec cannot be planned");
                self.write_failure(api, key, &PassError::terminal("InvalidSpec", e.to_string()))
                    .await?;
                return Err(ReconcileErr::Validation(e.to_string()));
            }
        };

        let prev = read_status::<K>(obj);
        let prev_core = K::core(&prev);
        if prev_core.observed_spec_hash.as_deref() == Some(spec_hash.as_str()) {
            debug!(%spec_hash, "spec unchanged, checking children");
        } else {
            info!(
                %spec_hash,
                observed = prev_core.observed_spec_hash.as_deref().unwrap_or("-"),
                children = plan.len(),
                "spec changed, applying plan"
            );
        }

        let applier = Applier {
            api,
            namespace: &key.namespace,
            owner: &owner,
            retry: &self.ctx.settings.apply_retry,
            token: &self.ctx.token,
            metrics: &self.ctx.metrics,
        };
        let outcome = match applier.apply(&plan, &prev_core.applied_children).await {
            Ok(o) => o,
            Err(ApplyAbort::Unreachable(reason)) => {
                warn!(%reason, "cluster became unreachable mid-pass");
                return Err(ReconcileErr::Unreachable {
                    cluster: key.cluster.clone(),
                    reason,
                });
            }
            Err(ApplyAbort::Cancelled) => return Err(ReconcileErr::Cancelled),
        };

        let pass_error = outcome.pass_error();
        let (phase, fresh) = status::aggregate(&outcome.children, pass_error.as_ref());
        let complete = outcome.complete();
        let at = now();
        self.write_status(api, key, |current| {
            let core = K::core(&current);
            let next = ReconcileStatus {
                phase: Some(phase),
                children: outcome.children.clone(),
                conditions: merge_conditions(&core.conditions, fresh.clone(), &at),
                observed_spec_hash: if complete {
                    Some(spec_hash.clone())
                } else {
                    core.observed_spec_hash.clone()
                },
                last_reconciled_at: if complete {
                    Some(at.clone())
                } else {
                    core.last_reconciled_at.clone()
                },
                applied_children: outcome.applied.clone(),
            };
            K::build_status(next, &outcome.live)
        })
        .await?;

        info!(
            %phase,
            created = outcome.created,
            updated = outcome.updated,
            deleted = outcome.deleted,
            "pass finished"
        );
        match pass_error {
            Some(e) if e.terminal => Err(ReconcileErr::Validation(e.message)),
            Some(_) => Err(ReconcileErr::ChildApply {
                failed: outcome.failures.len(),
                total: plan.len(),
            }),
            None => Ok(Requeue::After(self.ctx.settings.resync)),
        }
    }

    async fn finalize(&self, api: &dyn ClusterApi, key: &WorkKey, obj: &DynamicObject) -> Result<Requeue, ReconcileErr> {
        if !has_finalizer::<K>(obj) {
            debug!("deleting without our finalizer, nothing to do");
            return Ok(Requeue::Never);
        }
        let res = K::KIND.resource();
        let owner = self.owner(obj, &key.namespace);
        let core = K::core(&read_status::<K>(obj)).clone();
        let spec: Option<K::Spec> = obj
            .data
            .get("spec")
            .and_then(|s| serde_json::from_value(s.clone()).ok());
        let plan = spec
            .as_ref()
            .and_then(|s| K::plan(&owner, s).ok())
            .unwrap_or_default();
        let mut steps = spec
            .as_ref()
            .map(|s| K::external_cleanup(&key.name, s))
            .unwrap_or_default();
        steps.extend(finalizer::child_steps(&core.applied_children, &plan));

        let ordered = finalizer::teardown_order(steps);
        if core.phase != Some(Phase::Terminating) && ordered.is_ok() {
            let at = now();
            self.write_status(api, key, |current| {
                let core = K::core(&current).clone();
                let next = ReconcileStatus {
                    phase: Some(Phase::Terminating),
                    conditions: merge_conditions(&core.conditions, terminating_conditions(None), &at),
                    ..core
                };
                K::replace_core(current, next)
            })
            .await?;
        }

        let mut done = Vec::new();
        let result = match &ordered {
            Ok(steps) => {
                finalizer::run_cleanup(
                    steps,
                    api,
                    &key.namespace,
                    self.ctx.publisher.as_ref(),
                    &self.ctx.settings.apply_retry,
                    &self.ctx.token,
                    &mut done,
                )
                .await
            }
            Err(e) => Err(e.clone()),
        };

        let (step, reason, unreachable) = match result {
            Ok(()) => {
                let Some(current) = api
                    .get(&res, &key.namespace, &key.name)
                    .await
                    .map_err(|e| ReconcileErr::api(&key.cluster, e))?
                else {
                    return Ok(Requeue::Never);
                };
                let rest: Vec<String> = current
                    .finalizers()
                    .iter()
                    .filter(|f| *f != K::FINALIZER)
                    .cloned()
                    .collect();
                match api.set_finalizers(&res, &key.namespace, &key.name, &rest).await {
                    Ok(_) | Err(ApiError::NotFound(_)) => {}
                    Err(e) => return Err(ReconcileErr::api(&key.cluster, e)),
                }
                info!(steps = done.len(), "cleanup finished, finalizer removed");
                return Ok(Requeue::Never);
            }
            Err(CleanupError::Step {
                step,
                reason,
                unreachable,
            }) => (step, reason, unreachable),
            Err(CleanupError::Cycle(id)) => (id, "cleanup steps form a cycle".to_string(), false),
        };

        warn!(%step, %reason, "cleanup blocked");
        let blocked = format!("{step}: {reason}");
        let at = now();
        self.write_status(api, key, |current| {
            let core = K::core(&current).clone();
            let remaining = core
                .applied_children
                .iter()
                .filter(|c| !done.contains(&child_step_id(c)))
                .cloned()
                .collect();
            let next = ReconcileStatus {
                phase: Some(Phase::Terminating),
                conditions: merge_conditions(
                    &core.conditions,
                    terminating_conditions(Some(&blocked)),
                    &at,
                ),
                applied_children: remaining,
                ..core
            };
            K::replace_core(current, next)
        })
        .await?;

        if unreachable && step.starts_with("child:") {
            return Err(ReconcileErr::Unreachable {
                cluster: key.cluster.clone(),
                reason,
            });
        }
        Err(ReconcileErr::Cleanup { step, reason })
    }
}

#[async_trait]
impl<K: DeclaredObject> KindHandler for Reconciler<K> {
    #[instrument(
        skip(self),
        fields(cluster = %key.cluster, kind = %key.kind, ns = %key.namespace, name = %key.name)
    )]
    async fn reconcile(&self, key: &WorkKey) -> Result<Requeue, ReconcileErr> {
        let cluster = self
            .ctx
            .registry
            .resolve(&key.cluster)
            .await
            .map_err(|e| ReconcileErr::Unreachable {
                cluster: key.cluster.clone(),
                reason: e.to_string(),
            })?;
        if cluster.reachability() == Reachability::Unreachable {
            return Err(ReconcileErr::Unreachable {
                cluster: key.cluster.clone(),
                reason: "failing health probes".into(),
            });
        }
        let api = cluster.api();
        let res = K::KIND.resource();
        let Some(obj) = api
            .get(&res, &key.namespace, &key.name)
            .await
            .map_err(|e| ReconcileErr::api(&key.cluster, e))?
        else {
            debug!("object gone");
            return Ok(Requeue::Never);
        };

        if obj.metadata.deletion_timestamp.is_some() {
            return self.finalize(api.as_ref(), key, &obj).await;
        }
        if !has_finalizer::<K>(&obj) {
            self.add_finalizer(api.as_ref(), key, &obj).await?;
        }
        self.converge(api.as_ref(), key, &obj).await
    }
}
