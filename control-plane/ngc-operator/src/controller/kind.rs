//! Per-kind glue between the generic reconciler and the declared types.

use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use ngc_cluster::api_resource;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::finalizer::{CleanupAction, CleanupStep, child_step_id};
use super::planner::inference_stack::{ROUTE_API_VERSION, route_name};
use super::planner::{ChildDescriptor, OwnerInfo, PlanError, gateway_bundle, inference_stack};
use super::readiness::gateway_address;
use crate::crd::common::{API_VERSION, ChildRef, ReconcileStatus};
use crate::crd::gateway_bundle::{GATEWAY_BUNDLE_FINALIZER, GatewayBundle, GatewayBundleSpec, GatewayBundleStatus};
use crate::crd::inference_stack::{INFERENCE_STACK_FINALIZER, InferenceStack, InferenceStackSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeclaredKind {
    InferenceStack,
    GatewayBundle,
}

impl DeclaredKind {
    pub const ALL: [DeclaredKind; 2] = [DeclaredKind::InferenceStack, DeclaredKind::GatewayBundle];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeclaredKind::InferenceStack => "InferenceStack",
            DeclaredKind::GatewayBundle => "GatewayBundle",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    pub fn resource(&self) -> ApiResource {
        let mut res = api_resource(API_VERSION, self.as_str());
        res.plural = match self {
            DeclaredKind::InferenceStack => "inferencestacks".into(),
            DeclaredKind::GatewayBundle => "gatewaybundles".into(),
        };
        res
    }
}

impl std::fmt::Display for DeclaredKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared object kind the reconciler can drive.
pub trait DeclaredObject: Send + Sync + 'static {
    type Spec: Serialize + DeserializeOwned + Send + Sync;
    type Status: Serialize + DeserializeOwned + Default + Clone + Send + Sync;

    const KIND: DeclaredKind;
    const FINALIZER: &'static str;
    const OWNER_LABEL: &'static str;

    fn plan(owner: &OwnerInfo, spec: &Self::Spec) -> Result<Vec<ChildDescriptor>, PlanError>;

    fn core(status: &Self::Status) -> &ReconcileStatus;

    /// Assemble the full status from the shared block and the live children
    /// seen this pass.
    fn build_status(core: ReconcileStatus, live: &[(ChildDescriptor, DynamicObject)]) -> Self::Status;

    /// Swap the shared block of `previous`, keeping what the kind adds.
    fn replace_core(previous: Self::Status, core: ReconcileStatus) -> Self::Status;

    /// Cleanup outside the cluster, run before child deletion.
    fn external_cleanup(_name: &str, _spec: &Self::Spec) -> Vec<CleanupStep> {
        Vec::new()
    }
}

impl DeclaredObject for InferenceStack {
    type Spec = InferenceStackSpec;
    type Status = ReconcileStatus;

    const KIND: DeclaredKind = DeclaredKind::InferenceStack;
    const FINALIZER: &'static str = INFERENCE_STACK_FINALIZER;
    const OWNER_LABEL: &'static str = inference_stack::STACK_LABEL;

    fn plan(owner: &OwnerInfo, spec: &Self::Spec) -> Result<Vec<ChildDescriptor>, PlanError> {
        inference_stack::plan(owner, spec)
    }

    fn core(status: &Self::Status) -> &ReconcileStatus {
        status
    }

    fn build_status(core: ReconcileStatus, _live: &[(ChildDescriptor, DynamicObject)]) -> Self::Status {
        core
    }

    fn replace_core(_previous: Self::Status, core: ReconcileStatus) -> Self::Status {
        core
    }

    fn external_cleanup(name: &str, spec: &Self::Spec) -> Vec<CleanupStep> {
        let Some(xc) = &spec.distributed_cloud else {
            return Vec::new();
        };
        let route = route_name(name);
        let lb_name = format!("ngf-{route}");
        let pool_name = xc
            .origin_pool
            .as_ref()
            .and_then(|p| p.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("ngf-{route}-pool"));
        let route_step = child_step_id(&ChildRef {
            api_version: ROUTE_API_VERSION.to_string(),
            kind: "HTTPRoute".to_string(),
            name: route,
        });
        vec![
            CleanupStep {
                id: "xc-http-loadbalancer".into(),
                depends_on: vec!["xc-origin-pool".into()],
                action: CleanupAction::DeleteHttpLoadBalancer {
                    tenant: xc.tenant.clone(),
                    namespace: xc.namespace.clone(),
                    name: lb_name,
                },
            },
            CleanupStep {
                id: "xc-origin-pool".into(),
                depends_on: vec![route_step],
                action: CleanupAction::DeleteOriginPool {
                    tenant: xc.tenant.clone(),
                    namespace: xc.namespace.clone(),
                    name: pool_name,
                },
            },
        ]
    }
}

impl DeclaredObject for GatewayBundle {
    type Spec = GatewayBundleSpec;
    type Status = GatewayBundleStatus;

    const KIND: DeclaredKind = DeclaredKind::GatewayBundle;
    const FINALIZER: &'static str = GATEWAY_BUNDLE_FINALIZER;
    const OWNER_LABEL: &'static str = gateway_bundle::BUNDLE_LABEL;

    fn plan(owner: &OwnerInfo, spec: &Self::Spec) -> Result<Vec<ChildDescriptor>, PlanError> {
        gateway_bundle::plan(owner, spec)
    }

    fn core(status: &Self::Status) -> &ReconcileStatus {
        &status.reconcile
    }

    fn build_status(core: ReconcileStatus, live: &[(ChildDescriptor, DynamicObject)]) -> Self::Status {
        let gateway_address = live
            .iter()
            .find(|(d, _)| d.kind == "Gateway")
            .and_then(|(_, obj)| gateway_address(obj));
        GatewayBundleStatus {
            reconcile: core,
            gateway_address,
        }
    }

    fn replace_core(previous: Self::Status, core: ReconcileStatus) -> Self::Status {
        GatewayBundleStatus {
            reconcile: core,
            ..previous
        }
    }
}
