use async_trait::async_trait;
use kube::Client;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;

use crate::error::ApiError;

/// Build the dynamic resource descriptor for an `apiVersion` + `kind` pair.
pub fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    };
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

/// Uniform access to the object store of one cluster.
///
/// Every call is scoped to a namespace and addresses objects dynamically so
/// one implementation serves declared objects and all child kinds alike.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch one object; `Ok(None)` when it does not exist.
    async fn get(
        &self,
        res: &ApiResource,
        ns: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ApiError>;

    /// List objects matching a label selector (empty selector lists everything).
    async fn list(
        &self,
        res: &ApiResource,
        ns: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ApiError>;

    async fn create(
        &self,
        res: &ApiResource,
        ns: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError>;

    /// Replace the main resource. The object's `resourceVersion` acts as a
    /// precondition: a stale version yields `ApiError::Conflict`.
    async fn replace(
        &self,
        res: &ApiResource,
        ns: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError>;

    /// Replace the status subresource under the same precondition as `replace`.
    async fn replace_status(
        &self,
        res: &ApiResource,
        ns: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError>;

    /// Overwrite `metadata.finalizers`.
    async fn set_finalizers(
        &self,
        res: &ApiResource,
        ns: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<DynamicObject, ApiError>;

    /// Delete an object. Deleting something already gone is not an error.
    async fn delete(&self, res: &ApiResource, ns: &str, name: &str) -> Result<(), ApiError>;

    /// Lightweight reachability probe.
    async fn probe(&self) -> Result<(), ApiError>;

    /// Underlying kube client, when this cluster is backed by a real API server.
    fn kube_client(&self) -> Option<Client> {
        None
    }
}
