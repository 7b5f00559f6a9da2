use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::api::ClusterApi;
use crate::error::ApiError;

/// `ClusterApi` backed by a kube client. Every call runs under `timeout`.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    timeout: Duration,
}

impl KubeClusterApi {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, res: &ApiResource, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, res)
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(ApiError::from),
            Err(_) => Err(ApiError::Timeout(format!(
                "{op} exceeded {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get(
        &self,
        res: &ApiResource,
        ns: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ApiError> {
        let api = self.api(res, ns);
        self.bounded("get", api.get_opt(name)).await
    }

    async fn list(
        &self,
        res: &ApiResource,
        ns: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ApiError> {
        let api = self.api(res, ns);
        let mut lp = ListParams::default();
        if !label_selector.is_empty() {
            lp = lp.labels(label_selector);
        }
        let list = self.bounded("list", api.list(&lp)).await?;
        Ok(list.items)
    }

    async fn create(
        &self,
        res: &ApiResource,
        ns: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        let api = self.api(res, ns);
        self.bounded("create", api.create(&PostParams::default(), obj))
            .await
    }

    async fn replace(
        &self,
        res: &ApiResource,
        ns: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        let api = self.api(res, ns);
        let name = obj.name_any();
        self.bounded("replace", api.replace(&name, &PostParams::default(), obj))
            .await
    }

    async fn replace_status(
        &self,
        res: &ApiResource,
        ns: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        let api = self.api(res, ns);
        let name = obj.name_any();
        let body = serde_json::to_vec(obj)?;
        self.bounded(
            "replace_status",
            api.replace_status(&name, &PostParams::default(), body),
        )
        .await
    }

    async fn set_finalizers(
        &self,
        res: &ApiResource,
        ns: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<DynamicObject, ApiError> {
        let api = self.api(res, ns);
        let patch = json!({"metadata": {"finalizers": finalizers}});
        self.bounded(
            "set_finalizers",
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
    }

    async fn delete(&self, res: &ApiResource, ns: &str, name: &str) -> Result<(), ApiError> {
        let api = self.api(res, ns);
        match self
            .bounded("delete", api.delete(name, &DeleteParams::background()))
            .await
        {
            Ok(_) => Ok(()),
            Err(ApiError::NotFound(_)) => {
                debug!(kind = %res.kind, %ns, %name, "delete: already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn probe(&self) -> Result<(), ApiError> {
        self.bounded("probe", self.client.apiserver_version())
            .await
            .map(|_| ())
    }

    fn kube_client(&self) -> Option<Client> {
        Some(self.client.clone())
    }
}
