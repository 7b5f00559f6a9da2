//! In-memory cluster used by tests and local dry runs.
//!
//! Models the parts of API server behaviour the reconciler relies on:
//! resource versions as write preconditions, a status subresource that main
//! resource writes cannot touch, generation bumps on spec changes and
//! finalizer-gated deletion. Calls are recorded and faults can be injected.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{DynamicObject, TypeMeta};
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde_json::Value;

use crate::api::ClusterApi;
use crate::error::{ApiError, RegistryError};
use crate::source::{ClusterDescriptor, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOp {
    Create,
    Replace,
    ReplaceStatus,
    SetFinalizers,
    Delete,
}

impl ApiOp {
    /// Create, replace and delete change the object itself.
    pub fn is_mutation(&self) -> bool {
        matches!(self, ApiOp::Create | ApiOp::Replace | ApiOp::Delete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub op: ApiOp,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

type Key = (String, String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, DynamicObject>,
    next_version: u64,
    calls: Vec<ApiCall>,
    write_failures: HashMap<(String, String), ApiError>,
    status_conflicts: u32,
    unreachable: bool,
    probe_failing: bool,
    latency: Option<Duration>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn check_reachable(&self) -> Result<(), ApiError> {
        if self.unreachable {
            return Err(ApiError::Unreachable("memory cluster offline".into()));
        }
        Ok(())
    }

    fn check_write(&self, kind: &str, name: &str) -> Result<(), ApiError> {
        match self.write_failures.get(&(kind.to_string(), name.to_string())) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn record(&mut self, op: ApiOp, res: &ApiResource, ns: &str, name: &str) {
        self.calls.push(ApiCall {
            op,
            kind: res.kind.clone(),
            namespace: ns.to_string(),
            name: name.to_string(),
        });
    }
}

fn key(res: &ApiResource, ns: &str, name: &str) -> Key {
    (
        res.api_version.clone(),
        res.kind.clone(),
        ns.to_string(),
        name.to_string(),
    )
}

fn without_status(data: &Value) -> Value {
    let mut v = data.clone();
    if let Some(map) = v.as_object_mut() {
        map.remove("status");
    }
    v
}

fn stale(incoming: &DynamicObject, stored: &DynamicObject) -> bool {
    match &incoming.metadata.resource_version {
        Some(rv) => stored.metadata.resource_version.as_deref() != Some(rv.as_str()),
        None => false,
    }
}

fn deleting_without_finalizers(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some() && obj.finalizers().is_empty()
}

#[derive(Default)]
pub struct MemoryClusterApi {
    inner: Mutex<Inner>,
}

impl MemoryClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }

    /// Seed an object without recording a call.
    pub fn insert(&self, res: &ApiResource, mut obj: DynamicObject) -> DynamicObject {
        let mut inner = self.lock();
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        obj.types.get_or_insert_with(|| TypeMeta {
            api_version: res.api_version.clone(),
            kind: res.kind.clone(),
        });
        let rv = inner.bump();
        obj.metadata.resource_version = Some(rv.clone());
        obj.metadata.uid.get_or_insert_with(|| format!("uid-{rv}"));
        obj.metadata.generation.get_or_insert(1);
        inner.objects.insert(key(res, &ns, &name), obj.clone());
        obj
    }

    /// Read an object without recording a call or honouring fault injection.
    pub fn object(&self, res: &ApiResource, ns: &str, name: &str) -> Option<DynamicObject> {
        self.lock().objects.get(&key(res, ns, name)).cloned()
    }

    /// Apply an out-of-band edit, as another actor on the cluster would.
    /// Returns false when the object does not exist.
    pub fn edit(
        &self,
        res: &ApiResource,
        ns: &str,
        name: &str,
        f: impl FnOnce(&mut DynamicObject),
    ) -> bool {
        let mut inner = self.lock();
        let rv = inner.bump();
        match inner.objects.get_mut(&key(res, ns, name)) {
            Some(obj) => {
                f(obj);
                obj.metadata.resource_version = Some(rv);
                true
            }
            None => false,
        }
    }

    /// Set the status block of an object, as the owning platform controller would.
    pub fn set_status(&self, res: &ApiResource, ns: &str, name: &str, status: Value) -> bool {
        self.edit(res, ns, name, |obj| {
            if obj.data.is_null() {
                obj.data = Value::Object(Default::default());
            }
            if let Some(map) = obj.data.as_object_mut() {
                map.insert("status".into(), status);
            }
        })
    }

    pub fn objects_of(&self, res: &ApiResource) -> Vec<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .filter(|((av, kind, _, _), _)| *av == res.api_version && *kind == res.kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.lock().calls.clone()
    }

    /// Create, replace and delete calls, in the order they happened.
    pub fn mutations(&self) -> Vec<ApiCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make every create, replace or delete of `kind`/`name` fail with `err`.
    pub fn fail_writes(&self, kind: &str, name: &str, err: ApiError) {
        self.lock()
            .write_failures
            .insert((kind.to_string(), name.to_string()), err);
    }

    pub fn clear_failures(&self) {
        self.lock().write_failures.clear();
    }

    /// The next `n` status writes lose a race against a concurrent writer.
    pub fn conflict_next_status_writes(&self, n: u32) {
        self.lock().status_conflicts = n;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    pub fn set_probe_failing(&self, failing: bool) {
        self.lock().probe_failing = failing;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }
}

#[async_trait]
impl ClusterApi for MemoryClusterApi {
    async fn get(
        &self,
        res: &ApiResource,
        ns: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ApiError> {
        self.delay().await;
        let inner = self.lock();
        inner.check_reachable()?;
        Ok(inner.objects.get(&key(res, ns, name)).cloned())
    }

    async fn list(
        &self,
        res: &ApiResource,
        ns: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ApiError> {
        self.delay().await;
        let inner = self.lock();
        inner.check_reachable()?;
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter_map(|kv| kv.split_once('='))
            .collect();
        Ok(inner
            .objects
            .iter()
            .filter(|((av, kind, o_ns, _), _)| {
                *av == res.api_version && *kind == res.kind && o_ns == ns
            })
            .filter(|(_, o)| {
                let labels = o.labels();
                wanted
                    .iter()
                    .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(
        &self,
        res: &ApiResource,
        ns: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.check_reachable()?;
        let name = obj.name_any();
        inner.record(ApiOp::Create, res, ns, &name);
        inner.check_write(&res.kind, &name)?;
        let k = key(res, ns, &name);
        if inner.objects.contains_key(&k) {
            return Err(ApiError::Conflict(format!("{} {name} already exists", res.kind)));
        }
        let mut stored = obj.clone();
        stored.types = Some(TypeMeta {
            api_version: res.api_version.clone(),
            kind: res.kind.clone(),
        });
        let rv = inner.bump();
        stored.metadata.namespace = Some(ns.to_string());
        stored.metadata.resource_version = Some(rv.clone());
        stored.metadata.uid = Some(format!("uid-{rv}"));
        stored.metadata.generation = Some(1);
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        inner.objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn replace(
        &self,
        res: &ApiResource,
        ns: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.check_reachable()?;
        let name = obj.name_any();
        inner.record(ApiOp::Replace, res, ns, &name);
        inner.check_write(&res.kind, &name)?;
        let k = key(res, ns, &name);
        let Some(current) = inner.objects.get(&k).cloned() else {
            return Err(ApiError::NotFound(format!("{} {name}", res.kind)));
        };
        if stale(obj, &current) {
            return Err(ApiError::Conflict(format!("{} {name} was modified", res.kind)));
        }
        let mut next = obj.clone();
        next.types = current.types.clone();
        next.metadata.namespace = current.metadata.namespace.clone();
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        let mut data = without_status(&obj.data);
        if let (Some(map), Some(status)) = (data.as_object_mut(), current.data.get("status")) {
            map.insert("status".into(), status.clone());
        }
        let spec_changed = without_status(&current.data) != without_status(&data);
        next.data = data;
        let generation = current.metadata.generation.unwrap_or(1);
        next.metadata.generation = Some(if spec_changed { generation + 1 } else { generation });
        next.metadata.resource_version = Some(inner.bump());
        if deleting_without_finalizers(&next) {
            inner.objects.remove(&k);
        } else {
            inner.objects.insert(k, next.clone());
        }
        Ok(next)
    }

    async fn replace_status(
        &self,
        res: &ApiResource,
        ns: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.check_reachable()?;
        let name = obj.name_any();
        inner.record(ApiOp::ReplaceStatus, res, ns, &name);
        let k = key(res, ns, &name);
        if !inner.objects.contains_key(&k) {
            return Err(ApiError::NotFound(format!("{} {name}", res.kind)));
        }
        if inner.status_conflicts > 0 {
            inner.status_conflicts -= 1;
            let rv = inner.bump();
            if let Some(current) = inner.objects.get_mut(&k) {
                current.metadata.resource_version = Some(rv);
            }
            return Err(ApiError::Conflict(format!("{} {name} status was modified", res.kind)));
        }
        let rv = inner.bump();
        let Some(current) = inner.objects.get_mut(&k) else {
            return Err(ApiError::NotFound(format!("{} {name}", res.kind)));
        };
        if stale(obj, current) {
            return Err(ApiError::Conflict(format!("{} {name} was modified", res.kind)));
        }
        if current.data.is_null() {
            current.data = Value::Object(Default::default());
        }
        if let Some(map) = current.data.as_object_mut() {
            match obj.data.get("status") {
                Some(status) => map.insert("status".into(), status.clone()),
                None => map.remove("status"),
            };
        }
        current.metadata.resource_version = Some(rv);
        Ok(current.clone())
    }

    async fn set_finalizers(
        &self,
        res: &ApiResource,
        ns: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<DynamicObject, ApiError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.check_reachable()?;
        inner.record(ApiOp::SetFinalizers, res, ns, name);
        let k = key(res, ns, name);
        let rv = inner.bump();
        let Some(current) = inner.objects.get_mut(&k) else {
            return Err(ApiError::NotFound(format!("{} {name}", res.kind)));
        };
        current.metadata.finalizers = Some(finalizers.to_vec());
        current.metadata.resource_version = Some(rv);
        let updated = current.clone();
        if deleting_without_finalizers(&updated) {
            inner.objects.remove(&k);
        }
        Ok(updated)
    }

    async fn delete(&self, res: &ApiResource, ns: &str, name: &str) -> Result<(), ApiError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.check_reachable()?;
        inner.record(ApiOp::Delete, res, ns, name);
        inner.check_write(&res.kind, name)?;
        let k = key(res, ns, name);
        let rv = inner.bump();
        let Some(current) = inner.objects.get_mut(&k) else {
            return Ok(());
        };
        if current.finalizers().is_empty() {
            inner.objects.remove(&k);
        } else if current.metadata.deletion_timestamp.is_none() {
            current.metadata.deletion_timestamp = Some(Time(Utc::now()));
            current.metadata.resource_version = Some(rv);
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), ApiError> {
        let inner = self.lock();
        inner.check_reachable()?;
        if inner.probe_failing {
            return Err(ApiError::Timeout("probe failed".into()));
        }
        Ok(())
    }
}

/// Connector handing out pre-built memory clusters by name.
#[derive(Default, Clone)]
pub struct MemoryConnector {
    clusters: Arc<Mutex<HashMap<String, Arc<MemoryClusterApi>>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the memory cluster for `name`.
    pub fn cluster(&self, name: &str) -> Arc<MemoryClusterApi> {
        self.clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryClusterApi::new()))
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        desc: &ClusterDescriptor,
    ) -> Result<Arc<dyn ClusterApi>, RegistryError> {
        Ok(self.cluster(&desc.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::api_resource;
    use serde_json::json;

    fn cm(name: &str) -> DynamicObject {
        let res = api_resource("v1", "ConfigMap");
        let mut obj = DynamicObject::new(name, &res).within("ns");
        obj.data = json!({"data": {"k": "v"}});
        obj
    }

    #[tokio::test]
    async fn replace_with_stale_version_conflicts() {
        let api = MemoryClusterApi::new();
        let res = api_resource("v1", "ConfigMap");
        let created = api.create(&res, "ns", &cm("a")).await.unwrap();
        api.edit(&res, "ns", "a", |_| {});
        let err = api.replace(&res, "ns", &created).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn replace_preserves_status_and_bumps_generation() {
        let api = MemoryClusterApi::new();
        let res = api_resource("v1", "ConfigMap");
        api.create(&res, "ns", &cm("a")).await.unwrap();
        api.set_status(&res, "ns", "a", json!({"ok": true}));
        let mut live = api.get(&res, "ns", "a").await.unwrap().unwrap();
        live.data = json!({"data": {"k": "changed"}});
        let out = api.replace(&res, "ns", &live).await.unwrap();
        assert_eq!(out.data["status"], json!({"ok": true}));
        assert_eq!(out.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn delete_waits_for_finalizers() {
        let api = MemoryClusterApi::new();
        let res = api_resource("v1", "ConfigMap");
        let mut obj = cm("a");
        obj.metadata.finalizers = Some(vec!["x/y".into()]);
        api.create(&res, "ns", &obj).await.unwrap();
        api.delete(&res, "ns", "a").await.unwrap();
        let live = api.object(&res, "ns", "a").unwrap();
        assert!(live.metadata.deletion_timestamp.is_some());
        api.set_finalizers(&res, "ns", "a", &[]).await.unwrap();
        assert!(api.object(&res, "ns", "a").is_none());
    }

    #[tokio::test]
    async fn list_filters_by_labels() {
        let api = MemoryClusterApi::new();
        let res = api_resource("v1", "ConfigMap");
        let mut a = cm("a");
        a.metadata.labels = Some([("team".to_string(), "x".to_string())].into());
        api.create(&res, "ns", &a).await.unwrap();
        api.create(&res, "ns", &cm("b")).await.unwrap();
        let out = api.list(&res, "ns", "team=x").await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name_any(), "a");
    }

    #[tokio::test]
    async fn unreachable_fails_every_call() {
        let api = MemoryClusterApi::new();
        let res = api_resource("v1", "ConfigMap");
        api.set_reachable(false);
        assert!(api.get(&res, "ns", "a").await.unwrap_err().is_unreachable());
        assert!(api.probe().await.is_err());
    }
}
