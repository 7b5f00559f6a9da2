//! Child planning: declared spec in, ordered child descriptors out.
//!
//! Planning is pure. The same spec always produces byte-identical
//! descriptors, so hashes over them are meaningful across restarts.
//! A disabled or absent sub-spec yields no descriptor at all.

pub mod gateway_bundle;
pub mod inference_stack;

#[cfg(test)]
mod planner_tests;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::{DynamicObject, TypeMeta};
use kube::discovery::ApiResource;
use ngc_cluster::api_resource;
use ngc_cluster::config::is_valid_cluster_name;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::crd::common::{ChildRef, MANAGED_BY, MANAGED_BY_LABEL};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct PlanError {
    pub field: String,
    pub reason: String,
}

impl PlanError {
    pub fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Identity of the declared object children are planned for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerInfo {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    /// Label key carrying the owner's name on every child
    pub owner_label: &'static str,
}

impl OwnerInfo {
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
            (self.owner_label.to_string(), self.name.clone()),
        ])
    }

    /// Selector matching every child of this owner.
    pub fn selector(&self) -> String {
        format!("{}={},{}={}", MANAGED_BY_LABEL, MANAGED_BY, self.owner_label, self.name)
    }

    fn owner_reference(&self) -> Option<OwnerReference> {
        self.uid.as_ref().map(|uid| OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

/// One desired child resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildDescriptor {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Names of children in the same plan this one references
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Top-level fields besides metadata, e.g. `spec` or `data`
    pub body: Map<String, Value>,
}

impl ChildDescriptor {
    pub fn new(owner: &OwnerInfo, api_version: &str, kind: &str, name: String) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name,
            depends_on: Vec::new(),
            labels: owner.labels(),
            annotations: BTreeMap::new(),
            body: Map::new(),
        }
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.depends_on.push(name.to_string());
        self
    }

    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn annotation(mut self, key: &str, value: String) -> Self {
        self.annotations.insert(key.to_string(), value);
        self
    }

    pub fn resource(&self) -> ApiResource {
        api_resource(&self.api_version, &self.kind)
    }

    pub fn child_ref(&self) -> ChildRef {
        ChildRef {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
        }
    }

    /// Full object to create, owned by `owner`.
    pub fn to_object(&self, owner: &OwnerInfo) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: self.api_version.clone(),
                kind: self.kind.clone(),
            }),
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(owner.namespace.clone()),
                labels: Some(self.labels.clone()),
                annotations: (!self.annotations.is_empty()).then(|| self.annotations.clone()),
                owner_references: owner.owner_reference().map(|r| vec![r]),
                ..Default::default()
            },
            data: Value::Object(self.body.clone()),
        }
    }
}

/// True for names accepted as Kubernetes object names (DNS-1123 subdomain).
pub(crate) fn is_dns_subdomain(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(is_valid_cluster_name)
}
