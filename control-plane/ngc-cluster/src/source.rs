use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, ResourceExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::api::{ClusterApi, api_resource};
use crate::config::{ClustersConfig, is_valid_cluster_name};
use crate::error::RegistryError;
use crate::kube_api::KubeClusterApi;

pub const CLUSTER_API_VERSION: &str = "ngf-console.f5.com/v1alpha1";
pub const CLUSTER_KIND: &str = "ManagedCluster";

/// How to reach a cluster's API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionRef {
    Kubeconfig { path: String, context: Option<String> },
    /// Kubeconfig stored in a Secret on the hub cluster.
    Secret { name: String },
    /// In-cluster or ambient kubeconfig.
    Local { context: Option<String> },
}

/// What a source of truth says about one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescriptor {
    pub name: String,
    pub display_name: String,
    pub region: Option<String>,
    pub environment: Option<String>,
    pub connection: ConnectionRef,
    pub is_default: bool,
}

impl ClusterDescriptor {
    pub fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: name.to_string(),
            region: None,
            environment: None,
            connection: ConnectionRef::Local { context: None },
            is_default: true,
        }
    }
}

/// Source of truth for registry membership.
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn descriptors(&self) -> Result<Vec<ClusterDescriptor>, RegistryError>;
}

/// Turns a descriptor into a live cluster client.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, desc: &ClusterDescriptor)
    -> Result<Arc<dyn ClusterApi>, RegistryError>;
}

/// Fixed membership, from the registry file or a single local cluster.
pub struct StaticSource {
    descriptors: Vec<ClusterDescriptor>,
}

impl StaticSource {
    pub fn from_config(cfg: &ClustersConfig) -> Self {
        Self {
            descriptors: cfg.clusters.iter().map(|e| e.descriptor()).collect(),
        }
    }

    pub fn new(descriptors: Vec<ClusterDescriptor>) -> Self {
        Self { descriptors }
    }
}

#[async_trait]
impl ClusterSource for StaticSource {
    async fn descriptors(&self) -> Result<Vec<ClusterDescriptor>, RegistryError> {
        Ok(self.descriptors.clone())
    }
}

#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase", default)]
struct ManagedClusterSpec {
    display_name: Option<String>,
    region: Option<String>,
    environment: Option<String>,
    kubeconfig_secret_ref: Option<SecretRef>,
    is_local: bool,
    default: bool,
}

#[derive(Deserialize, Default, Debug)]
struct SecretRef {
    name: String,
}

/// Membership read from `ManagedCluster` objects in one namespace of a hub cluster.
pub struct HubSource {
    hub: Arc<dyn ClusterApi>,
    namespace: String,
}

impl HubSource {
    pub fn new(hub: Arc<dyn ClusterApi>, namespace: impl Into<String>) -> Self {
        Self {
            hub,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl ClusterSource for HubSource {
    async fn descriptors(&self) -> Result<Vec<ClusterDescriptor>, RegistryError> {
        let res = api_resource(CLUSTER_API_VERSION, CLUSTER_KIND);
        let mut items = self.hub.list(&res, &self.namespace, "").await?;
        items.sort_by_key(|o| o.name_any());

        let mut out = Vec::with_capacity(items.len());
        let mut seen_default = false;
        for obj in items {
            let name = obj.name_any();
            if !is_valid_cluster_name(&name) {
                warn!(%name, "hub: skipping ManagedCluster with invalid name");
                continue;
            }
            let spec: ManagedClusterSpec = match obj.data.get("spec") {
                Some(v) => match serde_json::from_value(v.clone()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(%name, error = %e, "hub: skipping ManagedCluster with unreadable spec");
                        continue;
                    }
                },
                None => ManagedClusterSpec::default(),
            };
            let connection = match (&spec.kubeconfig_secret_ref, spec.is_local) {
                (Some(r), false) => ConnectionRef::Secret {
                    name: r.name.clone(),
                },
                (_, true) => ConnectionRef::Local { context: None },
                (None, false) => {
                    warn!(%name, "hub: skipping ManagedCluster without kubeconfigSecretRef");
                    continue;
                }
            };
            let is_default = spec.default && !seen_default;
            if spec.default && seen_default {
                warn!(%name, "hub: more than one default cluster; ignoring this flag");
            }
            seen_default |= is_default;
            out.push(ClusterDescriptor {
                display_name: spec.display_name.unwrap_or_else(|| name.clone()),
                name,
                region: spec.region,
                environment: spec.environment,
                connection,
                is_default,
            });
        }
        debug!(count = out.len(), ns = %self.namespace, "hub: listed managed clusters");
        Ok(out)
    }
}

/// Connects descriptors to real API servers.
pub struct KubeConnector {
    hub: Option<Client>,
    secret_namespace: String,
    api_timeout: Duration,
}

impl KubeConnector {
    pub fn new(hub: Option<Client>, secret_namespace: impl Into<String>, api_timeout: Duration) -> Self {
        Self {
            hub,
            secret_namespace: secret_namespace.into(),
            api_timeout,
        }
    }

    async fn kubeconfig_from_secret(&self, cluster: &str, secret: &str) -> Result<Kubeconfig, RegistryError> {
        let connect_err = |reason: String| RegistryError::Connect {
            name: cluster.to_string(),
            reason,
        };
        let hub = self
            .hub
            .clone()
            .ok_or_else(|| connect_err("no hub client to read kubeconfig secret".into()))?;
        let api: Api<Secret> = Api::namespaced(hub, &self.secret_namespace);
        let obj = api
            .get(secret)
            .await
            .map_err(|e| connect_err(format!("reading secret {secret}: {e}")))?;
        let data = obj.data.unwrap_or_default();
        let bytes = data
            .get("kubeconfig")
            .or_else(|| data.get("value"))
            .ok_or_else(|| connect_err(format!("secret {secret} has no kubeconfig or value key")))?;
        let raw = String::from_utf8(bytes.0.clone())
            .map_err(|e| connect_err(format!("secret {secret} is not utf-8: {e}")))?;
        Kubeconfig::from_yaml(&raw).map_err(|e| connect_err(e.to_string()))
    }
}

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(
        &self,
        desc: &ClusterDescriptor,
    ) -> Result<Arc<dyn ClusterApi>, RegistryError> {
        let connect_err = |reason: String| RegistryError::Connect {
            name: desc.name.clone(),
            reason,
        };
        let config = match &desc.connection {
            ConnectionRef::Kubeconfig { path, context } => {
                let kc = Kubeconfig::read_from(path).map_err(|e| connect_err(e.to_string()))?;
                let opts = KubeConfigOptions {
                    context: context.clone(),
                    ..Default::default()
                };
                Config::from_custom_kubeconfig(kc, &opts)
                    .await
                    .map_err(|e| connect_err(e.to_string()))?
            }
            ConnectionRef::Secret { name } => {
                let kc = self.kubeconfig_from_secret(&desc.name, name).await?;
                Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| connect_err(e.to_string()))?
            }
            ConnectionRef::Local { context: Some(ctx) } => {
                let opts = KubeConfigOptions {
                    context: Some(ctx.clone()),
                    ..Default::default()
                };
                Config::from_kubeconfig(&opts)
                    .await
                    .map_err(|e| connect_err(e.to_string()))?
            }
            ConnectionRef::Local { context: None } => Config::infer()
                .await
                .map_err(|e| connect_err(e.to_string()))?,
        };
        let client = Client::try_from(config).map_err(|e| connect_err(e.to_string()))?;
        Ok(Arc::new(KubeClusterApi::new(client, self.api_timeout)))
    }
}
