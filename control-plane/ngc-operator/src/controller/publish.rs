//! Client for resources published outside the cluster (F5 Distributed Cloud).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info};

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("external publisher is not configured")]
    NotConfigured,
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },
}

impl PublishError {
    /// The remote side could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, PublishError::Request { source, .. } if source.is_connect() || source.is_timeout())
    }
}

/// Deletion side of external publishing. Deleting something already gone
/// succeeds.
#[async_trait]
pub trait ExternalPublisher: Send + Sync {
    async fn delete_http_load_balancer(
        &self,
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), PublishError>;

    async fn delete_origin_pool(&self, tenant: &str, namespace: &str, name: &str) -> Result<(), PublishError>;
}

/// Used when no API token is configured; every call fails.
pub struct Unconfigured;

#[async_trait]
impl ExternalPublisher for Unconfigured {
    async fn delete_http_load_balancer(&self, _: &str, _: &str, _: &str) -> Result<(), PublishError> {
        Err(PublishError::NotConfigured)
    }

    async fn delete_origin_pool(&self, _: &str, _: &str, _: &str) -> Result<(), PublishError> {
        Err(PublishError::NotConfigured)
    }
}

pub struct XcPublisher {
    http: reqwest::Client,
    token: String,
    base_url: Option<String>,
}

impl XcPublisher {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            token: token.into(),
            base_url: None,
        })
    }

    /// Send every request to `url` instead of the tenant console.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    fn url(&self, tenant: &str, path: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{}/api{path}", base.trim_end_matches('/')),
            None => format!("https://{tenant}.console.ves.volterra.io/api{path}"),
        }
    }

    async fn delete(&self, tenant: &str, path: String) -> Result<(), PublishError> {
        let url = self.url(tenant, &path);
        let resp = self
            .http
            .delete(&url)
            .header("Authorization", format!("APIToken {}", self.token))
            .send()
            .await
            .map_err(|source| PublishError::Request {
                url: url.clone(),
                source,
            })?;
        match resp.status() {
            StatusCode::NOT_FOUND => {
                debug!(%url, "already deleted");
                Ok(())
            }
            s if s.is_success() => {
                info!(%url, "deleted");
                Ok(())
            }
            s => Err(PublishError::Status {
                url,
                status: s.as_u16(),
            }),
        }
    }
}

#[async_trait]
impl ExternalPublisher for XcPublisher {
    async fn delete_http_load_balancer(
        &self,
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), PublishError> {
        self.delete(tenant, format!("/config/namespaces/{namespace}/http_loadbalancers/{name}"))
            .await
    }

    async fn delete_origin_pool(&self, tenant: &str, namespace: &str, name: &str) -> Result<(), PublishError> {
        self.delete(tenant, format!("/config/namespaces/{namespace}/origin_pools/{name}"))
            .await
    }
}
