use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};
use tracing::{info, warn};

use crate::api::ClusterApi;
use crate::error::RegistryError;
use crate::source::{ClusterDescriptor, ClusterSource, ConnectionRef, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
}

impl Reachability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reachability::Unknown => "Unknown",
            Reachability::Reachable => "Reachable",
            Reachability::Unreachable => "Unreachable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthState {
    pub reachability: Reachability,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            reachability: Reachability::Unknown,
            last_checked_at: None,
            consecutive_failures: 0,
        }
    }
}

/// One registered cluster. Only the health checker mutates its health.
pub struct ManagedCluster {
    pub name: String,
    pub display_name: String,
    pub region: Option<String>,
    pub environment: Option<String>,
    pub connection: ConnectionRef,
    pub is_default: bool,
    api: Arc<dyn ClusterApi>,
    health: StdRwLock<HealthState>,
}

impl ManagedCluster {
    fn new(desc: &ClusterDescriptor, api: Arc<dyn ClusterApi>, health: HealthState) -> Self {
        Self {
            name: desc.name.clone(),
            display_name: desc.display_name.clone(),
            region: desc.region.clone(),
            environment: desc.environment.clone(),
            connection: desc.connection.clone(),
            is_default: desc.is_default,
            api,
            health: StdRwLock::new(health),
        }
    }

    pub fn api(&self) -> Arc<dyn ClusterApi> {
        self.api.clone()
    }

    pub fn health(&self) -> HealthState {
        *self.health.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reachability(&self) -> Reachability {
        self.health().reachability
    }

    /// Record a successful probe. Returns the previous reachability.
    pub fn record_success(&self, at: DateTime<Utc>) -> Reachability {
        let mut h = self.health.write().unwrap_or_else(PoisonError::into_inner);
        let prev = h.reachability;
        h.reachability = Reachability::Reachable;
        h.consecutive_failures = 0;
        h.last_checked_at = Some(at);
        prev
    }

    /// Record a failed probe; the cluster turns unreachable once `threshold`
    /// failures in a row accumulate. Returns the previous reachability.
    pub fn record_failure(&self, at: DateTime<Utc>, threshold: u32) -> Reachability {
        let mut h = self.health.write().unwrap_or_else(PoisonError::into_inner);
        let prev = h.reachability;
        h.consecutive_failures = h.consecutive_failures.saturating_add(1);
        h.last_checked_at = Some(at);
        if h.consecutive_failures >= threshold.max(1) {
            h.reachability = Reachability::Unreachable;
        }
        prev
    }
}

impl std::fmt::Debug for ManagedCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedCluster")
            .field("name", &self.name)
            .field("is_default", &self.is_default)
            .field("health", &self.health())
            .finish()
    }
}

/// The set of managed clusters, kept in source order.
pub struct ClusterRegistry {
    source: Arc<dyn ClusterSource>,
    connector: Arc<dyn Connector>,
    clusters: RwLock<Vec<Arc<ManagedCluster>>>,
    generation: watch::Sender<u64>,
}

impl ClusterRegistry {
    pub fn new(source: Arc<dyn ClusterSource>, connector: Arc<dyn Connector>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            source,
            connector,
            clusters: RwLock::new(Vec::new()),
            generation,
        }
    }

    /// Notified each time membership or connection parameters change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Rebuild membership from the source of truth.
    ///
    /// Clusters that persist keep their client and health state, new ones
    /// start as `Unknown`, vanished ones are dropped along with their client.
    /// A cluster that cannot be connected is left out (or keeps its previous
    /// entry) and retried on the next sync.
    pub async fn sync(&self) -> Result<(), RegistryError> {
        let descriptors = self.source.descriptors().await?;
        let current: HashMap<String, Arc<ManagedCluster>> = self
            .clusters
            .read()
            .await
            .iter()
            .map(|c| (c.name.clone(), c.clone()))
            .collect();

        let mut next = Vec::with_capacity(descriptors.len());
        let mut changed = false;
        for desc in &descriptors {
            match current.get(&desc.name) {
                Some(existing) if existing.connection == desc.connection => {
                    let same_meta = existing.display_name == desc.display_name
                        && existing.is_default == desc.is_default
                        && existing.region == desc.region
                        && existing.environment == desc.environment;
                    if same_meta {
                        next.push(existing.clone());
                    } else {
                        changed = true;
                        next.push(Arc::new(ManagedCluster::new(
                            desc,
                            existing.api(),
                            existing.health(),
                        )));
                    }
                }
                Some(existing) => match self.connector.connect(desc).await {
                    Ok(api) => {
                        info!(cluster = %desc.name, "registry: connection changed; reconnected");
                        changed = true;
                        next.push(Arc::new(ManagedCluster::new(desc, api, existing.health())));
                    }
                    Err(e) => {
                        warn!(cluster = %desc.name, error = %e, "registry: reconnect failed; keeping previous client");
                        next.push(existing.clone());
                    }
                },
                None => match self.connector.connect(desc).await {
                    Ok(api) => {
                        info!(cluster = %desc.name, "registry: cluster added");
                        changed = true;
                        next.push(Arc::new(ManagedCluster::new(desc, api, HealthState::default())));
                    }
                    Err(e) => {
                        warn!(cluster = %desc.name, error = %e, "registry: connect failed; will retry on next sync");
                    }
                },
            }
        }
        for name in current.keys() {
            if !descriptors.iter().any(|d| &d.name == name) {
                info!(cluster = %name, "registry: cluster removed");
                changed = true;
            }
        }

        *self.clusters.write().await = next;
        if changed {
            self.generation.send_modify(|g| *g += 1);
        }
        Ok(())
    }

    /// Look up a cluster by name; the empty name resolves to the default,
    /// which is the flagged entry or else the first registered one.
    pub async fn resolve(&self, name: &str) -> Result<Arc<ManagedCluster>, RegistryError> {
        let clusters = self.clusters.read().await;
        if name.is_empty() {
            return clusters
                .iter()
                .find(|c| c.is_default)
                .or_else(|| clusters.first())
                .cloned()
                .ok_or(RegistryError::NoClusters);
        }
        clusters
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCluster(name.to_string()))
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .clusters
            .read()
            .await
            .iter()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn list(&self) -> Vec<Arc<ManagedCluster>> {
        self.clusters.read().await.clone()
    }

    /// Clusters eligible for fan-out: everything not known to be unreachable.
    pub async fn reachable(&self) -> Vec<Arc<ManagedCluster>> {
        self.clusters
            .read()
            .await
            .iter()
            .filter(|c| c.reachability() != Reachability::Unreachable)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.clusters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clusters.read().await.is_empty()
    }
}
