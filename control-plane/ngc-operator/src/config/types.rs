use std::time::Duration;

use envconfig::Envconfig;
use ngc_cluster::HealthSettings;

use crate::controller::ReconcileSettings;
use crate::controller::queue::Backoff;
use crate::controller::retry::RetryConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    #[envconfig(from = "NGC_WORKERS", default = "4")]
    pub workers: usize,

    /// Requeue interval after a successful pass
    #[envconfig(from = "NGC_RESYNC_SECS", default = "60")]
    pub resync_secs: u64,

    /// Deadline for each cluster API call
    #[envconfig(from = "NGC_API_TIMEOUT_SECS", default = "10")]
    pub api_timeout_secs: u64,

    /// Inline attempts for transient child errors
    #[envconfig(from = "NGC_APPLY_RETRIES", default = "3")]
    pub apply_retries: u32,

    #[envconfig(from = "NGC_STATUS_RETRIES", default = "5")]
    pub status_retries: u32,

    #[envconfig(nested)]
    pub backoff: BackoffConfig,

    #[envconfig(nested)]
    pub registry: RegistryConfig,

    #[envconfig(nested)]
    pub health: HealthConfig,

    #[envconfig(nested)]
    pub lease: LeaseConfig,

    /// Credential for the distributed-cloud console; without it every
    /// external cleanup step fails and blocks deletion.
    #[envconfig(from = "XC_API_TOKEN")]
    pub xc_api_token: Option<String>,
}

#[derive(Envconfig, Clone, Debug)]
pub struct BackoffConfig {
    #[envconfig(from = "NGC_BACKOFF_BASE_MS", default = "500")]
    pub base_ms: u64,
    #[envconfig(from = "NGC_BACKOFF_MAX_SECS", default = "300")]
    pub max_secs: u64,
}

#[derive(Envconfig, Clone, Debug, Default)]
pub struct RegistryConfig {
    /// Path of the clusters YAML file; takes precedence over hub mode
    #[envconfig(from = "NGC_CLUSTERS_CONFIG")]
    pub clusters_config: Option<String>,

    /// Namespace holding ManagedCluster descriptors and their kubeconfig secrets
    #[envconfig(from = "NGC_HUB_NAMESPACE")]
    pub hub_namespace: Option<String>,

    #[envconfig(from = "NGC_REGISTRY_SYNC_SECS", default = "30")]
    pub sync_secs: u64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct HealthConfig {
    #[envconfig(from = "NGC_HEALTH_INTERVAL_SECS", default = "15")]
    pub interval_secs: u64,
    #[envconfig(from = "NGC_HEALTH_TIMEOUT_SECS", default = "5")]
    pub timeout_secs: u64,
    #[envconfig(from = "NGC_HEALTH_FAILURE_THRESHOLD", default = "3")]
    pub failure_threshold: u32,
}

#[derive(Envconfig, Clone, Debug)]
pub struct LeaseConfig {
    #[envconfig(from = "NGC_LEASE_NAME", default = "ngf-console-operator.f5.com")]
    pub name: String,
    #[envconfig(from = "NGC_LEASE_NAMESPACE", default = "default")]
    pub namespace: String,
    #[envconfig(from = "NGC_LEASE_TTL_SECS", default = "15")]
    pub ttl_secs: u64,
}

/// Where registry membership comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryMode {
    File(String),
    Hub(String),
    Local,
}

impl OperatorConfig {
    pub fn registry_mode(&self) -> RegistryMode {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
        if let Some(path) = non_empty(&self.registry.clusters_config) {
            RegistryMode::File(path)
        } else if let Some(ns) = non_empty(&self.registry.hub_namespace) {
            RegistryMode::Hub(ns)
        } else {
            RegistryMode::Local
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs.max(1))
    }

    pub fn registry_sync_interval(&self) -> Duration {
        Duration::from_secs(self.registry.sync_secs.max(1))
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            resync: Duration::from_secs(self.resync_secs.max(1)),
            apply_retry: RetryConfig::with_max_attempts(self.apply_retries.max(1)),
            status_attempts: self.status_retries.max(1),
        }
    }

    pub fn health_settings(&self) -> HealthSettings {
        HealthSettings {
            interval: Duration::from_secs(self.health.interval_secs.max(1)),
            probe_timeout: Duration::from_secs(self.health.timeout_secs.max(1)),
            failure_threshold: self.health.failure_threshold.max(1),
        }
    }

    pub fn backoff(&self) -> Backoff {
        let base = Duration::from_millis(self.backoff.base_ms.max(1));
        Backoff {
            base,
            max: Duration::from_secs(self.backoff.max_secs).max(base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> OperatorConfig {
        OperatorConfig {
            workers: 4,
            resync_secs: 60,
            api_timeout_secs: 10,
            apply_retries: 3,
            status_retries: 5,
            backoff: BackoffConfig {
                base_ms: 500,
                max_secs: 300,
            },
            registry: RegistryConfig {
                sync_secs: 30,
                ..Default::default()
            },
            health: HealthConfig {
                interval_secs: 15,
                timeout_secs: 5,
                failure_threshold: 3,
            },
            lease: LeaseConfig {
                name: "ngf-console-operator.f5.com".into(),
                namespace: "default".into(),
                ttl_secs: 15,
            },
            xc_api_token: None,
        }
    }

    #[test]
    fn registry_mode_prefers_file_then_hub() {
        let mut cfg = base();
        assert_eq!(cfg.registry_mode(), RegistryMode::Local);
        cfg.registry.hub_namespace = Some("ngf-console".into());
        assert_eq!(cfg.registry_mode(), RegistryMode::Hub("ngf-console".into()));
        cfg.registry.clusters_config = Some("/etc/ngc/clusters.yaml".into());
        assert_eq!(cfg.registry_mode(), RegistryMode::File("/etc/ngc/clusters.yaml".into()));
        cfg.registry.clusters_config = Some("  ".into());
        assert_eq!(cfg.registry_mode(), RegistryMode::Hub("ngf-console".into()));
    }

    #[test]
    fn derived_settings() {
        let cfg = base();
        let s = cfg.reconcile_settings();
        assert_eq!(s.resync, Duration::from_secs(60));
        assert_eq!(s.apply_retry.max_attempts, 3);
        assert_eq!(s.status_attempts, 5);
        assert_eq!(cfg.health_settings().failure_threshold, 3);
        assert_eq!(cfg.backoff().base, Duration::from_millis(500));
    }

    #[test]
    fn zero_values_are_clamped() {
        let mut cfg = base();
        cfg.apply_retries = 0;
        cfg.backoff.max_secs = 0;
        cfg.health.failure_threshold = 0;
        assert_eq!(cfg.reconcile_settings().apply_retry.max_attempts, 1);
        assert_eq!(cfg.backoff().max, cfg.backoff().base);
        assert_eq!(cfg.health_settings().failure_threshold, 1);
    }
}
