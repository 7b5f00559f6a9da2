use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::source::{ClusterDescriptor, ConnectionRef};

/// One entry of the cluster registry file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEntry {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Path to a kubeconfig file. Omitted means the ambient config.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// Context within the kubeconfig; defaults to its current context.
    #[serde(default)]
    pub context: Option<String>,
    /// Name of a Secret on the hub cluster holding the kubeconfig.
    #[serde(default)]
    pub kubeconfig_secret: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub default: bool,
}

impl ClusterEntry {
    pub fn connection(&self) -> ConnectionRef {
        match (&self.kubeconfig, &self.kubeconfig_secret) {
            (Some(path), _) => ConnectionRef::Kubeconfig {
                path: path.clone(),
                context: self.context.clone(),
            },
            (None, Some(secret)) => ConnectionRef::Secret {
                name: secret.clone(),
            },
            (None, None) => ConnectionRef::Local {
                context: self.context.clone(),
            },
        }
    }

    pub fn descriptor(&self) -> ClusterDescriptor {
        ClusterDescriptor {
            name: self.name.clone(),
            display_name: self.display_name.clone().unwrap_or_else(|| self.name.clone()),
            region: self.region.clone(),
            environment: self.environment.clone(),
            connection: self.connection(),
            is_default: self.default,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClustersConfig {
    pub clusters: Vec<ClusterEntry>,
}

/// Lowercase alphanumerics and hyphens, 1 to 63 chars, alphanumeric at both ends.
pub fn is_valid_cluster_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| alnum(b) || b == b'-')
}

impl ClustersConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, RegistryError> {
        let cfg: ClustersConfig = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.clusters.is_empty() {
            return Err(RegistryError::InvalidConfig("no clusters defined".into()));
        }
        let mut names = HashSet::new();
        let mut defaults = 0;
        for (i, entry) in self.clusters.iter().enumerate() {
            if entry.name.is_empty() {
                return Err(RegistryError::InvalidConfig(format!(
                    "cluster at index {i} has empty name"
                )));
            }
            if !is_valid_cluster_name(&entry.name) {
                return Err(RegistryError::InvalidConfig(format!(
                    "cluster name {:?} is invalid: must be lowercase alphanumeric with hyphens, 1-63 chars",
                    entry.name
                )));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(RegistryError::InvalidConfig(format!(
                    "duplicate cluster name {:?}",
                    entry.name
                )));
            }
            if entry.kubeconfig.is_some() && entry.kubeconfig_secret.is_some() {
                return Err(RegistryError::InvalidConfig(format!(
                    "cluster {:?} sets both kubeconfig and kubeconfigSecret",
                    entry.name
                )));
            }
            if entry.default {
                defaults += 1;
            }
        }
        if defaults > 1 {
            return Err(RegistryError::InvalidConfig(
                "multiple clusters marked as default (max 1)".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_maps_connections() {
        let cfg = ClustersConfig::from_yaml(
            r#"
clusters:
  - name: east
    displayName: US East
    kubeconfig: /etc/ngc/east.yaml
    context: admin@east
    default: true
  - name: west
    kubeconfigSecret: west-kubeconfig
  - name: local
"#,
        )
        .unwrap();
        assert_eq!(cfg.clusters.len(), 3);
        assert_eq!(
            cfg.clusters[0].connection(),
            ConnectionRef::Kubeconfig {
                path: "/etc/ngc/east.yaml".into(),
                context: Some("admin@east".into())
            }
        );
        assert_eq!(
            cfg.clusters[1].connection(),
            ConnectionRef::Secret {
                name: "west-kubeconfig".into()
            }
        );
        assert_eq!(
            cfg.clusters[2].connection(),
            ConnectionRef::Local { context: None }
        );
        assert_eq!(cfg.clusters[0].descriptor().display_name, "US East");
        assert_eq!(cfg.clusters[2].descriptor().display_name, "local");
    }

    #[test]
    fn rejects_bad_names() {
        let too_long = "a".repeat(64);
        let longest = "a".repeat(63);
        for bad in ["", "Upper", "-lead", "trail-", "under_score", too_long.as_str()] {
            assert!(!is_valid_cluster_name(bad), "{bad:?} should be invalid");
        }
        for good in ["a", "a1", "prod-east-1", longest.as_str()] {
            assert!(is_valid_cluster_name(good), "{good:?} should be valid");
        }
    }

    #[test]
    fn rejects_duplicates_and_multiple_defaults() {
        let dup = "clusters:\n  - name: a\n  - name: a\n";
        assert!(matches!(
            ClustersConfig::from_yaml(dup),
            Err(RegistryError::InvalidConfig(m)) if m.contains("duplicate")
        ));
        let two_defaults =
            "clusters:\n  - name: a\n    default: true\n  - name: b\n    default: true\n";
        assert!(matches!(
            ClustersConfig::from_yaml(two_defaults),
            Err(RegistryError::InvalidConfig(m)) if m.contains("default")
        ));
        assert!(ClustersConfig::from_yaml("clusters: []\n").is_err());
    }
}
