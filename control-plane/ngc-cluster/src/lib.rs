//! Managed cluster registry: membership, client lookup and reachability.

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod kube_api;
pub mod memory;
pub mod registry;
pub mod source;

pub use api::{ClusterApi, api_resource};
pub use error::{ApiError, RegistryError};
pub use health::{HealthChecker, HealthSettings};
pub use registry::{ClusterRegistry, HealthState, ManagedCluster, Reachability};
pub use source::{ClusterDescriptor, ClusterSource, ConnectionRef, Connector};
