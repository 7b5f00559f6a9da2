#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use ngc_cluster::memory::{MemoryClusterApi, MemoryConnector};
use ngc_cluster::source::StaticSource;
use ngc_cluster::{ClusterDescriptor, ClusterRegistry};
use ngc_operator::controller::publish::{ExternalPublisher, PublishError};
use ngc_operator::controller::reconcile::{Dispatcher, Requeue};
use ngc_operator::controller::retry::RetryConfig;
use ngc_operator::controller::{ControllerContext, DeclaredKind, ReconcileErr, ReconcileSettings, WorkKey};
use ngc_operator::crd::common::ReconcileStatus;
use ngc_operator::metrics::Metrics;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub const NS: &str = "ml";

/// Records external deletions; can be told to fail them.
#[derive(Default)]
pub struct RecordingPublisher {
    pub calls: Mutex<Vec<String>>,
    pub failing: Mutex<bool>,
}

impl RecordingPublisher {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    fn record(&self, call: String) -> Result<(), PublishError> {
        if *self.failing.lock().unwrap() {
            return Err(PublishError::Status {
                url: call,
                status: 503,
            });
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl ExternalPublisher for RecordingPublisher {
    async fn delete_http_load_balancer(&self, tenant: &str, namespace: &str, name: &str) -> Result<(), PublishError> {
        self.record(format!("lb:{tenant}/{namespace}/{name}"))
    }

    async fn delete_origin_pool(&self, tenant: &str, namespace: &str, name: &str) -> Result<(), PublishError> {
        self.record(format!("pool:{tenant}/{namespace}/{name}"))
    }
}

pub struct Harness {
    pub registry: Arc<ClusterRegistry>,
    pub connector: MemoryConnector,
    pub publisher: Arc<RecordingPublisher>,
    pub metrics: Arc<Metrics>,
    pub ctx: Arc<ControllerContext>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Registry over memory clusters; the first name is the default cluster.
pub async fn harness(clusters: &[&str]) -> Harness {
    let connector = MemoryConnector::new();
    let descriptors = clusters
        .iter()
        .enumerate()
        .map(|(i, name)| ClusterDescriptor {
            is_default: i == 0,
            ..ClusterDescriptor::local(name)
        })
        .collect();
    let registry = Arc::new(ClusterRegistry::new(
        Arc::new(StaticSource::new(descriptors)),
        Arc::new(connector.clone()),
    ));
    registry.sync().await.unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let metrics = Arc::new(Metrics::new().unwrap());
    let ctx = Arc::new(ControllerContext {
        registry: registry.clone(),
        publisher: publisher.clone(),
        metrics: metrics.clone(),
        settings: ReconcileSettings {
            resync: Duration::from_secs(60),
            apply_retry: RetryConfig::no_delay(3),
            status_attempts: 5,
        },
        token: CancellationToken::new(),
    });
    let dispatcher = Arc::new(Dispatcher::standard(ctx.clone()));
    Harness {
        registry,
        connector,
        publisher,
        metrics,
        ctx,
        dispatcher,
    }
}

impl Harness {
    pub fn cluster(&self, name: &str) -> Arc<MemoryClusterApi> {
        self.connector.cluster(name)
    }

    pub async fn reconcile(&self, key: &WorkKey) -> Result<Requeue, ReconcileErr> {
        self.dispatcher.dispatch(key).await
    }
}

pub fn declared(kind: DeclaredKind, name: &str, spec: Value) -> DynamicObject {
    DynamicObject::new(name, &kind.resource())
        .within(NS)
        .data(json!({ "spec": spec }))
}

/// Seed a declared object and return its work key.
pub fn seed(api: &MemoryClusterApi, cluster: &str, kind: DeclaredKind, name: &str, spec: Value) -> WorkKey {
    api.insert(&kind.resource(), declared(kind, name, spec));
    WorkKey::new(cluster, kind, NS, name)
}

pub fn stored(api: &MemoryClusterApi, key: &WorkKey) -> Option<DynamicObject> {
    api.object(&key.kind.resource(), &key.namespace, &key.name)
}

pub fn status_of(api: &MemoryClusterApi, key: &WorkKey) -> ReconcileStatus {
    let obj = stored(api, key).expect("declared object exists");
    serde_json::from_value(obj.data.get("status").cloned().unwrap_or(Value::Null)).unwrap_or_default()
}

pub fn child(api: &MemoryClusterApi, api_version: &str, kind: &str, name: &str) -> Option<DynamicObject> {
    api.object(&ngc_cluster::api_resource(api_version, kind), NS, name)
}

pub fn res(api_version: &str, kind: &str) -> ApiResource {
    ngc_cluster::api_resource(api_version, kind)
}

pub fn stack_spec(replicas: i32) -> Value {
    json!({
        "modelName": "meta-llama/Llama-3-8B-Instruct",
        "servingBackend": "vllm",
        "pool": {"gpuType": "H100", "gpuCount": 1, "replicas": replicas},
    })
}

/// Pool, route and DCGM exporter.
pub fn three_child_stack_spec() -> Value {
    json!({
        "modelName": "meta-llama/Llama-3-8B-Instruct",
        "servingBackend": "vllm",
        "pool": {"gpuType": "H100", "gpuCount": 1, "replicas": 2},
        "httpRoute": {"hostnames": ["llama.example.com"], "gatewayRef": "edge"},
        "dcgm": {"enabled": true},
    })
}
