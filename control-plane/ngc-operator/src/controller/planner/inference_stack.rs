use serde_json::json;

use super::{ChildDescriptor, OwnerInfo, PlanError, is_dns_subdomain};
use crate::crd::inference_stack::{AutoscalingSpec, DcgmSpec, EppSpec, HttpRouteSpec, InferenceStackSpec};

pub const STACK_LABEL: &str = "ngf-console.f5.com/stack";
pub const REPLICAS_ANNOTATION: &str = "ngf-console.f5.com/replicas";
pub const GPU_TYPE_ANNOTATION: &str = "ngf-console.f5.com/gpu-type";
pub const GPU_COUNT_ANNOTATION: &str = "ngf-console.f5.com/gpu-count";

pub const POOL_API_VERSION: &str = "inference.networking.k8s.io/v1";
pub const ROUTE_API_VERSION: &str = "gateway.networking.k8s.io/v1";
pub const KEDA_API_VERSION: &str = "keda.sh/v1alpha1";

const DEFAULT_DCGM_IMAGE: &str = "nvcr.io/nvidia/k8s/dcgm-exporter:3.3.5-3.4.1-ubuntu22.04";
const DEFAULT_EPP_STRATEGY: &str = "least_queue";
const PROMETHEUS_ADDRESS: &str = "http://prometheus.monitoring:9090";
const EPP_PORT: i64 = 9002;
const DEFAULT_COOLDOWN_SECS: i64 = 300;
const POLLING_INTERVAL_SECS: i64 = 15;

pub const SERVING_BACKENDS: [&str; 4] = ["vllm", "triton", "tgi", "ollama"];

pub fn pool_name(stack: &str) -> String {
    format!("{stack}-pool")
}

pub fn route_name(stack: &str) -> String {
    format!("{stack}-route")
}

fn serving_port(backend: &str) -> i64 {
    match backend {
        "triton" => 8001,
        "tgi" => 80,
        "ollama" => 11434,
        _ => 8000,
    }
}

fn is_metric_name(m: &str) -> bool {
    let mut chars = m.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

pub fn validate(spec: &InferenceStackSpec) -> Result<(), PlanError> {
    if spec.model_name.trim().is_empty() {
        return Err(PlanError::new("modelName", "must not be empty"));
    }
    if !SERVING_BACKENDS.contains(&spec.serving_backend.as_str()) {
        return Err(PlanError::new(
            "servingBackend",
            format!(
                "{:?} is not one of {}",
                spec.serving_backend,
                SERVING_BACKENDS.join(", ")
            ),
        ));
    }
    let pool = &spec.pool;
    for (field, v) in [
        ("pool.replicas", pool.replicas),
        ("pool.gpuCount", pool.gpu_count),
        ("pool.minReplicas", pool.min_replicas),
        ("pool.maxReplicas", pool.max_replicas),
    ] {
        if v < 0 {
            return Err(PlanError::new(field, "must not be negative"));
        }
    }
    if let Some(a) = &spec.autoscaling {
        match a.backend.as_deref() {
            None | Some("") | Some("keda") => {}
            Some(other) => {
                return Err(PlanError::new(
                    "autoscaling.backend",
                    format!("{other:?} is not supported (keda)"),
                ));
            }
        }
        if pool.max_replicas == 0 || pool.min_replicas > pool.max_replicas {
            return Err(PlanError::new(
                "pool.maxReplicas",
                "must be positive and at least minReplicas when autoscaling",
            ));
        }
        for t in &a.thresholds {
            if !is_metric_name(&t.metric) {
                return Err(PlanError::new(
                    "autoscaling.thresholds.metric",
                    format!("{:?} is not a metric name", t.metric),
                ));
            }
        }
        if matches!(a.cooldown_seconds, Some(c) if c < 0) {
            return Err(PlanError::new("autoscaling.cooldownSeconds", "must not be negative"));
        }
    }
    if let Some(r) = &spec.http_route {
        if !is_dns_subdomain(&r.gateway_ref) {
            return Err(PlanError::new("httpRoute.gatewayRef", "must be a valid object name"));
        }
    }
    if let Some(d) = &spec.dcgm {
        if matches!(&d.image, Some(img) if img.is_empty() || img.chars().any(char::is_whitespace)) {
            return Err(PlanError::new("dcgm.image", "must be a non-empty image reference"));
        }
    }
    if let Some(xc) = &spec.distributed_cloud {
        for (field, v) in [
            ("distributedCloud.tenant", &xc.tenant),
            ("distributedCloud.namespace", &xc.namespace),
            ("distributedCloud.publicHostname", &xc.public_hostname),
        ] {
            if v.trim().is_empty() {
                return Err(PlanError::new(field, "must not be empty"));
            }
        }
    }
    Ok(())
}

/// Plan children for an inference stack: the pool first, then what
/// references it, then telemetry and the autoscaler.
pub fn plan(owner: &OwnerInfo, spec: &InferenceStackSpec) -> Result<Vec<ChildDescriptor>, PlanError> {
    validate(spec)?;
    let mut out = vec![inference_pool(owner, spec)];
    if let Some(epp) = &spec.epp {
        out.push(epp_config(owner, spec, epp));
    }
    if let Some(route) = &spec.http_route {
        out.push(http_route(owner, route));
    }
    if let Some(dcgm) = spec.dcgm.as_ref().filter(|d| d.enabled) {
        out.push(dcgm_exporter(owner, dcgm));
    }
    if let Some(a) = &spec.autoscaling {
        out.push(scaled_object(owner, spec, a));
    }
    Ok(out)
}

fn inference_pool(owner: &OwnerInfo, spec: &InferenceStackSpec) -> ChildDescriptor {
    let selector = spec
        .pool
        .selector
        .clone()
        .unwrap_or_else(|| [("app".to_string(), owner.name.clone())].into());
    let mut desc = ChildDescriptor::new(owner, POOL_API_VERSION, "InferencePool", pool_name(&owner.name))
        .annotation(REPLICAS_ANNOTATION, spec.pool.replicas.to_string())
        .annotation(GPU_COUNT_ANNOTATION, spec.pool.gpu_count.to_string())
        .field(
            "spec",
            json!({
                "targetPorts": [{"number": serving_port(&spec.serving_backend)}],
                "selector": {"matchLabels": selector},
                "endpointPickerRef": {
                    "group": "",
                    "kind": "Service",
                    "name": format!("{}-epp", owner.name),
                    "failureMode": "FailClose",
                    "port": {"number": EPP_PORT},
                },
            }),
        );
    if !spec.pool.gpu_type.is_empty() {
        desc = desc.annotation(GPU_TYPE_ANNOTATION, spec.pool.gpu_type.clone());
    }
    desc
}

fn epp_config(owner: &OwnerInfo, spec: &InferenceStackSpec, epp: &EppSpec) -> ChildDescriptor {
    let mut cfg = json!({
        "strategy": epp.strategy.as_deref().filter(|s| !s.is_empty()).unwrap_or(DEFAULT_EPP_STRATEGY),
        "poolName": pool_name(&owner.name),
        "modelName": spec.model_name,
    });
    if let Some(w) = &epp.weights {
        cfg["weights"] = json!({
            "queueDepth": w.queue_depth,
            "kvCache": w.kv_cache,
            "prefixAffinity": w.prefix_affinity,
        });
    }
    let rendered = crate::controller::drift::canonical_json(&cfg);
    ChildDescriptor::new(owner, "v1", "ConfigMap", format!("{}-epp-config", owner.name))
        .depends_on(&pool_name(&owner.name))
        .field("data", json!({"epp-config.json": rendered}))
}

fn http_route(owner: &OwnerInfo, route: &HttpRouteSpec) -> ChildDescriptor {
    let mut parent = json!({
        "group": "gateway.networking.k8s.io",
        "kind": "Gateway",
        "name": route.gateway_ref,
    });
    if let Some(ns) = route.gateway_namespace.as_deref().filter(|ns| *ns != owner.namespace) {
        parent["namespace"] = json!(ns);
    }
    let mut spec = json!({
        "parentRefs": [parent],
        "rules": [{
            "backendRefs": [{
                "group": "inference.networking.k8s.io",
                "kind": "InferencePool",
                "name": pool_name(&owner.name),
            }],
        }],
    });
    if !route.hostnames.is_empty() {
        spec["hostnames"] = json!(route.hostnames);
    }
    ChildDescriptor::new(owner, ROUTE_API_VERSION, "HTTPRoute", route_name(&owner.name))
        .depends_on(&pool_name(&owner.name))
        .field("spec", spec)
}

fn dcgm_exporter(owner: &OwnerInfo, dcgm: &DcgmSpec) -> ChildDescriptor {
    let name = format!("{}-dcgm", owner.name);
    let mut pod_labels = owner.labels();
    pod_labels.insert("app".into(), name.clone());
    ChildDescriptor::new(owner, "apps/v1", "DaemonSet", name.clone())
        .label("app", &name)
        .field(
            "spec",
            json!({
                "selector": {"matchLabels": {"app": name}},
                "template": {
                    "metadata": {"labels": pod_labels},
                    "spec": {
                        "containers": [{
                            "name": "dcgm-exporter",
                            "image": dcgm.image.as_deref().unwrap_or(DEFAULT_DCGM_IMAGE),
                            "ports": [{"name": "metrics", "containerPort": 9400, "protocol": "TCP"}],
                            "resources": {
                                "requests": {"cpu": "100m", "memory": "128Mi"},
                                "limits": {"cpu": "200m", "memory": "256Mi"},
                            },
                            "securityContext": {
                                "runAsNonRoot": true,
                                "capabilities": {"add": ["SYS_ADMIN"]},
                            },
                        }],
                    },
                },
            }),
        )
}

fn scaled_object(owner: &OwnerInfo, spec: &InferenceStackSpec, a: &AutoscalingSpec) -> ChildDescriptor {
    let pool = pool_name(&owner.name);
    let triggers: Vec<_> = a
        .thresholds
        .iter()
        .map(|t| {
            json!({
                "type": "prometheus",
                "metadata": {
                    "serverAddress": PROMETHEUS_ADDRESS,
                    "metricName": t.metric,
                    "threshold": t.target.to_string(),
                    "query": format!("avg({}{{pool=\"{}\"}})", t.metric, pool),
                },
            })
        })
        .collect();
    let cooldown = a
        .cooldown_seconds
        .filter(|c| *c > 0)
        .map(i64::from)
        .unwrap_or(DEFAULT_COOLDOWN_SECS);
    ChildDescriptor::new(owner, KEDA_API_VERSION, "ScaledObject", format!("{}-scaler", owner.name))
        .depends_on(&pool)
        .field(
            "spec",
            json!({
                "scaleTargetRef": {
                    "apiVersion": POOL_API_VERSION,
                    "kind": "InferencePool",
                    "name": pool,
                },
                "minReplicaCount": spec.pool.min_replicas,
                "maxReplicaCount": spec.pool.max_replicas,
                "cooldownPeriod": cooldown,
                "pollingInterval": POLLING_INTERVAL_SECS,
                "triggers": triggers,
            }),
        )
}
