use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::ReconcileStatus;

pub const INFERENCE_STACK_FINALIZER: &str = "ngf-console.f5.com/inferencestack-finalizer";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "ngf-console.f5.com",
    version = "v1alpha1",
    kind = "InferenceStack",
    plural = "inferencestacks",
    namespaced,
    status = "ReconcileStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.modelName"}"#,
    printcolumn = r#"{"name":"Backend","type":"string","jsonPath":".spec.servingBackend"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InferenceStackSpec {
    /// Model identifier, e.g. "meta-llama/Llama-3-70B-Instruct"
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    /// vllm, triton, tgi or ollama
    pub serving_backend: String,
    pub pool: PoolSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epp: Option<EppSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<AutoscalingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_route: Option<HttpRouteSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dcgm: Option<DcgmSpec>,
    /// External publishing through F5 Distributed Cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributed_cloud: Option<DistributedCloudSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    #[serde(default)]
    pub gpu_type: String,
    #[serde(default)]
    pub gpu_count: i32,
    pub replicas: i32,
    #[serde(default)]
    pub min_replicas: i32,
    #[serde(default)]
    pub max_replicas: i32,
    /// Pod selector; defaults to `app: <stack name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EppSpec {
    /// least_queue, kv_cache, prefix_affinity or composite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<EppWeights>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EppWeights {
    #[serde(default)]
    pub queue_depth: i32,
    #[serde(default)]
    pub kv_cache: i32,
    #[serde(default)]
    pub prefix_affinity: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingSpec {
    /// Only "keda" is supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct ThresholdSpec {
    pub metric: String,
    pub target: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteSpec {
    #[serde(default)]
    pub hostnames: Vec<String>,
    pub gateway_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct DcgmSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DistributedCloudSpec {
    pub tenant: String,
    pub namespace: String,
    pub public_hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waf_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_pool: Option<OriginPoolSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct OriginPoolSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
