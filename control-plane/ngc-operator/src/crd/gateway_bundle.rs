use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::ReconcileStatus;

pub const GATEWAY_BUNDLE_FINALIZER: &str = "ngf-console.f5.com/gatewaybundle-finalizer";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "ngf-console.f5.com",
    version = "v1alpha1",
    kind = "GatewayBundle",
    plural = "gatewaybundles",
    namespaced,
    status = "GatewayBundleStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.gatewayClassName"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.gatewayAddress"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayBundleSpec {
    pub gateway_class_name: String,
    pub listeners: Vec<ListenerSpec>,
    /// Extra labels for the Gateway child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx_proxy: Option<NginxProxySpec>,
    /// Accepted for compatibility; WAF policies are attached by the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waf: Option<WafSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippets_filter: Option<SnippetsFilterSpec>,
    /// Accepted for compatibility; certificates are referenced per listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<GatewayTlsSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    pub name: String,
    pub port: i32,
    /// HTTP, HTTPS, TLS, TCP or UDP
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ListenerTlsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_routes: Option<AllowedRoutesSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerTlsSpec {
    /// Terminate or Passthrough
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default)]
    pub certificate_refs: Vec<CertRefSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct CertRefSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct AllowedRoutesSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<RouteNamespacesSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct RouteNamespacesSpec {
    /// Same, All or Selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NginxProxySpec {
    #[serde(default)]
    pub enabled: bool,
    /// dual, ipv4 or ipv6
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_family: Option<String>,
    #[serde(
        default,
        rename = "rewriteClientIP",
        skip_serializing_if = "Option::is_none"
    )]
    pub rewrite_client_ip: Option<RewriteClientIpSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<NginxTelemetrySpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct RewriteClientIpSpec {
    /// ProxyProtocol or XForwardedFor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, rename = "setIPRecursively")]
    pub set_ip_recursively: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct NginxTelemetrySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporter: Option<OtelExporterSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct OtelExporterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WafSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_ref: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnippetsFilterSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_snippet: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTlsSpec {
    #[serde(default)]
    pub secret_refs: Vec<CertRefSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayBundleStatus {
    #[serde(flatten)]
    pub reconcile: ReconcileStatus,
    /// First address reported by the Gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_address: Option<String>,
}
