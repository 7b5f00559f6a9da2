use std::collections::HashSet;

use serde_json::{Value, json};

use super::{ChildDescriptor, OwnerInfo, PlanError};
use crate::crd::gateway_bundle::{GatewayBundleSpec, ListenerSpec, NginxProxySpec, SnippetsFilterSpec};

pub const BUNDLE_LABEL: &str = "ngf-console.f5.com/bundle";
pub const GATEWAY_API_VERSION: &str = "gateway.networking.k8s.io/v1";
pub const NGINX_PROXY_API_VERSION: &str = "gateway.nginx.org/v1alpha2";
pub const SNIPPETS_FILTER_API_VERSION: &str = "gateway.nginx.org/v1alpha1";

const PROTOCOLS: [&str; 5] = ["HTTP", "HTTPS", "TLS", "TCP", "UDP"];

pub fn validate(spec: &GatewayBundleSpec) -> Result<(), PlanError> {
    if spec.gateway_class_name.trim().is_empty() {
        return Err(PlanError::new("gatewayClassName", "must not be empty"));
    }
    if spec.listeners.is_empty() {
        return Err(PlanError::new("listeners", "at least one listener is required"));
    }
    let mut names = HashSet::new();
    for l in &spec.listeners {
        if l.name.is_empty() {
            return Err(PlanError::new("listeners.name", "must not be empty"));
        }
        if !names.insert(l.name.as_str()) {
            return Err(PlanError::new("listeners.name", format!("duplicate listener {:?}", l.name)));
        }
        if !(1..=65535).contains(&l.port) {
            return Err(PlanError::new(
                "listeners.port",
                format!("{} is out of range for listener {:?}", l.port, l.name),
            ));
        }
        if !PROTOCOLS.contains(&l.protocol.as_str()) {
            return Err(PlanError::new(
                "listeners.protocol",
                format!("{:?} is not one of {}", l.protocol, PROTOCOLS.join(", ")),
            ));
        }
        if let Some(mode) = l.tls.as_ref().and_then(|t| t.mode.as_deref()) {
            if mode != "Terminate" && mode != "Passthrough" {
                return Err(PlanError::new("listeners.tls.mode", format!("{mode:?} is not Terminate or Passthrough")));
            }
        }
    }
    Ok(())
}

/// Plan children for a gateway bundle: the proxy parameters the Gateway
/// points at, the Gateway, then filters attached to it.
pub fn plan(owner: &OwnerInfo, spec: &GatewayBundleSpec) -> Result<Vec<ChildDescriptor>, PlanError> {
    validate(spec)?;
    let mut out = Vec::new();
    let proxy = spec.nginx_proxy.as_ref().filter(|p| p.enabled);
    if let Some(p) = proxy {
        out.push(nginx_proxy(owner, p));
    }
    out.push(gateway(owner, spec, proxy.is_some()));
    if let Some(sf) = spec.snippets_filter.as_ref().filter(|s| s.enabled) {
        out.push(snippets_filter(owner, sf));
    }
    Ok(out)
}

fn proxy_name(bundle: &str) -> String {
    format!("{bundle}-proxy")
}

fn listener(l: &ListenerSpec) -> Value {
    let mut v = json!({"name": l.name, "port": l.port, "protocol": l.protocol});
    if let Some(h) = l.hostname.as_deref().filter(|h| !h.is_empty()) {
        v["hostname"] = json!(h);
    }
    if let Some(tls) = &l.tls {
        let mut t = json!({});
        if let Some(mode) = &tls.mode {
            t["mode"] = json!(mode);
        }
        let refs: Vec<Value> = tls
            .certificate_refs
            .iter()
            .map(|r| {
                let mut c = json!({"kind": "Secret", "name": r.name});
                if let Some(ns) = r.namespace.as_deref().filter(|ns| !ns.is_empty()) {
                    c["namespace"] = json!(ns);
                }
                c
            })
            .collect();
        if !refs.is_empty() {
            t["certificateRefs"] = json!(refs);
        }
        v["tls"] = t;
    }
    if let Some(ns) = l.allowed_routes.as_ref().and_then(|a| a.namespaces.as_ref()) {
        let mut n = json!({});
        if let Some(from) = ns.from.as_deref().filter(|f| !f.is_empty()) {
            n["from"] = json!(from);
        }
        if let Some(sel) = &ns.selector {
            n["selector"] = json!({"matchLabels": sel});
        }
        v["allowedRoutes"] = json!({"namespaces": n});
    }
    v
}

fn gateway(owner: &OwnerInfo, spec: &GatewayBundleSpec, with_proxy: bool) -> ChildDescriptor {
    let mut desc = ChildDescriptor::new(owner, GATEWAY_API_VERSION, "Gateway", owner.name.clone());
    let ours = desc.labels.clone();
    if let Some(extra) = &spec.labels {
        desc.labels.extend(extra.clone());
        desc.labels.extend(ours);
    }
    if let Some(ann) = &spec.annotations {
        desc.annotations.extend(ann.clone());
    }
    let mut gw = json!({
        "gatewayClassName": spec.gateway_class_name,
        "listeners": spec.listeners.iter().map(listener).collect::<Vec<_>>(),
    });
    if with_proxy {
        gw["infrastructure"] = json!({
            "parametersRef": {
                "group": "gateway.nginx.org",
                "kind": "NginxProxy",
                "name": proxy_name(&owner.name),
            }
        });
        desc = desc.depends_on(&proxy_name(&owner.name));
    }
    desc.field("spec", gw)
}

fn nginx_proxy(owner: &OwnerInfo, p: &NginxProxySpec) -> ChildDescriptor {
    let mut spec = json!({});
    if let Some(f) = p.ip_family.as_deref().filter(|f| !f.is_empty()) {
        spec["ipFamily"] = json!(f);
    }
    if let Some(r) = &p.rewrite_client_ip {
        let mut rw = json!({"setIPRecursively": r.set_ip_recursively});
        if let Some(mode) = &r.mode {
            rw["mode"] = json!(mode);
        }
        spec["rewriteClientIP"] = rw;
    }
    if let Some(ep) = p
        .telemetry
        .as_ref()
        .and_then(|t| t.exporter.as_ref())
        .and_then(|e| e.endpoint.as_deref())
    {
        spec["telemetry"] = json!({"exporter": {"endpoint": ep}});
    }
    ChildDescriptor::new(owner, NGINX_PROXY_API_VERSION, "NginxProxy", proxy_name(&owner.name))
        .field("spec", spec)
}

fn snippets_filter(owner: &OwnerInfo, sf: &SnippetsFilterSpec) -> ChildDescriptor {
    let mut snippets = Vec::new();
    if let Some(s) = sf.server_snippet.as_deref().filter(|s| !s.is_empty()) {
        snippets.push(json!({"context": "http.server", "value": s}));
    }
    if let Some(s) = sf.location_snippet.as_deref().filter(|s| !s.is_empty()) {
        snippets.push(json!({"context": "http.server.location", "value": s}));
    }
    ChildDescriptor::new(owner, SNIPPETS_FILTER_API_VERSION, "SnippetsFilter", format!("{}-snippets", owner.name))
        .depends_on(&owner.name)
        .field("spec", json!({"snippets": snippets}))
}
