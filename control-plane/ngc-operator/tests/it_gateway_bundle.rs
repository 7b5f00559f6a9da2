// GatewayBundle reconcile passes against an in-memory cluster.

use ngc_cluster::{ApiError, ClusterApi};
use ngc_operator::controller::planner::gateway_bundle::{
    GATEWAY_API_VERSION, NGINX_PROXY_API_VERSION, SNIPPETS_FILTER_API_VERSION,
};
use ngc_operator::controller::reconcile::Requeue;
use ngc_operator::controller::{DeclaredKind, ReconcileErr};
use ngc_operator::crd::common::Phase;
use ngc_operator::crd::gateway_bundle::GatewayBundleStatus;
use serde_json::{Value, json};

mod common;
use common::{NS, child, harness, res, seed, status_of, stored};

const BUNDLE: DeclaredKind = DeclaredKind::GatewayBundle;

fn bundle_spec() -> Value {
    json!({
        "gatewayClassName": "nginx",
        "listeners": [{"name": "http", "port": 80, "protocol": "HTTP"}],
    })
}

fn bundle_status(api: &ngc_cluster::memory::MemoryClusterApi) -> GatewayBundleStatus {
    let obj = api.object(&BUNDLE.resource(), NS, "edge").unwrap();
    serde_json::from_value(obj.data["status"].clone()).unwrap()
}

#[test_log::test(tokio::test)]
async fn minimal_bundle_plans_only_the_gateway() {
    let h = harness(&["east"]).await;
    let api = h.cluster("east");
    let key = seed(&api, "east", BUNDLE, "edge", bundle_spec());
    h.reconcile(&key).await.unwrap();

    let gw = child(&api, GATEWAY_API_VERSION, "Gateway", "edge").unwrap();
    assert_eq!(gw.data["spec"]["gatewayClassName"], "nginx");
    assert_eq!(gw.data["spec"]["listeners"][0]["port"], 80);
    assert!(gw.data["spec"].get("infrastructure").is_none());
    assert!(child(&api, NGINX_PROXY_API_VERSION, "NginxProxy", "edge-proxy").is_none());

    let status = status_of(&api, &key);
    assert_eq!(status.phase, Some(Phase::Degraded));
    assert_eq!(status.children.len(), 1);
    assert_eq!(status.children[0].message, "waiting for gateway controller");
}

#[test_log::test(tokio::test)]
async fn programmed_gateway_reports_its_address() {
    let h = harness(&["east"]).await;
    let api = h.cluster("east");
    let key = seed(&api, "east", BUNDLE, "edge", bundle_spec());
    h.reconcile(&key).await.unwrap();
    assert_eq!(bundle_status(&api).gateway_address, None);

    api.set_status(
        &res(GATEWAY_API_VERSION, "Gateway"),
        NS,
        "edge",
        json!({
            "conditions": [
                {"type": "Accepted", "status": "True"},
                {"type": "Programmed", "status": "True"},
            ],
            "addresses": [{"type": "IPAddress", "value": "10.0.0.7"}],
        }),
    );
    assert!(matches!(h.reconcile(&key).await, Ok(Requeue::After(_))));

    let status = bundle_status(&api);
    assert_eq!(status.reconcile.phase, Some(Phase::Ready));
    assert_eq!(status.gateway_address.as_deref(), Some("10.0.0.7"));
    let raw = stored(&api, &key).unwrap().data["status"].clone();
    assert_eq!(raw["gatewayAddress"], "10.0.0.7");
    assert_eq!(raw["phase"], "Ready");
}

#[test_log::test(tokio::test)]
async fn proxy_and_snippets_are_wired_to_the_gateway() {
    let h = harness(&["east"]).await;
    let api = h.cluster("east");
    let mut spec = bundle_spec();
    spec["nginxProxy"] = json!({"enabled": true, "ipFamily": "ipv4"});
    spec["snippetsFilter"] = json!({"enabled": true, "serverSnippet": "client_max_body_size 10m;"});
    let key = seed(&api, "east", BUNDLE, "edge", spec);
    h.reconcile(&key).await.unwrap();

    let proxy = child(&api, NGINX_PROXY_API_VERSION, "NginxProxy", "edge-proxy").unwrap();
    assert_eq!(proxy.data["spec"]["ipFamily"], "ipv4");
    let gw = child(&api, GATEWAY_API_VERSION, "Gateway", "edge").unwrap();
    assert_eq!(gw.data["spec"]["infrastructure"]["parametersRef"]["name"], "edge-proxy");
    let sf = child(&api, SNIPPETS_FILTER_API_VERSION, "SnippetsFilter", "edge-snippets").unwrap();
    assert_eq!(sf.data["spec"]["snippets"][0]["context"], "http.server");

    let kinds: Vec<String> = status_of(&api, &key).applied_children.into_iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec!["NginxProxy", "Gateway", "SnippetsFilter"]);
}

#[test_log::test(tokio::test)]
async fn duplicate_listener_is_rejected() {
    let h = harness(&["east"]).await;
    let api = h.cluster("east");
    let mut spec = bundle_spec();
    spec["listeners"] = json!([
        {"name": "http", "port": 80, "protocol": "HTTP"},
        {"name": "http", "port": 8080, "protocol": "HTTP"},
    ]);
    let key = seed(&api, "east", BUNDLE, "edge", spec);

    assert!(matches!(h.reconcile(&key).await, Err(ReconcileErr::Validation(_))));
    assert_eq!(status_of(&api, &key).phase, Some(Phase::Error));
    assert!(api.objects_of(&res(GATEWAY_API_VERSION, "Gateway")).is_empty());
}

#[test_log::test(tokio::test)]
async fn deleting_a_bundle_removes_the_gateway() {
    let h = harness(&["east"]).await;
    let api = h.cluster("east");
    let key = seed(&api, "east", BUNDLE, "edge", bundle_spec());
    h.reconcile(&key).await.unwrap();
    api.delete(&BUNDLE.resource(), NS, "edge").await.unwrap();

    assert_eq!(h.reconcile(&key).await.unwrap(), Requeue::Never);
    assert!(stored(&api, &key).is_none());
    assert!(child(&api, GATEWAY_API_VERSION, "Gateway", "edge").is_none());
    assert!(h.publisher.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn terminating_status_keeps_reported_address() {
    let h = harness(&["east"]).await;
    let api = h.cluster("east");
    let key = seed(&api, "east", BUNDLE, "edge", bundle_spec());
    h.reconcile(&key).await.unwrap();
    api.set_status(
        &res(GATEWAY_API_VERSION, "Gateway"),
        NS,
        "edge",
        json!({
            "conditions": [{"type": "Programmed", "status": "True"}],
            "addresses": [{"value": "10.0.0.7"}],
        }),
    );
    h.reconcile(&key).await.unwrap();
    assert_eq!(bundle_status(&api).gateway_address.as_deref(), Some("10.0.0.7"));

    api.fail_writes("Gateway", "edge", ApiError::Internal("webhook down".into()));
    api.delete(&BUNDLE.resource(), NS, "edge").await.unwrap();
    assert!(matches!(h.reconcile(&key).await, Err(ReconcileErr::Cleanup { .. })));

    let status = bundle_status(&api);
    assert_eq!(status.reconcile.phase, Some(Phase::Terminating));
    assert_eq!(status.gateway_address.as_deref(), Some("10.0.0.7"));
}
