#[cfg(test)]
mod tests {
    use super::super::{OwnerInfo, gateway_bundle, inference_stack};
    use crate::crd::gateway_bundle::{
        GatewayBundleSpec, ListenerSpec, NginxProxySpec, SnippetsFilterSpec,
    };
    use crate::crd::inference_stack::{
        AutoscalingSpec, DcgmSpec, EppSpec, HttpRouteSpec, InferenceStackSpec, PoolSpec,
        ThresholdSpec,
    };
    use serde_json::json;

    fn stack_owner() -> OwnerInfo {
        OwnerInfo {
            api_version: "ngf-console.f5.com/v1alpha1".into(),
            kind: "InferenceStack".into(),
            name: "llama".into(),
            namespace: "ml".into(),
            uid: Some("uid-1".into()),
            owner_label: inference_stack::STACK_LABEL,
        }
    }

    fn bundle_owner() -> OwnerInfo {
        OwnerInfo {
            kind: "GatewayBundle".into(),
            name: "edge".into(),
            owner_label: gateway_bundle::BUNDLE_LABEL,
            ..stack_owner()
        }
    }

    fn minimal_stack() -> InferenceStackSpec {
        InferenceStackSpec {
            model_name: "meta-llama/Llama-3-8B".into(),
            serving_backend: "vllm".into(),
            pool: PoolSpec {
                gpu_type: "H100".into(),
                gpu_count: 1,
                replicas: 6,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn full_stack() -> InferenceStackSpec {
        InferenceStackSpec {
            epp: Some(EppSpec {
                strategy: None,
                weights: None,
            }),
            http_route: Some(HttpRouteSpec {
                hostnames: vec!["llama.example.com".into()],
                gateway_ref: "edge".into(),
                gateway_namespace: None,
            }),
            dcgm: Some(DcgmSpec {
                enabled: true,
                image: None,
            }),
            autoscaling: Some(AutoscalingSpec {
                backend: Some("keda".into()),
                thresholds: vec![ThresholdSpec {
                    metric: "vllm:num_requests_waiting".into(),
                    target: 10,
                }],
                cooldown_seconds: None,
            }),
            pool: PoolSpec {
                min_replicas: 1,
                max_replicas: 8,
                ..minimal_stack().pool
            },
            ..minimal_stack()
        }
    }

    fn listener(name: &str, port: i32) -> ListenerSpec {
        ListenerSpec {
            name: name.into(),
            port,
            protocol: "HTTP".into(),
            ..Default::default()
        }
    }

    #[test]
    fn minimal_stack_plans_only_the_pool() {
        let plan = inference_stack::plan(&stack_owner(), &minimal_stack()).unwrap();
        assert_eq!(plan.len(), 1);
        let pool = &plan[0];
        assert_eq!(pool.kind, "InferencePool");
        assert_eq!(pool.name, "llama-pool");
        assert_eq!(pool.annotations[inference_stack::REPLICAS_ANNOTATION], "6");
        assert_eq!(pool.annotations[inference_stack::GPU_TYPE_ANNOTATION], "H100");
        assert_eq!(pool.body["spec"]["selector"]["matchLabels"], json!({"app": "llama"}));
        assert_eq!(pool.body["spec"]["targetPorts"], json!([{"number": 8000}]));
        assert_eq!(pool.labels[inference_stack::STACK_LABEL], "llama");
    }

    #[test]
    fn planning_is_deterministic() {
        let a = inference_stack::plan(&stack_owner(), &full_stack()).unwrap();
        let b = inference_stack::plan(&stack_owner(), &full_stack()).unwrap();
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
    }

    #[test]
    fn full_stack_order_and_dependencies() {
        let plan = inference_stack::plan(&stack_owner(), &full_stack()).unwrap();
        let kinds: Vec<_> = plan.iter().map(|d| (d.kind.as_str(), d.name.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                ("InferencePool", "llama-pool"),
                ("ConfigMap", "llama-epp-config"),
                ("HTTPRoute", "llama-route"),
                ("DaemonSet", "llama-dcgm"),
                ("ScaledObject", "llama-scaler"),
            ]
        );
        for d in &plan[1..] {
            if d.kind != "DaemonSet" {
                assert_eq!(d.depends_on, vec!["llama-pool".to_string()], "{}", d.kind);
            }
        }
        let route = &plan[2];
        assert_eq!(route.body["spec"]["parentRefs"][0]["name"], "edge");
        assert_eq!(route.body["spec"]["rules"][0]["backendRefs"][0]["name"], "llama-pool");
        let scaler = &plan[4];
        assert_eq!(scaler.body["spec"]["cooldownPeriod"], 300);
        assert_eq!(scaler.body["spec"]["maxReplicaCount"], 8);
        assert_eq!(scaler.body["spec"]["triggers"][0]["metadata"]["threshold"], "10");
    }

    #[test]
    fn epp_config_defaults_strategy() {
        let plan = inference_stack::plan(&stack_owner(), &full_stack()).unwrap();
        let rendered = plan[1].body["data"]["epp-config.json"].as_str().unwrap();
        let cfg: serde_json::Value = serde_json::from_str(rendered).unwrap();
        assert_eq!(cfg["strategy"], "least_queue");
        assert_eq!(cfg["poolName"], "llama-pool");
    }

    #[test]
    fn disabled_dcgm_is_omitted() {
        let mut spec = full_stack();
        spec.dcgm = Some(DcgmSpec {
            enabled: false,
            image: None,
        });
        let plan = inference_stack::plan(&stack_owner(), &spec).unwrap();
        assert!(plan.iter().all(|d| d.kind != "DaemonSet"));
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn stack_validation_rejects_bad_input() {
        let owner = stack_owner();
        let mut spec = minimal_stack();
        spec.serving_backend = "llamacpp".into();
        assert_eq!(inference_stack::plan(&owner, &spec).unwrap_err().field, "servingBackend");

        let mut spec = minimal_stack();
        spec.pool.replicas = -1;
        assert_eq!(inference_stack::plan(&owner, &spec).unwrap_err().field, "pool.replicas");

        let mut spec = full_stack();
        spec.pool.min_replicas = 9;
        assert_eq!(inference_stack::plan(&owner, &spec).unwrap_err().field, "pool.maxReplicas");

        let mut spec = full_stack();
        spec.autoscaling.as_mut().unwrap().backend = Some("hpa".into());
        assert_eq!(inference_stack::plan(&owner, &spec).unwrap_err().field, "autoscaling.backend");

        let mut spec = minimal_stack();
        spec.model_name = " ".into();
        assert_eq!(inference_stack::plan(&owner, &spec).unwrap_err().field, "modelName");
    }

    #[test]
    fn bundle_plans_proxy_gateway_and_snippets() {
        let spec = GatewayBundleSpec {
            gateway_class_name: "nginx".into(),
            listeners: vec![listener("http", 80)],
            labels: Some([("team".to_string(), "ml".to_string())].into()),
            nginx_proxy: Some(NginxProxySpec {
                enabled: true,
                ip_family: Some("dual".into()),
                ..Default::default()
            }),
            snippets_filter: Some(SnippetsFilterSpec {
                enabled: true,
                server_snippet: Some("client_max_body_size 10m;".into()),
                location_snippet: None,
            }),
            ..Default::default()
        };
        let plan = gateway_bundle::plan(&bundle_owner(), &spec).unwrap();
        let names: Vec<_> = plan.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["edge-proxy", "edge", "edge-snippets"]);
        let gw = &plan[1];
        assert_eq!(gw.depends_on, vec!["edge-proxy".to_string()]);
        assert_eq!(gw.labels["team"], "ml");
        assert_eq!(gw.labels[gateway_bundle::BUNDLE_LABEL], "edge");
        assert_eq!(gw.body["spec"]["infrastructure"]["parametersRef"]["name"], "edge-proxy");
        assert_eq!(plan[2].depends_on, vec!["edge".to_string()]);
    }

    #[test]
    fn bundle_without_extras_plans_only_gateway() {
        let spec = GatewayBundleSpec {
            gateway_class_name: "nginx".into(),
            listeners: vec![listener("http", 80)],
            ..Default::default()
        };
        let plan = gateway_bundle::plan(&bundle_owner(), &spec).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan[0].body["spec"].get("infrastructure").is_none());
    }

    #[test]
    fn spec_labels_cannot_override_ownership() {
        let spec = GatewayBundleSpec {
            gateway_class_name: "nginx".into(),
            listeners: vec![listener("http", 80)],
            labels: Some([(gateway_bundle::BUNDLE_LABEL.to_string(), "other".to_string())].into()),
            ..Default::default()
        };
        let plan = gateway_bundle::plan(&bundle_owner(), &spec).unwrap();
        assert_eq!(plan[0].labels[gateway_bundle::BUNDLE_LABEL], "edge");
    }

    #[test]
    fn bundle_validation_rejects_bad_listeners() {
        let owner = bundle_owner();
        let base = GatewayBundleSpec {
            gateway_class_name: "nginx".into(),
            listeners: vec![listener("http", 80), listener("http", 8080)],
            ..Default::default()
        };
        assert_eq!(gateway_bundle::plan(&owner, &base).unwrap_err().field, "listeners.name");

        let spec = GatewayBundleSpec {
            listeners: vec![listener("http", 70000)],
            ..base.clone()
        };
        assert_eq!(gateway_bundle::plan(&owner, &spec).unwrap_err().field, "listeners.port");

        let spec = GatewayBundleSpec {
            listeners: vec![],
            ..base.clone()
        };
        assert_eq!(gateway_bundle::plan(&owner, &spec).unwrap_err().field, "listeners");

        let mut l = listener("grpc", 9000);
        l.protocol = "GRPC".into();
        let spec = GatewayBundleSpec {
            listeners: vec![l],
            ..base
        };
        assert_eq!(gateway_bundle::plan(&owner, &spec).unwrap_err().field, "listeners.protocol");
    }
}
