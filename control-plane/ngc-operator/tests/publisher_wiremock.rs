use std::time::Duration;

use ngc_operator::controller::publish::{ExternalPublisher, PublishError, XcPublisher};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn publisher(server: &MockServer) -> XcPublisher {
    XcPublisher::new("t", Duration::from_secs(5))
        .unwrap()
        .with_base_url(server.uri())
}

#[tokio::test]
async fn deletes_load_balancer_with_api_token() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/config/namespaces/prod/http_loadbalancers/x"))
        .and(header("Authorization", "APIToken t"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    publisher(&server)
        .delete_http_load_balancer("acme", "prod", "x")
        .await
        .unwrap();
}

#[tokio::test]
async fn missing_origin_pool_counts_as_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/config/namespaces/prod/origin_pools/x-pool"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    assert!(publisher(&server).delete_origin_pool("acme", "prod", "x-pool").await.is_ok());
}

#[tokio::test]
async fn server_error_is_reported_with_status() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = publisher(&server)
        .delete_http_load_balancer("acme", "prod", "x")
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Status { status: 500, .. }));
}
