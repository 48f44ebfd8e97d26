//! Registry client tests against a mocked Eureka server

use resilience::RetryConfig;
use service_registry::{EurekaClient, InstanceInfo, InstanceStatus, LeaseKeeper, RenewOutcome};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn instance() -> InstanceInfo {
    InstanceInfo::new("em-processor", "127.0.0.1", 8080)
        .with_instance_id("proc-1")
        .with_lease(Duration::from_millis(50), Duration::from_secs(1))
}

async fn client_for(server: &MockServer) -> EurekaClient {
    EurekaClient::new(&format!("{}/eureka", server.uri())).expect("client")
}

#[tokio::test]
async fn test_register_posts_instance() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/eureka/apps/EM-PROCESSOR"))
        .and(body_partial_json(serde_json::json!({
            "instance": { "instanceId": "proc-1", "app": "EM-PROCESSOR", "status": "UP" }
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    client.register(&instance()).await.expect("register");
}

#[tokio::test]
async fn test_renew_reports_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/eureka/apps/EM-PROCESSOR/proc-1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let outcome = client.renew(&instance()).await.expect("renew");
    assert_eq!(outcome, RenewOutcome::NotFound);
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/eureka/apps/EM-PROCESSOR"))
        .respond_with(ResponseTemplate::new(503).set_body_string("starting"))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client.register(&instance()).await.unwrap_err();
    assert!(err.is_transient());
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn test_set_status() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/eureka/apps/EM-PROCESSOR/proc-1/status"))
        .and(query_param("value", "OUT_OF_SERVICE"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    client
        .set_status(&instance(), InstanceStatus::OutOfService)
        .await
        .expect("set_status");
}

#[tokio::test]
async fn test_lease_keeper_renews_and_deregisters() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/eureka/apps/EM-PROCESSOR"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/eureka/apps/EM-PROCESSOR/proc-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2..)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/eureka/apps/EM-PROCESSOR/proc-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let keeper = LeaseKeeper::start(client_for(&server).await, instance())
        .await
        .expect("start");

    tokio::time::sleep(Duration::from_millis(180)).await;
    keeper.shutdown().await;
}

#[tokio::test]
async fn test_lease_keeper_reregisters_after_eviction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/eureka/apps/EM-PROCESSOR"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2..)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/eureka/apps/EM-PROCESSOR/proc-1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let keeper = LeaseKeeper::start(client_for(&server).await, instance())
        .await
        .expect("start");

    tokio::time::sleep(Duration::from_millis(120)).await;
    keeper.shutdown().await;
}

#[tokio::test]
async fn test_start_gives_up_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let retry = RetryConfig {
        max_retries: 2,
        initial_backoff: Duration::from_millis(5),
        jitter: false,
        ..Default::default()
    };
    let result = LeaseKeeper::start_with_retry(client_for(&server).await, instance(), retry).await;
    assert!(result.is_err());
}
