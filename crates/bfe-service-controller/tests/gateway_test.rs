//! Gateway behavior against a mock open-api

use std::collections::BTreeMap;
use std::time::Duration;

use bfe_openapi::OpenApiClient;
use bfe_service_controller::desired::{DesiredPool, PoolMember};
use bfe_service_controller::gateway::{
    AlbPoolGateway, DeleteOutcome, GatewayError, PoolGateway, UpsertOutcome,
};
use serde_json::{json, Value};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const POOLS: &str = "/open-api/v1/products/shop/instance-pools";
const POOL: &str = "/open-api/v1/products/shop/instance-pools/shop.k8s_default_web_http";

fn gateway(server: &MockServer) -> AlbPoolGateway {
    gateway_with_timeout(server, Duration::from_secs(2))
}

fn gateway_with_timeout(server: &MockServer, timeout: Duration) -> AlbPoolGateway {
    AlbPoolGateway::new(OpenApiClient::new(&server.uri(), "Token secret", timeout).unwrap())
}

fn desired(ips: &[&str]) -> DesiredPool {
    DesiredPool {
        product: "shop".to_string(),
        pool_id: "shop.k8s_default_web_http".to_string(),
        members: ips
            .iter()
            .map(|ip| PoolMember {
                address: ip.to_string(),
                port: 8080,
                weight: 1,
                tags: BTreeMap::from([("key".to_string(), "value".to_string())]),
            })
            .collect(),
    }
}

fn instances(ips: &[&str]) -> Value {
    ips.iter()
        .map(|ip| {
            json!({
                "hostname": ip,
                "ip": ip,
                "weight": 1,
                "ports": {"Default": 8080},
                "tags": {"key": "value"}
            })
        })
        .collect()
}

fn ok(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "ErrNum": 200,
        "ErrMsg": "success",
        "Data": data
    }))
}

fn status(code: u16, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(code).set_body_json(json!({
        "ErrNum": code,
        "ErrMsg": message,
        "Data": null
    }))
}

fn existing_pool(ips: &[&str]) -> ResponseTemplate {
    ok(json!({"name": "shop.k8s_default_web_http", "instances": instances(ips)}))
}

fn upsert_body(ips: &[&str]) -> Value {
    json!({"name": "shop.k8s_default_web_http", "instances": instances(ips)})
}

#[tokio::test]
async fn test_upsert_creates_missing_pool() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POOL))
        .respond_with(status(404, "instance pool not found"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(POOLS))
        .and(body_json(upsert_body(&["10.0.0.1"])))
        .respond_with(ok(Value::Null))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = gateway(&server).upsert(&desired(&["10.0.0.1"])).await.unwrap();
    assert_eq!(outcome, UpsertOutcome::Created);
}

#[tokio::test]
async fn test_upsert_matching_pool_sends_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POOL))
        .respond_with(existing_pool(&["10.0.0.2", "10.0.0.1"]))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .respond_with(ok(Value::Null))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ok(Value::Null))
        .expect(0)
        .mount(&server)
        .await;

    let outcome = gateway(&server)
        .upsert(&desired(&["10.0.0.1", "10.0.0.2"]))
        .await
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::Unchanged);
}

#[tokio::test]
async fn test_upsert_updates_differing_pool() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POOL))
        .respond_with(existing_pool(&["10.0.0.1"]))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(POOL))
        .and(body_json(upsert_body(&["10.0.0.1", "10.0.0.3"])))
        .respond_with(ok(Value::Null))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = gateway(&server)
        .upsert(&desired(&["10.0.0.1", "10.0.0.3"]))
        .await
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::Updated);
}

#[tokio::test]
async fn test_upsert_create_race_falls_back_to_update() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POOL))
        .respond_with(status(404, "instance pool not found"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(POOLS))
        .respond_with(status(409, "instance pool already exist"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(POOL))
        .respond_with(ok(Value::Null))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = gateway(&server).upsert(&desired(&["10.0.0.1"])).await.unwrap();
    assert_eq!(outcome, UpsertOutcome::Updated);
}

#[tokio::test]
async fn test_upsert_rejected_create_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POOL))
        .respond_with(status(404, "instance pool not found"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(status(403, "permission denied"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .respond_with(ok(Value::Null))
        .expect(0)
        .mount(&server)
        .await;

    let err = gateway(&server)
        .upsert(&desired(&["10.0.0.1"]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::RemoteRejected {
            status: 403,
            message: "permission denied".to_string()
        }
    );
}

#[tokio::test]
async fn test_delete_existing_pool() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path(POOL))
        .respond_with(ok(Value::Null))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = gateway(&server)
        .delete("shop", "shop.k8s_default_web_http")
        .await
        .unwrap();
    assert_eq!(outcome, DeleteOutcome::Deleted);
}

#[tokio::test]
async fn test_delete_missing_pool_is_already_absent() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path(POOL))
        .respond_with(status(404, "instance pool not found"))
        .mount(&server)
        .await;

    let outcome = gateway(&server)
        .delete("shop", "shop.k8s_default_web_http")
        .await
        .unwrap();
    assert_eq!(outcome, DeleteOutcome::AlreadyAbsent);
}

#[tokio::test]
async fn test_delete_in_missing_product_is_already_absent() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path(POOL))
        .respond_with(status(422, "Product Not Exist"))
        .mount(&server)
        .await;

    let outcome = gateway(&server)
        .delete("shop", "shop.k8s_default_web_http")
        .await
        .unwrap();
    assert_eq!(outcome, DeleteOutcome::AlreadyAbsent);
}

#[tokio::test]
async fn test_delete_failures_are_classified() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path(POOL))
        .respond_with(status(403, "permission denied"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/other", POOLS)))
        .respond_with(status(500, "database unavailable"))
        .mount(&server)
        .await;

    let gateway = gateway(&server);

    let rejected = gateway
        .delete("shop", "shop.k8s_default_web_http")
        .await
        .unwrap_err();
    assert!(rejected.is_rejected());

    let unavailable = gateway.delete("shop", "other").await.unwrap_err();
    assert_eq!(
        unavailable,
        GatewayError::RemoteUnavailable {
            status: 500,
            message: "database unavailable".to_string()
        }
    );
}

#[tokio::test]
async fn test_exists() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POOL))
        .respond_with(existing_pool(&["10.0.0.1"]))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/gone", POOLS)))
        .respond_with(status(404, "instance pool not found"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/broken", POOLS)))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let gateway = gateway(&server);

    assert!(gateway.exists("shop", "shop.k8s_default_web_http").await.unwrap());
    assert!(!gateway.exists("shop", "gone").await.unwrap());
    assert!(matches!(
        gateway.exists("shop", "broken").await,
        Err(GatewayError::RemoteUnavailable { status: 502, .. })
    ));
}

#[tokio::test]
async fn test_timeout_is_transient() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(POOL))
        .respond_with(existing_pool(&["10.0.0.1"]).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let err = gateway_with_timeout(&server, Duration::from_millis(50))
        .upsert(&desired(&["10.0.0.1"]))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Transient(_)));
}
