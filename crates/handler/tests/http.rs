use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use graphfed_handler::{
    handler::{graphql_request, health, status, HandlerConfig},
    Engine,
    ServiceCall,
    ServiceCaller,
    ServiceResponse,
};
use graphfed_planner::{FederationConfig, Response, Result, ServiceConfig};
use serde_json::{json, Value};
use value::ConstValue;
use warp::{http::StatusCode, test::request};

struct EchoCaller;

#[async_trait]
impl ServiceCaller for EchoCaller {
    async fn call(&self, call: ServiceCall) -> Result<ServiceResponse> {
        let forwarded = call
            .headers
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(ServiceResponse::from_response(
            &call.service.name,
            Response {
                data: ConstValue::from_json(json!({ "dogs": [{ "name": forwarded }] })).unwrap(),
                ..Default::default()
            },
            Duration::ZERO,
        ))
    }

    async fn is_healthy(&self, _service: &ServiceConfig) -> bool {
        true
    }
}

fn engine() -> Arc<Engine> {
    let config = FederationConfig {
        services: vec![ServiceConfig::new("dogs", "http://dogs:4001").schema("type Query { dogs: [Dog] } type Dog { name: String }")],
        ..Default::default()
    };
    let engine = Engine::new(config.clone(), Arc::new(EchoCaller)).unwrap();
    engine.initialize(config).unwrap();
    Arc::new(engine)
}

#[tokio::test]
async fn query_is_executed() {
    let api = graphql_request(HandlerConfig {
        engine: engine(),
        forward_headers: Arc::new(vec!["x-request-id".to_string()]),
    });

    let resp = request()
        .method("POST")
        .path("/")
        .header("content-type", "application/json")
        .header("x-request-id", "42")
        .body(r#"{"query": "query { dogs { name } }"}"#)
        .reply(&api)
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body, json!({ "data": { "dogs": [{ "name": "42" }] } }));
}

#[tokio::test]
async fn errors_use_the_graphql_shape() {
    let api = graphql_request(HandlerConfig {
        engine: engine(),
        forward_headers: Arc::new(vec![]),
    });

    let resp = request()
        .method("POST")
        .path("/")
        .header("content-type", "application/json")
        .body(r#"{"query": "query A { dogs { name } } query B { dogs { name } }"}"#)
        .reply(&api)
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["data"], Value::Null);
    assert_eq!(body["errors"][0]["extensions"]["code"], json!("QUERY_PARSING_ERROR"));
}

#[tokio::test]
async fn health_and_status() {
    let engine = engine();

    let resp = request().method("GET").path("/").reply(&health(engine.clone())).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["status"], json!("running"));

    let resp = request().method("GET").path("/").reply(&status(engine.clone())).await;
    let body: Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["queryCount"], json!(0));
    assert_eq!(body["serviceCount"], json!(1));

    engine.shutdown();
    let resp = request().method("GET").path("/").reply(&health(engine)).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}
