use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use graphfed_handler::{
    Engine,
    EngineStatus,
    ExecutionCoordinator,
    ExecutionState,
    HealthCache,
    ServiceCall,
    ServiceCaller,
    ServiceResponse,
};
use graphfed_planner::{
    ExecutionPlan,
    FederationConfig,
    FederationError,
    RepresentationRequest,
    Request,
    Response,
    Result,
    ServiceConfig,
    SubQuery,
};
use http::HeaderMap;
use pretty_assertions::assert_eq;
use serde_json::json;
use value::ConstValue;

const USERS_SDL: &str = r#"
    type Query { users: [User] }
    type User @key(fields: "id") { id: ID! name: String }
"#;

const PRODUCTS_SDL: &str = r#"
    type Query { products: [Product] }
    type Product @key(fields: "id") { id: ID! name: String }
"#;

#[derive(Default)]
struct MockCaller {
    delays: HashMap<String, Duration>,
    unhealthy: HashSet<String>,
    panicking: HashSet<String>,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl MockCaller {
    fn delay(mut self, service: &str, delay: Duration) -> Self {
        self.delays.insert(service.to_string(), delay);
        self
    }

    fn unhealthy(mut self, service: &str) -> Self {
        self.unhealthy.insert(service.to_string());
        self
    }

    fn panicking(mut self, service: &str) -> Self {
        self.panicking.insert(service.to_string());
        self
    }
}

#[async_trait]
impl ServiceCaller for MockCaller {
    async fn call(&self, call: ServiceCall) -> Result<ServiceResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(call.sub_query.query.clone());
        if self.panicking.contains(&call.service.name) {
            panic!("{} crashed", call.service.name);
        }
        if let Some(delay) = self.delays.get(&call.service.name) {
            tokio::time::sleep(*delay).await;
        }

        let data = if call.sub_query.query.contains("_entities") {
            let representations = call.sub_query.variables.get("representations").cloned();
            let entities: Vec<serde_json::Value> = match representations {
                Some(ConstValue::List(values)) => values
                    .into_iter()
                    .map(|value| {
                        let mut entity = value.into_json().unwrap();
                        entity["name"] = json!(format!("{} from {}", entity["id"], call.service.name));
                        entity
                    })
                    .collect(),
                _ => vec![],
            };
            json!({ "_entities": entities })
        } else {
            match call.service.name.as_str() {
                "users-service" => json!({ "users": [{ "id": "1", "name": "Ada" }] }),
                "products-service" => json!({ "products": [{ "id": "p1", "name": "Lamp" }] }),
                _ => serde_json::Value::Null,
            }
        };

        Ok(ServiceResponse::from_response(
            &call.service.name,
            Response {
                data: ConstValue::from_json(data).unwrap(),
                ..Default::default()
            },
            Duration::from_millis(1),
        ))
    }

    async fn is_healthy(&self, service: &ServiceConfig) -> bool {
        !self.unhealthy.contains(&service.name)
    }
}

fn config() -> FederationConfig {
    FederationConfig {
        services: vec![
            ServiceConfig::new("users-service", "http://users:4001").schema(USERS_SDL),
            ServiceConfig::new("products-service", "http://products:4002").schema(PRODUCTS_SDL),
        ],
        query_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

fn engine(caller: MockCaller) -> Engine {
    let engine = Engine::new(config(), Arc::new(caller)).unwrap();
    engine.initialize(config()).unwrap();
    engine
}

fn data(response: &Response) -> serde_json::Value {
    response.data.clone().into_json().unwrap()
}

#[tokio::test]
async fn two_services() {
    let engine = engine(MockCaller::default());
    let response = engine
        .execute(Request::new("{ users { id name } products { id name } }"), HeaderMap::new())
        .await;

    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(
        data(&response),
        json!({
            "users": [{ "id": "1", "name": "Ada" }],
            "products": [{ "id": "p1", "name": "Lamp" }],
        })
    );
    assert_eq!(engine.metrics().query_count, 1);
    assert_eq!(engine.metrics().error_count, 0);
}

#[tokio::test(start_paused = true)]
async fn timed_out_service_is_reported() {
    let engine = engine(MockCaller::default().delay("products-service", Duration::from_secs(10)));
    let response = engine
        .execute(Request::new("{ users { id name } products { id name } }"), HeaderMap::new())
        .await;

    let data = data(&response);
    assert_eq!(data["users"], json!([{ "id": "1", "name": "Ada" }]));
    assert!(data.get("products").is_none());

    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].code(), Some("SERVICE_ERROR"));
    assert_eq!(
        response.errors[0].extensions["service"],
        ConstValue::String("products-service".to_string())
    );
    assert!(response.errors[0].message.contains("timed out"));
}

#[tokio::test]
async fn unhealthy_service_is_not_called() {
    let caller = Arc::new(MockCaller::default().unhealthy("products-service"));
    let engine = Engine::new(config(), caller.clone()).unwrap();
    engine.initialize(config()).unwrap();

    let response = engine
        .execute(Request::new("{ users { id } products { id } }"), HeaderMap::new())
        .await;

    assert_eq!(caller.calls.load(Ordering::SeqCst), 1);
    assert_eq!(response.errors.len(), 1);
    assert!(response.errors[0].message.contains("unavailable"));
    assert_eq!(data(&response)["users"], json!([{ "id": "1", "name": "Ada" }]));
}

#[tokio::test]
async fn too_deep_query_fails_whole_request() {
    let engine = engine(MockCaller::default());
    let response = engine
        .execute(
            Request::new("{ users { a { b { c { d { e { f { g { h { i { j { k { l { m } } } } } } } } } } } } } }"),
            HeaderMap::new(),
        )
        .await;

    assert_eq!(response.data, ConstValue::Null);
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].code(), Some("QUERY_COMPLEXITY_ERROR"));
    assert_eq!(engine.metrics().error_count, 1);
}

#[tokio::test]
async fn invalid_query_fails_whole_request() {
    let engine = engine(MockCaller::default());
    let response = engine.execute(Request::new("{ users { "), HeaderMap::new()).await;
    assert_eq!(response.data, ConstValue::Null);
    assert_eq!(response.errors[0].code(), Some("QUERY_PARSING_ERROR"));
}

#[tokio::test]
async fn lifecycle() {
    let engine = Engine::new(config(), Arc::new(MockCaller::default())).unwrap();
    assert_eq!(engine.status(), EngineStatus::Initializing);
    assert!(!engine.is_healthy());

    let response = engine.execute(Request::new("{ users { id } }"), HeaderMap::new()).await;
    assert_eq!(response.errors[0].code(), Some("SERVICE_UNAVAILABLE"));

    engine.initialize(config()).unwrap();
    assert!(engine.is_healthy());
    assert_eq!(engine.federated_entities().len(), 2);

    engine.shutdown();
    assert_eq!(engine.status(), EngineStatus::Shutdown);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let err = Engine::new(FederationConfig::default(), Arc::new(MockCaller::default()))
        .err()
        .unwrap();
    assert_eq!(err.code(), "CONFIG_INVALID");

    let engine = engine(MockCaller::default());
    let mut config = config();
    config.services[0].endpoint = "users:4001".to_string();
    assert!(engine.update_config(config).is_err());
}

#[tokio::test]
async fn update_config_drops_removed_services() {
    let engine = engine(MockCaller::default());
    let mut config = config();
    config.services.truncate(1);
    engine.update_config(config).unwrap();

    assert_eq!(engine.config().services.len(), 1);
    let entities = engine.federated_entities();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].type_name, "User");
}

#[tokio::test]
async fn resolve_entity_references() {
    let engine = engine(MockCaller::default());
    let entities = engine
        .resolve_entity_references(vec![
            RepresentationRequest::new("User").field("id", "1"),
            RepresentationRequest::new("Product").field("id", "p1"),
            RepresentationRequest::new("User").field("id", "2"),
        ])
        .await
        .unwrap();

    let names: Vec<_> = entities
        .into_iter()
        .map(|entity| entity.into_json().unwrap()["name"].clone())
        .collect();
    assert_eq!(
        names,
        vec![
            json!("\"1\" from users-service"),
            json!("\"2\" from users-service"),
            json!("\"p1\" from products-service"),
        ]
    );
}

#[tokio::test]
async fn entity_key_is_validated() {
    let engine = engine(MockCaller::default());
    let err = engine
        .resolve_entity_references(vec![RepresentationRequest::new("User").field("name", "Ada")])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        FederationError::Validation("missing required key field 'id' for entity User".to_string())
    );

    let user = engine
        .federated_entities()
        .into_iter()
        .find(|entity| entity.type_name == "User")
        .unwrap();
    assert!(engine
        .validate_entity_key(&user, &RepresentationRequest::new("User").field("id", "1"))
        .is_ok());
}

#[tokio::test]
async fn representation_query() {
    let engine = engine(MockCaller::default());
    let query = engine
        .build_representation_query("Product", &[RepresentationRequest::new("Product").field("id", "p1")])
        .unwrap();
    assert_eq!(
        query,
        "query($representations: [_Any!]!) { _entities(representations: $representations) { ... on Product { id name } } }"
    );
    assert_eq!(
        engine.build_representation_query("Review", &[]).unwrap_err().code(),
        "RESOLUTION_ERROR"
    );
}

#[tokio::test]
async fn federation_directives() {
    let engine = engine(MockCaller::default());
    let entities = engine
        .process_federation_directives(
            "reviews",
            r#"
                extend type User @key(fields: "id") {
                    id: ID! @external
                    reviews: [String]
                }
            "#,
        )
        .unwrap();
    assert_eq!(entities.len(), 1);

    let err = engine
        .process_federation_directives(
            "shipping",
            r#"
                type Product @key(fields: "id") {
                    id: ID!
                    weight: Int
                    estimate: Int @requires(fields: "weight")
                }
            "#,
        )
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn federation_query() {
    let engine = engine(MockCaller::default());
    let entities = engine.federated_entities();
    let mut variables = value::Variables::default();
    variables.insert(
        value::Name::new("representations"),
        ConstValue::List(vec![RepresentationRequest::new("User").field("id", "1").to_value()]),
    );

    let response = engine
        .execute_federation_query(
            Request::new("query($representations: [_Any!]!) { _entities(representations: $representations) { __typename } }")
                .variables(variables),
            &entities,
            HeaderMap::new(),
        )
        .await
        .unwrap();

    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(
        data(&response)["_entities"],
        json!([{ "__typename": "User", "id": "1", "name": "\"1\" from users-service" }])
    );
}

#[tokio::test]
async fn planning_disabled_forwards_the_selected_operation() {
    let caller = Arc::new(MockCaller::default());
    let config = FederationConfig {
        enable_query_planning: false,
        ..config()
    };
    let engine = Engine::new(config.clone(), caller.clone()).unwrap();
    engine.initialize(config).unwrap();

    let response = engine
        .execute(
            Request::new("query Other { products { id } } query Users { users { id name } }").operation_name("Users"),
            HeaderMap::new(),
        )
        .await;

    assert!(response.errors.is_empty());
    assert_eq!(data(&response), json!({ "users": [{ "id": "1", "name": "Ada" }] }));
    assert_eq!(*caller.queries.lock().unwrap(), vec![
        "query Users { users { id name } }".to_string()
    ]);
}

#[tokio::test]
async fn coordinator_reports_missing_service() {
    let coordinator_config = Arc::new(config());
    let mut coordinator = ExecutionCoordinator::new(
        coordinator_config,
        Arc::new(MockCaller::default()),
        Arc::new(HealthCache::default()),
    );
    assert_eq!(coordinator.state(), ExecutionState::Planned);

    let plan = ExecutionPlan::new(vec![
        SubQuery::new("users-service", "query { users { id } }"),
        SubQuery::new("billing-service", "query { invoices { id } }"),
    ]);
    let responses = coordinator.execute(&plan).await;

    assert_eq!(coordinator.state(), ExecutionState::Done);
    assert_eq!(responses.len(), 2);
    assert!(responses[0].is_ok());
    assert_eq!(
        responses[1].error,
        Some(FederationError::ServiceNotFound("billing-service".to_string()))
    );
}

#[tokio::test]
async fn coordinator_reports_crashed_task_as_execution_error() {
    let mut coordinator = ExecutionCoordinator::new(
        Arc::new(config()),
        Arc::new(MockCaller::default().panicking("users-service")),
        Arc::new(HealthCache::default()),
    );

    let plan = ExecutionPlan::new(vec![
        SubQuery::new("users-service", "query { users { id } }"),
        SubQuery::new("products-service", "query { products { id } }"),
    ]);
    let responses = coordinator.execute(&plan).await;

    assert_eq!(coordinator.state(), ExecutionState::Done);
    let error = responses[0].error.as_ref().expect("crashed sub-query has no error");
    assert_eq!(error.code(), "EXECUTION_FAILED");
    assert_eq!(
        error,
        &FederationError::Execution("sub-query task panicked for service users-service".to_string())
    );
    assert!(responses[1].is_ok());
}

#[tokio::test]
async fn batch_reports_failures() {
    let caller = MockCaller::default();
    let users = ServiceConfig::new("users-service", "http://users:4001");
    let batch = caller
        .call_batch(vec![
            ServiceCall::new(users.clone(), SubQuery::new("users-service", "{ users { id } }")),
            ServiceCall::new(users, SubQuery::new("users-service", "{ users { name } }")),
        ])
        .await;

    assert_eq!(batch.responses.len(), 2);
    assert!(batch.error.is_none());
}
