use std::{
    fmt::{self, Display, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        RwLock,
    },
    time::Instant,
};

use graphfed_planner::{
    validate_plan,
    EntityPlanner,
    ExecutionPlan,
    FederationConfig,
    FederationError,
    ParsedQuery,
    PlanBuilder,
    PlanOptimizer,
    QueryAnalyzer,
    RepresentationRequest,
    Request,
    Response,
    Result,
    SubQuery,
};
use graphfed_schema::{extract_entities, FederatedEntity, InMemorySchemaRegistry, SchemaRegistry};
use http::HeaderMap;
use serde::Serialize;
use tracing::instrument;
use value::ConstValue;

use crate::{
    entity_resolver::owning_entity,
    EntityResolver,
    ExecutionCoordinator,
    HealthCache,
    HealthStatus,
    ResponseMerger,
    ServiceCaller,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Initializing,
    Running,
    Shutdown,
}

impl Display for EngineStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineStatus::Initializing => "initializing",
            EngineStatus::Running => "running",
            EngineStatus::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetrics {
    pub uptime_secs: u64,
    pub query_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub service_count: usize,
    pub status: EngineStatus,
}

/// The federation gateway: plans, executes and merges queries over the configured services.
pub struct Engine {
    config: RwLock<Arc<FederationConfig>>,
    caller: Arc<dyn ServiceCaller>,
    registry: InMemorySchemaRegistry,
    health: Arc<HealthCache>,
    analyzer: QueryAnalyzer,
    optimizer: PlanOptimizer,
    merger: ResponseMerger,
    entity_planner: EntityPlanner,
    status: RwLock<EngineStatus>,
    started_at: Instant,
    query_count: AtomicU64,
    error_count: AtomicU64,
}

impl Engine {
    pub fn new(config: FederationConfig, caller: Arc<dyn ServiceCaller>) -> Result<Self> {
        let config = config.with_defaults();
        config.validate()?;

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            caller,
            registry: InMemorySchemaRegistry::new(),
            health: Default::default(),
            analyzer: QueryAnalyzer::new(),
            optimizer: PlanOptimizer::new(),
            merger: ResponseMerger::default(),
            entity_planner: EntityPlanner::new(),
            status: RwLock::new(EngineStatus::Initializing),
            started_at: Instant::now(),
            query_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        })
    }

    pub fn merger(self, merger: ResponseMerger) -> Self {
        Self { merger, ..self }
    }

    pub fn health_cache(self, health: Arc<HealthCache>) -> Self {
        Self { health, ..self }
    }

    /// Register the schemas of `config` and start serving.
    pub fn initialize(&self, config: FederationConfig) -> Result<()> {
        let config = config.with_defaults();
        config.validate()?;
        self.register_schemas(&config);
        *self.config.write().unwrap_or_else(|err| err.into_inner()) = Arc::new(config);
        self.set_status(EngineStatus::Running);
        tracing::info!(services = self.config().services.len(), "Federation engine initialized");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.set_status(EngineStatus::Shutdown);
        tracing::info!("Federation engine shut down");
    }

    /// Replace the configuration; requests already running keep the one they started with.
    pub fn update_config(&self, config: FederationConfig) -> Result<()> {
        let config = config.with_defaults();
        config.validate()?;

        let previous = self.config();
        for service in &previous.services {
            if config.service(&service.name).is_none() {
                self.registry.unregister_schema(&service.name);
                self.health.remove(&service.name);
            }
        }
        self.register_schemas(&config);
        *self.config.write().unwrap_or_else(|err| err.into_inner()) = Arc::new(config);
        tracing::info!("Federation configuration updated");
        Ok(())
    }

    pub fn config(&self) -> Arc<FederationConfig> {
        self.config.read().unwrap_or_else(|err| err.into_inner()).clone()
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.read().unwrap_or_else(|err| err.into_inner())
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.status() == EngineStatus::Running
    }

    pub fn metrics(&self) -> EngineMetrics {
        let query_count = self.query_count.load(Ordering::Relaxed);
        let error_count = self.error_count.load(Ordering::Relaxed);
        EngineMetrics {
            uptime_secs: self.started_at.elapsed().as_secs(),
            query_count,
            error_count,
            error_rate: match query_count {
                0 => 0.0,
                _ => error_count as f64 / query_count as f64,
            },
            service_count: self.config().services.len(),
            status: self.status(),
        }
    }

    pub fn service_health(&self) -> std::collections::HashMap<String, HealthStatus> {
        self.health.statuses()
    }

    /// Execute a request; failures of the whole request come back as `data: null` and one error.
    pub async fn execute(&self, request: Request, headers: HeaderMap) -> Response {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        match self.try_execute(request, headers).await {
            Ok(response) => response,
            Err(err) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %err, code = err.code(), "Query failed");
                Response::from_error(err.into())
            },
        }
    }

    #[instrument(err(Debug), skip_all, level = "trace")]
    async fn try_execute(&self, request: Request, headers: HeaderMap) -> Result<Response> {
        self.ensure_running()?;
        let config = self.config();
        let query = self.analyze(&config, &request)?;

        let plan = match config.enable_query_planning {
            true => {
                let snapshot = self.registry.snapshot();
                let plan = PlanBuilder::new(&config).registry(&snapshot).plan(&query)?;
                validate_plan(&plan)?;
                self.optimize(plan)
            },
            false => self.direct_plan(&config, &query)?,
        };

        let mut response = self.run(&config, &plan, headers).await?;
        if config.debug_mode {
            let plan = serde_json::to_value(&plan).map_err(|err| FederationError::Internal(err.to_string()))?;
            let plan = ConstValue::from_json(plan).map_err(|err| FederationError::Internal(err.to_string()))?;
            response.extensions.insert("queryPlan".to_string(), plan);
        }
        Ok(response)
    }

    /// Plan a query over federated entities instead of root fields.
    #[instrument(err(Debug), skip_all, level = "trace")]
    pub async fn execute_federation_query(
        &self,
        request: Request,
        entities: &[FederatedEntity],
        headers: HeaderMap,
    ) -> Result<Response> {
        self.ensure_running()?;
        let config = self.config();
        let query = self.analyze(&config, &request)?;
        let plan = self.entity_planner.create_federation_execution_plan(&query, entities)?;
        validate_plan(&plan)?;
        self.run(&config, &plan, headers).await
    }

    /// Fetch the entities behind `representations` from the services owning their types.
    pub async fn resolve_entity_references(
        &self,
        representations: Vec<RepresentationRequest>,
    ) -> Result<Vec<ConstValue>> {
        self.ensure_running()?;
        let entities = self.federated_entities();
        EntityResolver::new(self.config(), self.caller.clone())
            .resolve_references(&entities, representations)
            .await
    }

    pub fn build_representation_query(
        &self,
        type_name: &str,
        representations: &[RepresentationRequest],
    ) -> Result<String> {
        let entities = self.federated_entities();
        let entity = owning_entity(&entities, type_name)
            .ok_or_else(|| FederationError::Resolution(format!("unknown entity type {type_name}")))?;
        self.entity_planner.build_representation_query(entity, representations)
    }

    /// Extract and validate the federated entities declared by `sdl`.
    pub fn process_federation_directives(&self, service_name: &str, sdl: &str) -> Result<Vec<FederatedEntity>> {
        let entities = extract_entities(service_name, sdl)?;
        for entity in &entities {
            entity.validate()?;
        }
        Ok(entities)
    }

    pub fn register_schema(&self, service_name: &str, sdl: &str) -> Result<()> {
        Ok(self.registry.register_schema(service_name, sdl)?)
    }

    pub fn federated_entities(&self) -> Vec<FederatedEntity> {
        self.registry.federated_entities()
    }

    pub fn validate_entity_key(&self, entity: &FederatedEntity, representation: &RepresentationRequest) -> Result<()> {
        representation.validate(entity)
    }

    fn analyze(&self, config: &FederationConfig, request: &Request) -> Result<ParsedQuery> {
        let query = self.analyzer.analyze(request)?;
        if config.max_query_depth > 0 && query.depth > config.max_query_depth {
            return Err(FederationError::QueryComplexity(format!(
                "query depth {} exceeds maximum allowed depth {}",
                query.depth, config.max_query_depth
            )));
        }
        Ok(query)
    }

    fn optimize(&self, plan: ExecutionPlan) -> ExecutionPlan {
        if plan.sub_queries.len() < 2 {
            return plan;
        }
        match self.optimizer.optimize(&plan) {
            Ok(optimized) => optimized,
            Err(err) => {
                tracing::warn!(error = %err, "Plan optimization failed, using the original plan");
                plan
            },
        }
    }

    /// Without planning the selected operation goes to the first service.
    fn direct_plan(&self, config: &FederationConfig, query: &ParsedQuery) -> Result<ExecutionPlan> {
        let service = config
            .services
            .first()
            .ok_or_else(|| FederationError::Planning("no services configured".to_string()))?;
        let printed = query.print()?;
        Ok(ExecutionPlan::new(vec![SubQuery::new(&service.name, printed.query)
            .variables(printed.variables)
            .timeout(service.timeout)]))
    }

    async fn run(&self, config: &Arc<FederationConfig>, plan: &ExecutionPlan, headers: HeaderMap) -> Result<Response> {
        let responses = ExecutionCoordinator::new(config.clone(), self.caller.clone(), self.health.clone())
            .headers(headers)
            .execute(plan)
            .await;
        self.merger.merge(&responses, plan.merge_strategy)
    }

    fn ensure_running(&self) -> Result<()> {
        match self.status() {
            EngineStatus::Running => Ok(()),
            status => Err(FederationError::ServiceUnavailable {
                service: "gateway".to_string(),
                message: format!("engine is {status}"),
            }),
        }
    }

    fn set_status(&self, status: EngineStatus) {
        *self.status.write().unwrap_or_else(|err| err.into_inner()) = status;
    }

    fn register_schemas(&self, config: &FederationConfig) {
        for service in &config.services {
            if let Err(err) = self.registry.register_schema(&service.name, &service.schema) {
                tracing::warn!(service = %service.name, error = %err, "Failed to register schema");
            }
        }
    }
}
