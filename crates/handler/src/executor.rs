use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use graphfed_planner::{ExecutionPlan, FederationConfig, FederationError, SubQuery};
use http::HeaderMap;
use tokio::{sync::mpsc, time::Instant};

use crate::{HealthCache, ServiceCall, ServiceCaller, ServiceResponse};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Planned,
    Dispatching,
    Collecting,
    Done,
    Failed,
}

impl Display for ExecutionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionState::Planned => "planned",
            ExecutionState::Dispatching => "dispatching",
            ExecutionState::Collecting => "collecting",
            ExecutionState::Done => "done",
            ExecutionState::Failed => "failed",
        })
    }
}

/// Runs the sub-queries of one plan concurrently under a shared deadline.
///
/// A failing sub-query never fails the whole execution: it becomes a [`ServiceResponse`]
/// carrying the error, and the caller merges it with the others.
pub struct ExecutionCoordinator {
    config: Arc<FederationConfig>,
    caller: Arc<dyn ServiceCaller>,
    health: Arc<HealthCache>,
    headers: HeaderMap,
    state: ExecutionState,
}

impl ExecutionCoordinator {
    pub fn new(config: Arc<FederationConfig>, caller: Arc<dyn ServiceCaller>, health: Arc<HealthCache>) -> Self {
        Self {
            config,
            caller,
            health,
            headers: HeaderMap::new(),
            state: ExecutionState::Planned,
        }
    }

    /// Headers forwarded with every service call.
    pub fn headers(self, headers: HeaderMap) -> Self {
        Self { headers, ..self }
    }

    #[inline]
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// One response per sub-query, in plan order.
    pub async fn execute(&mut self, plan: &ExecutionPlan) -> Vec<ServiceResponse> {
        let deadline = Instant::now() + self.config.query_timeout;
        self.state = ExecutionState::Dispatching;

        let (tx, mut rx) = mpsc::channel(plan.sub_queries.len().max(1));
        let mut tasks = Vec::with_capacity(plan.sub_queries.len());
        for (index, sub_query) in plan.sub_queries.iter().enumerate() {
            let tx = tx.clone();
            let task = SubQueryTask {
                config: self.config.clone(),
                caller: self.caller.clone(),
                health: self.health.clone(),
                headers: self.headers.clone(),
                sub_query: sub_query.clone(),
            };
            tasks.push(tokio::spawn(async move {
                let response = task.run().await;
                tx.send((index, response)).await.ok();
            }));
        }
        drop(tx);

        self.state = ExecutionState::Collecting;
        let mut responses: Vec<Option<ServiceResponse>> = vec![None; plan.sub_queries.len()];
        let mut deadline_exceeded = false;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((index, response))) => responses[index] = Some(response),
                Ok(None) => break,
                Err(_) => {
                    deadline_exceeded = true;
                    break;
                },
            }
        }

        if deadline_exceeded {
            for task in &tasks {
                task.abort();
            }
        }

        let timeout = self.config.query_timeout;
        let mut collected = Vec::with_capacity(responses.len());
        for ((response, task), sub_query) in responses.into_iter().zip(tasks).zip(&plan.sub_queries) {
            let response = match response {
                Some(response) => response,
                None => match task.await {
                    Err(err) if err.is_panic() => failed_task_response(sub_query, "sub-query task panicked"),
                    _ if deadline_exceeded => deadline_response(sub_query, timeout),
                    _ => failed_task_response(sub_query, "sub-query task ended without a response"),
                },
            };
            collected.push(response);
        }
        let responses = collected;

        self.state = match deadline_exceeded {
            true => ExecutionState::Failed,
            false => ExecutionState::Done,
        };

        tracing::debug!(
            sub_queries = plan.sub_queries.len(),
            failed = responses.iter().filter(|response| response.error.is_some()).count(),
            state = %self.state,
            "Executed plan"
        );
        responses
    }
}

struct SubQueryTask {
    config: Arc<FederationConfig>,
    caller: Arc<dyn ServiceCaller>,
    health: Arc<HealthCache>,
    headers: HeaderMap,
    sub_query: SubQuery,
}

impl SubQueryTask {
    async fn run(self) -> ServiceResponse {
        let start = std::time::Instant::now();
        let service_name = self.sub_query.service_name.clone();

        let Some(service) = self.config.service(&service_name) else {
            tracing::error!(service = %service_name, "Service not found");
            return ServiceResponse::from_error(
                &service_name,
                FederationError::ServiceNotFound(service_name.clone()),
                start.elapsed(),
            );
        };

        if !self.health.check(self.caller.as_ref(), service).await {
            return ServiceResponse::from_error(
                &service_name,
                FederationError::ServiceUnavailable {
                    service: service_name.clone(),
                    message: "service is marked unhealthy".to_string(),
                },
                start.elapsed(),
            );
        }

        let call = ServiceCall::new(service.clone(), self.sub_query).headers(self.headers);
        match self.caller.call(call).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(service = %service_name, error = %err, "Sub-query failed");
                ServiceResponse::from_error(&service_name, err, start.elapsed())
            },
        }
    }
}

fn deadline_response(sub_query: &SubQuery, timeout: Duration) -> ServiceResponse {
    tracing::error!(service = %sub_query.service_name, "Sub-query did not finish before the deadline");
    ServiceResponse::from_error(
        &sub_query.service_name,
        FederationError::Timeout {
            service: sub_query.service_name.clone(),
            message: format!("query deadline of {}ms exceeded", timeout.as_millis()),
        },
        timeout,
    )
}

fn failed_task_response(sub_query: &SubQuery, message: &str) -> ServiceResponse {
    tracing::error!(service = %sub_query.service_name, "{}", message);
    ServiceResponse::from_error(
        &sub_query.service_name,
        FederationError::Execution(format!("{message} for service {}", sub_query.service_name)),
        Duration::ZERO,
    )
}
