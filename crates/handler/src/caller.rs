use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use futures_util::future::join_all;
use graphfed_planner::{FederationError, Response, Result, ServerError, ServiceConfig, SubQuery};
use http::HeaderMap;
use indexmap::IndexMap;
use serde::Serialize;
use value::ConstValue;

/// One sub-query addressed to its service.
#[derive(Debug, Clone)]
pub struct ServiceCall {
    pub service: ServiceConfig,
    pub sub_query: SubQuery,
    /// Headers forwarded from the incoming request.
    pub headers: HeaderMap,
}

impl ServiceCall {
    pub fn new(service: ServiceConfig, sub_query: SubQuery) -> Self {
        Self {
            service,
            sub_query,
            headers: HeaderMap::new(),
        }
    }

    pub fn headers(self, headers: HeaderMap) -> Self {
        Self { headers, ..self }
    }
}

/// What one service answered, or why it did not.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    pub service_name: String,
    pub data: ConstValue,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ServerError>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub extensions: IndexMap<String, ConstValue>,
    /// Transport level failure of the call.
    #[serde(skip)]
    pub error: Option<FederationError>,
    #[serde(skip)]
    pub latency: Duration,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub metadata: IndexMap<String, ConstValue>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, Vec<String>>,
}

impl ServiceResponse {
    pub fn from_response(service_name: impl Into<String>, response: Response, latency: Duration) -> Self {
        Self {
            service_name: service_name.into(),
            data: response.data,
            errors: response.errors,
            extensions: response.extensions,
            error: None,
            latency,
            metadata: Default::default(),
            headers: response.headers.unwrap_or_default(),
        }
    }

    pub fn from_error(service_name: impl Into<String>, error: FederationError, latency: Duration) -> Self {
        Self {
            service_name: service_name.into(),
            data: ConstValue::Null,
            errors: Vec::new(),
            extensions: Default::default(),
            error: Some(error),
            latency,
            metadata: Default::default(),
            headers: Default::default(),
        }
    }

    pub fn metadata(mut self, name: impl Into<String>, value: impl Into<ConstValue>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.errors.is_empty()
    }
}

/// Responses of a batch in call order, and the failures among them.
#[derive(Debug, Clone)]
pub struct BatchResponse {
    pub responses: Vec<ServiceResponse>,
    pub error: Option<FederationError>,
}

/// The boundary to the services behind the gateway.
#[async_trait]
pub trait ServiceCaller: Send + Sync {
    /// Send one sub-query, returning within its timeout.
    async fn call(&self, call: ServiceCall) -> Result<ServiceResponse>;

    /// Send several calls concurrently.
    async fn call_batch(&self, calls: Vec<ServiceCall>) -> BatchResponse {
        let results = join_all(calls.into_iter().map(|call| {
            let service_name = call.service.name.clone();
            async move {
                self.call(call)
                    .await
                    .unwrap_or_else(|err| ServiceResponse::from_error(service_name, err, Duration::ZERO))
            }
        }))
        .await;

        let failures: Vec<String> = results
            .iter()
            .filter_map(|response| response.error.as_ref())
            .map(ToString::to_string)
            .collect();
        let error = (!failures.is_empty()).then(|| {
            FederationError::Execution(format!(
                "{} of {} service calls failed: {}",
                failures.len(),
                results.len(),
                failures.join("; ")
            ))
        });

        BatchResponse {
            responses: results,
            error,
        }
    }

    async fn is_healthy(&self, service: &ServiceConfig) -> bool;
}
