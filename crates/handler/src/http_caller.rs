use std::{
    collections::HashMap,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use async_trait::async_trait;
use graphfed_planner::{FederationError, Request, Response, Result, ServiceConfig};
use http::{
    header::{HeaderName, HeaderValue},
    HeaderMap,
};
use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::instrument;

use crate::{ServiceCall, ServiceCaller, ServiceResponse};

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(Default::default);

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub timeouts: u64,
}

/// Calls services with GraphQL over HTTP.
#[derive(Debug, Default)]
pub struct HttpCaller {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
}

impl HttpCaller {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn stats(&self) -> CallerStats {
        CallerStats {
            total: self.total.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    async fn send(&self, call: &ServiceCall) -> Result<Response> {
        let service = &call.service;
        let request = Request::new(call.sub_query.query.clone()).variables(call.sub_query.variables.clone());

        let raw_resp = HTTP_CLIENT
            .post(service.url())
            .headers(request_headers(service, &call.headers))
            .timeout(call.sub_query.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|err| transport_error(&service.name, err))?;

        if !raw_resp.status().is_success() {
            let status = raw_resp.status().as_u16();
            let body = raw_resp.text().await.unwrap_or_default();
            return Err(FederationError::ServiceCall {
                service: service.name.clone(),
                message: format!("received non-2xx response, body: \"{body}\""),
                status: Some(status),
            });
        }

        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (key, val) in raw_resp.headers().iter() {
            if let Ok(val) = val.to_str() {
                headers.entry(key.as_str().to_string()).or_default().push(val.to_string());
            }
        }

        let mut resp = raw_resp
            .json::<Response>()
            .await
            .map_err(|err| transport_error(&service.name, err))?;
        resp.headers = Some(headers);
        Ok(resp)
    }
}

#[async_trait]
impl ServiceCaller for HttpCaller {
    #[instrument(err(Debug), skip_all, fields(service = %call.service.name), level = "trace")]
    async fn call(&self, call: ServiceCall) -> Result<ServiceResponse> {
        self.total.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        match self.send(&call).await {
            Ok(resp) => {
                self.successful.fetch_add(1, Ordering::Relaxed);
                Ok(ServiceResponse::from_response(&call.service.name, resp, start.elapsed()))
            },
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if matches!(err, FederationError::Timeout { .. }) {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                Err(err)
            },
        }
    }

    async fn is_healthy(&self, service: &ServiceConfig) -> bool {
        let (Some(url), Some(health_check)) = (service.health_url(), service.health_check.as_ref()) else {
            return true;
        };

        match HTTP_CLIENT.get(&url).timeout(health_check.timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(service = %service.name, error = %err, "Health check failed");
                false
            },
        }
    }
}

fn transport_error(service: &str, err: reqwest::Error) -> FederationError {
    if err.is_timeout() {
        FederationError::Timeout {
            service: service.to_string(),
            message: err.to_string(),
        }
    } else if err.is_connect() {
        FederationError::ServiceUnavailable {
            service: service.to_string(),
            message: err.to_string(),
        }
    } else {
        FederationError::ServiceCall {
            service: service.to_string(),
            message: err.to_string(),
            status: err.status().map(|status| status.as_u16()),
        }
    }
}

/// Static service headers followed by the forwarded request headers.
fn request_headers(service: &ServiceConfig, forwarded: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &service.headers {
        match (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            },
            _ => tracing::warn!(service = %service.name, header = %name, "Ignoring invalid header"),
        }
    }
    for (name, value) in forwarded {
        headers.append(name, value.clone());
    }
    headers
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn static_headers_come_first() {
        let mut service = ServiceConfig::new("users", "http://users.local");
        service.headers.insert("x-api-key".to_string(), "secret".to_string());
        service.headers.insert("bad header".to_string(), "x".to_string());

        let mut forwarded = HeaderMap::new();
        forwarded.insert("authorization", HeaderValue::from_static("Bearer t"));

        let headers = request_headers(&service, &forwarded);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["x-api-key"], "secret");
        assert_eq!(headers["authorization"], "Bearer t");
    }

    #[tokio::test]
    async fn disabled_health_check_is_healthy() {
        let caller = HttpCaller::new();
        assert!(caller.is_healthy(&ServiceConfig::new("users", "http://users.local")).await);
        assert_eq!(caller.stats(), CallerStats::default());
    }
}
