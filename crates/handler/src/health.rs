use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use graphfed_planner::ServiceConfig;
use serde::Serialize;

use crate::ServiceCaller;

pub const DEFAULT_HEALTH_TTL: Duration = Duration::from_secs(30);

/// Last known health of one service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    #[serde(skip)]
    checked_at: Instant,
    pub latency_ms: u64,
    pub check_count: u64,
    pub failure_count: u64,
}

impl HealthStatus {
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.checked_at.elapsed() < ttl
    }
}

/// Health of the services, shared by all requests.
///
/// Entries older than the TTL are checked again instead of being trusted.
#[derive(Debug)]
pub struct HealthCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, HealthStatus>>,
}

impl Default for HealthCache {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_TTL)
    }
}

impl HealthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Default::default(),
        }
    }

    /// The cached health of `service`, if it is still fresh.
    pub fn get(&self, service: &str) -> Option<bool> {
        self.entries
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(service)
            .filter(|status| status.is_fresh(self.ttl))
            .map(|status| status.healthy)
    }

    pub fn record(&self, service: &str, healthy: bool, latency: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(|err| err.into_inner());
        let status = entries.entry(service.to_string()).or_insert_with(|| HealthStatus {
            healthy,
            last_check: Utc::now(),
            checked_at: Instant::now(),
            latency_ms: 0,
            check_count: 0,
            failure_count: 0,
        });
        status.healthy = healthy;
        status.last_check = Utc::now();
        status.checked_at = Instant::now();
        status.latency_ms = latency.as_millis() as u64;
        status.check_count += 1;
        if !healthy {
            status.failure_count += 1;
        }
    }

    pub fn status(&self, service: &str) -> Option<HealthStatus> {
        self.entries
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(service)
            .cloned()
    }

    pub fn statuses(&self) -> HashMap<String, HealthStatus> {
        self.entries.read().unwrap_or_else(|err| err.into_inner()).clone()
    }

    pub fn remove(&self, service: &str) {
        self.entries
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(service);
    }

    /// Cached health of `service`, asking the caller when the entry is missing or stale.
    pub async fn check(&self, caller: &dyn ServiceCaller, service: &ServiceConfig) -> bool {
        if let Some(healthy) = self.get(&service.name) {
            return healthy;
        }

        let start = Instant::now();
        let healthy = caller.is_healthy(service).await;
        self.record(&service.name, healthy, start.elapsed());
        if !healthy {
            tracing::warn!(service = %service.name, "Service is unhealthy");
        }
        healthy
    }
}
