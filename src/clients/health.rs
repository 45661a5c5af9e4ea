use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::{circuit_breaker::CircuitBreaker, queue::DurableQueue},
    models::{
        circuit_breaker::CircuitState,
        health::{ComponentHealth, HealthCheckResponse, HealthStatus},
    },
    services::sinks::OrderStore,
};

pub const SERVICE_NAME: &str = "webhook-pipeline";

pub struct HealthChecker {
    queue: Arc<dyn DurableQueue>,
    store: Arc<dyn OrderStore>,
    breaker: Arc<CircuitBreaker>,
}

impl HealthChecker {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        store: Arc<dyn OrderStore>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            queue,
            store,
            breaker,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let (queue_health, storage_health) = tokio::join!(self.check_queue(), self.check_storage());

        let mut checks = HashMap::new();
        checks.insert("queue".to_string(), queue_health);
        checks.insert("storage".to_string(), storage_health);
        checks.insert("circuit_breaker".to_string(), self.check_circuit_breaker());

        HealthCheckResponse {
            status: overall_status(&checks),
            service: SERVICE_NAME.to_string(),
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check_queue(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.queue.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Queue health check passed");
                ComponentHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Queue health check failed");
                ComponentHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    async fn check_storage(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.store.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Storage health check passed");
                ComponentHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Storage health check failed");
                ComponentHealth::unhealthy(format!("Health check query failed: {}", e))
            }
        }
    }

    fn check_circuit_breaker(&self) -> ComponentHealth {
        let state = self.breaker.state();
        debug!(circuit_state = state.as_str(), "Circuit breaker state checked");

        match state {
            CircuitState::Closed => ComponentHealth::healthy(0).with_detail(state.as_str()),
            CircuitState::HalfOpen => ComponentHealth::degraded("Circuit breaker in recovery mode"),
            CircuitState::Open => {
                ComponentHealth::degraded("Circuit breaker open, events processed synchronously")
            }
        }
    }
}

fn overall_status(checks: &HashMap<String, ComponentHealth>) -> HealthStatus {
    if checks
        .values()
        .any(|health| health.status == HealthStatus::Unhealthy)
    {
        HealthStatus::Unhealthy
    } else if checks
        .values()
        .any(|health| health.status == HealthStatus::Degraded)
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
