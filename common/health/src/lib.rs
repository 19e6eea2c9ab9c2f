use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Health reporting for components of the service.
///
/// The pipeline process contains several asynchronous loops, and can only
/// be trusted with user data if all of them are running and reporting.
/// Each component registers against the registry with a deadline, and must
/// report healthy more frequently than that deadline, or the process as a
/// whole reports unhealthy.
///
/// Liveness and readiness are distinct k8s concepts and merging them is
/// full of foot-guns, so each probe should get its own registry instance.
#[derive(Clone)]
pub struct HealthRegistry {
    name: &'static str,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Debug, Clone)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the instant
    HealthyUntil(Instant),
    /// Reported unhealthy
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => *until > Instant::now(),
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, String>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the configured deadline.
    pub async fn report_healthy(&self) {
        self.report_healthy_blocking()
    }

    /// Synchronous variant, safe to call from non-async contexts like the
    /// rdkafka stats callback thread.
    pub fn report_healthy_blocking(&self) {
        self.report_status_blocking(ComponentStatus::HealthyUntil(Instant::now() + self.deadline))
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        self.report_status_blocking(status)
    }

    pub fn report_status_blocking(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            Err(err) => warn!("failed to report health status: {}", err),
        }
    }
}

impl HealthRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            components: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new component. The returned handle must report healthy
    /// more often than the given deadline for the registry to pass checks.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status_blocking(ComponentStatus::Starting);
        handle
    }

    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(err) => {
                warn!("health registry {} lock poisoned: {}", self.name, err);
                return HealthStatus::default();
            }
        };

        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (component, component_status) in components.iter() {
            if !component_status.is_healthy() {
                status.healthy = false;
            }
            status
                .components
                .insert(component.clone(), format!("{component_status:?}"));
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn starting_component_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        let _handle = registry
            .register("worker".to_string(), Duration::from_secs(30))
            .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn reported_component_is_healthy_until_deadline() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("worker".to_string(), Duration::from_secs(30))
            .await;
        handle.report_healthy().await;
        assert!(registry.get_status().healthy);
    }

    #[tokio::test]
    async fn expired_deadline_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("worker".to_string(), Duration::from_millis(0))
            .await;
        handle.report_healthy().await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn one_unhealthy_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let healthy = registry
            .register("worker".to_string(), Duration::from_secs(30))
            .await;
        let unhealthy = registry
            .register("kafka".to_string(), Duration::from_secs(30))
            .await;
        healthy.report_healthy().await;
        unhealthy.report_status(ComponentStatus::Unhealthy).await;
        assert!(!registry.get_status().healthy);
    }
}
