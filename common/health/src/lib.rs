use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Liveness reporting for the supervision loops of the service.
///
/// Every relay worker and consumer session runs its own asynchronous
/// loop, and the process is only worth keeping alive while each of those
/// loops keeps making progress. Components register here and report
/// through their [`HealthHandle`]:
///   - a component that reported unhealthy fails the check,
///   - a component whose last report is older than its deadline is
///     considered stalled and fails the check,
///   - a component that was closed on purpose reports [`ComponentStatus::Stopped`]
///     and no longer takes part in the verdict, so a graceful drain does
///     not get the pod killed halfway through.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if every active component is healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy, e.g. a consumer session waiting to be recreated
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
    /// Closed by its owner, ignored by the overall verdict
    Stopped,
}

impl ComponentStatus {
    /// Returns true if the component currently counts as live.
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => until.gt(&time::OffsetDateTime::now_utc()),
            ComponentStatus::Stopped => true,
            _ => false,
        }
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Asynchronously report healthy, returns when the message is queued.
    /// Must be called more frequently than the configured deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    /// Asynchronously report component status, returns when the message is queued.
    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }

    /// Synchronously report as healthy. Used from librdkafka callbacks,
    /// which run on the client's own threads.
    pub fn report_healthy_blocking(&self) {
        self.report_status_blocking(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    /// Synchronously report component status, returns when the message is queued.
    pub fn report_status_blocking(&self, status: ComponentStatus) {
        // Blocking inside a runtime worker would panic, hand it to the runtime instead
        if let Ok(h) = runtime::Handle::try_current() {
            let handle = self.clone();
            h.spawn(async move { handle.report_status(status).await });
        } else {
            let message = HealthMessage {
                component: self.component.clone(),
                status,
            };
            if let Err(err) = self.sender.blocking_send(message) {
                warn!("failed to report health status: {}", err)
            }
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    /// Creates the registry and spawns its update loop, must be called
    /// from within a tokio runtime.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let mut map = components.write().unwrap_or_else(PoisonError::into_inner);
                _ = map.insert(message.component, message.status);
            }
        });

        registry
    }

    /// Registers a new component in the registry. The returned handle should be passed
    /// to the relay or session, to allow it to report its health status.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Returns the overall process status, computed from the status of all the components
    /// currently registered. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        // Unhealthy until at least one component registered
        let result = HealthStatus {
            healthy: !components.is_empty(),
            components: Default::default(),
        };
        let now = time::OffsetDateTime::now_utc();

        let result = components
            .iter()
            .fold(result, |mut result, (name, status)| {
                let status = match status {
                    ComponentStatus::HealthyUntil(until) if until.le(&now) => {
                        ComponentStatus::Stalled
                    }
                    other => other.clone(),
                };
                if !matches!(
                    status,
                    ComponentStatus::HealthyUntil(_) | ComponentStatus::Stopped
                ) {
                    result.healthy = false;
                }
                _ = result.components.insert(name.clone(), status);
                result
            });
        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::{ComponentStatus, HealthRegistry, HealthStatus};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::ops::{Add, Sub};
    use std::time::Duration;
    use time::OffsetDateTime;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc().add(Duration::from_secs(5));
        while !check() && OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn relay_worker_lifecycle() {
        let registry = HealthRegistry::new("liveness");

        let handle = registry
            .register("relay".to_string(), Duration::from_secs(30))
            .await;
        assert_eq!(handle.component(), "relay");
        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("relay"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("relay"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn stale_report_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("session".to_string(), Duration::from_secs(30))
            .await;

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(Duration::from_secs(1)),
            ))
            .await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("session"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn stopped_components_do_not_fail_the_check() {
        let registry = HealthRegistry::new("liveness");
        let relay = registry
            .register("relay".to_string(), Duration::from_secs(30))
            .await;
        let session = registry
            .register("session".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 2).await;

        relay.report_healthy().await;
        assert_or_retry(|| {
            registry.get_status().components.get("relay") != Some(&ComponentStatus::Starting)
        })
        .await;
        // Session still starting
        assert!(!registry.get_status().healthy);

        session.report_status(ComponentStatus::Stopped).await;
        assert_or_retry(|| registry.get_status().healthy).await;

        relay.report_status(ComponentStatus::Stopped).await;
        assert_or_retry(|| {
            registry.get_status().components.get("relay") == Some(&ComponentStatus::Stopped)
        })
        .await;
        assert!(registry.get_status().healthy);
    }

    #[tokio::test]
    async fn blocking_report_from_runtime_is_spawned() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("client".to_string(), Duration::from_secs(30))
            .await;

        handle.report_healthy_blocking();
        assert_or_retry(|| registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[test]
    fn stopped_counts_as_live() {
        assert!(ComponentStatus::Stopped.is_healthy());
        assert!(!ComponentStatus::Stalled.is_healthy());
        assert!(!ComponentStatus::Starting.is_healthy());
    }
}
