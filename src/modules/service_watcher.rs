// src/modules/service_watcher.rs
use crate::error::Result;
use crate::modules::listener::{notify, service_watch_key, FailedServiceCheck, ServiceListener};
use crate::modules::task::{Task, TaskCore};
use crate::registry_client::{HealthStatus, RegistryClient, ServiceDefinition};
use async_trait::async_trait;
use log::{info, warn, Level};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Watches one registered service. Services carry no modify index, so the
/// last seen definition is kept and compared field by field.
pub struct ServiceWatcherTask {
    core: TaskCore,
    listener: Arc<dyn ServiceListener>,
    client: Arc<dyn RegistryClient>,
    snapshot: Option<ServiceDefinition>,
}

impl ServiceWatcherTask {
    pub fn new(
        listener: Arc<dyn ServiceListener>,
        client: Arc<dyn RegistryClient>,
        interval: Duration,
        stop: CancellationToken,
    ) -> Self {
        let name = service_watch_key(listener.service_key());
        Self {
            core: TaskCore::new(name, interval, stop),
            listener,
            client,
            snapshot: None,
        }
    }

    pub fn with_log_interval(mut self, log_interval: Duration) -> Self {
        self.core = self.core.with_log_interval(log_interval);
        self
    }

    pub fn snapshot(&self) -> Option<&ServiceDefinition> {
        self.snapshot.as_ref()
    }
}

#[async_trait]
impl Task for ServiceWatcherTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    async fn check(&mut self) -> Result<()> {
        let service_key = self.listener.service_key().to_string();
        let Some(state) = self.client.fetch_service(&service_key).await? else {
            let message = if self.snapshot.is_some() {
                "is no longer registered"
            } else {
                "is not registered yet"
            };
            self.core.log_with_interval(
                "not-registered",
                Level::Debug,
                format_args!("Service '{}' {}", service_key, message),
            );
            return Ok(());
        };

        let name = self.core.name().to_string();
        let definition = state.definition;
        let changed = self
            .snapshot
            .as_ref()
            .map(|previous| previous.content_differs(&definition));
        match changed {
            None => {
                info!("Initial definition for service '{}'", service_key);
                if !notify(&name, "on_init", || self.listener.on_init(&definition)) {
                    warn!("Listener for service '{}' rejected the initial definition", service_key);
                }
                self.snapshot = Some(definition);
            }
            Some(true) => {
                info!("Definition of service '{}' changed", service_key);
                if !notify(&name, "on_update", || self.listener.on_update(&definition)) {
                    warn!("Listener for service '{}' rejected the update", service_key);
                }
                self.snapshot = Some(definition);
            }
            Some(false) => {
                self.core.log_with_interval(
                    "unchanged",
                    Level::Debug,
                    format_args!("No change for service '{}'", service_key),
                );
            }
        }

        if state.health == HealthStatus::Critical {
            warn!("Service '{}' reports critical health", service_key);
            let failure = FailedServiceCheck {
                service_key: service_key.clone(),
                status: state.health,
                checks: state.checks,
            };
            notify(&name, "notify_failed_service_check", || {
                self.listener.notify_failed_service_check(&failure);
                true
            });
        }
        Ok(())
    }
}
