// src/modules/log_listener.rs
use crate::modules::listener::{ConfigListener, FailedServiceCheck, ServiceListener};
use crate::registry_client::{ConfigMap, ServiceDefinition};
use log::{info, warn};
use std::sync::Mutex;

/// Config listener used by the daemon: logs what arrives and keeps the latest value.
pub struct LoggingConfigListener {
    path: String,
    current: Mutex<Option<ConfigMap>>,
}

impl LoggingConfigListener {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            current: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<ConfigMap> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    fn store(&self, config: &ConfigMap) -> bool {
        match self.current.lock() {
            Ok(mut current) => {
                *current = Some(config.clone());
                true
            }
            Err(_) => false,
        }
    }
}

impl ConfigListener for LoggingConfigListener {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn on_init(&self, config: &ConfigMap) -> bool {
        info!("Loaded config '{}' with {} key(s)", self.path, config.len());
        self.store(config)
    }

    fn on_update(&self, new_config: &ConfigMap) -> bool {
        let keys: Vec<&str> = new_config.keys().map(String::as_str).collect();
        info!("Config '{}' updated, keys: {:?}", self.path, keys);
        self.store(new_config)
    }
}

pub struct LoggingServiceListener {
    service_key: String,
}

impl LoggingServiceListener {
    pub fn new(service_key: impl Into<String>) -> Self {
        Self {
            service_key: service_key.into(),
        }
    }
}

impl ServiceListener for LoggingServiceListener {
    fn service_key(&self) -> &str {
        &self.service_key
    }

    fn on_init(&self, definition: &ServiceDefinition) -> bool {
        info!(
            "Service '{}' registered at {}:{} tags={:?} meta={:?}",
            self.service_key, definition.address, definition.port, definition.tags, definition.meta
        );
        true
    }

    fn on_update(&self, definition: &ServiceDefinition) -> bool {
        info!(
            "Service '{}' changed: {}:{} tags={:?} meta={:?}",
            self.service_key, definition.address, definition.port, definition.tags, definition.meta
        );
        true
    }

    fn notify_failed_service_check(&self, failure: &FailedServiceCheck) {
        for check in &failure.checks {
            warn!(
                "Service '{}' check '{}' is {}: {}",
                failure.service_key, check.name, check.status, check.output
            );
        }
        if failure.checks.is_empty() {
            warn!("Service '{}' is {}", failure.service_key, failure.status);
        }
    }
}
