// src/modules/listener.rs
use crate::error::{Result, WatchError};
use crate::registry_client::{ConfigMap, HealthCheck, HealthStatus, ServiceDefinition};
use log::error;
use regex::Regex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static key pattern"))
}

/// Keys end up inside request URLs, so only a conservative alphabet is allowed.
pub fn validate_key(key: &str) -> Result<()> {
    if key_pattern().is_match(key) {
        Ok(())
    } else {
        Err(WatchError::InvalidKey(format!(
            "'{}' must match {}",
            key,
            key_pattern().as_str()
        )))
    }
}

/// Structured location of a config entry: `project/env/feature/service/detail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPath {
    pub project: String,
    pub env: String,
    pub feature: String,
    pub service: String,
    pub detail: String,
}

impl ConfigPath {
    pub fn new(project: &str, feature: &str, service: &str) -> Result<Self> {
        for segment in [project, feature, service] {
            validate_key(segment)?;
        }
        Ok(Self {
            project: project.to_string(),
            env: "dev".to_string(),
            feature: feature.to_string(),
            service: service.to_string(),
            detail: "config".to_string(),
        })
    }

    pub fn with_env(mut self, env: &str) -> Result<Self> {
        validate_key(env)?;
        self.env = env.to_string();
        Ok(self)
    }

    pub fn with_detail(mut self, detail: &str) -> Result<Self> {
        validate_key(detail)?;
        self.detail = detail.to_string();
        Ok(self)
    }

    pub fn compose_path(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.project, self.env, self.feature, self.service, self.detail
        )
    }
}

/// Receives the decoded config stored at one key-value path.
pub trait ConfigListener: Send + Sync {
    fn path(&self) -> String;

    /// First observation of the path. The return value is logged only.
    fn on_init(&self, config: &ConfigMap) -> bool;

    fn on_update(&self, new_config: &ConfigMap) -> bool;
}

/// Payload for [`ServiceListener::notify_failed_service_check`].
#[derive(Debug, Clone, PartialEq)]
pub struct FailedServiceCheck {
    pub service_key: String,
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
}

/// Receives the registered definition of one service.
pub trait ServiceListener: Send + Sync {
    fn service_key(&self) -> &str;

    fn on_init(&self, definition: &ServiceDefinition) -> bool;

    fn on_update(&self, definition: &ServiceDefinition) -> bool;

    /// Called on every check where the registry reports the service as critical.
    fn notify_failed_service_check(&self, _failure: &FailedServiceCheck) {}
}

#[derive(Clone)]
pub enum Listener {
    Config(Arc<dyn ConfigListener>),
    Service(Arc<dyn ServiceListener>),
}

impl Listener {
    pub fn watch_key(&self) -> String {
        match self {
            Listener::Config(listener) => config_watch_key(&listener.path()),
            Listener::Service(listener) => service_watch_key(listener.service_key()),
        }
    }
}

pub fn config_watch_key(path: &str) -> String {
    format!("kv:{}", path)
}

pub fn service_watch_key(service_key: &str) -> String {
    format!("service:{}", service_key)
}

/// Runs a listener callback. A panic counts as a rejection.
pub(crate) fn notify(watch: &str, callback: &str, f: impl FnOnce() -> bool) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(accepted) => accepted,
        Err(_) => {
            error!("Listener for '{}' panicked in {}", watch, callback);
            false
        }
    }
}
