// src/modules/discovery.rs
use crate::config::TriggerConfig;
use crate::error::{Result, WatchError};
use crate::modules::kv_watcher::KVWatcherTask;
use crate::modules::listener::{validate_key, ConfigListener, Listener, ServiceListener};
use crate::modules::service_watcher::ServiceWatcherTask;
use crate::modules::task::Task;
use crate::modules::trigger::Trigger;
use crate::registry_client::{ConfigMap, RegistryClient, ServiceDefinition};
use log::{debug, info};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tracks the running watches by key. At most one watch exists per key.
pub struct WatchRegistry {
    client: Arc<dyn RegistryClient>,
    trigger: Trigger,
    keys: BTreeSet<String>,
    shutdown: CancellationToken,
    log_interval: Duration,
}

impl WatchRegistry {
    pub fn new(client: Arc<dyn RegistryClient>, trigger_config: &TriggerConfig) -> Self {
        Self {
            client,
            trigger: Trigger::new(trigger_config.stop_timeout()),
            keys: BTreeSet::new(),
            shutdown: CancellationToken::new(),
            log_interval: trigger_config.log_interval(),
        }
    }

    /// Registers `task` under `key`. Fails if the key is already watched.
    pub fn add_watch(&mut self, key: &str, task: Box<dyn Task>) -> Result<()> {
        if self.keys.contains(key) {
            return Err(WatchError::DuplicateWatch(key.to_string()));
        }
        if task.core().name() != key {
            return Err(WatchError::InvalidKey(format!(
                "task '{}' registered under watch key '{}'",
                task.core().name(),
                key
            )));
        }
        self.keys.insert(key.to_string());
        self.trigger.add_task(task);
        debug!("Added watch '{}'", key);
        Ok(())
    }

    pub fn add_config_watch(
        &mut self,
        listener: Arc<dyn ConfigListener>,
        interval: Duration,
    ) -> Result<String> {
        let task = KVWatcherTask::new(
            listener,
            self.client.clone(),
            interval,
            self.shutdown.child_token(),
        )
        .with_log_interval(self.log_interval);
        let key = task.core().name().to_string();
        self.add_watch(&key, Box::new(task))?;
        Ok(key)
    }

    pub fn add_service_watch(
        &mut self,
        listener: Arc<dyn ServiceListener>,
        interval: Duration,
    ) -> Result<String> {
        let task = ServiceWatcherTask::new(
            listener,
            self.client.clone(),
            interval,
            self.shutdown.child_token(),
        )
        .with_log_interval(self.log_interval);
        let key = task.core().name().to_string();
        self.add_watch(&key, Box::new(task))?;
        Ok(key)
    }

    pub fn add_listener_watch(&mut self, listener: Listener, interval: Duration) -> Result<String> {
        match listener {
            Listener::Config(listener) => self.add_config_watch(listener, interval),
            Listener::Service(listener) => self.add_service_watch(listener, interval),
        }
    }

    /// Starts every registered watch. Watches added later start immediately.
    pub fn start_all(&mut self) -> Result<()> {
        if self.keys.is_empty() {
            return Err(WatchError::NoWatches);
        }
        if self.trigger.is_running() {
            debug!("Watches already running");
            return Ok(());
        }
        info!("Starting {} watch(es)", self.keys.len());
        self.trigger.run();
        Ok(())
    }

    /// Runs one check of every registered watch without scheduling them.
    pub async fn check_all_once(&mut self) {
        self.trigger.check_all().await;
    }

    /// Stops and removes one watch. Returns false if `key` is not watched.
    pub async fn stop_watch(&mut self, key: &str) -> bool {
        if !self.keys.remove(key) {
            return false;
        }
        self.trigger.stop_task(key).await
    }

    /// Stops every watch and waits for their loops to exit.
    pub async fn stop_all(&mut self) {
        self.shutdown.cancel();
        self.trigger.stop_tasks().await;
        self.keys.clear();
        self.shutdown = CancellationToken::new();
        info!("All watches stopped");
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub async fn fetch_config(&self, path: &str) -> Result<Option<ConfigMap>> {
        Ok(self.client.fetch_kv(path, None).await?.map(|e| e.value))
    }

    pub async fn store_config(&self, path: &str, config: &ConfigMap) -> Result<bool> {
        self.client.put_kv(path, config, None).await
    }

    /// Removes the config at `path`. Watches on it go quiet until it returns.
    pub async fn delete_config(&self, path: &str) -> Result<bool> {
        self.client.delete_kv(path, false).await
    }

    pub async fn register_service(&self, definition: &ServiceDefinition) -> Result<()> {
        validate_key(&definition.key)?;
        self.client.register_service(definition).await?;
        info!("Registered service '{}'", definition.key);
        Ok(())
    }

    pub async fn update_service(&self, definition: &ServiceDefinition) -> Result<()> {
        validate_key(&definition.key)?;
        self.client.update_service(definition).await?;
        info!("Updated service '{}'", definition.key);
        Ok(())
    }

    /// Returns false if the service was not registered.
    pub async fn deregister_service(&self, service_key: &str) -> Result<bool> {
        let removed = self.client.deregister_service(service_key).await?;
        if removed {
            info!("Deregistered service '{}'", service_key);
        } else {
            debug!("Service '{}' was not registered", service_key);
        }
        Ok(removed)
    }

    pub fn kv_updater(&self, path: &str) -> KvUpdater {
        KvUpdater {
            client: self.client.clone(),
            path: path.to_string(),
        }
    }
}

/// Merges partial updates into one watched config entry.
pub struct KvUpdater {
    client: Arc<dyn RegistryClient>,
    path: String,
}

impl KvUpdater {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn merge(&self, partial: &ConfigMap) -> Result<bool> {
        self.client.merge_kv(&self.path, partial).await
    }
}
