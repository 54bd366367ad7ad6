// src/modules/kv_watcher.rs
use crate::error::Result;
use crate::modules::listener::{config_watch_key, notify, ConfigListener};
use crate::modules::task::{Task, TaskCore};
use crate::registry_client::RegistryClient;
use async_trait::async_trait;
use log::{info, warn, Level};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Watches one key-value path and drives a [`ConfigListener`] by comparing
/// the registry's modify index against the last one seen.
pub struct KVWatcherTask {
    core: TaskCore,
    listener: Arc<dyn ConfigListener>,
    client: Arc<dyn RegistryClient>,
    last_modify_index: Option<u64>,
}

impl KVWatcherTask {
    pub fn new(
        listener: Arc<dyn ConfigListener>,
        client: Arc<dyn RegistryClient>,
        interval: Duration,
        stop: CancellationToken,
    ) -> Self {
        let name = config_watch_key(&listener.path());
        Self {
            core: TaskCore::new(name, interval, stop),
            listener,
            client,
            last_modify_index: None,
        }
    }

    pub fn with_log_interval(mut self, log_interval: Duration) -> Self {
        self.core = self.core.with_log_interval(log_interval);
        self
    }

    /// `None` until the path has been observed once.
    pub fn last_modify_index(&self) -> Option<u64> {
        self.last_modify_index
    }
}

#[async_trait]
impl Task for KVWatcherTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    async fn check(&mut self) -> Result<()> {
        let path = self.listener.path();
        let entry = self
            .client
            .fetch_kv(&path, self.last_modify_index)
            .await?;

        let Some(entry) = entry else {
            self.core.log_with_interval(
                "not-provisioned",
                Level::Debug,
                format_args!("Path '{}' is not provisioned yet", path),
            );
            return Ok(());
        };

        let name = self.core.name().to_string();
        match self.last_modify_index {
            None => {
                info!("Initial config for '{}' at index {}", path, entry.modify_index);
                if !notify(&name, "on_init", || self.listener.on_init(&entry.value)) {
                    warn!("Listener for '{}' rejected the initial config", path);
                }
                self.last_modify_index = Some(entry.modify_index);
            }
            Some(last) if entry.modify_index > last => {
                info!(
                    "Config for '{}' changed: index {} -> {}",
                    path, last, entry.modify_index
                );
                if !notify(&name, "on_update", || self.listener.on_update(&entry.value)) {
                    warn!(
                        "Listener for '{}' rejected the update at index {}",
                        path, entry.modify_index
                    );
                }
                self.last_modify_index = Some(entry.modify_index);
            }
            Some(last) if entry.modify_index == last => {
                self.core.log_with_interval(
                    "unchanged",
                    Level::Debug,
                    format_args!("No change for '{}' at index {}", path, last),
                );
            }
            Some(last) => {
                warn!(
                    "Ignoring stale read of '{}': index {} is behind {}",
                    path, entry.modify_index, last
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WatchError;
    use crate::test_utils::{InMemoryRegistry, RecordingConfigListener};
    use serde_json::json;

    const PATH: &str = "test/feature/service/config";

    fn watcher(registry: &Arc<InMemoryRegistry>, listener: &Arc<RecordingConfigListener>) -> KVWatcherTask {
        KVWatcherTask::new(
            listener.clone(),
            registry.clone(),
            Duration::from_secs(1),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_missing_key_never_notifies() {
        let registry = Arc::new(InMemoryRegistry::new());
        let listener = Arc::new(RecordingConfigListener::new(PATH));
        let mut task = watcher(&registry, &listener);

        for _ in 0..3 {
            task.check().await.unwrap();
        }
        assert_eq!(listener.init_count(), 0);
        assert_eq!(listener.update_count(), 0);
        assert_eq!(task.last_modify_index(), None);
    }

    #[tokio::test]
    async fn test_init_update_then_quiet() {
        let registry = Arc::new(InMemoryRegistry::new());
        let listener = Arc::new(RecordingConfigListener::new(PATH));
        let mut task = watcher(&registry, &listener);

        registry.set_kv(PATH, json!({"foo": "bar"}), 5);
        task.check().await.unwrap();
        assert_eq!(listener.init_count(), 1);
        assert_eq!(listener.inits()[0], json!({"foo": "bar"}).as_object().cloned().unwrap());
        assert_eq!(task.last_modify_index(), Some(5));

        registry.set_kv(PATH, json!({"foo": "bar", "flag": true}), 6);
        task.check().await.unwrap();
        assert_eq!(listener.update_count(), 1);
        assert_eq!(listener.updates()[0]["flag"], json!(true));
        assert_eq!(task.last_modify_index(), Some(6));

        task.check().await.unwrap();
        assert_eq!(listener.init_count(), 1);
        assert_eq!(listener.update_count(), 1);
    }

    #[tokio::test]
    async fn test_update_only_on_strictly_greater_index() {
        let registry = Arc::new(InMemoryRegistry::new());
        let listener = Arc::new(RecordingConfigListener::new(PATH));
        let mut task = watcher(&registry, &listener);

        registry.set_kv(PATH, json!({"v": 5}), 5);
        task.check().await.unwrap();

        for index in [6, 6, 9] {
            registry.set_kv(PATH, json!({"v": index}), index);
            task.check().await.unwrap();
        }

        let updates = listener.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0]["v"], json!(6));
        assert_eq!(updates[1]["v"], json!(9));
        assert_eq!(task.last_modify_index(), Some(9));
    }

    #[tokio::test]
    async fn test_stale_index_is_ignored() {
        let registry = Arc::new(InMemoryRegistry::new());
        let listener = Arc::new(RecordingConfigListener::new(PATH));
        let mut task = watcher(&registry, &listener);

        registry.set_kv(PATH, json!({"v": 1}), 10);
        task.check().await.unwrap();

        registry.set_kv(PATH, json!({"v": 0}), 7);
        task.check().await.unwrap();

        assert_eq!(listener.init_count(), 1);
        assert_eq!(listener.update_count(), 0);
        assert_eq!(task.last_modify_index(), Some(10));
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_state_untouched() {
        let registry = Arc::new(InMemoryRegistry::new());
        let listener = Arc::new(RecordingConfigListener::new(PATH));
        let mut task = watcher(&registry, &listener);

        registry.set_kv(PATH, json!({"v": 1}), 3);
        registry.set_failing(true);
        assert!(matches!(task.check().await, Err(WatchError::Http(_))));
        assert_eq!(listener.init_count(), 0);
        assert_eq!(task.last_modify_index(), None);

        registry.set_failing(false);
        task.check().await.unwrap();
        assert_eq!(listener.init_count(), 1);
        assert_eq!(task.last_modify_index(), Some(3));
    }

    #[tokio::test]
    async fn test_rejecting_listener_still_advances_index() {
        let registry = Arc::new(InMemoryRegistry::new());
        let listener = Arc::new(RecordingConfigListener::rejecting(PATH));
        let mut task = watcher(&registry, &listener);

        registry.set_kv(PATH, json!({"v": 1}), 3);
        task.check().await.unwrap();
        assert_eq!(task.last_modify_index(), Some(3));

        registry.set_kv(PATH, json!({"v": 2}), 4);
        task.check().await.unwrap();
        task.check().await.unwrap();
        assert_eq!(listener.update_count(), 1);
        assert_eq!(task.last_modify_index(), Some(4));
    }

    #[tokio::test]
    async fn test_panicking_listener_still_advances_index() {
        let registry = Arc::new(InMemoryRegistry::new());
        let listener = Arc::new(RecordingConfigListener::panicking(PATH));
        let mut task = watcher(&registry, &listener);

        registry.set_kv(PATH, json!({"v": 1}), 3);
        task.check().await.unwrap();
        assert_eq!(listener.init_count(), 1);
        assert_eq!(task.last_modify_index(), Some(3));

        // Same index: no second init.
        task.check().await.unwrap();
        assert_eq!(listener.init_count(), 1);
        assert_eq!(listener.update_count(), 0);

        registry.set_kv(PATH, json!({"v": 2}), 4);
        task.check().await.unwrap();
        assert_eq!(listener.update_count(), 1);
        assert_eq!(task.last_modify_index(), Some(4));

        task.check().await.unwrap();
        assert_eq!(listener.update_count(), 1);
    }

    #[tokio::test]
    async fn test_task_name_is_watch_key() {
        let registry = Arc::new(InMemoryRegistry::new());
        let listener = Arc::new(RecordingConfigListener::new(PATH));
        let task = watcher(&registry, &listener);
        assert_eq!(task.core().name(), "kv:test/feature/service/config");
    }
}
