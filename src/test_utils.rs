// src/test_utils.rs
use crate::error::{Result, WatchError};
use crate::modules::listener::{ConfigListener, FailedServiceCheck, ServiceListener};
use crate::registry_client::{ConfigMap, KvEntry, RegistryClient, ServiceDefinition, ServiceState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Registry fake with programmable contents and failure injection.
pub(crate) struct InMemoryRegistry {
    kv: Mutex<HashMap<String, KvEntry>>,
    services: Mutex<HashMap<String, ServiceState>>,
    failing: AtomicBool,
    last_index: AtomicU64,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            kv: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            last_index: AtomicU64::new(0),
        }
    }

    /// Stores `value` at `path` with an explicit modify index.
    pub fn set_kv(&self, path: &str, value: serde_json::Value, modify_index: u64) {
        let value = value.as_object().cloned().unwrap_or_default();
        self.last_index.fetch_max(modify_index, Ordering::SeqCst);
        self.kv.lock().unwrap().insert(
            path.to_string(),
            KvEntry {
                value,
                modify_index,
            },
        );
    }

    pub fn kv_value(&self, path: &str) -> Option<KvEntry> {
        self.kv.lock().unwrap().get(path).cloned()
    }

    pub fn set_service(&self, state: ServiceState) {
        self.services
            .lock()
            .unwrap()
            .insert(state.definition.key.clone(), state);
    }

    pub fn remove_service(&self, key: &str) {
        self.services.lock().unwrap().remove(key);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WatchError::Http("registry unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn fetch_kv(&self, path: &str, _last_index: Option<u64>) -> Result<Option<KvEntry>> {
        self.check_reachable()?;
        Ok(self.kv_value(path))
    }

    async fn fetch_service(&self, service_key: &str) -> Result<Option<ServiceState>> {
        self.check_reachable()?;
        Ok(self.services.lock().unwrap().get(service_key).cloned())
    }

    async fn put_kv(&self, path: &str, value: &ConfigMap, cas: Option<u64>) -> Result<bool> {
        self.check_reachable()?;
        let mut kv = self.kv.lock().unwrap();
        let current = kv.get(path).map(|e| e.modify_index).unwrap_or(0);
        if let Some(expected) = cas {
            if expected != current {
                return Ok(false);
            }
        }
        let modify_index = self.last_index.fetch_add(1, Ordering::SeqCst) + 1;
        kv.insert(
            path.to_string(),
            KvEntry {
                value: value.clone(),
                modify_index,
            },
        );
        Ok(true)
    }

    async fn delete_kv(&self, path: &str, recurse: bool) -> Result<bool> {
        self.check_reachable()?;
        let mut kv = self.kv.lock().unwrap();
        if recurse {
            kv.retain(|key, _| !key.starts_with(path));
        } else {
            kv.remove(path);
        }
        Ok(true)
    }

    async fn register_service(&self, definition: &ServiceDefinition) -> Result<()> {
        self.check_reachable()?;
        self.set_service(ServiceState::passing(definition.clone()));
        Ok(())
    }

    async fn deregister_service(&self, service_key: &str) -> Result<bool> {
        self.check_reachable()?;
        Ok(self.services.lock().unwrap().remove(service_key).is_some())
    }
}

/// Config listener that records every callback.
pub(crate) struct RecordingConfigListener {
    path: String,
    accept: bool,
    panics: bool,
    inits: Mutex<Vec<ConfigMap>>,
    updates: Mutex<Vec<ConfigMap>>,
}

impl RecordingConfigListener {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            accept: true,
            panics: false,
            inits: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(path: &str) -> Self {
        Self {
            accept: false,
            ..Self::new(path)
        }
    }

    /// Records every callback, then panics.
    pub fn panicking(path: &str) -> Self {
        Self {
            panics: true,
            ..Self::new(path)
        }
    }

    pub fn inits(&self) -> Vec<ConfigMap> {
        self.inits.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<ConfigMap> {
        self.updates.lock().unwrap().clone()
    }

    pub fn init_count(&self) -> usize {
        self.inits.lock().unwrap().len()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

impl ConfigListener for RecordingConfigListener {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn on_init(&self, config: &ConfigMap) -> bool {
        self.inits.lock().unwrap().push(config.clone());
        if self.panics {
            panic!("on_init failed for {}", self.path);
        }
        self.accept
    }

    fn on_update(&self, new_config: &ConfigMap) -> bool {
        self.updates.lock().unwrap().push(new_config.clone());
        if self.panics {
            panic!("on_update failed for {}", self.path);
        }
        self.accept
    }
}

/// Service listener that records every callback.
pub(crate) struct RecordingServiceListener {
    service_key: String,
    panics: bool,
    inits: Mutex<Vec<ServiceDefinition>>,
    updates: Mutex<Vec<ServiceDefinition>>,
    failures: Mutex<Vec<FailedServiceCheck>>,
}

impl RecordingServiceListener {
    pub fn new(service_key: &str) -> Self {
        Self {
            service_key: service_key.to_string(),
            panics: false,
            inits: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Records every callback, then panics.
    pub fn panicking(service_key: &str) -> Self {
        Self {
            panics: true,
            ..Self::new(service_key)
        }
    }

    pub fn inits(&self) -> Vec<ServiceDefinition> {
        self.inits.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<ServiceDefinition> {
        self.updates.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<FailedServiceCheck> {
        self.failures.lock().unwrap().clone()
    }

    pub fn init_count(&self) -> usize {
        self.inits.lock().unwrap().len()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

impl ServiceListener for RecordingServiceListener {
    fn service_key(&self) -> &str {
        &self.service_key
    }

    fn on_init(&self, definition: &ServiceDefinition) -> bool {
        self.inits.lock().unwrap().push(definition.clone());
        if self.panics {
            panic!("on_init failed for {}", self.service_key);
        }
        true
    }

    fn on_update(&self, definition: &ServiceDefinition) -> bool {
        self.updates.lock().unwrap().push(definition.clone());
        if self.panics {
            panic!("on_update failed for {}", self.service_key);
        }
        true
    }

    fn notify_failed_service_check(&self, failure: &FailedServiceCheck) {
        self.failures.lock().unwrap().push(failure.clone());
        if self.panics {
            panic!("notify_failed_service_check failed for {}", self.service_key);
        }
    }
}
