// src/modules/mod.rs

pub mod discovery;
pub mod kv_watcher;
pub mod listener;
pub mod log_listener;
pub mod service_watcher;
pub mod task;
pub mod trigger;

// Re-export for easier access
pub use discovery::{KvUpdater, WatchRegistry};
pub use kv_watcher::KVWatcherTask;
pub use listener::{ConfigListener, ConfigPath, FailedServiceCheck, Listener, ServiceListener};
pub use log_listener::{LoggingConfigListener, LoggingServiceListener};
pub use service_watcher::ServiceWatcherTask;
pub use task::{LogThrottle, Task, TaskCore};
pub use trigger::Trigger;
