// src/modules/task.rs
use crate::error::Result;
use async_trait::async_trait;
use log::Level;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Emits at most one message of each kind per window. Kinds are throttled
/// independently, so a frequent message cannot hide a rare one.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last_logged: HashMap<&'static str, Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: HashMap::new(),
        }
    }

    /// Returns true if the window for `kind` is open, and closes it.
    pub fn allow(&mut self, kind: &'static str) -> bool {
        let now = Instant::now();
        match self.last_logged.get(kind) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                self.last_logged.insert(kind, now);
                true
            }
        }
    }
}

/// State shared by every periodic task: identity, schedule and stop signal.
#[derive(Debug)]
pub struct TaskCore {
    name: String,
    interval: Duration,
    stop: CancellationToken,
    last_check_time: Option<Instant>,
    throttle: LogThrottle,
}

impl TaskCore {
    pub fn new(name: impl Into<String>, interval: Duration, stop: CancellationToken) -> Self {
        Self {
            name: name.into(),
            interval,
            stop,
            last_check_time: None,
            throttle: LogThrottle::new(DEFAULT_LOG_INTERVAL),
        }
    }

    pub fn with_log_interval(mut self, log_interval: Duration) -> Self {
        self.throttle = LogThrottle::new(log_interval);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn last_check_time(&self) -> Option<Instant> {
        self.last_check_time
    }

    pub fn mark_checked(&mut self) {
        self.last_check_time = Some(Instant::now());
    }

    /// Logs `args` unless a message of the same `kind` was already logged
    /// within the log interval.
    pub fn log_with_interval(
        &mut self,
        kind: &'static str,
        level: Level,
        args: fmt::Arguments<'_>,
    ) {
        if self.throttle.allow(kind) {
            log::log!(level, "[{}] {}", self.name, args);
        }
    }
}

/// A unit of periodic work driven by the [`Trigger`](super::trigger::Trigger).
#[async_trait]
pub trait Task: Send {
    fn core(&self) -> &TaskCore;

    fn core_mut(&mut self) -> &mut TaskCore;

    /// One round of work. Errors are logged by the scheduler and the task is
    /// checked again at the next interval.
    async fn check(&mut self) -> Result<()>;
}
