// src/modules/trigger.rs
use crate::modules::task::Task;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningTask {
    name: String,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns a set of periodic tasks and runs each one on its own tokio task.
pub struct Trigger {
    pending: Vec<Box<dyn Task>>,
    running: Vec<RunningTask>,
    started: bool,
    stop_timeout: Duration,
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_TIMEOUT)
    }
}

impl Trigger {
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            pending: Vec::new(),
            running: Vec::new(),
            started: false,
            stop_timeout,
        }
    }

    /// Registers a task. Once the trigger runs, new tasks start right away.
    pub fn add_task(&mut self, task: Box<dyn Task>) {
        if self.started {
            self.spawn(task);
        } else {
            debug!("Registered task '{}'", task.core().name());
            self.pending.push(task);
        }
    }

    /// Starts every registered task and returns immediately. Must be called
    /// from within a tokio runtime.
    pub fn run(&mut self) {
        self.started = true;
        let pending = std::mem::take(&mut self.pending);
        info!("Starting {} periodic task(s)", pending.len());
        for task in pending {
            self.spawn(task);
        }
    }

    /// Runs one check of every task that has not been started yet, in order.
    pub async fn check_all(&mut self) {
        for task in self.pending.iter_mut() {
            check_once(task.as_mut()).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.started
    }

    pub fn task_count(&self) -> usize {
        self.pending.len() + self.running.len()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.pending
            .iter()
            .map(|t| t.core().name().to_string())
            .chain(self.running.iter().map(|r| r.name.clone()))
            .collect()
    }

    /// Stops one task by name. Returns false if no such task exists.
    pub async fn stop_task(&mut self, name: &str) -> bool {
        if let Some(pos) = self.pending.iter().position(|t| t.core().name() == name) {
            self.pending.remove(pos);
            return true;
        }
        let Some(pos) = self.running.iter().position(|r| r.name == name) else {
            return false;
        };
        let task = self.running.remove(pos);
        task.stop.cancel();
        self.join(vec![task]).await;
        true
    }

    /// Signals every task to stop and waits for the loops to exit. A check in
    /// flight is allowed to finish within the stop timeout.
    pub async fn stop_tasks(&mut self) {
        self.pending.clear();
        self.started = false;
        let running = std::mem::take(&mut self.running);
        if running.is_empty() {
            return;
        }
        info!("Stopping {} periodic task(s)", running.len());
        for task in &running {
            task.stop.cancel();
        }
        self.join(running).await;
    }

    async fn join(&self, tasks: Vec<RunningTask>) {
        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        for task in tasks {
            let RunningTask {
                name, mut handle, ..
            } = task;
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, &mut handle).await {
                Ok(Ok(())) => debug!("Task '{}' stopped", name),
                Ok(Err(e)) => warn!("Task '{}' ended abnormally: {}", name, e),
                Err(_) => {
                    warn!(
                        "Task '{}' did not stop within {:?}; aborting",
                        name, self.stop_timeout
                    );
                    // Wait for the abort to land so no callback runs after we return.
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
    }

    fn spawn(&mut self, task: Box<dyn Task>) {
        let name = task.core().name().to_string();
        let stop = task.core().stop_token();
        let handle = tokio::spawn(run_task(task));
        self.running.push(RunningTask { name, stop, handle });
    }
}

async fn run_task(mut task: Box<dyn Task>) {
    let stop = task.core().stop_token();
    let interval = task.core().interval();
    debug!(
        "Task '{}' scheduled every {:?}",
        task.core().name(),
        interval
    );

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = sleep(interval) => {}
        }
        if stop.is_cancelled() {
            break;
        }

        check_once(task.as_mut()).await;
    }

    debug!("Task '{}' left its loop", task.core().name());
}

/// Runs one check. Neither an error nor a panic ends the task.
async fn check_once(task: &mut dyn Task) {
    task.core_mut().mark_checked();
    let outcome = AssertUnwindSafe(task.check()).catch_unwind().await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Check of task '{}' failed: {}", task.core().name(), e),
        Err(panic) => error!(
            "Check of task '{}' panicked: {}",
            task.core().name(),
            panic_message(panic.as_ref())
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
