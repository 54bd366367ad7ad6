// src/signal.rs
use crate::error::{Result, WatchError};
use log::{debug, info};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const SIGINT: i32 = 2;
pub const SIGTERM: i32 = 15;

const NO_SIGNAL: i32 = 0;

struct Inner {
    event: CancellationToken,
    received: AtomicI32,
    hook: Mutex<Option<JoinHandle<()>>>,
}

/// Turns an OS termination signal into a single in-process stop event.
#[derive(Clone)]
pub struct SignalHandler {
    inner: Arc<Inner>,
}

impl SignalHandler {
    pub fn new(event: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                event,
                received: AtomicI32::new(NO_SIGNAL),
                hook: Mutex::new(None),
            }),
        }
    }

    /// Sets the event on the first signal. Later signals are ignored.
    pub fn handle(&self, signal_number: i32) {
        match self.inner.received.compare_exchange(
            NO_SIGNAL,
            signal_number,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                info!("Received signal {}, requesting shutdown", signal_number);
                self.inner.event.cancel();
            }
            Err(first) => {
                debug!(
                    "Ignoring signal {}; shutdown already requested by signal {}",
                    signal_number, first
                );
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.event.is_cancelled()
    }

    pub fn received_signal(&self) -> Option<i32> {
        match self.inner.received.load(Ordering::SeqCst) {
            NO_SIGNAL => None,
            signal => Some(signal),
        }
    }

    pub async fn wait(&self) {
        self.inner.event.cancelled().await;
    }

    /// Hooks SIGINT and SIGTERM. May only be called once per handler.
    pub fn install(&self) -> Result<()> {
        let mut hook = self
            .inner
            .hook
            .lock()
            .map_err(|_| WatchError::SignalHandler("hook state poisoned".to_string()))?;
        if hook.is_some() {
            return Err(WatchError::SignalHandler(
                "signal hooks are already installed".to_string(),
            ));
        }
        *hook = Some(self.spawn_hook()?);
        debug!("Signal hooks installed");
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.inner
            .hook
            .lock()
            .map(|hook| hook.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Stops forwarding signals to this handler.
    ///
    /// tokio never unregisters its process-level handler, so the default
    /// action of SIGINT and SIGTERM is not restored: once a handler has been
    /// installed, later signals are swallowed unless another handler is
    /// installed. Call this only on the way out of the process, after
    /// [`wait`](Self::wait) has returned or the watches are stopped.
    pub fn uninstall(&self) {
        if let Ok(mut hook) = self.inner.hook.lock() {
            if let Some(handle) = hook.take() {
                handle.abort();
                debug!("Signal hooks removed");
            }
        }
    }

    #[cfg(unix)]
    fn spawn_hook(&self) -> Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| WatchError::SignalHandler(format!("cannot hook SIGINT: {}", e)))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| WatchError::SignalHandler(format!("cannot hook SIGTERM: {}", e)))?;
        let handler = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = sigint.recv() => handler.handle(SIGINT),
                    Some(()) = sigterm.recv() => handler.handle(SIGTERM),
                    else => break,
                }
            }
        }))
    }

    #[cfg(not(unix))]
    fn spawn_hook(&self) -> Result<JoinHandle<()>> {
        let handler = self.clone();
        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                handler.handle(SIGINT);
            }
        }))
    }
}
