//! Background worker threads with graceful shutdown.
//!
//! - [`PeriodicWorker`]: runs a tick function now and then every interval
//! - [`SubscriptionWorker`]: applies a handler to every message of a bus
//!   subscription
//!
//! Both return a [`WorkerHandle`]; dropping the handle detaches the thread,
//! `shutdown()` stops it and waits.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use jobwarden_events::Subscription;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker thread has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

/// Fixed-interval worker.
#[derive(Debug)]
pub struct PeriodicWorker;

impl PeriodicWorker {
    /// Spawn a thread that calls `tick` immediately and then every `interval`.
    ///
    /// Tick errors are logged; the worker keeps going.
    pub fn spawn<F, E>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<WorkerHandle>
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let worker = name.to_string();

        let join = thread::Builder::new().name(worker.clone()).spawn(move || {
            debug!(worker = %worker, interval_ms = interval.as_millis() as u64, "periodic worker started");
            loop {
                if let Err(err) = tick() {
                    warn!(worker = %worker, error = ?err, "periodic worker tick failed");
                }
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(worker = %worker, "periodic worker stopped");
        })?;

        Ok(WorkerHandle {
            name: name.to_string(),
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

/// Bus consumer loop.
#[derive(Debug)]
pub struct SubscriptionWorker;

impl SubscriptionWorker {
    /// Spawn a worker thread that processes messages from `subscription`.
    ///
    /// `handler` must tolerate duplicates (at-least-once delivery).
    pub fn spawn<M, H, E>(name: &str, subscription: Subscription<M>, mut handler: H) -> std::io::Result<WorkerHandle>
    where
        M: Send + 'static,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let worker = name.to_string();
        let tick = Duration::from_millis(250);

        let join = thread::Builder::new().name(worker.clone()).spawn(move || {
            loop {
                // Shutdown check (non-blocking)
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                match subscription.recv_timeout(tick) {
                    Ok(msg) => {
                        if let Err(err) = handler(msg) {
                            warn!(worker = %worker, error = ?err, "subscription worker handler failed");
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;

        Ok(WorkerHandle {
            name: name.to_string(),
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}
