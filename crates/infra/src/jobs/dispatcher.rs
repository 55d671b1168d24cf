//! Threaded dispatcher: a coordinator that claims jobs plus a bounded pool of
//! execution slots.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::queue::QueueManager;
use super::types::{QueuedJob, QueuedJobStatus};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to poll when nothing is eligible
    pub poll_interval: Duration,
    /// Name for logging and thread names
    pub name: String,
    /// Exit once the queue reports itself drained
    pub stop_when_drained: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            name: "dispatcher".to_string(),
            stop_when_drained: true,
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Failed attempts that were scheduled for retry
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub errors: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Stop claiming new jobs, let in-flight ones finish, then return.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        self.wait_inner();
    }

    /// Block until the dispatcher stops on its own (e.g. drained).
    pub fn wait(mut self) {
        self.wait_inner();
    }

    fn wait_inner(&mut self) {
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!("dispatcher coordinator panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    pub fn stats(&self) -> DispatcherStats {
        lock_stats(&self.stats, |s| s.clone()).unwrap_or_default()
    }
}

/// Spawns the coordinator and its worker slots.
#[derive(Debug)]
pub struct Dispatcher;

impl Dispatcher {
    pub fn spawn(queue: Arc<QueueManager>, config: DispatcherConfig) -> std::io::Result<DispatcherHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));
        let slots = queue.config().max_concurrency.max(1);

        let (job_tx, job_rx) = mpsc::sync_channel::<QueuedJob>(slots);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = Vec::with_capacity(slots);
        for slot in 0..slots {
            let queue = queue.clone();
            let job_rx = job_rx.clone();
            let stats = stats.clone();
            let name = format!("{}-slot-{slot}", config.name);
            workers.push(
                thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || slot_loop(&name, &queue, &job_rx, &stats))?,
            );
        }

        let coordinator_stats = stats.clone();
        let join = thread::Builder::new().name(config.name.clone()).spawn(move || {
            coordinator_loop(&queue, &config, &shutdown_rx, job_tx, &coordinator_stats);
            for worker in workers {
                if worker.join().is_err() {
                    error!(dispatcher = %config.name, "dispatcher slot panicked");
                }
            }
            info!(dispatcher = %config.name, "dispatcher stopped");
        })?;

        Ok(DispatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn coordinator_loop(
    queue: &QueueManager,
    config: &DispatcherConfig,
    shutdown_rx: &mpsc::Receiver<()>,
    job_tx: mpsc::SyncSender<QueuedJob>,
    stats: &Mutex<DispatcherStats>,
) {
    info!(
        dispatcher = %config.name,
        max_concurrency = queue.config().max_concurrency,
        "dispatcher started"
    );
    let start_time = Instant::now();

    loop {
        // Check for shutdown
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        lock_stats(stats, |s| s.uptime_secs = start_time.elapsed().as_secs());

        if let Err(e) = queue.promote_due() {
            error!(dispatcher = %config.name, error = %e, "failed to promote due jobs");
        }

        match queue.claim_next() {
            Ok(Some(job)) => {
                debug!(
                    dispatcher = %config.name,
                    queued_job_id = %job.id,
                    job_id = %job.job_id,
                    "dispatching job"
                );
                lock_stats(stats, |s| s.current_running += 1);
                if job_tx.send(job).is_err() {
                    error!(dispatcher = %config.name, "all dispatcher slots exited");
                    break;
                }
                continue;
            }
            Ok(None) => {
                let idle = lock_stats(stats, |s| s.current_running == 0).unwrap_or(true);
                if config.stop_when_drained && idle {
                    match queue.is_drained() {
                        Ok(true) => {
                            info!(dispatcher = %config.name, "queue drained");
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => error!(dispatcher = %config.name, error = %e, "failed to check drain state"),
                    }
                }
            }
            Err(e) => {
                lock_stats(stats, |s| s.errors += 1);
                error!(dispatcher = %config.name, error = %e, "failed to claim job");
            }
        }

        // Nothing to do: wait for the next poll or a shutdown request.
        match shutdown_rx.recv_timeout(config.poll_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn slot_loop(
    name: &str,
    queue: &QueueManager,
    job_rx: &Mutex<mpsc::Receiver<QueuedJob>>,
    stats: &Mutex<DispatcherStats>,
) {
    loop {
        let next = match job_rx.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        // Disconnected: coordinator stopped and the buffer is empty.
        let Ok(job) = next else { break };

        let result = queue.execute_claimed(&job);

        lock_stats(stats, |s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match &result {
                Ok(updated) => match updated.status {
                    QueuedJobStatus::Completed => s.jobs_succeeded += 1,
                    QueuedJobStatus::Delayed => s.jobs_retried += 1,
                    QueuedJobStatus::Failed => s.jobs_dead_lettered += 1,
                    _ => {}
                },
                Err(_) => s.errors += 1,
            }
        });

        if let Err(e) = result {
            error!(slot = name, queued_job_id = %job.id, job_id = %job.job_id, error = %e, "job execution failed");
        }
    }
}

fn lock_stats<T>(stats: &Mutex<DispatcherStats>, f: impl FnOnce(&mut DispatcherStats) -> T) -> Option<T> {
    stats.lock().ok().map(|mut s| f(&mut s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::QueueConfig;
    use crate::jobs::registry::{JobContext, JobDefinition, JobError, JobOutput, JobRegistry};
    use crate::jobs::tracker::ExecutionTracker;
    use crate::jobs::types::JobSpec;
    use crate::store::{InMemoryKeyedStore, SharedStore};
    use jobwarden_core::SystemClock;

    fn queue(max_concurrency: usize) -> Arc<QueueManager> {
        let store: SharedStore = Arc::new(InMemoryKeyedStore::new());
        let clock = SystemClock::shared();
        let mut registry = JobRegistry::new();
        registry.register(JobDefinition::new(
            "nap",
            "Nap",
            |_: &JobContext| -> Result<JobOutput, JobError> {
                thread::sleep(Duration::from_millis(20));
                Ok(None)
            },
        ));
        let tracker = Arc::new(ExecutionTracker::new(store.clone(), clock.clone()));
        Arc::new(QueueManager::new(
            store,
            Arc::new(registry),
            tracker,
            clock,
            QueueConfig::default().with_max_concurrency(max_concurrency),
        ))
    }

    #[test]
    fn runs_everything_then_stops_when_drained() {
        let queue = queue(2);
        for _ in 0..5 {
            queue.enqueue(JobSpec::new("nap")).unwrap();
        }
        queue.drain().unwrap();

        let handle = Dispatcher::spawn(
            queue.clone(),
            DispatcherConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();

        for _ in 0..500 {
            if handle.is_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        handle.wait();

        assert_eq!(stats.jobs_succeeded, 5);
        assert_eq!(stats.current_running, 0);
        assert!(queue.is_drained().unwrap());
    }

    #[test]
    fn shutdown_finishes_in_flight_work() {
        let queue = queue(1);
        let job = queue.enqueue(JobSpec::new("nap")).unwrap();

        let handle = Dispatcher::spawn(
            queue.clone(),
            DispatcherConfig::default().with_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        handle.shutdown();

        let status = queue.get(job.id).unwrap().unwrap().status;
        assert_eq!(status, QueuedJobStatus::Completed);
    }
}
