//! Composition root: builds every manager once and shares it by `Arc`.

use std::sync::Arc;

use anyhow::Context as _;
use tracing::info;

use jobwarden_core::{SharedClock, SystemClock};
use jobwarden_events::{BusSink, EventSink, InMemoryEventBus, WorkerEvent};
use jobwarden_infra::alerts::{AlertManager, Notifier, TracingTransport};
use jobwarden_infra::jobs::{ExecutionTracker, JobRegistry, QueueManager, RetryCoordinator};
use jobwarden_infra::store::{FileKeyedStore, SharedStore};

use crate::builtin;
use crate::config::WorkerConfig;

pub struct Runtime {
    pub config: WorkerConfig,
    pub store: SharedStore,
    pub clock: SharedClock,
    pub bus: Arc<InMemoryEventBus<WorkerEvent>>,
    pub registry: Arc<JobRegistry>,
    pub tracker: Arc<ExecutionTracker>,
    pub queue: Arc<QueueManager>,
    pub alerts: Arc<AlertManager>,
}

impl Runtime {
    /// File-backed runtime with the builtin jobs registered.
    pub fn build(config: WorkerConfig) -> anyhow::Result<Self> {
        let store: SharedStore = Arc::new(
            FileKeyedStore::open(config.data_dir.clone())
                .with_context(|| format!("opening job store at {}", config.data_dir.display()))?,
        );
        Self::with_parts(config, store, SystemClock::shared(), builtin::registry())
    }

    pub fn with_parts(
        config: WorkerConfig,
        store: SharedStore,
        clock: SharedClock,
        registry: JobRegistry,
    ) -> anyhow::Result<Self> {
        let bus: Arc<InMemoryEventBus<WorkerEvent>> = Arc::new(InMemoryEventBus::new());
        let sink: Arc<dyn EventSink> = Arc::new(BusSink::new(bus.clone()));
        let registry = Arc::new(registry);

        let tracker = Arc::new(ExecutionTracker::new(store.clone(), clock.clone()).with_events(sink.clone()));
        let queue = Arc::new(
            QueueManager::new(
                store.clone(),
                registry.clone(),
                tracker.clone(),
                clock.clone(),
                config.queue_config(),
            )
            .with_events(sink),
        );

        let mut alert_config = AlertManager::load_config(config.alert_config.as_deref());
        if let Some(secs) = config.health_check_interval_secs {
            alert_config.settings.health_check_interval_secs = secs;
        }
        let alerts = Arc::new(
            AlertManager::new(
                alert_config,
                store.clone(),
                tracker.history(),
                Notifier::with_all(Arc::new(TracingTransport)),
                clock.clone(),
            )
            .with_queue(queue.clone()),
        );
        if alerts.is_enabled() {
            tracker.add_hook(alerts.clone());
        }

        info!(
            data_dir = %config.data_dir.display(),
            jobs = registry.len(),
            max_concurrency = config.max_concurrency,
            alerting = alerts.is_enabled(),
            "runtime ready"
        );

        Ok(Self {
            config,
            store,
            clock,
            bus,
            registry,
            tracker,
            queue,
            alerts,
        })
    }

    pub fn retry_coordinator(&self) -> Arc<RetryCoordinator> {
        let sink: Arc<dyn EventSink> = Arc::new(BusSink::new(self.bus.clone()));
        Arc::new(
            RetryCoordinator::new(
                self.tracker.clone(),
                self.registry.clone(),
                self.clock.clone(),
                self.config.retry.clone(),
            )
            .with_events(sink),
        )
    }
}
