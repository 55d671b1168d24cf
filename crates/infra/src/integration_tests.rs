//! End-to-end tests across the queue, tracker, retry sweep and alerting.
//!
//! Verifies:
//! - Priority and dependency ordering under a concurrency limit of one
//! - Retries exhaust into exactly one dead letter, which alerts once
//! - Dependency failure cascades without dead-lettering dependents
//! - Alert throttling and success-rate rules see queue-driven executions
//! - The retry sweep honours its hourly cap and skips queue-owned runs
//! - Queue state survives a restart on the file store

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use jobwarden_core::{ManualClock, SystemClock};
    use jobwarden_events::{BusSink, EventBus, InMemoryEventBus, RecordingSink, WorkerEvent};

    use crate::alerts::{
        AlertConfig, AlertManager, AlertRule, AlertSettings, ChannelKind, JobFailureConditions, Notifier,
        PerformanceConditions, QueueHealthConditions, RecordingTransport, Severity, ThrottlePolicy,
    };
    use crate::jobs::{
        BackoffPolicy, Dispatcher, DispatcherConfig, ExecutionFilter, ExecutionStatus, ExecutionTracker, JobContext,
        JobDefinition, JobError, JobOutput, JobRegistry, JobSpec, Priority, QueueConfig, QueueManager, QueueMode,
        QueuedJobStatus, RetryCoordinator, RetryCoordinatorConfig, RunRequest,
    };
    use crate::store::{FileKeyedStore, InMemoryKeyedStore, SharedStore};

    fn ok(_: &JobContext) -> Result<JobOutput, JobError> {
        Ok(None)
    }

    fn always_fails(_: &JobContext) -> Result<JobOutput, JobError> {
        Err(JobError::failed("upstream unavailable"))
    }

    struct World {
        store: SharedStore,
        clock: Arc<ManualClock>,
        tracker: Arc<ExecutionTracker>,
        queue: Arc<QueueManager>,
        events: Arc<RecordingSink>,
    }

    fn world(registry: JobRegistry, max_concurrency: usize) -> World {
        let store: SharedStore = Arc::new(InMemoryKeyedStore::new());
        let clock = ManualClock::starting_now();
        let tracker = Arc::new(ExecutionTracker::new(store.clone(), clock.clone()));
        let events = Arc::new(RecordingSink::new());
        let queue = Arc::new(
            QueueManager::new(
                store.clone(),
                Arc::new(registry),
                tracker.clone(),
                clock.clone(),
                QueueConfig::default()
                    .with_max_concurrency(max_concurrency)
                    .with_default_backoff(BackoffPolicy::fixed(Duration::from_secs(1))),
            )
            .with_events(events.clone()),
        );
        World {
            store,
            clock,
            tracker,
            queue,
            events,
        }
    }

    fn alerting(w: &World, config: AlertConfig) -> (Arc<AlertManager>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let manager = Arc::new(
            AlertManager::new(
                config,
                w.store.clone(),
                w.tracker.history(),
                Notifier::with_all(transport.clone()),
                w.clock.clone(),
            )
            .with_queue(w.queue.clone()),
        );
        w.tracker.add_hook(manager.clone());
        (manager, transport)
    }

    fn enabled(throttle: ThrottlePolicy) -> AlertSettings {
        AlertSettings {
            enabled: true,
            channels: vec![ChannelKind::Slack],
            throttle,
            ..AlertSettings::default()
        }
    }

    fn rule<C>(name: &str, conditions: C) -> AlertRule<C> {
        AlertRule {
            name: name.to_string(),
            enabled: true,
            severity: Severity::Critical,
            channels: Vec::new(),
            conditions,
        }
    }

    #[test]
    fn dependency_runs_before_higher_priority_dependent() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let mut registry = JobRegistry::new();
        registry.register(JobDefinition::new("step", "Step", move |ctx: &JobContext| -> Result<JobOutput, JobError> {
            seen.lock().unwrap().push(ctx.input_str("name").unwrap_or_default().to_string());
            Ok(None)
        }));
        let w = world(registry, 1);

        let a = w
            .queue
            .enqueue(JobSpec::new("step").input(serde_json::json!({ "name": "A" })))
            .unwrap();
        let b = w
            .queue
            .enqueue(
                JobSpec::new("step")
                    .priority(Priority::Critical)
                    .depends_on([a.id])
                    .input(serde_json::json!({ "name": "B" })),
            )
            .unwrap();
        assert_eq!(b.status, QueuedJobStatus::Pending);

        assert_eq!(w.queue.run_until_idle().unwrap(), 2);
        assert_eq!(*order.lock().unwrap(), vec!["A", "B"]);
        assert_eq!(w.queue.get(b.id).unwrap().unwrap().status, QueuedJobStatus::Completed);

        let stats = w.queue.stats().unwrap();
        assert_eq!(stats.by_status.completed, 2);
        assert_eq!(stats.success_rate, Some(1.0));
    }

    #[test]
    fn exhausted_retries_dead_letter_once_and_alert_once() {
        let mut registry = JobRegistry::new();
        registry.register(JobDefinition::new("flaky", "Flaky", always_fails));
        let w = world(registry, 1);
        let (manager, transport) = alerting(
            &w,
            AlertConfig {
                settings: enabled(ThrottlePolicy::default()),
                queue_health: vec![rule(
                    "dead-letters",
                    QueueHealthConditions {
                        new_dead_letter: true,
                        ..Default::default()
                    },
                )],
                ..Default::default()
            },
        );

        let job = w.queue.enqueue(JobSpec::new("flaky").max_attempts(3)).unwrap();
        for _ in 0..3 {
            assert_eq!(w.queue.run_until_idle().unwrap(), 1);
            w.clock.advance_secs(1);
        }
        assert_eq!(w.queue.run_until_idle().unwrap(), 0);

        let failed = w.queue.get(job.id).unwrap().unwrap();
        assert_eq!(failed.status, QueuedJobStatus::Failed);
        assert_eq!(failed.attempt, 3);

        let dead = w.queue.dead_letters().list(&Default::default()).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert!(dead[0].can_retry);
        assert_eq!(dead[0].original_job_id, job.id);

        let retries = w
            .events
            .all()
            .into_iter()
            .filter(|e| matches!(e, WorkerEvent::JobRetryScheduled { .. }))
            .count();
        assert_eq!(retries, 2);

        // Every event that announces the dead letter triggers a check; only one alert results.
        for event in w.events.all() {
            manager.handle_event(&event).unwrap();
        }
        manager.check_queue_health().unwrap();
        assert_eq!(transport.count(ChannelKind::Slack), 1);

        let retried = w.queue.retry_dead_letter(dead[0].id).unwrap();
        assert_eq!(retried.status, QueuedJobStatus::Ready);
        assert_eq!(retried.dead_letter_retries, 1);
        assert!(w.queue.dead_letters().get(dead[0].id).unwrap().is_none());
    }

    #[test]
    fn failed_dependency_cascades_without_dead_lettering_dependents() {
        let mut registry = JobRegistry::new();
        registry
            .register(JobDefinition::new("extract", "Extract", always_fails))
            .register(JobDefinition::new("load", "Load", ok));
        let w = world(registry, 2);

        let a = w.queue.enqueue(JobSpec::new("extract").max_attempts(1)).unwrap();
        let b = w.queue.enqueue(JobSpec::new("load").depends_on([a.id])).unwrap();
        let c = w.queue.enqueue(JobSpec::new("load").depends_on([b.id])).unwrap();

        w.queue.run_until_idle().unwrap();

        for id in [b.id, c.id] {
            let dependent = w.queue.get(id).unwrap().unwrap();
            assert_eq!(dependent.status, QueuedJobStatus::Failed);
            assert_eq!(dependent.error, Some(format!("dependency failed: {}", a.id)));
        }
        assert_eq!(w.queue.dead_letters().count().unwrap(), 1);

        // Depending on an already failed job fails immediately.
        let late = w.queue.enqueue(JobSpec::new("load").depends_on([a.id])).unwrap();
        assert_eq!(late.status, QueuedJobStatus::Failed);
    }

    #[test]
    fn throttled_failure_alerts_respect_interval_and_hourly_cap() {
        let mut registry = JobRegistry::new();
        registry.register(JobDefinition::new("sync", "Sync", always_fails));
        let w = world(registry, 1);
        let (manager, transport) = alerting(
            &w,
            AlertConfig {
                settings: enabled(ThrottlePolicy {
                    min_interval_secs: 300,
                    max_alerts_per_job_per_hour: 3,
                }),
                job_failures: vec![rule(
                    "sync-failing",
                    JobFailureConditions {
                        job_pattern: Some("^sync$".into()),
                        failure_count: Some(1),
                        ..Default::default()
                    },
                )],
                ..Default::default()
            },
        );

        let fail_once = || {
            w.queue.enqueue(JobSpec::new("sync").max_attempts(1)).unwrap();
            w.queue.run_until_idle().unwrap();
        };

        fail_once();
        w.clock.advance_secs(100);
        fail_once();
        assert_eq!(transport.count(ChannelKind::Slack), 1);

        w.clock.advance_secs(300);
        fail_once();
        assert_eq!(transport.count(ChannelKind::Slack), 2);

        w.clock.advance_secs(301);
        fail_once();
        w.clock.advance_secs(301);
        fail_once();
        assert_eq!(transport.count(ChannelKind::Slack), 3);

        // Suppressed alerts leave no history behind.
        assert_eq!(manager.history(10).unwrap().len(), 3);
        let status = manager.status().unwrap();
        assert_eq!(status.throttles.len(), 1);
        assert_eq!(status.throttles[0].key, "sync-failing:sync");
        assert_eq!(status.throttles[0].count, 3);
    }

    #[test]
    fn success_rate_alert_fires_below_threshold_only() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = JobRegistry::new();
        registry.register(JobDefinition::new("report", "Report", move |_: &JobContext| -> Result<JobOutput, JobError> {
            if counter.fetch_add(1, Ordering::SeqCst) < 4 {
                Ok(None)
            } else {
                Err(JobError::failed("report rendering failed"))
            }
        }));
        let w = world(registry, 1);
        let (manager, _transport) = alerting(
            &w,
            AlertConfig {
                settings: enabled(ThrottlePolicy::default()),
                performance: vec![rule(
                    "report-health",
                    PerformanceConditions {
                        min_runs: 5,
                        success_rate: Some(0.8),
                        ..Default::default()
                    },
                )],
                ..Default::default()
            },
        );

        for _ in 0..5 {
            w.queue.enqueue(JobSpec::new("report").max_attempts(1)).unwrap();
            w.queue.run_until_idle().unwrap();
        }
        assert!(manager.history(10).unwrap().is_empty());

        w.queue.enqueue(JobSpec::new("report").max_attempts(1)).unwrap();
        w.queue.run_until_idle().unwrap();

        let alerts = manager.history(10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_name, "report-health");
        assert_eq!(alerts[0].job_id.as_deref(), Some("report"));
    }

    #[test]
    fn retry_sweep_stops_at_hourly_cap() {
        let mut registry = JobRegistry::new();
        registry
            .register(JobDefinition::new("flaky", "Flaky", always_fails))
            .register(JobDefinition::new("once", "Once", always_fails));
        let registry = Arc::new(registry);
        let w = world(JobRegistry::new(), 1);

        let flaky = registry.get("flaky").unwrap();
        w.tracker.run(flaky, RunRequest::default()).unwrap();
        w.tracker.run(flaky, RunRequest::default()).unwrap();
        w.tracker.run(registry.get("once").unwrap(), RunRequest::default()).unwrap();

        let coordinator = RetryCoordinator::new(
            w.tracker.clone(),
            registry,
            w.clock.clone(),
            RetryCoordinatorConfig {
                max_retries: 2,
                pacing: Duration::ZERO,
                ..Default::default()
            },
        );
        let report = coordinator.sweep().unwrap();

        assert_eq!(report.total_failed, 3);
        assert_eq!(report.retried, 1);
        assert_eq!(report.skipped, 1);
        let once_runs = w.tracker.list(&ExecutionFilter::for_job("once")).unwrap();
        assert_eq!(once_runs.len(), 2);
    }

    #[test]
    fn retry_sweep_leaves_dead_lettered_queue_jobs_alone() {
        let mut registry = JobRegistry::new();
        registry.register(JobDefinition::new("flaky", "Flaky", always_fails));
        let w = world(registry, 1);

        w.queue.enqueue(JobSpec::new("flaky").max_attempts(1)).unwrap();
        w.queue.run_until_idle().unwrap();
        assert_eq!(w.queue.dead_letters().count().unwrap(), 1);

        let coordinator = RetryCoordinator::new(
            w.tracker.clone(),
            w.queue.registry().clone(),
            w.clock.clone(),
            RetryCoordinatorConfig {
                max_retries: 5,
                pacing: Duration::ZERO,
                ..Default::default()
            },
        );
        let report = coordinator.sweep().unwrap();

        assert_eq!(report.total_failed, 0);
        assert_eq!(report.retried, 0);
        assert_eq!(w.tracker.list(&ExecutionFilter::for_job("flaky")).unwrap().len(), 1);
    }

    #[test]
    fn paused_queue_holds_work_and_drain_refuses_new_jobs() {
        let mut registry = JobRegistry::new();
        registry.register(JobDefinition::new("noop", "Noop", ok));
        let w = world(registry, 1);

        w.queue.pause().unwrap();
        let job = w.queue.enqueue(JobSpec::new("noop")).unwrap();
        assert_eq!(w.queue.run_until_idle().unwrap(), 0);
        assert_eq!(w.queue.stats().unwrap().mode, QueueMode::Paused);

        w.queue.drain().unwrap();
        assert!(w.queue.enqueue(JobSpec::new("noop")).is_err());
        assert!(!w.queue.is_drained().unwrap());
        assert_eq!(w.queue.run_until_idle().unwrap(), 1);
        assert!(w.queue.is_drained().unwrap());
        assert_eq!(w.queue.get(job.id).unwrap().unwrap().status, QueuedJobStatus::Completed);
    }

    #[test]
    fn alert_monitor_reacts_to_bus_dead_letters() {
        let store: SharedStore = Arc::new(InMemoryKeyedStore::new());
        let clock = ManualClock::starting_now();
        let bus: Arc<InMemoryEventBus<WorkerEvent>> = Arc::new(InMemoryEventBus::new());
        let tracker = Arc::new(ExecutionTracker::new(store.clone(), clock.clone()));
        let mut registry = JobRegistry::new();
        registry.register(JobDefinition::new("flaky", "Flaky", always_fails));
        let queue = Arc::new(
            QueueManager::new(store.clone(), Arc::new(registry), tracker.clone(), clock.clone(), QueueConfig::default())
                .with_events(Arc::new(BusSink::new(bus.clone()))),
        );
        let transport = Arc::new(RecordingTransport::new());
        let mut settings = enabled(ThrottlePolicy::default());
        settings.health_check_interval_secs = 3600;
        let manager = Arc::new(
            AlertManager::new(
                AlertConfig {
                    settings,
                    queue_health: vec![rule(
                        "dead-letters",
                        QueueHealthConditions {
                            new_dead_letter: true,
                            ..Default::default()
                        },
                    )],
                    ..Default::default()
                },
                store,
                tracker.history(),
                Notifier::with_all(transport.clone()),
                clock,
            )
            .with_queue(queue.clone()),
        );
        let monitor = manager.start(bus.subscribe()).unwrap();

        queue.enqueue(JobSpec::new("flaky").max_attempts(1)).unwrap();
        queue.run_until_idle().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while transport.count(ChannelKind::Slack) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        monitor.stop();
        assert_eq!(transport.count(ChannelKind::Slack), 1);
    }

    #[test]
    fn file_store_survives_restart_and_dispatcher_drains() {
        let dir = tempfile::tempdir().unwrap();
        let registry = {
            let mut r = JobRegistry::new();
            r.register(JobDefinition::new("noop", "Noop", ok));
            Arc::new(r)
        };
        let open = || {
            let store: SharedStore = Arc::new(FileKeyedStore::open(dir.path()).unwrap());
            let clock = SystemClock::shared();
            let tracker = Arc::new(ExecutionTracker::new(store.clone(), clock.clone()));
            Arc::new(QueueManager::new(store, registry.clone(), tracker, clock, QueueConfig::default()))
        };

        let first = open();
        let ids: Vec<_> = (0..3)
            .map(|_| first.enqueue(JobSpec::new("noop")).unwrap().id)
            .collect();
        first.pause().unwrap();
        drop(first);

        let second = open();
        assert_eq!(second.mode().unwrap(), QueueMode::Paused);
        assert_eq!(second.stats().unwrap().by_status.ready, 3);

        second.drain().unwrap();
        let handle = Dispatcher::spawn(
            second.clone(),
            DispatcherConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();
        handle.wait();

        for id in ids {
            assert_eq!(second.get(id).unwrap().unwrap().status, QueuedJobStatus::Completed);
        }
        let executions = second.tracker().list(&ExecutionFilter::for_job("noop")).unwrap();
        assert_eq!(executions.len(), 3);
        assert!(executions.iter().all(|e| e.status == ExecutionStatus::Success));
    }
}
