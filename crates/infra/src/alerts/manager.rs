//! Alert manager: evaluates rules, throttles, persists and delivers alerts.
//!
//! Hook and monitor failures are logged by whoever drives the manager; they
//! never reach job execution. A manager built from a missing or disabled
//! configuration turns every operation into a no-op.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use jobwarden_core::{AlertEventId, DeadLetterId, QueuedJobId, SharedClock};
use jobwarden_events::{Subscription, WorkerEvent};

use super::channels::{ChannelKind, Notifier};
use super::config::{AlertConfig, AlertRuleSet, CompiledRule, RuleConditions, Severity};
use super::throttle::{AlertThrottle, throttle_key};
use crate::jobs::{CompletionHook, DeadLetterJob, ExecutionHistory, JobExecution, QueueManager, QueueMode};
use crate::store::{Record, RecordStore, SharedStore, StoreError, kinds};
use crate::workers::{PeriodicWorker, SubscriptionWorker, WorkerHandle};

/// A fired alert. Persisted before delivery, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: AlertEventId,
    pub alert_name: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub channels: Vec<ChannelKind>,
    pub metadata: serde_json::Value,
    pub triggered_at: DateTime<Utc>,
    pub job_id: Option<String>,
    pub queued_job_id: Option<QueuedJobId>,
}

impl Record for AlertEvent {
    const KIND: &'static str = kinds::ALERT_EVENTS;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Most recent dead letter already alerted on, shared by every process
/// working against the same store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterCursor {
    pub last_alerted: Option<DeadLetterId>,
    pub updated_at: DateTime<Utc>,
}

impl DeadLetterCursor {
    pub const KEY: &'static str = "dead-letters";
}

impl Record for DeadLetterCursor {
    const KIND: &'static str = kinds::ALERT_CURSORS;

    fn key(&self) -> String {
        Self::KEY.to_string()
    }
}

/// Input to [`AlertManager::send_alert`].
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub alert_name: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub channels: Vec<ChannelKind>,
    pub metadata: serde_json::Value,
    pub job_id: Option<String>,
    pub queued_job_id: Option<QueuedJobId>,
}

impl AlertRequest {
    fn from_rule(rule: &CompiledRule, title: String, message: String, metadata: serde_json::Value) -> Self {
        Self {
            alert_name: rule.name.clone(),
            severity: rule.severity,
            title,
            message,
            channels: rule.channels.clone(),
            metadata,
            job_id: None,
            queued_job_id: None,
        }
    }
}

/// Queue metrics the health rules look at.
#[derive(Debug, Clone, Default)]
pub struct QueueHealthSnapshot {
    pub dead_letters: usize,
    /// pending + ready
    pub pending: usize,
    pub delayed: usize,
    pub running: usize,
    pub mode: QueueMode,
    pub latest_dead_letter: Option<DeadLetterJob>,
}

pub trait QueueHealthSource: Send + Sync {
    fn health_snapshot(&self) -> anyhow::Result<QueueHealthSnapshot>;
}

impl QueueHealthSource for QueueManager {
    fn health_snapshot(&self) -> anyhow::Result<QueueHealthSnapshot> {
        let stats = self.stats()?;
        Ok(QueueHealthSnapshot {
            dead_letters: stats.dead_letters,
            pending: stats.by_status.pending + stats.by_status.ready,
            delayed: stats.by_status.delayed,
            running: stats.running,
            mode: stats.mode,
            latest_dead_letter: self.dead_letters().latest()?,
        })
    }
}

/// Operator-facing summary.
#[derive(Debug, Clone, Serialize)]
pub struct AlertStatus {
    pub enabled: bool,
    pub job_failure_rules: usize,
    pub queue_health_rules: usize,
    pub performance_rules: usize,
    pub rejected_rules: Vec<String>,
    pub channels: Vec<ChannelKind>,
    pub transports: Vec<ChannelKind>,
    pub health_check_interval_secs: u64,
    pub throttles: Vec<AlertThrottle>,
}

/// Result of a test send.
#[derive(Debug, Clone, Serialize)]
pub struct TestAlertReport {
    pub event: AlertEvent,
    /// `(channel, error)`; `None` means delivered.
    pub deliveries: Vec<(ChannelKind, Option<String>)>,
}

/// Running monitor threads.
#[derive(Debug)]
pub struct AlertMonitorHandle {
    workers: Vec<WorkerHandle>,
}

impl AlertMonitorHandle {
    pub fn stop(self) {
        for worker in self.workers {
            worker.shutdown();
        }
    }
}

pub struct AlertManager {
    config: AlertConfig,
    rules: AlertRuleSet,
    store: SharedStore,
    history: ExecutionHistory,
    notifier: Notifier,
    clock: SharedClock,
    queue: Option<Arc<dyn QueueHealthSource>>,
    /// Serializes throttle read-modify-write.
    throttle_lock: Mutex<()>,
    /// Serializes dead-letter cursor read-modify-write.
    cursor_lock: Mutex<()>,
}

impl AlertManager {
    pub fn new(
        config: AlertConfig,
        store: SharedStore,
        history: ExecutionHistory,
        notifier: Notifier,
        clock: SharedClock,
    ) -> Self {
        let rules = if config.settings.enabled {
            config.compile()
        } else {
            AlertRuleSet::default()
        };
        Self {
            config,
            rules,
            store,
            history,
            notifier,
            clock,
            queue: None,
            throttle_lock: Mutex::new(()),
            cursor_lock: Mutex::new(()),
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueHealthSource>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Load a config file; any failure degrades to alerting disabled.
    pub fn load_config(path: Option<&Path>) -> AlertConfig {
        let Some(path) = path else {
            info!("no alert config given; alerting disabled");
            return AlertConfig::default();
        };
        match AlertConfig::load(path) {
            Ok(config) => {
                if !config.settings.enabled {
                    info!(path = %path.display(), "alerting disabled by config");
                }
                config
            }
            Err(err) => {
                warn!(error = %err, "alert config unusable; alerting disabled");
                AlertConfig::default()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.settings.enabled
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    // ---- job failures & performance ----

    /// Evaluate job-failure and performance rules for a finished execution.
    pub fn evaluate_execution(&self, execution: &JobExecution) -> anyhow::Result<Vec<AlertEvent>> {
        if !self.is_enabled() || !execution.is_terminal() {
            return Ok(Vec::new());
        }

        let mut fired = Vec::new();
        if execution.status.is_failure() {
            for rule in self.rules.job_failures.iter().filter(|r| r.matches_job(&execution.job_id)) {
                if let Some(event) = self.evaluate_job_failure(rule, execution)? {
                    fired.push(event);
                }
            }
        }
        for rule in self.rules.performance.iter().filter(|r| r.matches_job(&execution.job_id)) {
            if let Some(event) = self.evaluate_performance(rule, execution)? {
                fired.push(event);
            }
        }
        Ok(fired)
    }

    fn evaluate_job_failure(&self, rule: &CompiledRule, execution: &JobExecution) -> anyhow::Result<Option<AlertEvent>> {
        let RuleConditions::JobFailure(c) = &rule.conditions else {
            return Ok(None);
        };
        let org = execution.org_id.as_deref();
        let mut reasons = Vec::new();

        if let Some(n) = c.consecutive_failures {
            let recent = self.history.recent_terminal(&execution.job_id, org, n)?;
            if recent.len() == n && recent.iter().all(|e| e.status.is_failure()) {
                reasons.push(format!("failed {n} times in a row"));
            }
        }
        if let Some(n) = c.failure_count {
            let since = self.clock.now() - ChronoDuration::hours(1);
            let count = self.history.failures_since(&execution.job_id, org, since)?;
            if count >= n {
                reasons.push(format!("{count} failures in the last hour"));
            }
        }
        if let Some(needle) = &c.failure_reason {
            let error = execution.error.as_deref().unwrap_or_default();
            if error.to_lowercase().contains(&needle.to_lowercase()) {
                reasons.push(format!("error matches \"{needle}\""));
            }
        }

        if reasons.is_empty() {
            return Ok(None);
        }

        let title = format!("Job {} {}", execution.job_name, execution.status);
        let message = format!(
            "{} ({}). Last error: {}",
            execution.job_id,
            reasons.join("; "),
            execution.error.as_deref().unwrap_or("none")
        );
        let mut request = AlertRequest::from_rule(
            rule,
            title,
            message,
            serde_json::json!({
                "executionId": execution.id,
                "status": execution.status,
                "orgId": execution.org_id,
                "reasons": reasons,
            }),
        );
        request.job_id = Some(execution.job_id.clone());
        request.queued_job_id = execution.queued_job_id;
        Ok(self.send_alert(request)?)
    }

    fn evaluate_performance(&self, rule: &CompiledRule, execution: &JobExecution) -> anyhow::Result<Option<AlertEvent>> {
        let RuleConditions::Performance(c) = &rule.conditions else {
            return Ok(None);
        };
        let stats = self.history.stats(&execution.job_id, execution.org_id.as_deref())?;
        if stats.total_runs < c.min_runs {
            return Ok(None);
        }

        let mut reasons = Vec::new();
        if let (Some(threshold), Some(rate)) = (c.success_rate, stats.success_rate()) {
            if rate < threshold {
                reasons.push(format!(
                    "success rate {:.1}% below {:.1}%",
                    rate * 100.0,
                    threshold * 100.0
                ));
            }
        }
        if let (Some(factor), Some(duration)) = (c.duration_increase, execution.duration_ms) {
            if let Some(avg) = stats.avg_duration_without(duration).filter(|a| *a > 0.0) {
                if duration as f64 >= factor * avg {
                    reasons.push(format!("took {duration}ms, {:.1}x the {avg:.0}ms average", duration as f64 / avg));
                }
            }
        }

        if reasons.is_empty() {
            return Ok(None);
        }

        let title = format!("Job {} performance degraded", execution.job_name);
        let message = format!("{}: {}", execution.job_id, reasons.join("; "));
        let mut request = AlertRequest::from_rule(
            rule,
            title,
            message,
            serde_json::json!({
                "executionId": execution.id,
                "totalRuns": stats.total_runs,
                "successRate": stats.success_rate(),
                "avgDurationMs": stats.avg_duration_ms,
                "reasons": reasons,
            }),
        );
        request.job_id = Some(execution.job_id.clone());
        request.queued_job_id = execution.queued_job_id;
        Ok(self.send_alert(request)?)
    }

    // ---- queue health ----

    /// Evaluate queue-health rules against a fresh snapshot.
    pub fn check_queue_health(&self) -> anyhow::Result<Vec<AlertEvent>> {
        if !self.is_enabled() || self.rules.queue_health.is_empty() {
            return Ok(Vec::new());
        }
        let Some(queue) = &self.queue else {
            debug!("no queue attached; skipping health check");
            return Ok(Vec::new());
        };
        let snapshot = queue.health_snapshot()?;
        let new_dead_letter = self.take_new_dead_letter(snapshot.latest_dead_letter.as_ref())?;

        let mut fired = Vec::new();
        for rule in &self.rules.queue_health {
            let RuleConditions::QueueHealth(c) = &rule.conditions else {
                continue;
            };

            let mut reasons = Vec::new();
            if let Some(n) = c.dlq_size.filter(|n| snapshot.dead_letters >= *n) {
                reasons.push(format!("{} dead letters (threshold {n})", snapshot.dead_letters));
            }
            if let Some(n) = c.pending_jobs.filter(|n| snapshot.pending >= *n) {
                reasons.push(format!("{} jobs waiting (threshold {n})", snapshot.pending));
            }
            if let Some(n) = c.delayed_jobs.filter(|n| snapshot.delayed >= *n) {
                reasons.push(format!("{} jobs delayed (threshold {n})", snapshot.delayed));
            }
            if c.mode.is_some_and(|m| m == snapshot.mode) {
                reasons.push(format!("queue is {}", snapshot.mode));
            }

            if !reasons.is_empty() {
                let request = AlertRequest::from_rule(
                    rule,
                    "Queue health degraded".to_string(),
                    reasons.join("; "),
                    serde_json::json!({
                        "deadLetters": snapshot.dead_letters,
                        "pending": snapshot.pending,
                        "delayed": snapshot.delayed,
                        "running": snapshot.running,
                        "mode": snapshot.mode,
                    }),
                );
                fired.extend(self.send_alert(request)?);
            }

            if let (true, Some(dead)) = (c.new_dead_letter, &new_dead_letter) {
                let mut request = AlertRequest::from_rule(
                    rule,
                    format!("Job {} moved to dead-letter queue", dead.job_name),
                    format!(
                        "{} failed {} times: {}",
                        dead.job_id, dead.attempts, dead.failure_reason
                    ),
                    serde_json::json!({
                        "deadLetterId": dead.id,
                        "attempts": dead.attempts,
                        "canRetry": dead.can_retry,
                    }),
                );
                request.job_id = Some(dead.job_id.clone());
                request.queued_job_id = Some(dead.original_job_id);
                fired.extend(self.send_alert(request)?);
            }
        }
        Ok(fired)
    }

    /// The latest dead letter, if no process alerted on it yet.
    fn take_new_dead_letter(&self, latest: Option<&DeadLetterJob>) -> Result<Option<DeadLetterJob>, StoreError> {
        let Some(latest) = latest else { return Ok(None) };
        let _guard = self.cursor_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let cursor: Option<DeadLetterCursor> = self.store.load(DeadLetterCursor::KEY)?;
        if cursor.is_some_and(|c| c.last_alerted == Some(latest.id)) {
            return Ok(None);
        }
        self.store.save(&DeadLetterCursor {
            last_alerted: Some(latest.id),
            updated_at: self.clock.now(),
        })?;
        Ok(Some(latest.clone()))
    }

    /// On a store that never had a cursor, mark the current latest dead letter
    /// as seen so entries older than the first monitor do not alert.
    fn seed_dead_letter_cursor(&self) {
        let Some(queue) = &self.queue else { return };
        let seeded = (|| -> anyhow::Result<()> {
            let _guard = self.cursor_lock.lock().map_err(|_| StoreError::Poisoned)?;
            let existing: Option<DeadLetterCursor> = self.store.load(DeadLetterCursor::KEY)?;
            if existing.is_none() {
                let snapshot = queue.health_snapshot()?;
                self.store.save(&DeadLetterCursor {
                    last_alerted: snapshot.latest_dead_letter.map(|d| d.id),
                    updated_at: self.clock.now(),
                })?;
            }
            Ok(())
        })();
        if let Err(err) = seeded {
            warn!(error = %format!("{err:#}"), "could not seed dead-letter cursor");
        }
    }

    /// React to a bus event. Only dead-letter signals matter here.
    pub fn handle_event(&self, event: &WorkerEvent) -> anyhow::Result<Vec<AlertEvent>> {
        if event.is_dead_letter() {
            self.check_queue_health()
        } else {
            Ok(Vec::new())
        }
    }

    // ---- delivery ----

    /// Throttle, persist, deliver. `None` when disabled or suppressed.
    pub fn send_alert(&self, request: AlertRequest) -> Result<Option<AlertEvent>, StoreError> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let _guard = self.throttle_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let key = throttle_key(&request.alert_name, request.job_id.as_deref());
        let now = self.clock.now();
        let existing: Option<AlertThrottle> = self.store.load(&key)?;

        if let Some(reason) = existing.as_ref().and_then(|t| t.check(&self.config.settings.throttle, now)) {
            debug!(alert = %request.alert_name, key = %key, reason = ?reason, "alert suppressed");
            return Ok(None);
        }

        let event = self.persist(request, now)?;
        self.deliver(&event);

        let throttle = match existing {
            Some(mut t) => {
                t.record_send(now);
                t
            }
            None => AlertThrottle::first(key, now),
        };
        self.store.save(&throttle)?;
        Ok(Some(event))
    }

    fn persist(&self, request: AlertRequest, now: DateTime<Utc>) -> Result<AlertEvent, StoreError> {
        let event = AlertEvent {
            id: AlertEventId::new(),
            alert_name: request.alert_name,
            severity: request.severity,
            title: request.title,
            message: request.message,
            channels: request.channels,
            metadata: request.metadata,
            triggered_at: now,
            job_id: request.job_id,
            queued_job_id: request.queued_job_id,
        };
        self.store.save(&event)?;
        info!(
            alert = %event.alert_name,
            alert_id = %event.id,
            severity = %event.severity,
            job_id = ?event.job_id,
            "alert triggered"
        );
        Ok(event)
    }

    /// Each channel independently; failures are logged.
    fn deliver(&self, event: &AlertEvent) -> Vec<(ChannelKind, Option<String>)> {
        if event.channels.is_empty() {
            warn!(alert = %event.alert_name, "alert has no channels configured");
        }
        event
            .channels
            .iter()
            .map(|channel| {
                let outcome = self.notifier.deliver(*channel, event, &self.config.settings);
                if let Err(err) = &outcome {
                    warn!(alert = %event.alert_name, channel = %channel, error = %err, "alert delivery failed");
                }
                (*channel, outcome.err().map(|e| e.to_string()))
            })
            .collect()
    }

    /// Send a synthetic alert, bypassing throttling.
    ///
    /// Without an explicit channel, goes to the configured defaults or, if
    /// none, to every wired transport.
    pub fn test_alert(&self, channel: Option<ChannelKind>) -> Result<TestAlertReport, StoreError> {
        let channels = match channel {
            Some(c) => vec![c],
            None if !self.config.settings.channels.is_empty() => self.config.settings.channels.clone(),
            None => self.notifier.enabled_channels(),
        };
        let now = self.clock.now();
        let event = self.persist(
            AlertRequest {
                alert_name: "test-alert".to_string(),
                severity: Severity::Low,
                title: "Test alert".to_string(),
                message: format!("Test alert sent at {}", now.to_rfc3339()),
                channels,
                metadata: serde_json::json!({ "test": true }),
                job_id: None,
                queued_job_id: None,
            },
            now,
        )?;
        let deliveries = self.deliver(&event);
        Ok(TestAlertReport { event, deliveries })
    }

    // ---- inspection ----

    pub fn status(&self) -> Result<AlertStatus, StoreError> {
        let mut throttles: Vec<AlertThrottle> = self.store.load_all()?;
        throttles.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(AlertStatus {
            enabled: self.is_enabled(),
            job_failure_rules: self.rules.job_failures.len(),
            queue_health_rules: self.rules.queue_health.len(),
            performance_rules: self.rules.performance.len(),
            rejected_rules: self.rules.rejected.clone(),
            channels: self.config.settings.channels.clone(),
            transports: self.notifier.enabled_channels(),
            health_check_interval_secs: self.config.settings.health_check_interval_secs,
            throttles,
        })
    }

    /// Persisted alerts, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<AlertEvent>, StoreError> {
        let mut events: Vec<AlertEvent> = self.store.load_all()?;
        events.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at).then_with(|| b.id.cmp(&a.id)));
        events.truncate(limit);
        Ok(events)
    }

    // ---- background monitor ----

    /// Health check now and every `healthCheckIntervalSecs`, plus one on every
    /// dead-letter signal from `events`.
    pub fn start(self: &Arc<Self>, events: Subscription<WorkerEvent>) -> std::io::Result<AlertMonitorHandle> {
        if !self.is_enabled() {
            return Ok(AlertMonitorHandle { workers: Vec::new() });
        }
        self.seed_dead_letter_cursor();

        let interval = Duration::from_secs(self.config.settings.health_check_interval_secs.max(1));
        let periodic = {
            let manager = self.clone();
            PeriodicWorker::spawn("alert-health", interval, move || {
                manager.check_queue_health().map(|_| ()).map_err(|e| format!("{e:#}"))
            })?
        };
        let listener = {
            let manager = self.clone();
            SubscriptionWorker::spawn("alert-events", events, move |event: WorkerEvent| {
                manager.handle_event(&event).map(|_| ()).map_err(|e| format!("{e:#}"))
            })?
        };

        info!(
            interval_secs = interval.as_secs(),
            rules = self.rules.len(),
            "alert monitor started"
        );
        Ok(AlertMonitorHandle {
            workers: vec![periodic, listener],
        })
    }
}

impl CompletionHook for AlertManager {
    fn on_execution_complete(&self, execution: &JobExecution) -> anyhow::Result<()> {
        self.evaluate_execution(execution).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::channels::RecordingTransport;
    use crate::alerts::config::{
        AlertRule, AlertSettings, JobFailureConditions, PerformanceConditions, QueueHealthConditions,
        ThrottlePolicy,
    };
    use crate::jobs::{ExecutionTracker, JobSpec, RunRequest};
    use crate::store::InMemoryKeyedStore;
    use jobwarden_core::{Clock, ManualClock};

    struct Fixture {
        manager: AlertManager,
        tracker: ExecutionTracker,
        transport: Arc<RecordingTransport>,
        clock: Arc<ManualClock>,
    }

    fn settings(throttle: ThrottlePolicy) -> AlertSettings {
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
            severity: Severity::High,
            channels: Vec::new(),
            conditions,
        }
    }

    fn fixture(config: AlertConfig) -> Fixture {
        let store: SharedStore = Arc::new(InMemoryKeyedStore::new());
        let clock = ManualClock::starting_now();
        let tracker = ExecutionTracker::new(store.clone(), clock.clone());
        let transport = Arc::new(RecordingTransport::new());
        let manager = AlertManager::new(
            config,
            store,
            tracker.history(),
            Notifier::with_all(transport.clone()),
            clock.clone(),
        );
        Fixture {
            manager,
            tracker,
            transport,
            clock,
        }
    }

    fn finish(f: &Fixture, job_id: &str, ok: bool, duration_ms: i64) -> JobExecution {
        let e = f.tracker.create_execution(job_id, job_id, None, None).unwrap();
        f.clock.advance(ChronoDuration::milliseconds(duration_ms));
        if ok {
            f.tracker.mark_success(e.id, None).unwrap()
        } else {
            f.tracker.mark_failure(e.id, "Connection refused by upstream", None).unwrap()
        }
    }

    #[test]
    fn disabled_manager_is_a_noop() {
        let f = fixture(AlertConfig::default());
        let failed = finish(&f, "sync", false, 10);

        assert!(f.manager.evaluate_execution(&failed).unwrap().is_empty());
        assert!(f.manager.history(10).unwrap().is_empty());
        assert!(!f.manager.status().unwrap().enabled);
    }

    #[test]
    fn consecutive_failures_need_an_unbroken_streak() {
        let f = fixture(AlertConfig {
            settings: settings(ThrottlePolicy {
                min_interval_secs: 0,
                max_alerts_per_job_per_hour: 100,
            }),
            job_failures: vec![rule(
                "streak",
                JobFailureConditions {
                    consecutive_failures: Some(2),
                    ..Default::default()
                },
            )],
            ..Default::default()
        });

        let a = finish(&f, "sync", false, 10);
        assert!(f.manager.evaluate_execution(&a).unwrap().is_empty());
        finish(&f, "sync", true, 10);
        let c = finish(&f, "sync", false, 10);
        assert!(f.manager.evaluate_execution(&c).unwrap().is_empty());
        let d = finish(&f, "sync", false, 10);
        let fired = f.manager.evaluate_execution(&d).unwrap();

        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].job_id.as_deref(), Some("sync"));
        assert_eq!(f.transport.count(ChannelKind::Slack), 1);
    }

    #[test]
    fn failure_reason_matches_case_insensitively_and_respects_pattern() {
        let mut failing = rule(
            "conn",
            JobFailureConditions {
                failure_reason: Some("connection REFUSED".into()),
                job_pattern: Some("^sync".into()),
                ..Default::default()
            },
        );
        failing.channels = vec![ChannelKind::Discord];
        let f = fixture(AlertConfig {
            settings: settings(ThrottlePolicy::default()),
            job_failures: vec![failing],
            ..Default::default()
        });

        let other = finish(&f, "report", false, 10);
        assert!(f.manager.evaluate_execution(&other).unwrap().is_empty());

        let sync = finish(&f, "sync-orders", false, 10);
        assert_eq!(f.manager.evaluate_execution(&sync).unwrap().len(), 1);
        assert_eq!(f.transport.count(ChannelKind::Discord), 1);
        assert_eq!(f.transport.count(ChannelKind::Slack), 0);
    }

    #[test]
    fn min_interval_throttles_by_key() {
        let f = fixture(AlertConfig {
            settings: settings(ThrottlePolicy {
                min_interval_secs: 300,
                max_alerts_per_job_per_hour: 100,
            }),
            job_failures: vec![rule(
                "any",
                JobFailureConditions {
                    failure_count: Some(1),
                    ..Default::default()
                },
            )],
            ..Default::default()
        });

        let first = finish(&f, "sync", false, 10);
        assert_eq!(f.manager.evaluate_execution(&first).unwrap().len(), 1);

        f.clock.advance_secs(100);
        let second = finish(&f, "sync", false, 10);
        assert!(f.manager.evaluate_execution(&second).unwrap().is_empty());

        // Different job, different key.
        let other = finish(&f, "report", false, 10);
        assert_eq!(f.manager.evaluate_execution(&other).unwrap().len(), 1);

        f.clock.advance_secs(300);
        let third = finish(&f, "sync", false, 10);
        assert_eq!(f.manager.evaluate_execution(&third).unwrap().len(), 1);
        assert_eq!(f.manager.history(10).unwrap().len(), 3);
    }

    #[test]
    fn duration_increase_compares_against_history() {
        let f = fixture(AlertConfig {
            settings: settings(ThrottlePolicy::default()),
            performance: vec![rule(
                "slow",
                PerformanceConditions {
                    min_runs: 3,
                    duration_increase: Some(2.0),
                    ..Default::default()
                },
            )],
            ..Default::default()
        });

        for _ in 0..3 {
            let e = finish(&f, "report", true, 100);
            assert!(f.manager.evaluate_execution(&e).unwrap().is_empty());
        }
        let slow = finish(&f, "report", true, 250);
        let fired = f.manager.evaluate_execution(&slow).unwrap();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].message.contains("250ms"));
    }

    #[test]
    fn channel_failure_does_not_block_others_or_persistence() {
        let mut multi = rule(
            "any",
            JobFailureConditions {
                failure_count: Some(1),
                ..Default::default()
            },
        );
        multi.channels = vec![ChannelKind::Slack, ChannelKind::Discord];
        let f = fixture(AlertConfig {
            settings: settings(ThrottlePolicy::default()),
            job_failures: vec![multi],
            ..Default::default()
        });
        f.transport.fail(ChannelKind::Slack);

        let failed = finish(&f, "sync", false, 10);
        assert_eq!(f.manager.evaluate_execution(&failed).unwrap().len(), 1);
        assert_eq!(f.transport.count(ChannelKind::Discord), 1);
        assert_eq!(f.manager.history(10).unwrap().len(), 1);
    }

    struct FixedHealth(QueueHealthSnapshot);

    impl QueueHealthSource for FixedHealth {
        fn health_snapshot(&self) -> anyhow::Result<QueueHealthSnapshot> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn queue_health_thresholds_fire() {
        let f = fixture(AlertConfig {
            settings: settings(ThrottlePolicy::default()),
            queue_health: vec![
                rule(
                    "backlog",
                    QueueHealthConditions {
                        pending_jobs: Some(10),
                        ..Default::default()
                    },
                ),
                rule(
                    "paused",
                    QueueHealthConditions {
                        mode: Some(QueueMode::Paused),
                        ..Default::default()
                    },
                ),
            ],
            ..Default::default()
        });
        let manager = f.manager.with_queue(Arc::new(FixedHealth(QueueHealthSnapshot {
            pending: 12,
            mode: QueueMode::Running,
            ..Default::default()
        })));

        let fired = manager.check_queue_health().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].alert_name, "backlog");
    }

    #[test]
    fn dead_letter_alerts_once_across_managers_sharing_a_store() {
        let store: SharedStore = Arc::new(InMemoryKeyedStore::new());
        let clock = ManualClock::starting_now();
        let config = AlertConfig {
            settings: settings(ThrottlePolicy {
                min_interval_secs: 0,
                max_alerts_per_job_per_hour: 100,
            }),
            queue_health: vec![rule(
                "dlq",
                QueueHealthConditions {
                    new_dead_letter: true,
                    ..Default::default()
                },
            )],
            ..Default::default()
        };
        let dead = DeadLetterJob {
            id: DeadLetterId::new(),
            original_job_id: QueuedJobId::new(),
            job_id: "sync".into(),
            job_name: "Sync".into(),
            failure_reason: "boom".into(),
            attempts: 3,
            moved_to_dlq_at: clock.now(),
            retry_count: 0,
            error: Some("boom".into()),
            can_retry: true,
            spec: JobSpec::new("sync"),
        };
        let health = Arc::new(FixedHealth(QueueHealthSnapshot {
            dead_letters: 1,
            latest_dead_letter: Some(dead),
            ..Default::default()
        }));
        let manager = |transport: &Arc<RecordingTransport>| {
            AlertManager::new(
                config.clone(),
                store.clone(),
                ExecutionHistory::new(store.clone()),
                Notifier::with_all(transport.clone()),
                clock.clone(),
            )
            .with_queue(health.clone())
        };

        let first = Arc::new(RecordingTransport::new());
        assert_eq!(manager(&first).check_queue_health().unwrap().len(), 1);

        clock.advance_secs(3600);
        let later = Arc::new(RecordingTransport::new());
        let second = manager(&later);
        assert!(second.check_queue_health().unwrap().is_empty());
        assert!(second.check_queue_health().unwrap().is_empty());
        assert_eq!(later.count(ChannelKind::Slack), 0);
        assert_eq!(first.count(ChannelKind::Slack), 1);
    }

    #[test]
    fn monitor_seed_marks_existing_dead_letters_as_seen() {
        let f = fixture(AlertConfig {
            settings: settings(ThrottlePolicy::default()),
            queue_health: vec![rule(
                "dlq",
                QueueHealthConditions {
                    new_dead_letter: true,
                    ..Default::default()
                },
            )],
            ..Default::default()
        });
        let dead = DeadLetterJob {
            id: DeadLetterId::new(),
            original_job_id: QueuedJobId::new(),
            job_id: "sync".into(),
            job_name: "Sync".into(),
            failure_reason: "boom".into(),
            attempts: 1,
            moved_to_dlq_at: f.clock.now(),
            retry_count: 0,
            error: None,
            can_retry: false,
            spec: JobSpec::new("sync"),
        };
        let manager = f.manager.with_queue(Arc::new(FixedHealth(QueueHealthSnapshot {
            dead_letters: 1,
            latest_dead_letter: Some(dead),
            ..Default::default()
        })));

        manager.seed_dead_letter_cursor();
        assert!(manager.check_queue_health().unwrap().is_empty());
        assert_eq!(f.transport.count(ChannelKind::Slack), 0);
    }

    #[test]
    fn test_alert_bypasses_throttle() {
        let f = fixture(AlertConfig {
            settings: settings(ThrottlePolicy::default()),
            ..Default::default()
        });
        f.manager.test_alert(None).unwrap();
        let report = f.manager.test_alert(Some(ChannelKind::Email)).unwrap();

        assert_eq!(f.transport.count(ChannelKind::Slack), 1);
        // No recipients configured.
        assert!(report.deliveries[0].1.is_some());
        assert_eq!(f.manager.history(10).unwrap().len(), 2);
    }

    #[test]
    fn hook_wiring_alerts_on_tracked_runs() {
        let f = fixture(AlertConfig {
            settings: settings(ThrottlePolicy::default()),
            job_failures: vec![rule(
                "any",
                JobFailureConditions {
                    failure_count: Some(1),
                    ..Default::default()
                },
            )],
            ..Default::default()
        });
        let Fixture {
            manager, tracker, transport, ..
        } = f;
        let manager = Arc::new(manager);
        tracker.add_hook(manager.clone());

        let def = crate::jobs::JobDefinition::new(
            "sync",
            "Sync",
            |_: &crate::jobs::JobContext| -> Result<crate::jobs::JobOutput, crate::jobs::JobError> {
                Err(crate::jobs::JobError::failed("boom"))
            },
        );
        tracker.run(&def, RunRequest::default()).unwrap();

        assert_eq!(transport.count(ChannelKind::Slack), 1);
    }
}
