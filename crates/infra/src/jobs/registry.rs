//! Job registry: job id → handler + descriptive metadata.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use jobwarden_core::ExecutionId;
use jobwarden_events::EventPublisher;

/// Output recorded on a successful execution.
pub type JobOutput = Option<serde_json::Value>;

/// Failure reported by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),
    /// The handler enforced its own deadline.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// Everything a handler gets to see about the run it is executing.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub execution_id: ExecutionId,
    pub org_id: Option<String>,
    pub input: Option<serde_json::Value>,
    pub now: DateTime<Utc>,
    pub events: EventPublisher,
    span: tracing::Span,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        execution_id: ExecutionId,
        org_id: Option<String>,
        input: Option<serde_json::Value>,
        now: DateTime<Utc>,
        events: EventPublisher,
    ) -> Self {
        let job_id = job_id.into();
        let span = tracing::info_span!("job", job_id = %job_id, execution_id = %execution_id);
        Self {
            job_id,
            execution_id,
            org_id,
            input,
            now,
            events,
            span,
        }
    }

    /// Span carrying job/execution ids; enter it to tag handler logs.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Read a string field from the input map.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input.as_ref()?.get(key)?.as_str()
    }
}

/// Job business logic.
pub trait JobHandler: Send + Sync + 'static {
    fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError>;
}

impl<F> JobHandler for F
where
    F: Fn(&JobContext) -> Result<JobOutput, JobError> + Send + Sync + 'static,
{
    fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        self(ctx)
    }
}

/// A registered job. Immutable after registration.
#[derive(Clone)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    /// Informational only (e.g. a cron expression driven by an external scheduler).
    pub schedule_hint: Option<String>,
    handler: Arc<dyn JobHandler>,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, handler: impl JobHandler) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            schedule_hint: None,
            handler: Arc::new(handler),
        }
    }

    pub fn schedule_hint(mut self, hint: impl Into<String>) -> Self {
        self.schedule_hint = Some(hint.into());
        self
    }

    pub fn handler(&self) -> &Arc<dyn JobHandler> {
        &self.handler
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            schedule_hint: self.schedule_hint.clone(),
        }
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("schedule_hint", &self.schedule_hint)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub schedule_hint: Option<String>,
}

/// Static job lookup table.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, JobDefinition>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job; a later registration with the same id replaces the earlier one.
    pub fn register(&mut self, definition: JobDefinition) -> &mut Self {
        self.jobs.insert(definition.id.clone(), definition);
        self
    }

    /// Resolve a job id.
    ///
    /// Exact ids win; otherwise a `prefix.*` entry matches ids starting with
    /// `prefix.`, and finally a `*` entry matches anything.
    pub fn get(&self, job_id: &str) -> Option<&JobDefinition> {
        if let Some(def) = self.jobs.get(job_id) {
            return Some(def);
        }

        let mut best: Option<(&str, &JobDefinition)> = None;
        for (pattern, def) in &self.jobs {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                let matches = job_id
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'));
                // Longest prefix wins so resolution does not depend on map order.
                if matches && best.is_none_or(|(p, _)| prefix.len() > p.len()) {
                    best = Some((prefix, def));
                }
            }
        }
        if let Some((_, def)) = best {
            return Some(def);
        }

        self.jobs.get("*")
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.get(job_id).is_some()
    }

    /// Display name for a job id (falls back to the id itself).
    pub fn name_of(&self, job_id: &str) -> String {
        self.get(job_id)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| job_id.to_string())
    }

    /// All registered jobs, sorted by id.
    pub fn list(&self) -> Vec<JobInfo> {
        let mut infos: Vec<JobInfo> = self.jobs.values().map(JobDefinition::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_handler(_ctx: &JobContext) -> Result<JobOutput, JobError> {
        Ok(None)
    }

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry
            .register(JobDefinition::new("daily-plan", "Generate daily plan", ok_handler).schedule_hint("0 6 * * *"))
            .register(JobDefinition::new("reports.*", "Reports", ok_handler))
            .register(JobDefinition::new("reports.weekly.*", "Weekly reports", ok_handler));
        registry
    }

    #[test]
    fn exact_match_wins() {
        let registry = registry();
        let def = registry.get("daily-plan").unwrap();
        assert_eq!(def.name, "Generate daily plan");
        assert_eq!(def.schedule_hint.as_deref(), Some("0 6 * * *"));
    }

    #[test]
    fn longest_category_prefix_wins() {
        let registry = registry();
        assert_eq!(registry.get("reports.monthly").unwrap().name, "Reports");
        assert_eq!(registry.get("reports.weekly.sales").unwrap().name, "Weekly reports");
        assert!(registry.get("reportsx").is_none());
    }

    #[test]
    fn wildcard_is_last_resort() {
        let mut registry = registry();
        assert!(!registry.contains("anything"));

        registry.register(JobDefinition::new("*", "Catch-all", ok_handler));
        assert_eq!(registry.get("anything").unwrap().name, "Catch-all");
        assert_eq!(registry.get("daily-plan").unwrap().name, "Generate daily plan");
    }

    #[test]
    fn list_is_sorted() {
        let ids: Vec<String> = registry().list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["daily-plan", "reports.*", "reports.weekly.*"]);
    }

    #[test]
    fn closures_are_handlers() {
        let handler = |ctx: &JobContext| -> Result<JobOutput, JobError> {
            Ok(ctx.input.clone())
        };
        let def = JobDefinition::new("echo", "Echo", handler);
        let ctx = JobContext::new(
            "echo",
            ExecutionId::new(),
            None,
            Some(serde_json::json!({"k": "v"})),
            Utc::now(),
            EventPublisher::noop("echo"),
        );

        let out = def.handler().run(&ctx).unwrap();
        assert_eq!(out, Some(serde_json::json!({"k": "v"})));
        assert_eq!(ctx.input_str("k"), Some("v"));
    }
}
