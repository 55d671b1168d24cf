//! Diagnostic jobs registered by every runtime.
//!
//! - `noop`: succeeds immediately
//! - `echo`: returns its input and publishes it as `echo.received`
//! - `fail`: fails with `input.message` (or `input.timeout` to time out)
//! - `sleep`: sleeps `input.ms` milliseconds (default 1000, capped at 10 minutes)

use std::time::Duration;

use jobwarden_infra::jobs::{JobContext, JobDefinition, JobError, JobOutput, JobRegistry};

const MAX_SLEEP_MS: u64 = 10 * 60 * 1000;

pub fn register(registry: &mut JobRegistry) {
    registry
        .register(JobDefinition::new("noop", "No-op", noop))
        .register(JobDefinition::new("echo", "Echo", echo))
        .register(JobDefinition::new("fail", "Always fail", fail))
        .register(JobDefinition::new("sleep", "Sleep", sleep));
}

pub fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    register(&mut registry);
    registry
}

fn noop(_: &JobContext) -> Result<JobOutput, JobError> {
    Ok(None)
}

fn echo(ctx: &JobContext) -> Result<JobOutput, JobError> {
    let input = ctx.input.clone().unwrap_or(serde_json::Value::Null);
    ctx.events.publish("echo.received", input.clone());
    Ok(Some(input))
}

fn fail(ctx: &JobContext) -> Result<JobOutput, JobError> {
    if let Some(message) = ctx.input_str("timeout") {
        return Err(JobError::timeout(message));
    }
    let message = ctx.input_str("message").unwrap_or("requested failure");
    Err(JobError::failed(message))
}

fn sleep(ctx: &JobContext) -> Result<JobOutput, JobError> {
    let ms = ctx
        .input
        .as_ref()
        .and_then(|i| i.get("ms"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(1000)
        .min(MAX_SLEEP_MS);
    tracing::debug!(job_id = %ctx.job_id, ms, "sleeping");
    std::thread::sleep(Duration::from_millis(ms));
    Ok(Some(serde_json::json!({ "sleptMs": ms })))
}
