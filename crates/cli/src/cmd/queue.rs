//! Queue commands: enqueue, list, stats, mode changes, cancel.

use chrono::{DateTime, Duration, Utc};

use jobwarden_core::QueuedJobId;
use jobwarden_infra::jobs::{JobSpec, Priority, QueueFilter, QueuedJobStatus};

use crate::output::print_json;
use crate::runtime::Runtime;

#[derive(Debug, clap::Args)]
pub struct EnqueueArgs {
    /// Registered job id
    pub job_id: String,

    /// critical, high, normal or low
    #[arg(long, short = 'p', default_value = "normal")]
    pub priority: Priority,

    /// Attempts before the job is dead-lettered (default from config)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Organization the job runs for
    #[arg(long)]
    pub org: Option<String>,

    /// Earliest start, RFC 3339
    #[arg(long, conflicts_with = "delay_secs")]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Earliest start, seconds from now
    #[arg(long)]
    pub delay_secs: Option<i64>,

    /// Queued job ids that must complete first
    #[arg(long, value_delimiter = ',')]
    pub depends_on: Vec<QueuedJobId>,

    /// Jobs sharing a key never run at the same time
    #[arg(long)]
    pub concurrency_key: Option<String>,

    /// Handler input as JSON
    #[arg(long, value_parser = parse_json)]
    pub input: Option<serde_json::Value>,
}

fn parse_json(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn enqueue(runtime: &Runtime, args: EnqueueArgs) -> anyhow::Result<()> {
    let mut spec = JobSpec::new(args.job_id).priority(args.priority).depends_on(args.depends_on);
    if let Some(n) = args.max_attempts {
        spec = spec.max_attempts(n);
    }
    if let Some(org) = args.org {
        spec = spec.org(org);
    }
    let scheduled_for = args
        .scheduled_for
        .or_else(|| args.delay_secs.map(|s| runtime.clock.now() + Duration::seconds(s)));
    if let Some(at) = scheduled_for {
        spec = spec.scheduled_for(at);
    }
    if let Some(key) = args.concurrency_key {
        spec = spec.concurrency_key(key);
    }
    if let Some(input) = args.input {
        spec = spec.input(input);
    }

    let job = runtime.queue.enqueue(spec)?;
    print_json(&job)
}

#[derive(Debug, clap::Args)]
pub struct ListArgs {
    #[arg(long, short = 's')]
    pub status: Option<QueuedJobStatus>,

    #[arg(long, short = 'p')]
    pub priority: Option<Priority>,

    /// Only this job id
    #[arg(long)]
    pub job: Option<String>,

    #[arg(long)]
    pub org: Option<String>,

    #[arg(long, short = 'l')]
    pub limit: Option<usize>,
}

pub fn list(runtime: &Runtime, args: ListArgs) -> anyhow::Result<()> {
    let jobs = runtime.queue.list(&QueueFilter {
        status: args.status,
        priority: args.priority,
        job_id: args.job,
        org_id: args.org,
        limit: args.limit,
    })?;
    print_json(&jobs)
}

pub fn stats(runtime: &Runtime) -> anyhow::Result<()> {
    print_json(&runtime.queue.stats()?)
}

pub fn pause(runtime: &Runtime) -> anyhow::Result<()> {
    runtime.queue.pause()?;
    print_json(&serde_json::json!({ "mode": runtime.queue.mode()? }))
}

pub fn resume(runtime: &Runtime) -> anyhow::Result<()> {
    runtime.queue.resume()?;
    print_json(&serde_json::json!({ "mode": runtime.queue.mode()? }))
}

pub fn drain(runtime: &Runtime) -> anyhow::Result<()> {
    runtime.queue.drain()?;
    print_json(&serde_json::json!({
        "mode": runtime.queue.mode()?,
        "drained": runtime.queue.is_drained()?,
    }))
}

#[derive(Debug, clap::Args)]
pub struct CancelArgs {
    pub id: QueuedJobId,
}

pub fn cancel(runtime: &Runtime, args: CancelArgs) -> anyhow::Result<()> {
    print_json(&runtime.queue.cancel(args.id)?)
}
