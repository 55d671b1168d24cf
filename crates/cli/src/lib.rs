//! `jobwarden` command-line interface: configuration, runtime wiring and
//! operator commands.

pub mod builtin;
pub mod cmd;
pub mod config;
pub mod output;
pub mod runtime;

use config::GlobalArgs;
use runtime::Runtime;

/// Background job queue with retries, dead letters and alerting
#[derive(Debug, clap::Parser)]
#[command(name = "jobwarden")]
#[command(version)]
#[command(about = "Run and operate the jobwarden background job queue")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: cmd::Commands,
}

/// Resolve configuration, initialize logging, build the runtime and run one command.
pub fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.global.resolve()?;
    jobwarden_observability::init_with_format(config.log_format, &config.log_level);

    let runtime = Runtime::build(config)?;
    cmd::run(&runtime, cli.command)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use clap::Parser as _;
    use jobwarden_core::ManualClock;
    use jobwarden_infra::jobs::{QueueFilter, QueueMode, QueuedJobStatus};
    use jobwarden_infra::store::{InMemoryKeyedStore, SharedStore};

    use super::*;
    use crate::config::WorkerConfig;

    fn runtime() -> Runtime {
        let store: SharedStore = Arc::new(InMemoryKeyedStore::new());
        Runtime::with_parts(
            WorkerConfig::default(),
            store,
            ManualClock::starting_now(),
            builtin::registry(),
        )
        .unwrap()
    }

    fn exec(runtime: &Runtime, argv: &[&str]) -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(std::iter::once("jobwarden").chain(argv.iter().copied()))?;
        cmd::run(runtime, cli.command)
    }

    #[test]
    fn enqueue_flags_reach_the_queue() {
        let rt = runtime();
        exec(&rt, &["enqueue", "echo", "--priority", "critical", "--org", "acme", "--input", r#"{"a":1}"#]).unwrap();

        let jobs = rt.queue.list(&QueueFilter::default()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].priority.as_str(), "critical");
        assert_eq!(jobs[0].org_id.as_deref(), Some("acme"));
        assert_eq!(jobs[0].input, Some(serde_json::json!({ "a": 1 })));

        let first = jobs[0].id.to_string();
        exec(&rt, &["enqueue", "noop", "--depends-on", first.as_str(), "--concurrency-key", "k"]).unwrap();
        let pending = rt
            .queue
            .list(&QueueFilter {
                status: Some(QueuedJobStatus::Pending),
                ..QueueFilter::default()
            })
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].concurrency_key.as_deref(), Some("k"));
    }

    #[test]
    fn unknown_job_and_bad_input_fail() {
        let rt = runtime();
        assert!(exec(&rt, &["enqueue", "missing"]).is_err());
        assert!(exec(&rt, &["enqueue", "echo", "--input", "{not json"]).is_err());
        assert!(exec(&rt, &["enqueue", "echo", "--priority", "urgent"]).is_err());
    }

    #[test]
    fn run_once_executes_and_dead_letters() {
        let rt = runtime();
        exec(&rt, &["enqueue", "noop"]).unwrap();
        exec(&rt, &["enqueue", "fail", "--max-attempts", "1"]).unwrap();
        exec(&rt, &["run", "--once"]).unwrap();

        let stats = rt.queue.stats().unwrap();
        assert_eq!(stats.by_status.completed, 1);
        assert_eq!(stats.by_status.failed, 1);
        assert_eq!(stats.dead_letters, 1);

        let dead = rt.queue.dead_letters().latest().unwrap().unwrap();
        let id = dead.id.to_string();
        exec(&rt, &["dlq", "archive", id.as_str()]).unwrap();
        assert!(exec(&rt, &["dlq", "archive", id.as_str()]).is_err());
    }

    #[test]
    fn mode_commands_persist() {
        let rt = runtime();
        exec(&rt, &["pause"]).unwrap();
        assert_eq!(rt.queue.mode().unwrap(), QueueMode::Paused);
        exec(&rt, &["drain"]).unwrap();
        assert!(exec(&rt, &["enqueue", "noop"]).is_err());
        exec(&rt, &["resume"]).unwrap();
        assert_eq!(rt.queue.mode().unwrap(), QueueMode::Running);
    }

    #[test]
    fn alert_test_requires_enabled_alerting() {
        let rt = runtime();
        assert!(exec(&rt, &["alerts", "test"]).is_err());
        exec(&rt, &["alerts", "status"]).unwrap();
    }
}
