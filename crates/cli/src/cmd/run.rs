//! Worker daemon.
//!
//! Recovers jobs left `running` by a previous process, then runs the
//! dispatcher, the retry sweep and the alert monitor until the queue is
//! drained (`jobwarden drain` from another shell) or the runtime limit hits.

use std::time::{Duration, Instant};

use tracing::info;

use jobwarden_events::EventBus as _;
use jobwarden_infra::jobs::Dispatcher;

use crate::output::print_json;
use crate::runtime::Runtime;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Run everything currently eligible on this thread, then exit
    #[arg(long)]
    pub once: bool,

    /// Skip the periodic retry sweep
    #[arg(long)]
    pub no_retry: bool,

    /// Stop after this many seconds even if the queue is not drained
    #[arg(long)]
    pub max_runtime_secs: Option<u64>,
}

pub fn run(runtime: &Runtime, args: Args) -> anyhow::Result<()> {
    let recovered = runtime.queue.recover_interrupted()?;
    if recovered > 0 {
        info!(recovered, "requeued jobs interrupted by a previous worker");
    }

    if args.once {
        let executed = runtime.queue.run_until_idle()?;
        runtime.alerts.check_queue_health()?;
        return print_json(&serde_json::json!({
            "recovered": recovered,
            "executed": executed,
        }));
    }

    let monitor = runtime.alerts.start(runtime.bus.subscribe())?;
    let retry = if runtime.config.retry_enabled && !args.no_retry {
        Some(runtime.retry_coordinator().spawn()?)
    } else {
        None
    };
    let dispatcher = Dispatcher::spawn(runtime.queue.clone(), runtime.config.dispatcher_config())?;
    info!(
        max_concurrency = runtime.config.max_concurrency,
        retry = retry.is_some(),
        "worker running; drain the queue to stop"
    );

    let deadline = args.max_runtime_secs.map(|s| Instant::now() + Duration::from_secs(s));
    while !dispatcher.is_finished() && deadline.is_none_or(|d| Instant::now() < d) {
        std::thread::sleep(Duration::from_millis(200));
    }

    let stats = dispatcher.stats();
    dispatcher.shutdown();
    if let Some(retry) = retry {
        retry.shutdown();
    }
    monitor.stop();
    info!(jobs_processed = stats.jobs_processed, "worker stopped");

    print_json(&stats)
}
