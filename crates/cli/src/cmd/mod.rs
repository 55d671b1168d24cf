//! Operator commands.

pub mod alerts;
pub mod dlq;
pub mod executions;
pub mod jobs;
pub mod queue;
pub mod run;

use crate::runtime::Runtime;

#[derive(Debug, clap::Subcommand)]
pub enum Commands {
    /// Add a job to the queue
    Enqueue(queue::EnqueueArgs),

    /// List queued jobs
    #[command(alias = "ls")]
    List(queue::ListArgs),

    /// Show queue statistics
    Stats,

    /// Stop claiming new jobs (running jobs finish)
    Pause,

    /// Resume claiming jobs
    Resume,

    /// Refuse new jobs and stop the worker once the queue is empty
    Drain,

    /// Cancel a waiting job and fail its dependents
    Cancel(queue::CancelArgs),

    /// Run the worker: dispatcher, retry sweep and alert monitor
    Run(run::Args),

    /// Inspect and act on dead-lettered jobs
    #[command(subcommand)]
    Dlq(dlq::Commands),

    /// Alerting status, history and test sends
    #[command(subcommand)]
    Alerts(alerts::Commands),

    /// Execution history and statistics
    #[command(subcommand)]
    Executions(executions::Commands),

    /// Registered jobs
    #[command(subcommand)]
    Jobs(jobs::Commands),
}

pub fn run(runtime: &Runtime, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Enqueue(args) => queue::enqueue(runtime, args),
        Commands::List(args) => queue::list(runtime, args),
        Commands::Stats => queue::stats(runtime),
        Commands::Pause => queue::pause(runtime),
        Commands::Resume => queue::resume(runtime),
        Commands::Drain => queue::drain(runtime),
        Commands::Cancel(args) => queue::cancel(runtime, args),
        Commands::Run(args) => run::run(runtime, args),
        Commands::Dlq(command) => dlq::run(runtime, command),
        Commands::Alerts(command) => alerts::run(runtime, command),
        Commands::Executions(command) => executions::run(runtime, command),
        Commands::Jobs(command) => jobs::run(runtime, command),
    }
}
