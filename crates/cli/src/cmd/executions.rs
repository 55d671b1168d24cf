//! Execution history commands.

use jobwarden_infra::jobs::ExecutionFilter;

use crate::output::print_json;
use crate::runtime::Runtime;

#[derive(Debug, clap::Subcommand)]
pub enum Commands {
    /// Recent executions, newest first
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        job: Option<String>,

        #[arg(long)]
        org: Option<String>,

        #[arg(long, short = 'l', default_value_t = 50)]
        limit: usize,
    },

    /// Aggregate statistics for one job
    Stats {
        job: String,

        #[arg(long)]
        org: Option<String>,
    },

    /// Delete terminal executions older than the retention window
    Cleanup {
        /// Retention in days (default from config)
        #[arg(long)]
        days: Option<u32>,
    },
}

pub fn run(runtime: &Runtime, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::List { job, org, limit } => {
            let filter = ExecutionFilter {
                job_id: job,
                ..ExecutionFilter::default()
            }
            .org(org)
            .limit(limit);
            print_json(&runtime.tracker.list(&filter)?)
        }
        Commands::Stats { job, org } => print_json(&runtime.tracker.stats(&job, org.as_deref())?),
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(runtime.config.execution_retention_days);
            let deleted = runtime.tracker.cleanup(days)?;
            print_json(&serde_json::json!({ "deleted": deleted, "retentionDays": days }))
        }
    }
}
